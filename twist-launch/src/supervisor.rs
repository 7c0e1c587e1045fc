use crate::host::{self, HostError, LocalHost, ProcessHost, SshHost};
use crate::invocation::Launch;
use crate::launch_config::{ConfigError, LaunchConfig, Location, Profile, SupervisorSettings};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::{collections::HashMap, fmt, sync::Arc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Duration, Instant};

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("process {0:?} already running")]
    AlreadyRunning(String),
    #[error("no process running for {0:?}")]
    NotRunning(String),
    #[error("configuration error")]
    ConfigError(#[from] ConfigError),
    #[error("failed to launch process")]
    HostError(#[from] HostError),
    #[error("failed to signal process group")]
    SignalError(#[from] Errno),
}

type Result<T> = std::result::Result<T, SupervisorError>;

/// How long output is still forwarded after the main process exited
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Error(String),
}

impl ProcessStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Stopped => write!(f, "OFFLINE"),
            ProcessStatus::Starting => write!(f, "STARTING"),
            ProcessStatus::Running => write!(f, "ONLINE"),
            ProcessStatus::Error(_) => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Started(Option<u32>),
    /// One line of merged stdout and stderr
    Output(String),
    Finished(Option<i32>),
    Killed,
    Notice(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEvent {
    pub profile: String,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessInfo {
    pub id: String,
    pub title: String,
    pub location: Location,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
}

/// Exit code once the process is gone, `Some(None)` after death by signal
type ExitReceiver = watch::Receiver<Option<Option<i32>>>;

#[derive(Debug)]
struct Slot {
    status: ProcessStatus,
    pid: Option<u32>,
    exit: Option<ExitReceiver>,
    run_id: u64,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            status: ProcessStatus::Stopped,
            pid: None,
            exit: None,
            run_id: 0,
        }
    }
}

struct Entry {
    profile: Profile,
    launch: Launch,
    slot: Arc<Mutex<Slot>>,
}

/// Owns the lifecycle of every configured profile
pub struct Supervisor {
    entries: HashMap<String, Entry>,
    order: Vec<String>,
    local: Arc<dyn ProcessHost>,
    remote: Arc<dyn ProcessHost>,
    remote_target: String,
    settings: SupervisorSettings,
    events: broadcast::Sender<ProcessEvent>,
}

impl Supervisor {
    pub fn new(
        config: &LaunchConfig,
        local: Arc<dyn ProcessHost>,
        remote: Arc<dyn ProcessHost>,
    ) -> Supervisor {
        let (events, _) = broadcast::channel(config.supervisor.event_buffer.max(16));
        let mut entries = HashMap::new();
        let mut order = vec![];
        for profile in &config.profiles {
            order.push(profile.id.clone());
            entries.insert(
                profile.id.clone(),
                Entry {
                    profile: profile.clone(),
                    launch: config.launch_for(profile),
                    slot: Arc::new(Mutex::new(Slot::new())),
                },
            );
        }
        Supervisor {
            entries,
            order,
            local,
            remote,
            remote_target: config.remote.target.clone(),
            settings: config.supervisor.clone(),
            events,
        }
    }

    /// Local processes from this environment, remote ones through ssh
    pub fn from_config(config: &LaunchConfig) -> Supervisor {
        Supervisor::new(
            config,
            Arc::new(LocalHost::from_env()),
            Arc::new(SshHost::new(&config.remote)),
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    pub fn profile_ids(&self) -> &[String] {
        &self.order
    }

    pub fn title(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(|entry| entry.profile.title.as_str())
    }

    fn entry(&self, id: &str) -> Result<&Entry> {
        self.entries
            .get(id)
            .ok_or_else(|| ConfigError::UnknownProfile(id.to_owned()).into())
    }

    fn host(&self, location: Location) -> Arc<dyn ProcessHost> {
        match location {
            Location::Local => self.local.clone(),
            Location::Remote => self.remote.clone(),
        }
    }

    fn notice(&self, id: &str, text: impl Into<String>) {
        emit(&self.events, id, EventKind::Notice(text.into()));
    }

    pub async fn status(&self, id: &str) -> Result<ProcessStatus> {
        Ok(self.entry(id)?.slot.lock().await.status.clone())
    }

    pub async fn is_running(&self, id: &str) -> Result<bool> {
        Ok(self.status(id).await?.is_active())
    }

    pub async fn statuses(&self) -> Vec<ProcessInfo> {
        let mut infos = vec![];
        for id in &self.order {
            let entry = &self.entries[id];
            let slot = entry.slot.lock().await;
            infos.push(ProcessInfo {
                id: id.clone(),
                title: entry.profile.title.clone(),
                location: entry.profile.location,
                status: slot.status.clone(),
                pid: slot.pid,
            });
        }
        infos
    }

    pub async fn running(&self) -> Vec<String> {
        let mut running = vec![];
        for id in &self.order {
            if self.entries[id].slot.lock().await.status.is_active() {
                running.push(id.clone());
            }
        }
        running
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let mut slot = entry.slot.lock().await;
        if slot.status.is_active() {
            self.notice(id, "Process already running!");
            return Err(SupervisorError::AlreadyRunning(id.to_owned()));
        }

        self.notice(id, format!("Starting: {}", entry.launch.describe()));
        slot.status = ProcessStatus::Starting;
        if entry.profile.location == Location::Remote {
            self.notice(id, format!("Connecting to {}...", self.remote_target));
        }

        let process_host = self.host(entry.profile.location);
        let mut child = match host::spawn(process_host.as_ref(), &entry.launch) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!("Failed to start {}: {}", id, e);
                slot.status = ProcessStatus::Error(e.to_string());
                self.notice(id, format!("Error: {}", e));
                return Err(e.into());
            }
        };

        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        slot.run_id += 1;
        slot.pid = pid;
        slot.exit = Some(exit_rx);
        slot.status = ProcessStatus::Running;
        let run_id = slot.run_id;
        drop(slot);

        tracing::info!("Started {} with pid {:?}", id, pid);
        emit(&self.events, id, EventKind::Started(pid));
        if entry.profile.location == Location::Remote {
            self.notice(id, format!("Connected to {}", self.remote_target));
        }

        let mut readers: Vec<JoinHandle<()>> = vec![];
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, id.to_owned(), self.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, id.to_owned(), self.events.clone()));
        }

        let events = self.events.clone();
        let slot = entry.slot.clone();
        let id = id.to_owned();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::error!("Failed to wait for {}: {}", id, e);
                    emit(&events, &id, EventKind::Notice(format!("Monitor error: {}", e)));
                    None
                }
            };
            tracing::info!("{} finished with code {:?}", id, code);
            {
                let mut slot = slot.lock().await;
                if slot.run_id == run_id {
                    slot.status = ProcessStatus::Stopped;
                    slot.pid = None;
                }
            }
            let _ = exit_tx.send(Some(code));

            // detached descendants can hold the pipes open long after the exit
            let deadline = Instant::now() + OUTPUT_DRAIN;
            for mut reader in readers {
                if timeout_at(deadline, &mut reader).await.is_err() {
                    tracing::debug!("Output of {} still open after exit", id);
                    reader.abort();
                }
            }
            emit(&events, &id, EventKind::Finished(code));
        });
        Ok(())
    }

    /// Terminates the process group, escalating to SIGKILL within the grace period
    pub async fn kill(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let (run_id, exit) = {
            let slot = entry.slot.lock().await;
            match (&slot.status, slot.pid, &slot.exit) {
                (ProcessStatus::Running, Some(pid), Some(exit)) => {
                    tracing::info!("Killing {} (pid {})", id, pid);
                    (slot.run_id, exit.clone())
                }
                _ => {
                    self.notice(id, "No process running!");
                    return Err(SupervisorError::NotRunning(id.to_owned()));
                }
            }
        };

        self.notice(id, "Killing process...");
        let grace = self.settings.kill_grace();
        let deadline = Instant::now() + grace;
        self.signal_run(id, entry, run_id, Signal::SIGTERM).await?;
        if !wait_exit_until(exit.clone(), deadline - grace / 5).await {
            tracing::warn!("{} ignored SIGTERM, sending SIGKILL", id);
            self.signal_run(id, entry, run_id, Signal::SIGKILL).await?;
            wait_exit_until(exit, deadline).await;
        }

        if let Some(cleanup) = &entry.profile.cleanup {
            self.cleanup(id, entry.profile.location, cleanup).await;
        }

        {
            let mut slot = entry.slot.lock().await;
            if slot.run_id == run_id {
                slot.status = ProcessStatus::Stopped;
                slot.pid = None;
            }
        }
        emit(&self.events, id, EventKind::Killed);
        self.notice(id, "Process killed");
        Ok(())
    }

    /// Signals the group of one run, skipped once that run has exited
    async fn signal_run(
        &self,
        id: &str,
        entry: &Entry,
        run_id: u64,
        signal: Signal,
    ) -> Result<()> {
        let slot = entry.slot.lock().await;
        let pid = match slot.pid {
            Some(pid) if slot.run_id == run_id && slot.status == ProcessStatus::Running => pid,
            _ => return Ok(()),
        };
        match signal_group(pid, signal) {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(slot);
                tracing::error!("Failed to send {:?} to {}: {}", signal, id, e);
                self.notice(id, format!("Kill error: {}", e));
                Err(e.into())
            }
        }
    }

    async fn cleanup(&self, id: &str, location: Location, command: &str) {
        self.notice(id, format!("Cleanup: {}", command));
        let host = self.host(location);
        match host.run(command, self.settings.cleanup_timeout()).await {
            Ok(output) if output.success() => self.notice(id, "Cleanup successful"),
            Ok(output) => {
                let code = output
                    .code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_owned());
                self.notice(id, format!("Cleanup failed (code: {})", code))
            }
            Err(e) => self.notice(id, format!("Cleanup error: {}", e)),
        }
    }

    /// Waits for the current run of a profile to end and returns its exit code
    pub async fn wait(&self, id: &str) -> Result<Option<i32>> {
        let entry = self.entry(id)?;
        let exit = entry
            .slot
            .lock()
            .await
            .exit
            .clone()
            .ok_or_else(|| SupervisorError::NotRunning(id.to_owned()))?;
        Ok(exit_code(exit).await)
    }
}

fn emit(events: &broadcast::Sender<ProcessEvent>, profile: &str, kind: EventKind) {
    // no subscribers is fine
    let _ = events.send(ProcessEvent {
        profile: profile.to_owned(),
        kind,
    });
}

fn forward_lines<R>(
    reader: R,
    profile: String,
    events: broadcast::Sender<ProcessEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => emit(&events, &profile, EventKind::Output(line)),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!("Output of {} stopped: {}", profile, e);
                    break;
                }
            }
        }
    })
}

fn signal_group(pid: u32, signal: Signal) -> std::result::Result<(), Errno> {
    match killpg(Pid::from_raw(pid as i32), signal) {
        // already gone
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn exit_code(mut exit: ExitReceiver) -> Option<i32> {
    match exit.wait_for(|code| code.is_some()).await {
        Ok(code) => (*code).flatten(),
        // monitor dropped without reporting
        Err(_) => None,
    }
}

async fn wait_exit_until(exit: ExitReceiver, deadline: Instant) -> bool {
    timeout_at(deadline, exit_code(exit)).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launch_config::RemoteHost;
    use crate::programs::ProgramKind;
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    fn script(id: &str, command: &str, cleanup: Option<&str>) -> Profile {
        Profile {
            id: id.to_owned(),
            title: id.to_uppercase(),
            location: Location::Local,
            python: None,
            working_dir: None,
            program: ProgramKind::Script {
                command: command.to_owned(),
            },
            cleanup: cleanup.map(str::to_owned),
        }
    }

    /// Local profile command running a throwaway bash script
    fn bash_script(name: &str, body: &str) -> String {
        let path = std::env::temp_dir().join(format!(
            "twist-launch-{}-{}.sh",
            name,
            std::process::id()
        ));
        std::fs::write(&path, body).unwrap();
        format!("bash {}", path.display())
    }

    fn test_config() -> LaunchConfig {
        LaunchConfig {
            root: std::env::temp_dir(),
            working_dir: "deploy_real".into(),
            python: crate::invocation::PythonEnv::System,
            remote: RemoteHost::default(),
            supervisor: SupervisorSettings {
                kill_grace_ms: 300,
                cleanup_timeout_secs: 5,
                startup_delay_ms: 10,
                event_buffer: 256,
            },
            profiles: vec![
                script("echo", "echo hello supervisor", None),
                script("sleeper", "sleep 30", Some("true")),
                script("failing", "false", None),
                script("missing", "twist-launch-no-such-binary", None),
                script(
                    "detached",
                    &bash_script("detached", "setsid sleep 3 &\necho started\n"),
                    None,
                ),
                script(
                    "stubborn",
                    &bash_script(
                        "stubborn",
                        "trap '' TERM\nsetsid sleep 3 &\necho ready\nsleep 30\n",
                    ),
                    None,
                ),
            ],
            groups: BTreeMap::new(),
            actions: vec![],
        }
    }

    fn supervisor() -> Supervisor {
        let config = test_config();
        let local: Arc<dyn ProcessHost> = Arc::new(LocalHost::from_env());
        Supervisor::new(&config, local.clone(), local)
    }

    async fn collect_until_finished(
        events: &mut broadcast::Receiver<ProcessEvent>,
        id: &str,
    ) -> Vec<EventKind> {
        let mut kinds = vec![];
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if event.profile != id {
                continue;
            }
            let finished = matches!(event.kind, EventKind::Finished(_));
            kinds.push(event.kind);
            if finished {
                return kinds;
            }
        }
    }

    #[tokio::test]
    async fn start_streams_output_and_exit_code() {
        let supervisor = supervisor();
        let mut events = supervisor.subscribe();
        supervisor.start("echo").await.unwrap();
        let kinds = collect_until_finished(&mut events, "echo").await;
        assert!(kinds.contains(&EventKind::Output("hello supervisor".to_owned())));
        assert_eq!(kinds.last(), Some(&EventKind::Finished(Some(0))));
        assert_eq!(supervisor.wait("echo").await.unwrap(), Some(0));
        assert_eq!(
            supervisor.status("echo").await.unwrap(),
            ProcessStatus::Stopped
        );
    }

    #[tokio::test]
    async fn failing_exit_code_is_reported() {
        let supervisor = supervisor();
        supervisor.start("failing").await.unwrap();
        assert_eq!(supervisor.wait("failing").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let supervisor = supervisor();
        supervisor.start("sleeper").await.unwrap();
        assert!(matches!(
            supervisor.start("sleeper").await,
            Err(SupervisorError::AlreadyRunning(_))
        ));
        supervisor.kill("sleeper").await.unwrap();
    }

    #[tokio::test]
    async fn kill_terminates_and_runs_cleanup() {
        let supervisor = supervisor();
        let mut events = supervisor.subscribe();
        supervisor.start("sleeper").await.unwrap();
        assert!(supervisor.is_running("sleeper").await.unwrap());

        let started = Instant::now();
        supervisor.kill("sleeper").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            supervisor.status("sleeper").await.unwrap(),
            ProcessStatus::Stopped
        );
        assert_eq!(supervisor.wait("sleeper").await.unwrap(), None);

        let mut notices = vec![];
        while let Ok(event) = events.try_recv() {
            if let EventKind::Notice(text) = event.kind {
                notices.push(text);
            }
        }
        assert!(notices.contains(&"Cleanup: true".to_owned()));
        assert!(notices.contains(&"Cleanup successful".to_owned()));
        assert_eq!(notices.last().map(String::as_str), Some("Process killed"));
    }

    #[tokio::test]
    async fn kill_without_process_fails() {
        let supervisor = supervisor();
        assert!(matches!(
            supervisor.kill("sleeper").await,
            Err(SupervisorError::NotRunning(_))
        ));
        assert!(matches!(
            supervisor.wait("sleeper").await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn spawn_failure_marks_error() {
        let supervisor = supervisor();
        assert!(matches!(
            supervisor.start("missing").await,
            Err(SupervisorError::HostError(_))
        ));
        assert!(matches!(
            supervisor.status("missing").await.unwrap(),
            ProcessStatus::Error(_)
        ));
        assert!(supervisor.running().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_profile() {
        let supervisor = supervisor();
        assert!(matches!(
            supervisor.start("ghost").await,
            Err(SupervisorError::ConfigError(ConfigError::UnknownProfile(_)))
        ));
    }

    #[tokio::test]
    async fn statuses_follow_config_order() {
        let supervisor = supervisor();
        let ids: Vec<_> = supervisor
            .statuses()
            .await
            .into_iter()
            .map(|info| info.id)
            .collect();
        assert_eq!(
            ids,
            vec!["echo", "sleeper", "failing", "missing", "detached", "stubborn"]
        );
        assert_eq!(supervisor.title("sleeper"), Some("SLEEPER"));
    }

    #[tokio::test]
    async fn exit_is_reported_while_descendant_holds_output() {
        let supervisor = supervisor();
        let mut events = supervisor.subscribe();
        supervisor.start("detached").await.unwrap();
        let code = tokio::time::timeout(Duration::from_secs(2), supervisor.wait("detached"))
            .await
            .expect("exit reported before the descendant ends")
            .unwrap();
        assert_eq!(code, Some(0));
        let kinds = collect_until_finished(&mut events, "detached").await;
        assert_eq!(kinds.last(), Some(&EventKind::Finished(Some(0))));
        assert_eq!(
            supervisor.status("detached").await.unwrap(),
            ProcessStatus::Stopped
        );
    }

    #[tokio::test]
    async fn kill_escalates_to_sigkill_within_grace() {
        let supervisor = supervisor();
        let mut events = supervisor.subscribe();
        supervisor.start("stubborn").await.unwrap();
        // trap installed once the script printed
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            if event.kind == EventKind::Output("ready".to_owned()) {
                break;
            }
        }

        let started = Instant::now();
        supervisor.kill("stubborn").await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(550), "{:?}", elapsed);
        assert_eq!(
            supervisor.status("stubborn").await.unwrap(),
            ProcessStatus::Stopped
        );
        let code = tokio::time::timeout(Duration::from_secs(1), supervisor.wait("stubborn"))
            .await
            .expect("exit reported after kill")
            .unwrap();
        assert_eq!(code, None);
    }

    async fn fake_run(
        supervisor: &Supervisor,
        id: &str,
        pid: u32,
        run_id: u64,
    ) -> watch::Sender<Option<Option<i32>>> {
        let (exit_tx, exit_rx) = watch::channel(None);
        let mut slot = supervisor.entries[id].slot.lock().await;
        slot.status = ProcessStatus::Running;
        slot.pid = Some(pid);
        slot.exit = Some(exit_rx);
        slot.run_id = run_id;
        exit_tx
    }

    #[tokio::test]
    async fn kill_reports_signal_errors() {
        let supervisor = supervisor();
        let mut events = supervisor.subscribe();
        // negative process group, rejected with EINVAL
        let _exit = fake_run(&supervisor, "sleeper", u32::MAX, 3).await;

        assert!(matches!(
            supervisor.kill("sleeper").await,
            Err(SupervisorError::SignalError(Errno::EINVAL))
        ));
        let mut notices = vec![];
        while let Ok(event) = events.try_recv() {
            if let EventKind::Notice(text) = event.kind {
                notices.push(text);
            }
        }
        assert!(notices.last().unwrap().starts_with("Kill error"));
        assert!(!notices.contains(&"Process killed".to_owned()));
        assert_eq!(
            supervisor.status("sleeper").await.unwrap(),
            ProcessStatus::Running
        );
    }

    #[tokio::test]
    async fn signals_skip_a_finished_run() {
        let supervisor = supervisor();
        let _exit = fake_run(&supervisor, "sleeper", u32::MAX, 2).await;
        let entry = &supervisor.entries["sleeper"];
        // an earlier run, its pid may already belong to someone else
        supervisor
            .signal_run("sleeper", entry, 1, Signal::SIGKILL)
            .await
            .unwrap();
        entry.slot.lock().await.status = ProcessStatus::Stopped;
        supervisor
            .signal_run("sleeper", entry, 2, Signal::SIGKILL)
            .await
            .unwrap();
    }

    #[test]
    fn status_labels() {
        assert_eq!(ProcessStatus::Running.to_string(), "ONLINE");
        assert_eq!(ProcessStatus::Stopped.to_string(), "OFFLINE");
        assert_eq!(ProcessStatus::Starting.to_string(), "STARTING");
        assert_eq!(ProcessStatus::Error("x".to_owned()).to_string(), "ERROR");
    }
}
