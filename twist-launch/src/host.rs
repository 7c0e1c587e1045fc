use crate::invocation::{Invocation, Launch};
use crate::launch_config::{Location, RemoteHost};
use async_trait::async_trait;
use std::{
    os::unix::process::CommandExt,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use thiserror::Error;
use tokio::process::Child;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to spawn {command:?}")]
    SpawnError {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("empty command")]
    EmptyCommand,
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
}

type Result<T> = std::result::Result<T, HostError>;

const SSH_TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of a one-shot command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    /// `None` when the process died from a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Most useful text to show when the command failed
    pub fn error_message(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.clone()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.clone()
        } else {
            "Unknown error".to_owned()
        }
    }
}

#[async_trait]
pub trait ProcessHost: Send + Sync {
    fn location(&self) -> Location;

    /// Command that starts a long running launch
    fn command_for(&self, launch: &Launch) -> Result<Command>;

    /// Command for a short lived helper such as cleanup or a maintenance action
    fn helper_command(&self, command: &str) -> Result<Command>;

    /// Whether the host can currently run anything at all
    async fn check_connection(&self) -> bool {
        true
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        let mut helper = self.helper_command(command)?;
        helper
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut helper = tokio::process::Command::from(helper);
        helper.kill_on_drop(true);
        let output = match tokio::time::timeout(timeout, helper.output()).await {
            Ok(output) => output.map_err(|source| HostError::SpawnError {
                command: command.to_owned(),
                source,
            })?,
            Err(_) => return Err(HostError::Timeout(timeout)),
        };
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Spawns a launch with piped output in a fresh process group
pub fn spawn(host: &dyn ProcessHost, launch: &Launch) -> Result<Child> {
    let mut command = host.command_for(launch)?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);
    tokio::process::Command::from(command)
        .spawn()
        .map_err(|source| HostError::SpawnError {
            command: launch.describe(),
            source,
        })
}

fn split_command(command: &str) -> Result<Command> {
    let mut words = command.split_whitespace();
    let program = words.next().ok_or(HostError::EmptyCommand)?;
    let mut built = Command::new(program);
    built.args(words);
    Ok(built)
}

/// Runs programs on this machine
#[derive(Debug, Clone)]
pub struct LocalHost {
    home: Option<PathBuf>,
    base_path: String,
}

impl LocalHost {
    pub fn new(home: Option<PathBuf>, base_path: &str) -> LocalHost {
        LocalHost {
            home,
            base_path: base_path.to_owned(),
        }
    }

    /// Home and PATH of the current process
    pub fn from_env() -> LocalHost {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let base_path = std::env::var("PATH").unwrap_or_default();
        LocalHost::new(home, &base_path)
    }

    fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    /// Interpreter of the activated environment
    pub fn interpreter(&self, invocation: &Invocation) -> PathBuf {
        match invocation.python.prefix(self.home()) {
            Some(prefix) => prefix.join("bin").join("python"),
            None => PathBuf::from("python"),
        }
    }

    fn python_command(&self, invocation: &Invocation) -> Command {
        let mut command = Command::new(self.interpreter(invocation));
        command
            .arg(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .envs(invocation.env_overrides(self.home(), &self.base_path));
        command
    }
}

#[async_trait]
impl ProcessHost for LocalHost {
    fn location(&self) -> Location {
        Location::Local
    }

    fn command_for(&self, launch: &Launch) -> Result<Command> {
        match launch {
            Launch::Python(invocation) => Ok(self.python_command(invocation)),
            Launch::Script {
                command,
                working_dir,
            } => {
                let mut built = split_command(command)?;
                if let Some(working_dir) = working_dir {
                    built.current_dir(working_dir);
                }
                Ok(built)
            }
        }
    }

    fn helper_command(&self, command: &str) -> Result<Command> {
        split_command(command)
    }
}

/// Runs programs on the robot through the system ssh client
#[derive(Debug, Clone)]
pub struct SshHost {
    target: String,
    connect_timeout: Duration,
}

impl SshHost {
    pub fn new(remote: &RemoteHost) -> SshHost {
        SshHost {
            target: remote.target.clone(),
            connect_timeout: Duration::from_secs(remote.connect_timeout_secs),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// ssh arguments for a remote command, with a tty when sudo may prompt
    pub fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = vec![];
        if remote_command.contains("sudo") {
            args.push("-t".to_owned());
        }
        args.extend(
            [
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "LogLevel=ERROR",
                self.target.as_str(),
                remote_command,
            ]
            .iter()
            .map(|arg| arg.to_string()),
        );
        args
    }

    pub fn remote_command(launch: &Launch) -> String {
        match launch {
            Launch::Python(invocation) => invocation.shell_line(),
            Launch::Script { command, .. } => format!("cd ~ && {}", command),
        }
    }

    fn ssh_command(&self, remote_command: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(self.ssh_args(remote_command));
        command
    }

    pub fn connection_test_args(&self) -> Vec<String> {
        vec![
            "-o".to_owned(),
            "StrictHostKeyChecking=no".to_owned(),
            "-o".to_owned(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".to_owned(),
            "LogLevel=ERROR".to_owned(),
            self.target.clone(),
            "echo 'SSH test successful'".to_owned(),
        ]
    }

    /// True when a trivial command succeeds on the robot
    async fn test_connection(&self) -> bool {
        let mut command = tokio::process::Command::new("ssh");
        command
            .args(self.connection_test_args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(SSH_TEST_TIMEOUT, command.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::warn!("Failed to run ssh: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("ssh connection test to {} timed out", self.target);
                false
            }
        }
    }
}

#[async_trait]
impl ProcessHost for SshHost {
    fn location(&self) -> Location {
        Location::Remote
    }

    fn command_for(&self, launch: &Launch) -> Result<Command> {
        Ok(self.ssh_command(&SshHost::remote_command(launch)))
    }

    fn helper_command(&self, command: &str) -> Result<Command> {
        if command.trim().is_empty() {
            return Err(HostError::EmptyCommand);
        }
        Ok(self.ssh_command(command))
    }

    async fn check_connection(&self) -> bool {
        self.test_connection().await
    }
}
