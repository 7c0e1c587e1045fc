use crate::output;
use std::{collections::HashSet, future::Future, io::Write};
use tokio::sync::broadcast::{error::RecvError, Receiver};
use twist_launch::control_center::ControlCenter;
use twist_launch::supervisor::{EventKind, ProcessEvent, Supervisor};

/// How a streaming session ended
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEnd {
    /// Exit code of the last profile that finished
    pub last_code: Option<i32>,
    pub stopped: bool,
}

/// Exit status of `run`: the code of a single failing profile
pub fn exit_status(started: usize, end: &SessionEnd) -> Option<i32> {
    if started != 1 || end.stopped {
        return None;
    }
    end.last_code.filter(|code| *code != 0)
}

/// Prints events until every profile finished or `stop` resolved.
///
/// `stop` triggers an emergency stop of everything that runs.
pub async fn stream_until_done<W, F>(
    center: &ControlCenter,
    events: &mut Receiver<ProcessEvent>,
    profiles: Vec<String>,
    out: &mut W,
    stop: F,
) -> SessionEnd
where
    W: Write,
    F: Future<Output = ()>,
{
    let supervisor = center.supervisor();
    let mut pending: HashSet<String> = profiles.into_iter().collect();
    let mut end = SessionEnd {
        last_code: None,
        stopped: false,
    };
    tokio::pin!(stop);

    while !pending.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let title = supervisor
                        .title(&event.profile)
                        .unwrap_or(event.profile.as_str());
                    if let Some(line) = output::format_event(title, &event.kind) {
                        let _ = writeln!(out, "{}", line);
                    }
                    if let EventKind::Finished(code) = event.kind {
                        if pending.remove(&event.profile) {
                            end.last_code = code;
                        }
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} events", skipped);
                    // Finished events may be among the dropped ones
                    for id in finished_since_lag(&supervisor, &pending).await {
                        pending.remove(&id);
                        end.last_code = supervisor.wait(&id).await.ok().flatten();
                        let title = supervisor.title(&id).unwrap_or(id.as_str());
                        let finished = EventKind::Finished(end.last_code);
                        if let Some(line) = output::format_event(title, &finished) {
                            let _ = writeln!(out, "{}", line);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut stop => {
                tracing::info!("Stop requested");
                let _ = writeln!(out, "Emergency stop");
                let killed = center.emergency_stop().await;
                for info in supervisor.statuses().await {
                    if killed.contains(&info.id) {
                        let _ = writeln!(out, "{}", output::format_status(&info));
                    }
                }
                end.stopped = true;
                break;
            }
        }
    }
    end
}

async fn finished_since_lag(supervisor: &Supervisor, pending: &HashSet<String>) -> Vec<String> {
    let mut finished = vec![];
    for id in pending {
        if !matches!(supervisor.is_running(id).await, Ok(true)) {
            finished.push(id.clone());
        }
    }
    finished.sort();
    finished
}
