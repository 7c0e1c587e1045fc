use crate::host::{CommandOutput, HostError, LocalHost, ProcessHost, SshHost};
use crate::launch_config::{ConfigError, LaunchConfig, Location};
use crate::supervisor::{Supervisor, SupervisorError};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::sleep;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("action {name:?} failed: {message}")]
    ActionFailed { name: String, message: String },
    #[error("action {0:?} timed out")]
    Timeout(String),
    #[error("configuration error")]
    ConfigError(#[from] ConfigError),
    #[error("failed to run action")]
    HostError(#[from] HostError),
}

/// Outcome of starting a group of profiles
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GroupStart {
    pub started: Vec<String>,
    /// Already running before the call
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Group level operations on top of the supervisor
pub struct ControlCenter {
    config: LaunchConfig,
    supervisor: Arc<Supervisor>,
    local: Arc<dyn ProcessHost>,
    remote: Arc<dyn ProcessHost>,
}

impl ControlCenter {
    pub fn new(
        config: LaunchConfig,
        local: Arc<dyn ProcessHost>,
        remote: Arc<dyn ProcessHost>,
    ) -> ControlCenter {
        let supervisor = Arc::new(Supervisor::new(&config, local.clone(), remote.clone()));
        ControlCenter {
            config,
            supervisor,
            local,
            remote,
        }
    }

    pub fn from_config(config: LaunchConfig) -> ControlCenter {
        let remote = Arc::new(SshHost::new(&config.remote));
        ControlCenter::new(config, Arc::new(LocalHost::from_env()), remote)
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    fn host(&self, location: Location) -> &dyn ProcessHost {
        match location {
            Location::Local => self.local.as_ref(),
            Location::Remote => self.remote.as_ref(),
        }
    }

    /// Starts every profile of a group that is not already running
    pub async fn start_group(&self, name: &str) -> Result<GroupStart, SupervisorError> {
        let ids: Vec<String> = self
            .config
            .group(name)?
            .iter()
            .map(|profile| profile.id.clone())
            .collect();
        tracing::info!("Starting group {}: {:?}", name, ids);

        let mut result = GroupStart::default();
        for id in ids {
            if self.supervisor.is_running(&id).await? {
                result.skipped.push(id);
                continue;
            }
            if !result.started.is_empty() || !result.failed.is_empty() {
                sleep(self.supervisor.settings().startup_delay()).await;
            }
            match self.supervisor.start(&id).await {
                Ok(()) => result.started.push(id),
                Err(e) => {
                    tracing::error!("Failed to start {}: {}", id, e);
                    result.failed.push((id, e.to_string()));
                }
            }
        }
        Ok(result)
    }

    /// Kills everything that runs, returns the killed profile ids
    pub async fn emergency_stop(&self) -> Vec<String> {
        let mut killed = vec![];
        for id in self.supervisor.running().await {
            match self.supervisor.kill(&id).await {
                Ok(()) => killed.push(id),
                // exited on its own in the meantime
                Err(SupervisorError::NotRunning(_)) => {}
                Err(e) => tracing::error!("Failed to kill {}: {}", id, e),
            }
        }
        tracing::warn!("Emergency stop killed {:?}", killed);
        killed
    }

    pub async fn check_connection(&self) -> bool {
        let connected = self.remote.check_connection().await;
        tracing::info!("Remote connection: {}", connected);
        connected
    }

    pub async fn run_action(&self, name: &str) -> Result<CommandOutput, ActionError> {
        let action = self.config.action(name)?;
        tracing::info!("Running action {}: {}", name, action.command);
        let output = match self
            .host(action.location)
            .run(&action.command, action.timeout())
            .await
        {
            Ok(output) => output,
            Err(HostError::Timeout(_)) => return Err(ActionError::Timeout(name.to_owned())),
            Err(e) => return Err(e.into()),
        };
        if output.success() {
            Ok(output)
        } else {
            Err(ActionError::ActionFailed {
                name: name.to_owned(),
                message: output.error_message(),
            })
        }
    }
}
