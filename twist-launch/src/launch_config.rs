use crate::invocation::{Invocation, Launch, PythonEnv};
use crate::programs::{Overrides, ProgramKind};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error while accessing configuration")]
    IoError(#[from] std::io::Error),
    #[error("error while parsing json")]
    JsonError(#[from] serde_json::Error),
    #[error("error while parsing yaml")]
    YamlError(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("unknown profile {0:?}")]
    UnknownProfile(String),
    #[error("unknown group {0:?}")]
    UnknownGroup(String),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// Where a profile or action runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Location {
    #[default]
    Local,
    /// On the robot, through ssh
    Remote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteHost {
    /// ssh destination, usually a host alias from `~/.ssh/config`
    pub target: String,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteHost {
    fn default() -> Self {
        RemoteHost {
            target: "g1".to_owned(),
            connect_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Time between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,
    pub cleanup_timeout_secs: u64,
    /// Pause between profiles when starting a group
    pub startup_delay_ms: u64,
    pub event_buffer: usize,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        SupervisorSettings {
            kill_grace_ms: 1000,
            cleanup_timeout_secs: 10,
            startup_delay_ms: 1000,
            event_buffer: 1024,
        }
    }
}

impl SupervisorSettings {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_timeout_secs)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

/// One launchable entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub location: Location,
    /// Falls back to the config wide environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<PythonEnv>,
    /// Relative to the config root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub program: ProgramKind,
    /// Command run after the process group is gone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<String>,
}

/// One-shot maintenance command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub location: Location,
    pub command: String,
    pub timeout_secs: u64,
}

impl Action {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub root: PathBuf,
    pub working_dir: PathBuf,
    pub python: PythonEnv,
    #[serde(default)]
    pub remote: RemoteHost,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    pub profiles: Vec<Profile>,
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

impl LaunchConfig {
    /// Twist comes with an included config file.
    ///
    /// This file is packaged with the binary
    /// This method retrieves this included version
    pub fn included() -> LaunchConfig {
        LaunchConfig::parse_json(include_str!("../config/launch.json"))
            .expect("included launch config is valid")
    }

    pub fn parse_json(text: &str) -> Result<LaunchConfig> {
        let config: LaunchConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_yaml(text: &str) -> Result<LaunchConfig> {
        let config: LaunchConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn serialize_to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn serialize_to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        fs::write(path, self.serialize_to_json()?)?;
        Ok(())
    }

    pub fn save_yaml(&self, path: &Path) -> Result<()> {
        fs::write(path, self.serialize_to_yaml()?)?;
        Ok(())
    }

    /// Loads json or yaml depending on the file extension
    pub fn load(path: &Path) -> Result<LaunchConfig> {
        let text = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => LaunchConfig::parse_yaml(&text),
            _ => LaunchConfig::parse_json(&text),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if profile.id.is_empty() {
                return Err(ConfigError::Invalid("profile with empty id".to_owned()));
            }
            if !seen.insert(profile.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate profile id {:?}",
                    profile.id
                )));
            }
            if let ProgramKind::Script { command } = &profile.program {
                if command.trim().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "profile {:?} has an empty command",
                        profile.id
                    )));
                }
            }
            if let Some(working_dir) = &profile.working_dir {
                if working_dir.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "profile {:?} has an empty working dir",
                        profile.id
                    )));
                }
            }
        }
        for (group, members) in &self.groups {
            for member in members {
                if !seen.contains(member.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "group {:?} references unknown profile {:?}",
                        group, member
                    )));
                }
            }
        }
        let mut action_names = HashSet::new();
        for action in &self.actions {
            if !action_names.insert(action.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate action {:?}",
                    action.name
                )));
            }
            if action.command.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "action {:?} has an empty command",
                    action.name
                )));
            }
        }
        Ok(())
    }

    pub fn profile(&self, id: &str) -> Result<&Profile> {
        self.profiles
            .iter()
            .find(|profile| profile.id == id)
            .ok_or_else(|| ConfigError::UnknownProfile(id.to_owned()))
    }

    pub fn group(&self, name: &str) -> Result<Vec<&Profile>> {
        let members = self
            .groups
            .get(name)
            .ok_or_else(|| ConfigError::UnknownGroup(name.to_owned()))?;
        members.iter().map(|id| self.profile(id)).collect()
    }

    pub fn action(&self, name: &str) -> Result<&Action> {
        self.actions
            .iter()
            .find(|action| action.name == name)
            .ok_or_else(|| ConfigError::UnknownAction(name.to_owned()))
    }

    pub fn with_overrides(mut self, overrides: &Overrides) -> LaunchConfig {
        for profile in &mut self.profiles {
            profile.program.apply(overrides);
        }
        self
    }

    /// Resolves environment and directory of a profile
    pub fn launch_for(&self, profile: &Profile) -> Launch {
        match &profile.program {
            ProgramKind::Script { command } => Launch::Script {
                command: command.clone(),
                working_dir: match profile.location {
                    Location::Local => Some(self.root.join(
                        profile.working_dir.clone().unwrap_or_default(),
                    )),
                    Location::Remote => None,
                },
            },
            program => {
                let working_dir = profile
                    .working_dir
                    .as_ref()
                    .unwrap_or(&self.working_dir);
                let python = profile.python.clone().unwrap_or_else(|| self.python.clone());
                Launch::Python(Invocation::new(
                    python,
                    self.root.join(working_dir),
                    program.script_name().unwrap_or_default(),
                    program.to_args().unwrap_or_default(),
                ))
            }
        }
    }
}
