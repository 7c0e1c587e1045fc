use std::fmt::Write;
use twist_launch::host::{LocalHost, ProcessHost, SshHost};
use twist_launch::invocation::{join_quoted, Launch};
use twist_launch::launch_config::{LaunchConfig, Location, Profile};
use twist_launch::supervisor::{EventKind, ProcessInfo};

/// Terminal line for a supervisor event, prefixed with the profile title
pub fn format_event(title: &str, kind: &EventKind) -> Option<String> {
    match kind {
        EventKind::Output(line) => Some(format!("[{}] {}", title, line)),
        EventKind::Started(Some(pid)) => Some(format!("[{}] Started (pid {})", title, pid)),
        EventKind::Started(None) => Some(format!("[{}] Started", title)),
        EventKind::Finished(Some(code)) => {
            Some(format!("[{}] Process finished (code: {})", title, code))
        }
        EventKind::Finished(None) => Some(format!("[{}] Process finished (signal)", title)),
        EventKind::Notice(text) => Some(format!("[{}] {}", title, text)),
        EventKind::Killed => None,
    }
}

fn location_label(location: Location) -> &'static str {
    match location {
        Location::Local => "local",
        Location::Remote => "remote",
    }
}

/// Dry run view of what starting a profile executes
pub fn describe_profile(
    config: &LaunchConfig,
    profile: &Profile,
    local: &LocalHost,
    remote: &SshHost,
) -> String {
    let launch = config.launch_for(profile);
    let mut text = String::new();
    let _ = writeln!(text, "{} ({})", profile.title, profile.id);
    let _ = writeln!(text, "location: {}", location_label(profile.location));
    match profile.location {
        Location::Local => {
            if let Ok(command) = local.command_for(&launch) {
                let argv: Vec<String> = std::iter::once(command.get_program())
                    .chain(command.get_args())
                    .map(|arg| arg.to_string_lossy().into_owned())
                    .collect();
                let _ = writeln!(text, "argv: {}", join_quoted(&argv));
                if let Some(dir) = command.get_current_dir() {
                    let _ = writeln!(text, "cwd: {}", dir.display());
                }
                for (key, value) in command.get_envs() {
                    if let Some(value) = value {
                        let _ = writeln!(
                            text,
                            "env: {}={}",
                            key.to_string_lossy(),
                            value.to_string_lossy()
                        );
                    }
                }
            }
        }
        Location::Remote => {
            let remote_command = SshHost::remote_command(&launch);
            let mut argv = vec!["ssh".to_owned()];
            argv.extend(remote.ssh_args(&remote_command));
            let _ = writeln!(text, "argv: {}", join_quoted(&argv));
        }
    }
    if let Launch::Python(invocation) = &launch {
        let _ = writeln!(text, "shell: {}", invocation.shell_line());
    }
    if let Some(cleanup) = &profile.cleanup {
        let _ = writeln!(text, "cleanup: {}", cleanup);
    }
    text
}

/// One line per profile with the groups it belongs to
pub fn list_profiles(config: &LaunchConfig) -> Vec<String> {
    config
        .profiles
        .iter()
        .map(|profile| {
            let groups: Vec<&str> = config
                .groups
                .iter()
                .filter(|(_, members)| members.contains(&profile.id))
                .map(|(name, _)| name.as_str())
                .collect();
            format!(
                "{:<12} {:<8} {:<24} {}",
                profile.id,
                location_label(profile.location),
                profile.title,
                groups.join(",")
            )
        })
        .collect()
}

pub fn format_status(info: &ProcessInfo) -> String {
    match info.pid {
        Some(pid) => format!(
            "{:<12} {:<8} pid {}",
            info.id,
            info.status.to_string(),
            pid
        ),
        None => format!("{:<12} {}", info.id, info.status),
    }
}
