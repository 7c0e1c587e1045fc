use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tokio::sync::broadcast::Receiver;
use twist_ctl::{
    error::CtlError,
    logging, output,
    session::{self, SessionEnd},
};
use twist_launch::{
    control_center::ControlCenter,
    host::{LocalHost, SshHost},
    launch_config::LaunchConfig,
    programs::Overrides,
    supervisor::ProcessEvent,
};

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Launch configuration, json or yaml. Defaults to the included one
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as json
    #[arg(long, global = true)]
    log_json: bool,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: SubCommand,
}

#[derive(clap::Args)]
struct OverrideArgs {
    /// Redis address passed to teleop and motion server
    #[arg(long, global = true)]
    redis_ip: Option<String>,

    /// Network interface of the low level server
    #[arg(long, global = true)]
    net: Option<String>,

    /// Policy checkpoint of the low level server
    #[arg(long, global = true)]
    ckpt_path: Option<PathBuf>,

    /// Motion file of the motion server
    #[arg(long, global = true)]
    motion_file: Option<PathBuf>,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Overrides {
            redis_ip: args.redis_ip,
            net: args.net,
            ckpt_path: args.ckpt_path,
            motion_file: args.motion_file,
        }
    }
}

#[derive(clap::Subcommand)]
enum SubCommand {
    /// List configured profiles
    List,
    /// Print what a profile would execute without starting it
    Show { profile: String },
    /// Start profiles and stream their output until they exit
    Run {
        #[arg(required = true)]
        profiles: Vec<String>,
    },
    /// Start a group of profiles, Ctrl+C stops all of them
    Up { group: String },
    /// Test the ssh connection to the robot
    Check,
    /// Run a configured maintenance action
    Action { name: String },
    /// Print the effective configuration
    Config {
        #[arg(long)]
        yaml: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::setup_tracing(args.verbose, args.log_json);

    let config = match &args.config {
        Some(path) => LaunchConfig::load(path)?,
        None => LaunchConfig::included(),
    };
    let config = config.with_overrides(&args.overrides.into());

    match args.command {
        SubCommand::List => {
            for line in output::list_profiles(&config) {
                println!("{}", line);
            }
        }
        SubCommand::Show { profile } => {
            let profile = config.profile(&profile)?;
            print!(
                "{}",
                output::describe_profile(
                    &config,
                    profile,
                    &LocalHost::from_env(),
                    &SshHost::new(&config.remote)
                )
            );
        }
        SubCommand::Config { yaml } => {
            if yaml {
                print!("{}", config.serialize_to_yaml()?);
            } else {
                println!("{}", config.serialize_to_json()?);
            }
        }
        SubCommand::Check => {
            let target = config.remote.target.clone();
            let center = ControlCenter::from_config(config);
            if center.check_connection().await {
                println!("{} connected", target);
            } else {
                return Err(CtlError::Unreachable(target).into());
            }
        }
        SubCommand::Action { name } => {
            let center = ControlCenter::from_config(config);
            let output = center.run_action(&name).await?;
            println!("{} executed successfully", name);
            if !output.stdout.trim().is_empty() {
                print!("{}", output.stdout);
            }
        }
        SubCommand::Run { profiles } => {
            for profile in &profiles {
                config.profile(profile)?;
            }
            let center = ControlCenter::from_config(config);
            let supervisor = center.supervisor();
            let mut events = supervisor.subscribe();
            let mut started = vec![];
            for profile in &profiles {
                match supervisor.start(profile).await {
                    Ok(()) => started.push(profile.clone()),
                    Err(e) => tracing::error!("Failed to start {}: {}", profile, e),
                }
            }
            if started.is_empty() {
                return Err(CtlError::NothingToRun.into());
            }
            let count = started.len();
            let end = stream(&center, &mut events, started).await;
            if let Some(code) = session::exit_status(count, &end) {
                std::process::exit(code);
            }
        }
        SubCommand::Up { group } => {
            let center = ControlCenter::from_config(config);
            let supervisor = center.supervisor();
            let mut events = supervisor.subscribe();
            let result = center.start_group(&group).await?;
            for (id, error) in &result.failed {
                eprintln!("Failed to start {}: {}", id, error);
            }
            if result.started.is_empty() {
                return Err(CtlError::GroupFailed(group).into());
            }
            stream(&center, &mut events, result.started).await;
        }
    }
    Ok(())
}

async fn stream(
    center: &ControlCenter,
    events: &mut Receiver<ProcessEvent>,
    profiles: Vec<String>,
) -> SessionEnd {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+c: {}", e);
            std::future::pending::<()>().await;
        }
        tracing::info!("Detected Ctrl+c");
    };
    let mut stdout = std::io::stdout();
    session::stream_until_done(center, events, profiles, &mut stdout, ctrl_c).await
}
