use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const TELEOP_SCRIPT: &str = "xrobot_teleop_to_robot_w_hand.py";
pub const LOW_LEVEL_SCRIPT: &str = "server_low_level_g1_real.py";
pub const MOTION_SERVER_SCRIPT: &str = "server_motion_lib.py";
pub const DATA_RECORD_SCRIPT: &str = "server_data_record.py";

const DEFAULT_ROBOT: &str = "unitree_g1";

fn push_value(args: &mut Vec<String>, flag: &str, value: impl ToString) {
    args.push(flag.to_owned());
    args.push(value.to_string());
}

fn push_switch(args: &mut Vec<String>, flag: &str, enabled: bool) {
    if enabled {
        args.push(flag.to_owned());
    }
}

/// Flags of the whole body teleoperation client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeleopArgs {
    pub robot: String,
    pub actual_human_height: f64,
    pub redis_ip: String,
    pub target_fps: u32,
    pub measure_fps: u32,
    #[serde(default)]
    pub smooth: bool,
    #[serde(default)]
    pub pinch_mode: bool,
}

impl Default for TeleopArgs {
    fn default() -> Self {
        TeleopArgs {
            robot: DEFAULT_ROBOT.to_owned(),
            actual_human_height: 1.5,
            redis_ip: "localhost".to_owned(),
            target_fps: 100,
            measure_fps: 1,
            smooth: false,
            pinch_mode: false,
        }
    }
}

impl TeleopArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![];
        push_value(&mut args, "--robot", &self.robot);
        push_value(&mut args, "--actual_human_height", self.actual_human_height);
        push_value(&mut args, "--redis_ip", &self.redis_ip);
        push_value(&mut args, "--target_fps", self.target_fps);
        push_value(&mut args, "--measure_fps", self.measure_fps);
        push_switch(&mut args, "--smooth", self.smooth);
        push_switch(&mut args, "--pinch_mode", self.pinch_mode);
        args
    }
}

/// Flags of the low level policy server running on the real robot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowLevelArgs {
    pub policy: PathBuf,
    pub net: String,
    pub device: String,
    #[serde(default)]
    pub use_hand: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smooth_body: Option<f64>,
    #[serde(default)]
    pub record_proprio: bool,
}

impl Default for LowLevelArgs {
    fn default() -> Self {
        LowLevelArgs {
            policy: PathBuf::from("assets/ckpts/twist2_1017_20k.onnx"),
            net: "eno1".to_owned(),
            device: "cuda".to_owned(),
            use_hand: true,
            smooth_body: None,
            record_proprio: false,
        }
    }
}

impl LowLevelArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![];
        push_value(&mut args, "--policy", self.policy.display());
        push_value(&mut args, "--net", &self.net);
        push_value(&mut args, "--device", &self.device);
        push_switch(&mut args, "--use_hand", self.use_hand);
        if let Some(smooth_body) = self.smooth_body {
            push_value(&mut args, "--smooth_body", smooth_body);
        }
        push_switch(&mut args, "--record_proprio", self.record_proprio);
        args
    }
}

/// Flags of the offline motion library server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionServerArgs {
    pub motion_file: PathBuf,
    pub robot: String,
    #[serde(default)]
    pub vis: bool,
    pub redis_ip: String,
    #[serde(default)]
    pub send_start_frame_as_end_frame: bool,
    #[serde(default)]
    pub use_remote_control: bool,
}

impl Default for MotionServerArgs {
    fn default() -> Self {
        MotionServerArgs {
            motion_file: PathBuf::from("assets/example_motions/0807_yanjie_walk_001.pkl"),
            robot: DEFAULT_ROBOT.to_owned(),
            vis: true,
            redis_ip: "localhost".to_owned(),
            send_start_frame_as_end_frame: false,
            use_remote_control: false,
        }
    }
}

impl MotionServerArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![];
        push_value(&mut args, "--motion_file", self.motion_file.display());
        push_value(&mut args, "--robot", &self.robot);
        push_switch(&mut args, "--vis", self.vis);
        push_value(&mut args, "--redis_ip", &self.redis_ip);
        push_switch(
            &mut args,
            "--send_start_frame_as_end_frame",
            self.send_start_frame_as_end_frame,
        );
        push_switch(&mut args, "--use_remote_control", self.use_remote_control);
        args
    }
}

/// Flags of the episode recorder
///
/// Folder and task name fall back to the recorder's own defaults
/// (a timestamped task name) when left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecordArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_folder: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    pub frequency: u32,
    pub robot: String,
    pub robot_ip: String,
}

impl Default for DataRecordArgs {
    fn default() -> Self {
        DataRecordArgs {
            data_folder: None,
            task_name: None,
            frequency: 30,
            robot: DEFAULT_ROBOT.to_owned(),
            robot_ip: "192.168.123.164".to_owned(),
        }
    }
}

impl DataRecordArgs {
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![];
        if let Some(data_folder) = &self.data_folder {
            push_value(&mut args, "--data_folder", data_folder.display());
        }
        if let Some(task_name) = &self.task_name {
            push_value(&mut args, "--task_name", task_name);
        }
        push_value(&mut args, "--frequency", self.frequency);
        push_value(&mut args, "--robot", &self.robot);
        push_value(&mut args, "--robot_ip", &self.robot_ip);
        args
    }
}

/// Values usually edited at the top of a launcher script
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub redis_ip: Option<String>,
    pub net: Option<String>,
    pub ckpt_path: Option<PathBuf>,
    pub motion_file: Option<PathBuf>,
}

impl Overrides {
    pub fn is_empty(&self) -> bool {
        self == &Overrides::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "program", rename_all = "snake_case")]
pub enum ProgramKind {
    Teleop(TeleopArgs),
    LowLevel(LowLevelArgs),
    MotionServer(MotionServerArgs),
    DataRecord(DataRecordArgs),
    /// Opaque command, typically a shell script on the robot
    Script { command: String },
}

impl ProgramKind {
    pub fn script_name(&self) -> Option<&'static str> {
        match self {
            ProgramKind::Teleop(_) => Some(TELEOP_SCRIPT),
            ProgramKind::LowLevel(_) => Some(LOW_LEVEL_SCRIPT),
            ProgramKind::MotionServer(_) => Some(MOTION_SERVER_SCRIPT),
            ProgramKind::DataRecord(_) => Some(DATA_RECORD_SCRIPT),
            ProgramKind::Script { .. } => None,
        }
    }

    /// Python flags, `None` for opaque scripts
    pub fn to_args(&self) -> Option<Vec<String>> {
        match self {
            ProgramKind::Teleop(args) => Some(args.to_args()),
            ProgramKind::LowLevel(args) => Some(args.to_args()),
            ProgramKind::MotionServer(args) => Some(args.to_args()),
            ProgramKind::DataRecord(args) => Some(args.to_args()),
            ProgramKind::Script { .. } => None,
        }
    }

    /// Applies every override whose flag this program carries
    pub fn apply(&mut self, overrides: &Overrides) {
        match self {
            ProgramKind::Teleop(args) => {
                if let Some(redis_ip) = &overrides.redis_ip {
                    args.redis_ip = redis_ip.clone();
                }
            }
            ProgramKind::LowLevel(args) => {
                if let Some(net) = &overrides.net {
                    args.net = net.clone();
                }
                if let Some(ckpt_path) = &overrides.ckpt_path {
                    args.policy = ckpt_path.clone();
                }
            }
            ProgramKind::MotionServer(args) => {
                if let Some(redis_ip) = &overrides.redis_ip {
                    args.redis_ip = redis_ip.clone();
                }
                if let Some(motion_file) = &overrides.motion_file {
                    args.motion_file = motion_file.clone();
                }
            }
            ProgramKind::DataRecord(_) | ProgramKind::Script { .. } => {}
        }
    }
}
