#![doc = include_str!("../../doc_include.md")]

pub mod control_center;
pub mod host;
pub mod invocation;
pub mod launch_config;
pub mod programs;
pub mod supervisor;
