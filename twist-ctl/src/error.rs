use thiserror::Error;

#[derive(Error, Debug)]
pub enum CtlError {
    #[error("remote host {0:?} is not reachable")]
    Unreachable(String),
    #[error("no profile of group {0:?} could be started")]
    GroupFailed(String),
    #[error("nothing to run")]
    NothingToRun,
}
