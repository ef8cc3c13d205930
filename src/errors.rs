use std::result;

use failure::Fail;

pub type Result<T> = result::Result<T, ::failure::Error>;

/// Errors surfaced by the public scheduler interface. Failures inside task
/// bodies do not show up here; they ride the join path as resumed panics.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid settings: {}", _0)]
    InvalidSettings(String),
    #[fail(display = "scheduler has been started already")]
    AlreadyStarted,
    #[fail(display = "scheduler is not running")]
    NotRunning,
    #[fail(display = "scheduler has been terminated")]
    Terminated,
}
