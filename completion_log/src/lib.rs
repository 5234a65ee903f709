pub mod expected;
pub mod log;
pub mod roster;
pub mod git;
pub mod lock;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub use expected::{ExpectedDerivative, default_expected};
pub use log::{CompletionLog, SUBJECT_COLUMN, LOG_FILE_NAME};
pub use roster::Roster;
pub use git::GitSync;
pub use lock::{LogLock, is_locked};

#[derive(Debug,Error)]
pub enum LogError {
    #[error("io error on {path:?}: {source}")]
    Io{path:PathBuf,source:io::Error},
    #[error("malformed table {path:?}: {source}")]
    Csv{path:PathBuf,source:csv::Error},
    #[error("first column of {0:?} must be subjID")]
    MissingSubjectColumn(PathBuf),
    #[error("roster {0:?} has no redcap_id column")]
    MissingRosterId(PathBuf),
    #[error("unknown column {0}")]
    UnknownColumn(String),
    #[error("unknown subject {0}")]
    UnknownSubject(String),
    #[error("git {args} failed in {dir:?}: {stderr}")]
    Git{args:String,dir:PathBuf,stderr:String},
    #[error("log {0:?} is still locked after waiting")]
    Locked(PathBuf),
}

impl LogError {
    pub(crate) fn io(path:&std::path::Path) -> impl FnOnce(io::Error) -> LogError + '_ {
        move |source| LogError::Io{path:path.to_owned(),source}
    }
    pub(crate) fn csv(path:&std::path::Path) -> impl FnOnce(csv::Error) -> LogError + '_ {
        move |source| LogError::Csv{path:path.to_owned(),source}
    }
}
