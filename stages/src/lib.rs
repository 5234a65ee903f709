pub mod artifact;
pub mod step;
pub mod settings;
pub mod stage;
pub mod internal;
pub mod motion;
pub mod timing;
pub mod afni_prep;
pub mod fmriprep;
pub mod afni_task;
pub mod afni_resting;
pub mod reface;
pub mod ashs;
pub mod group;

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use artifact::Artifact;
pub use step::{Action, Resources, Step};
pub use internal::InternalTask;
pub use settings::StageSettings;
pub use stage::{Stage, StageKind, StageRequest, producer_of};

#[derive(Debug,Error)]
pub enum StageError {
    #[error("{subj} is missing {what}")]
    MissingInput{subj:String,what:String},
    #[error("{subj} has {epi} preprocessed runs but {confounds} confound files")]
    RunMismatch{subj:String,epi:usize,confounds:usize},
    #[error("need at least {needed} subjects for a group analysis, found {found}")]
    InsufficientSubjects{needed:usize,found:usize},
    #[error("a task group contrasts exactly two behaviors, got {0}")]
    BehaviorCount(usize),
    #[error("column {column} not found in {path:?}")]
    MissingColumn{path:PathBuf,column:String},
    #[error("bad value '{value}' in {path:?}")]
    BadValue{path:PathBuf,value:String},
    #[error("io error on {path:?}: {source}")]
    Io{path:PathBuf,source:io::Error},
    #[error("malformed table {path:?}: {source}")]
    Table{path:PathBuf,source:csv::Error},
    #[error("malformed json {path:?}: {source}")]
    Json{path:PathBuf,source:serde_json::Error},
    #[error(transparent)]
    Slurm(#[from] slurm::SlurmError),
}

impl StageError {
    pub(crate) fn io(path:&Path) -> impl FnOnce(io::Error) -> StageError + '_ {
        move |source| StageError::Io{path:path.to_owned(),source}
    }
    pub(crate) fn table(path:&Path) -> impl FnOnce(csv::Error) -> StageError + '_ {
        move |source| StageError::Table{path:path.to_owned(),source}
    }
    pub(crate) fn json(path:&Path) -> impl FnOnce(serde_json::Error) -> StageError + '_ {
        move |source| StageError::Json{path:path.to_owned(),source}
    }
    pub(crate) fn missing(subj:&str,what:&str) -> StageError {
        StageError::MissingInput{subj:subj.to_string(),what:what.to_string()}
    }
}
