use serde::{Deserialize, Serialize};
use completion_log::ExpectedDerivative;
use crate::artifact::{self, Artifact};
use crate::step::{Resources, Step};
use crate::settings::StageSettings;
use crate::StageError;
use crate::{afni_resting, afni_task, ashs, fmriprep, group, reface};

/// A processing stage: what it needs, what it leaves behind and the steps in between.
/// Subject stages plan one unit per subject; group stages plan a single unit.
pub trait Stage {
    fn kind(&self) -> StageKind;
    fn label(&self) -> String;
    fn inputs(&self,subj:&str) -> Vec<Artifact>;
    fn outputs(&self,subj:&str) -> Vec<Artifact>;
    fn plan(&self,subj:&str) -> Result<Vec<Step>,StageError>;
    fn driver_resources(&self) -> Resources;

    fn units(&self,subjects:&[String]) -> Vec<String> {
        subjects.to_vec()
    }

    /// every input is present
    fn is_ready(&self,subj:&str) -> bool {
        artifact::all_present(&self.inputs(subj))
    }

    /// some output is missing
    fn is_needed(&self,subj:&str) -> bool {
        !artifact::all_present(&self.outputs(subj))
    }
}

#[derive(Clone,Copy,Debug,PartialEq,Eq,Hash,Serialize,Deserialize)]
pub enum StageKind {
    Fmriprep,
    AfniTask,
    AfniResting,
    Reface,
    Ashs,
    TaskGroup,
    RestingGroup,
}

impl StageKind {
    /// stages whose outputs this stage reads
    pub fn dependencies(&self) -> &'static [StageKind] {
        match self {
            StageKind::Fmriprep => &[],
            StageKind::AfniTask => &[StageKind::Fmriprep],
            StageKind::AfniResting => &[StageKind::Fmriprep],
            StageKind::Reface => &[],
            StageKind::Ashs => &[],
            StageKind::TaskGroup => &[StageKind::AfniTask],
            StageKind::RestingGroup => &[StageKind::AfniResting],
        }
    }
}

/// map a completion log column to the stage that fills it
pub fn producer_of(expected:&ExpectedDerivative) -> Option<StageKind> {
    let column = expected.column.as_str();
    let resting = column.contains("rest") || expected.pattern.contains("task-rest");
    match expected.deriv_dir.as_str() {
        "fmriprep" | "freesurfer" => Some(StageKind::Fmriprep),
        "ashs" => Some(StageKind::Ashs),
        "reface" | "deface" | "reface_plus" => Some(StageKind::Reface),
        "afni" if resting => Some(StageKind::AfniResting),
        "afni" => Some(StageKind::AfniTask),
        _ => None
    }
}

#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageRequest {
    Fmriprep,
    AfniTask{session:String,task:String},
    AfniResting{session:String,task:String},
    Reface{method:String},
    Ashs{session:String},
    TaskGroup{session:String,task:String,decon:String,behaviors:Vec<String>},
    RestingGroup{task:String,seed:String},
}

impl StageRequest {
    pub fn kind(&self) -> StageKind {
        match self {
            StageRequest::Fmriprep => StageKind::Fmriprep,
            StageRequest::AfniTask{..} => StageKind::AfniTask,
            StageRequest::AfniResting{..} => StageKind::AfniResting,
            StageRequest::Reface{..} => StageKind::Reface,
            StageRequest::Ashs{..} => StageKind::Ashs,
            StageRequest::TaskGroup{..} => StageKind::TaskGroup,
            StageRequest::RestingGroup{..} => StageKind::RestingGroup,
        }
    }

    pub fn build(&self,settings:&StageSettings) -> Box<dyn Stage> {
        let s = settings.clone();
        match self {
            StageRequest::Fmriprep => Box::new(fmriprep::Fmriprep::new(s)),
            StageRequest::AfniTask{session,task} => Box::new(afni_task::AfniTask::new(s,session,task)),
            StageRequest::AfniResting{session,task} => Box::new(afni_resting::AfniResting::new(s,session,task)),
            StageRequest::Reface{method} => Box::new(reface::Reface::new(s,method)),
            StageRequest::Ashs{session} => Box::new(ashs::Ashs::new(s,session)),
            StageRequest::TaskGroup{session,task,decon,behaviors} => Box::new(group::TaskGroup::new(s,session,task,decon,behaviors)),
            StageRequest::RestingGroup{task,seed} => Box::new(group::RestingGroup::new(s,task,seed)),
        }
    }
}
