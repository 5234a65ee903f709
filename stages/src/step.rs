use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::internal::InternalTask;

#[derive(Clone,Copy,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct Resources {
    pub wall_hours:u32,
    pub mem_gig:u32,
    pub cpus:u32,
}

impl Resources {
    pub fn new(wall_hours:u32,mem_gig:u32,cpus:u32) -> Self {
        Self{wall_hours,mem_gig,cpus}
    }
}

impl Default for Resources {
    fn default() -> Self {
        Self::new(1,1,1)
    }
}

#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// shell text run either as its own sbatch job or directly on the driver node
    Shell{modules:Vec<String>,script:String,scheduled:bool},
    Internal{task:InternalTask},
}

/// One unit of work in a subject's plan. The `checks` are the files the step leaves
/// behind; when all of them exist the step is skipped.
#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct Step {
    pub name:String,
    pub job_name:String,
    pub work_dir:PathBuf,
    pub checks:Vec<PathBuf>,
    pub resources:Resources,
    pub action:Action,
}

impl Step {
    fn new(name:&str,job_name:&str,work_dir:&Path,action:Action) -> Self {
        Self {
            name:name.to_string(),
            job_name:job_name.to_string(),
            work_dir:work_dir.to_owned(),
            checks:Vec::new(),
            resources:Resources::default(),
            action,
        }
    }

    pub fn local(name:&str,work_dir:&Path,modules:&[String],script:&str) -> Self {
        Self::new(name,name,work_dir,Action::Shell{modules:modules.to_vec(),script:script.to_string(),scheduled:false})
    }

    pub fn scheduled(name:&str,job_name:&str,work_dir:&Path,modules:&[String],script:&str) -> Self {
        Self::new(name,job_name,work_dir,Action::Shell{modules:modules.to_vec(),script:script.to_string(),scheduled:true})
    }

    pub fn internal(name:&str,work_dir:&Path,task:InternalTask) -> Self {
        Self::new(name,name,work_dir,Action::Internal{task})
    }

    pub fn checks(mut self,checks:Vec<PathBuf>) -> Self {
        self.checks = checks;
        self
    }

    pub fn check(mut self,check:PathBuf) -> Self {
        self.checks.push(check);
        self
    }

    pub fn resources(mut self,resources:Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(self.action,Action::Shell{scheduled:true,..})
    }

    /// steps without checks always run
    pub fn is_satisfied(&self) -> bool {
        !self.checks.is_empty() && self.checks.iter().all(|c| c.exists())
    }

    pub fn missing_checks(&self) -> Vec<&PathBuf> {
        self.checks.iter().filter(|c| !c.exists()).collect()
    }
}
