use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use completion_log::{ExpectedDerivative, Roster, default_expected, LOG_FILE_NAME};
use slurm::BatchScript;
use stages::{Resources, StageSettings};

/// Options every driver and nested job is submitted with.
#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct SlurmDefaults {
    pub partition:String,
    pub account:Option<String>,
    pub qos:Option<String>,
    /// seconds between `squeue` polls while a step's job is queued
    pub poll_interval_sec:u64,
    /// delay before a driver whose inputs aren't ready tries again
    pub retry_delay_sec:u32,
}

impl Config for SlurmDefaults {
    fn default() -> Self {
        Self {
            partition:String::from("IB_44C_512G"),
            account:Some(String::from("iacc_madlab")),
            qos:Some(String::from("pq_madlab")),
            poll_interval_sec:3,
            retry_delay_sec:3600,
        }
    }
}

impl SlurmDefaults {
    /// apply partition/account/qos and a resource request to a batch script
    pub fn apply(&self,script:&mut BatchScript,resources:&Resources) {
        script.options.partition = self.partition.clone();
        script.options.account = self.account.clone();
        script.options.qos = self.qos.clone();
        script.options.wall_hours = Some(resources.wall_hours);
        script.options.memory = Some(format!("{}G",resources.mem_gig));
        script.options.cpus_per_task = Some(resources.cpus);
    }
}

#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct ProjectSettings {
    pub project_code:String,
    /// git checkout that holds `logs/completed_preprocessing.tsv`
    pub tracking_repo:PathBuf,
    pub tracking_remote:Option<String>,
    /// csv of consented participants; every dset subject is used when absent
    pub roster:Option<PathBuf>,
    /// where subject manager configs, state and driver output live
    pub state_dir:PathBuf,
    pub batch_size:usize,
    /// pause between driver submissions
    pub submit_spacing_sec:u64,
    pub slurm:SlurmDefaults,
    pub stages:StageSettings,
    pub expected:Vec<ExpectedDerivative>,
}

impl Config for ProjectSettings {
    fn default() -> Self {
        let stages = StageSettings::default();
        Self {
            project_code:String::from("McMakin_EMUR01"),
            tracking_repo:stages.proj_dir.join("code/func_processing"),
            tracking_remote:None,
            roster:None,
            state_dir:stages.scratch_dir.join("orchestrate"),
            batch_size:8,
            submit_spacing_sec:3,
            slurm:SlurmDefaults::default(),
            stages,
            expected:default_expected(),
        }
    }
}

impl ConfigFile for ProjectSettings {
    fn to_file(&self,filename:&Path) -> Result<()> {
        let t = toml::to_string_pretty(&self).context("cannot serialize project settings")?;
        utils::write_to_file(filename,&Self::file_ext(),&t)
            .with_context(|| format!("cannot write project settings {:?}",filename.with_extension(Self::file_ext())))
    }
    fn from_file(filename:&Path) -> Result<Self> {
        let t = utils::read_to_string(filename,&Self::file_ext())
            .with_context(|| format!("cannot read project settings {:?}",filename.with_extension(Self::file_ext())))?;
        toml::from_str(&t).with_context(|| format!("project settings {:?} must be corrupt",filename))
    }
    fn file_ext() -> String {
        String::from("project_settings")
    }
}

impl ProjectSettings {
    pub fn log_file(&self) -> PathBuf {
        self.tracking_repo.join("logs").join(LOG_FILE_NAME)
    }

    pub fn stage_dir(&self,label:&str) -> PathBuf {
        self.state_dir.join(label)
    }

    /// `<state_dir>/<label>/<unit>/<unit>` without extension
    pub fn manager_config(&self,label:&str,unit:&str) -> PathBuf {
        self.stage_dir(label).join(unit).join(unit)
    }

    pub fn columns(&self) -> Vec<String> {
        self.expected.iter().map(|e| e.column.clone()).collect()
    }

    /// subjects found in dset, limited to the roster when one is configured
    pub fn subjects(&self) -> Result<Vec<String>> {
        let dset = self.stages.dset_dir();
        let all = utils::list_subjects(&dset).with_context(|| format!("cannot list subjects in {:?}",dset))?;
        match &self.roster {
            Some(roster) => Ok(Roster::from_file(roster)?.filter(&all)),
            None => Ok(all),
        }
    }
}

pub trait Config {
    fn default() -> Self;
}

pub trait ConfigFile: Sized {
    fn to_file(&self,filename:&Path) -> Result<()>;
    fn from_file(filename:&Path) -> Result<Self>;
    fn file_ext() -> String;
    fn exists(filename:&Path) -> bool {
        filename.with_extension(Self::file_ext()).exists()
    }
}
