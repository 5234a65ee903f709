use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use slurm::{BatchScript, JobState, PollSettings, Scheduler};
use stages::{Action, Resources, StageRequest, Step};
use tracing::{debug, error, info, warn};
use crate::project_config::{ConfigFile, ProjectSettings};

/// Everything a driver job needs: the project, which stage, which unit and the steps
/// planned for it at submit time.
#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct SubjectManagerConfig {
    pub subject:String,
    pub label:String,
    pub slurm_disabled:bool,
    pub driver_log_dir:PathBuf,
    pub driver:Resources,
    pub request:StageRequest,
    pub project:ProjectSettings,
    pub steps:Vec<Step>,
}

impl ConfigFile for SubjectManagerConfig {
    fn to_file(&self,filename:&Path) -> Result<()> {
        let t = toml::to_string_pretty(&self).context("cannot serialize subject manager config")?;
        utils::write_to_file(filename,&Self::file_ext(),&t)
            .with_context(|| format!("cannot write {:?}",filename.with_extension(Self::file_ext())))
    }
    fn from_file(filename:&Path) -> Result<Self> {
        let t = utils::read_to_string(filename,&Self::file_ext())
            .with_context(|| format!("cannot read {:?}",filename.with_extension(Self::file_ext())))?;
        toml::from_str(&t).with_context(|| format!("subject manager config {:?} is corrupt",filename))
    }
    fn file_ext() -> String {
        String::from("subj_config")
    }
}

impl SubjectManagerConfig {
    pub fn new(project:&ProjectSettings,request:&StageRequest,unit:&str,driver_log_dir:&Path,slurm_disabled:bool) -> Result<Self> {
        let stage = request.build(&project.stages);
        let steps = stage.plan(unit).with_context(|| format!("cannot plan {} for {}",stage.label(),unit))?;
        Ok(Self {
            subject:unit.to_string(),
            label:stage.label(),
            slurm_disabled,
            driver_log_dir:driver_log_dir.to_owned(),
            driver:stage.driver_resources(),
            request:request.clone(),
            project:project.clone(),
            steps,
        })
    }

    /// also the driver's job name
    pub fn name(&self) -> String {
        format!("{}-{}",self.label,self.subject)
    }

    pub fn is_slurm_disabled(&self) -> bool {
        self.slurm_disabled
    }

    pub fn poll(&self) -> PollSettings {
        PollSettings {
            interval:Duration::from_secs(self.project.slurm.poll_interval_sec),
            ..PollSettings::default()
        }
    }
}

#[derive(Clone,Copy,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub enum SubjectManagerState {
    Idle,
    Running,
    Done,
    Failed,
}

#[derive(Clone,Debug,PartialEq)]
enum StateAdvance {
    Succeeded,
    TerminalFailure,
    TryingAgainLater,
    AllWorkDone,
}

/// The process driving a unit outside of slurm.
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct LocalRun {
    pub host:String,
    pub pid:u32,
}

impl LocalRun {
    pub fn this_process() -> Self {
        Self{host:slurm::hostname(),pid:std::process::id()}
    }

    /// Only answerable on the same host. A run on another host is assumed alive.
    pub fn is_alive(&self) -> bool {
        match self.host == slurm::hostname() {
            true => Path::new("/proc").join(self.pid.to_string()).exists(),
            false => true,
        }
    }
}

/// Persistent state of one unit's driver. Lives next to its config with the
/// `subj_man` extension and is rewritten after every step.
#[derive(Clone,Debug,Serialize,Deserialize)]
pub struct SubjectManager {
    config:PathBuf,
    state:SubjectManagerState,
    next_step:usize,
    slurm_job_id:Option<u32>,
    step_job_id:Option<u32>,
    last_error:Option<String>,
    local_run:Option<LocalRun>,
}

/// index of the first step that still has work to do
pub fn first_unsatisfied(steps:&[Step]) -> usize {
    steps.iter().position(|s| !s.is_satisfied()).unwrap_or(steps.len())
}

impl SubjectManager {

    pub fn read(config:&Path) -> Result<Option<Self>> {
        let state_file = config.with_extension(Self::file_ext());
        match state_file.exists() {
            false => Ok(None),
            true => {
                let t = utils::read_to_string(config,&Self::file_ext()).with_context(|| format!("cannot read {:?}",state_file))?;
                let sm = toml::from_str(&t).with_context(|| format!("subject manager state file {:?} is corrupt",state_file))?;
                Ok(Some(sm))
            }
        }
    }

    pub fn open(config:&Path) -> Result<Self> {
        match Self::read(config)? {
            Some(sm) => Ok(sm),
            None => {
                info!("state file not found. creating a new one ...");
                let sm = Self::new(config);
                sm.to_file()?;
                Ok(sm)
            }
        }
    }

    pub fn to_file(&self) -> Result<()> {
        let t = toml::to_string(&self).context("cannot serialize subject manager state")?;
        utils::write_to_file(&self.config,&Self::file_ext(),&t)
            .with_context(|| format!("cannot write state for {:?}",self.config))
    }

    pub fn file_ext() -> String {
        String::from("subj_man")
    }

    fn new(config:&Path) -> Self {
        Self {
            config:config.with_extension(""),
            state:SubjectManagerState::Idle,
            next_step:0,
            slurm_job_id:None,
            step_job_id:None,
            last_error:None,
            local_run:None,
        }
    }

    pub fn config(&self) -> Result<SubjectManagerConfig> {
        SubjectManagerConfig::from_file(&self.config)
    }

    pub fn config_path(&self) -> &Path {
        &self.config
    }

    pub fn work_dir(&self) -> &Path {
        self.config.parent().unwrap_or_else(|| Path::new("."))
    }

    /// the unit this manager drives
    pub fn name(&self) -> String {
        utils::file_name(&self.config)
    }

    pub fn slurm_out_dir(&self) -> PathBuf {
        self.work_dir().join("sbatch_out")
    }

    pub fn state(&self) -> SubjectManagerState {
        self.state
    }

    pub fn set_state(&mut self,state:SubjectManagerState) {
        self.state = state;
    }

    /// back to idle so the next launch re-checks inputs and resumes
    pub fn reset(&mut self) {
        self.state = SubjectManagerState::Idle;
        self.step_job_id = None;
        self.last_error = None;
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state,SubjectManagerState::Done)
    }

    pub fn next_step(&self) -> usize {
        self.next_step
    }

    pub fn job_id(&self) -> Option<u32> {
        self.slurm_job_id
    }

    pub fn step_job_id(&self) -> Option<u32> {
        self.step_job_id
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn local_run(&self) -> Option<&LocalRun> {
        self.local_run.as_ref()
    }

    pub fn slurm_status(&self,scheduler:&dyn Scheduler) -> Option<JobState> {
        let jid = self.slurm_job_id?;
        match scheduler.job_state(jid) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(job_id = jid, "unable to get job state: {}",e);
                None
            }
        }
    }

    /// A driver job is still queued, or the terminal process running this unit
    /// still exists. A Running state left behind by a killed process is stale.
    pub fn is_live(&self,scheduler:&dyn Scheduler) -> bool {
        match self.slurm_job_id {
            Some(jid) => match scheduler.is_queued(jid) {
                Ok(queued) => queued,
                Err(e) => {
                    warn!(job_id = jid, "unable to query queue: {}",e);
                    false
                }
            },
            None => self.state == SubjectManagerState::Running && !self.is_abandoned(),
        }
    }

    /// Running in a terminal that is gone: no driver job and no live process
    pub fn is_abandoned(&self) -> bool {
        self.slurm_job_id.is_none()
            && self.state == SubjectManagerState::Running
            && !self.local_run.as_ref().map(|r| r.is_alive()).unwrap_or(false)
    }

    /// cancel the driver and any step job it is waiting on. Returns the ids scancel accepted.
    pub fn cancel(&self,scheduler:&dyn Scheduler) -> Vec<u32> {
        [self.slurm_job_id,self.step_job_id].into_iter().flatten()
            .filter(|jid| slurm::cancel(scheduler,*jid))
            .collect()
    }

    fn launch_cmd(config:&Path) -> Result<Command> {
        let this_exe = std::env::current_exe().context("couldn't determine the current executable")?;
        let mut cmd = Command::new(this_exe);
        cmd.args(["subject-manager","launch"]);
        cmd.arg(config.with_extension(""));
        Ok(cmd)
    }

    pub fn slurm_batch_script(config:&Path) -> Result<BatchScript> {
        let cfg = SubjectManagerConfig::from_file(config)?;
        let mut bs = BatchScript::from_commands(&cfg.name(),&[Self::launch_cmd(config)?]);
        cfg.project.slurm.apply(&mut bs,&cfg.driver);
        std::fs::create_dir_all(&cfg.driver_log_dir).with_context(|| format!("unable to create {:?}",cfg.driver_log_dir))?;
        bs.options.output = cfg.driver_log_dir.join(format!("{}-%j.out",cfg.subject)).to_string_lossy().to_string();
        Ok(bs)
    }

    pub fn launch_with_slurm_now(config:&Path,scheduler:&dyn Scheduler) -> Result<u32> {
        let mut sm = SubjectManager::open(config)?;
        let mut bs = Self::slurm_batch_script(config)?;
        let jid = bs.submit_now(sm.work_dir(),scheduler)?;
        sm.slurm_job_id = Some(jid);
        sm.to_file()?;
        Ok(jid)
    }

    pub fn launch_with_slurm_later(config:&Path,scheduler:&dyn Scheduler,seconds_later:u32) -> Result<u32> {
        let mut sm = SubjectManager::open(config)?;
        let mut bs = Self::slurm_batch_script(config)?;
        let jid = bs.submit_later(sm.work_dir(),scheduler,seconds_later)?;
        sm.slurm_job_id = Some(jid);
        sm.to_file()?;
        Ok(jid)
    }

    /// Advance step by step until the plan is done, a step fails or inputs aren't
    /// ready yet. State is written after every advance.
    pub fn launch(config:&Path,scheduler:&dyn Scheduler) -> Result<SubjectManagerState> {
        let mut sm = SubjectManager::open(config)?;
        let cfg = sm.config()?;
        info!("loaded {} in state {:?} at step {}",cfg.name(),sm.state,sm.next_step);
        sm.local_run = Some(LocalRun::this_process());

        use StateAdvance::*;
        loop {
            let status = sm.advance_state(&cfg,scheduler);
            debug!("state advance returned with code {:?}, current state is {:?}",status,sm.state);
            if status != Succeeded {
                sm.local_run = None;
            }
            sm.to_file()?;
            match status {
                Succeeded => continue,
                TryingAgainLater => {
                    let delay = cfg.project.slurm.retry_delay_sec;
                    let jid = Self::launch_with_slurm_later(config,scheduler,delay)?;
                    info!(job_id = jid, "{} rescheduled in {} seconds",cfg.name(),delay);
                    break
                }
                TerminalFailure => {
                    error!("{} cannot continue. Will not reschedule.",cfg.name());
                    break
                }
                AllWorkDone => {
                    info!("{}: all work is complete.",cfg.name());
                    break
                }
            }
        }
        Ok(sm.state)
    }

    fn advance_state(&mut self,cfg:&SubjectManagerConfig,scheduler:&dyn Scheduler) -> StateAdvance {
        use SubjectManagerState::*;
        match self.state {
            Idle => {
                let stage = cfg.request.build(&cfg.project.stages);
                if !stage.is_ready(&cfg.subject) {
                    let missing:Vec<String> = stages::artifact::missing(&stage.inputs(&cfg.subject)).iter().map(|a| a.key.clone()).collect();
                    warn!("{} is missing inputs {:?}",cfg.name(),missing);
                    self.last_error = Some(format!("missing inputs {:?}",missing));
                    return match cfg.is_slurm_disabled() {
                        false => StateAdvance::TryingAgainLater,
                        true => {
                            self.state = Failed;
                            StateAdvance::TerminalFailure
                        }
                    }
                }
                self.next_step = first_unsatisfied(&cfg.steps);
                self.last_error = None;
                self.state = Running;
                info!("{} starting at step {} of {}",cfg.name(),self.next_step,cfg.steps.len());
                StateAdvance::Succeeded
            }
            Running => {
                let step = match cfg.steps.get(self.next_step) {
                    Some(step) => step,
                    None => {
                        self.state = Done;
                        return StateAdvance::AllWorkDone
                    }
                };
                if step.is_satisfied() {
                    debug!("{} already done",step.name);
                    self.next_step += 1;
                    return StateAdvance::Succeeded
                }
                match self.run_step(step,cfg,scheduler) {
                    Ok(()) => {
                        self.next_step += 1;
                        StateAdvance::Succeeded
                    }
                    Err(e) => {
                        error!("{}: {:#}",cfg.name(),e);
                        self.last_error = Some(format!("{:#}",e));
                        self.step_job_id = None;
                        self.state = Failed;
                        StateAdvance::TerminalFailure
                    }
                }
            }
            Done => StateAdvance::AllWorkDone,
            Failed => StateAdvance::TerminalFailure,
        }
    }

    fn run_step(&mut self,step:&Step,cfg:&SubjectManagerConfig,scheduler:&dyn Scheduler) -> Result<()> {
        info!("running {} ...",step.name);
        let ok = match &step.action {
            Action::Internal{task} => {
                task.run().with_context(|| format!("step {} failed",step.name))?;
                true
            }
            Action::Shell{modules,script,scheduled} => {
                let text = format!("mkdir -p {wd}\ncd {wd}\n{script}",wd = step.work_dir.display(),script = script);
                match *scheduled && !cfg.is_slurm_disabled() {
                    false => {
                        let r = slurm::run_local(modules,&text)?;
                        if !r.stdout.trim().is_empty() {
                            debug!("{} output:\n{}",step.name,r.stdout.trim());
                        }
                        r.success
                    }
                    true => {
                        let mut bs = BatchScript::new(&step.job_name,&[text]);
                        bs.modules = modules.clone();
                        cfg.project.slurm.apply(&mut bs,&step.resources);
                        let out_dir = self.slurm_out_dir();
                        bs.options.output = out_dir.join(format!("{}-%j.out",step.job_name)).to_string_lossy().to_string();
                        let jid = bs.submit_now(&out_dir,scheduler)?;
                        self.step_job_id = Some(jid);
                        self.to_file()?;
                        let state = slurm::wait_for_job(scheduler,jid,&cfg.poll())?;
                        self.step_job_id = None;
                        info!(job_id = jid, %state, "{} left the queue",step.name);
                        state.is_success()
                    }
                }
            }
        };
        match (step.checks.is_empty(),step.missing_checks()) {
            (true,_) if ok => Ok(()),
            (true,_) => Err(anyhow!("step {} exited unsuccessfully",step.name)),
            (false,missing) if missing.is_empty() => {
                if !ok {
                    warn!("{} reported failure but left every expected file",step.name);
                }
                Ok(())
            }
            (false,missing) => Err(anyhow!("step {} did not produce {:?}",step.name,missing)),
        }
    }
}
