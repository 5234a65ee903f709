use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use chrono::Local;
use serde::Serialize;
use completion_log::{CompletionLog, GitSync, LogLock};
use slurm::{JobState, Scheduler};
use stages::{StageKind, StageRequest};
use tracing::{info, warn};
use crate::project_config::{ConfigFile, ProjectSettings};
use crate::subject_manager::{SubjectManager, SubjectManagerConfig, SubjectManagerState};
use crate::work_queue::WorkQueue;

const LOCK_ATTEMPTS:u32 = 30;
const LOCK_MAX_WAIT:Duration = Duration::from_secs(2);

#[derive(Clone,Debug,Default)]
pub struct CheckReport {
    pub subjects:usize,
    /// columns filled by this check, per subject
    pub filled:BTreeMap<String,Vec<String>>,
    /// subjects with at least one empty cell after the check
    pub incomplete:Vec<String>,
    /// subjects still waiting on each producing stage
    pub needed:HashMap<StageKind,Vec<String>>,
}

#[derive(Clone,Debug,Default)]
pub struct CheckOptions {
    /// pull the tracking repo first, commit and push the log afterwards
    pub sync:bool,
    /// discard the existing log and rebuild it from the derivatives
    pub new_log:bool,
    /// only check this subject
    pub subject:Option<String>,
}

/// Bring the completion log up to date with the derivatives directory.
pub fn refresh_log(project:&ProjectSettings,opts:&CheckOptions) -> Result<CheckReport> {
    let log_file = project.log_file();
    let git = GitSync::new(&project.tracking_repo,project.tracking_remote.as_deref());
    let sync = opts.sync;
    if sync {
        git.update().context("cannot update tracking repo")?;
    }
    if let Some(parent) = log_file.parent() {
        create_dir_all(parent).with_context(|| format!("unable to create {:?}",parent))?;
    }
    let _lock = LogLock::acquire(&log_file,LOCK_ATTEMPTS,LOCK_MAX_WAIT)?;

    let mut log = match log_file.exists() && !opts.new_log {
        true => CompletionLog::read(&log_file)?,
        false => {
            info!("starting a new completion log at {:?}",log_file);
            CompletionLog::new(&project.columns(),&[])
        }
    };
    log.ensure_columns(&project.columns());

    let mut subjects = project.subjects()?;
    if let Some(subj) = &opts.subject {
        if !subjects.contains(subj) {
            bail!("{} is not a subject of {}",subj,project.project_code);
        }
        subjects = vec![subj.clone()];
    }
    let deriv = project.stages.deriv_dir();
    let mut report = CheckReport{subjects:subjects.len(),..CheckReport::default()};
    for subj in &subjects {
        let filled = log.check_subject(&deriv,subj,&project.expected);
        if !filled.is_empty() {
            info!("{}: found {}",subj,filled.join(", "));
            report.filled.insert(subj.clone(),filled);
        }
        let missing = log.missing_columns(subj);
        if missing.is_empty() {
            continue
        }
        report.incomplete.push(subj.clone());
        let kinds:HashSet<StageKind> = project.expected.iter()
            .filter(|e| missing.contains(&e.column))
            .filter_map(stages::producer_of)
            .collect();
        for kind in kinds {
            report.needed.entry(kind).or_default().push(subj.clone());
        }
    }
    log.write(&log_file)?;
    if sync {
        git.publish(&log_file).context("cannot publish completion log")?;
    }
    Ok(report)
}

/// units of a stage with a driver still in the queue or running in a terminal
pub fn active_units(project:&ProjectSettings,label:&str,scheduler:&dyn Scheduler) -> Result<HashSet<String>> {
    let queued:HashSet<String> = match scheduler.user_queue(&slurm::current_user()) {
        Ok(names) => names.into_iter().collect(),
        Err(e) => {
            warn!("unable to list the user's queue: {}",e);
            HashSet::new()
        }
    };
    let mut active = HashSet::new();
    for state_file in state_files(&project.stage_dir(label)) {
        let sm = match SubjectManager::read(&state_file)? {
            Some(sm) => sm,
            None => continue,
        };
        let unit = sm.name();
        if sm.is_live(scheduler) || queued.contains(&format!("{}-{}",label,unit)) {
            active.insert(unit);
        }
    }
    Ok(active)
}

fn state_files(dir:&Path) -> Vec<PathBuf> {
    let mut files = utils::find_files(dir,&SubjectManager::file_ext()).unwrap_or_default();
    files.sort();
    files
}

fn config_files(dir:&Path) -> Vec<PathBuf> {
    let mut files = utils::find_files(dir,&SubjectManagerConfig::file_ext()).unwrap_or_default();
    files.sort();
    files
}

#[derive(Clone,Debug)]
pub struct SubmitOptions {
    pub batch_size:usize,
    pub dry_run:bool,
    pub slurm_disabled:bool,
}

#[derive(Clone,Debug,PartialEq)]
pub struct Submission {
    pub unit:String,
    pub config:PathBuf,
    /// driver job id, when submitted to slurm
    pub job_id:Option<u32>,
    /// final state, when run in this terminal
    pub state:Option<SubjectManagerState>,
}

#[derive(Clone,Debug)]
pub struct SubmitReport {
    pub label:String,
    pub queue:WorkQueue,
    pub batch:Vec<String>,
    pub submitted:Vec<Submission>,
}

/// Write configs for the next batch of a stage's work queue and launch their drivers.
pub fn submit_stage(project:&ProjectSettings,request:&StageRequest,scheduler:&dyn Scheduler,opts:&SubmitOptions) -> Result<SubmitReport> {
    let stage = request.build(&project.stages);
    let label = stage.label();
    let subjects = project.subjects()?;
    let active = active_units(project,&label,scheduler)?;
    let queue = WorkQueue::build(stage.as_ref(),&subjects,&active);
    info!("{}: {}",label,queue.summary());
    let batch = queue.take(opts.batch_size);
    let mut report = SubmitReport{label:label.clone(),queue,batch:batch.clone(),submitted:vec![]};
    if opts.dry_run || batch.is_empty() {
        return Ok(report)
    }

    let driver_log_dir = project.stage_dir(&label).join("slurm_out").join(utils::timestamped_name(&label,&Local::now()));
    create_dir_all(&driver_log_dir).with_context(|| format!("unable to create {:?}",driver_log_dir))?;

    for unit in batch.iter() {
        let config = project.manager_config(&label,unit);
        if let Err(e) = prepare_manager(project,request,unit,&config,&driver_log_dir,opts.slurm_disabled) {
            warn!("skipping {}: {:#}",unit,e);
            continue
        }
        let submission = match opts.slurm_disabled {
            true => {
                info!("launching subject manager without slurm {:?}",config);
                Submission{unit:unit.clone(),config:config.clone(),job_id:None,state:Some(SubjectManager::launch(&config,scheduler)?)}
            }
            false => {
                if !report.submitted.is_empty() {
                    std::thread::sleep(Duration::from_secs(project.submit_spacing_sec));
                }
                let jid = SubjectManager::launch_with_slurm_now(&config,scheduler)?;
                info!("{}-{} job submitted with id {}",label,unit,jid);
                Submission{unit:unit.clone(),config:config.clone(),job_id:Some(jid),state:None}
            }
        };
        report.submitted.push(submission);
    }
    Ok(report)
}

/// Write the unit's config unless one exists and make its manager launchable again.
fn prepare_manager(project:&ProjectSettings,request:&StageRequest,unit:&str,config:&Path,driver_log_dir:&Path,slurm_disabled:bool) -> Result<()> {
    match SubjectManagerConfig::exists(config) {
        true => {
            info!("config already found for {}. Will not re-initialize",unit);
            let mut c = SubjectManagerConfig::from_file(config)?;
            if c.slurm_disabled != slurm_disabled || c.driver_log_dir != driver_log_dir {
                c.slurm_disabled = slurm_disabled;
                c.driver_log_dir = driver_log_dir.to_owned();
                c.to_file(config)?;
            }
        }
        false => {
            let c = SubjectManagerConfig::new(project,request,unit,driver_log_dir,slurm_disabled)?;
            if let Some(dir) = config.parent() {
                create_dir_all(dir).with_context(|| format!("unable to create {:?}",dir))?;
            }
            info!("creating new configuration for subject manager {}",c.name());
            c.to_file(config)?;
        }
    }
    // a queued unit whose last driver finished still has outputs missing
    if let Some(mut sm) = SubjectManager::read(config)? {
        if sm.state() != SubjectManagerState::Idle {
            sm.reset();
            sm.to_file()?;
        }
    }
    Ok(())
}

#[derive(Clone,Debug,Serialize)]
pub struct ManagerSummary {
    pub name:String,
    pub state:SubjectManagerState,
    pub next_step:usize,
    pub n_steps:usize,
    pub job_id:Option<u32>,
    pub job_state:Option<JobState>,
    pub last_error:Option<String>,
}

/// every manager under the stage directory, or the whole state dir without a label
fn managers(project:&ProjectSettings,label:Option<&str>) -> Result<Vec<SubjectManager>> {
    let dir = label.map(|l| project.stage_dir(l)).unwrap_or_else(|| project.state_dir.clone());
    let mut managers = vec![];
    for f in state_files(&dir) {
        if let Some(sm) = SubjectManager::read(&f)? {
            managers.push(sm);
        }
    }
    Ok(managers)
}

pub fn manager_summaries(project:&ProjectSettings,label:Option<&str>,scheduler:&dyn Scheduler) -> Result<Vec<ManagerSummary>> {
    let mut summaries = vec![];
    for sm in managers(project,label)? {
        let (name,n_steps) = match sm.config() {
            Ok(c) => (c.name(),c.steps.len()),
            Err(e) => {
                warn!("{:#}",e);
                (sm.name(),0)
            }
        };
        summaries.push(ManagerSummary {
            name,
            state:sm.state(),
            next_step:sm.next_step(),
            n_steps,
            job_id:sm.job_id(),
            job_state:sm.slurm_status(scheduler),
            last_error:sm.last_error().map(|e| e.to_string()),
        });
    }
    Ok(summaries)
}

/// Cancel the drivers (and any step job they wait on). Returns the manager names
/// with the ids that were cancelled.
pub fn cancel(project:&ProjectSettings,label:Option<&str>,scheduler:&dyn Scheduler) -> Result<Vec<(String,Vec<u32>)>> {
    let mut cancelled = vec![];
    for sm in managers(project,label)? {
        let ids = sm.cancel(scheduler);
        match ids.is_empty() {
            true => info!("no job id found for {}",sm.name()),
            false => info!("{} cancelled {:?}",sm.name(),ids),
        }
        cancelled.push((sm.name(),ids));
    }
    Ok(cancelled)
}

/// Relaunch every manager that isn't done and isn't already running. `slurm_disabled`
/// overrides the flag stored in each config.
pub fn restart(project:&ProjectSettings,label:Option<&str>,scheduler:&dyn Scheduler,slurm_disabled:Option<bool>) -> Result<Vec<Submission>> {
    let dir = label.map(|l| project.stage_dir(l)).unwrap_or_else(|| project.state_dir.clone());
    let mut restarted = vec![];
    for config_file in config_files(&dir) {
        let config = config_file.with_extension("");
        let mut c = SubjectManagerConfig::from_file(&config)?;
        if let Some(disabled) = slurm_disabled {
            c.slurm_disabled = disabled;
            c.to_file(&config)?;
        }
        let mut sm = SubjectManager::open(&config)?;
        if sm.is_done() {
            continue
        }
        if sm.is_live(scheduler) {
            warn!("{} is still running. Will not restart",c.name());
            continue
        }
        if sm.is_abandoned() {
            warn!("{} was left running by a process that is gone",c.name());
        }
        sm.reset();
        sm.to_file()?;
        let submission = match c.is_slurm_disabled() {
            true => Submission{unit:c.subject.clone(),config:config.clone(),job_id:None,state:Some(SubjectManager::launch(&config,scheduler)?)},
            false => Submission{unit:c.subject.clone(),config:config.clone(),job_id:Some(SubjectManager::launch_with_slurm_now(&config,scheduler)?),state:None},
        };
        restarted.push(submission);
    }
    Ok(restarted)
}

/// Block until every manager is done, failed or abandoned. Returns (done, total).
pub fn wait_for_completion(project:&ProjectSettings,label:Option<&str>,refresh:Duration) -> Result<(usize,usize)> {
    loop {
        let managers = managers(project,label)?;
        let total = managers.len();
        let n_done = managers.iter().filter(|m| m.is_done()).count();
        let n_failed = managers.iter().filter(|m| m.state() == SubjectManagerState::Failed || m.is_abandoned()).count();
        info!("{}: {} of {} are complete, {} failed",label.unwrap_or("all stages"),n_done,total,n_failed);
        match n_done + n_failed == total {
            true => return Ok((n_done,total)),
            false => std::thread::sleep(refresh),
        }
    }
}
