use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use completion_log::CompletionLog;
use orchestrate::pipeline::{self, CheckOptions, SubmitOptions};
use orchestrate::project_config::{Config, ProjectSettings};
use orchestrate::subject_manager::{SubjectManager, SubjectManagerState};
use slurm::{JobState, Scheduler, SlurmError};
use stages::{StageKind, StageRequest};

/// Driver scripts stay queued until `finish_drivers`. Step scripts run through bash
/// as soon as they are submitted.
struct ShellQueue {
    next:Cell<u32>,
    queued:RefCell<HashSet<u32>>,
    names:RefCell<Vec<(u32,String)>>,
    drivers:RefCell<Vec<PathBuf>>,
    cancelled:RefCell<Vec<u32>>,
}

impl ShellQueue {
    fn new() -> Self {
        Self {
            next:Cell::new(1000),
            queued:RefCell::new(HashSet::new()),
            names:RefCell::new(vec![]),
            drivers:RefCell::new(vec![]),
            cancelled:RefCell::new(vec![]),
        }
    }

    fn finish_drivers(&self) {
        self.queued.borrow_mut().clear();
    }
}

impl Scheduler for ShellQueue {
    fn submit(&self,script:&Path) -> Result<u32,SlurmError> {
        let jid = self.next.get() + 1;
        self.next.set(jid);
        let text = std::fs::read_to_string(script)?;
        let name = utils::file_name(&script.with_extension(""));
        self.names.borrow_mut().push((jid,name));
        match text.contains("subject-manager") {
            true => {
                self.drivers.borrow_mut().push(script.to_owned());
                self.queued.borrow_mut().insert(jid);
            }
            false => {
                Command::new("bash").arg(script).output()?;
            }
        }
        Ok(jid)
    }
    fn is_queued(&self,job_id:u32) -> Result<bool,SlurmError> {
        Ok(self.queued.borrow().contains(&job_id))
    }
    fn job_state(&self,job_id:u32) -> Result<JobState,SlurmError> {
        match self.queued.borrow().contains(&job_id) {
            true => Ok(JobState::Pending),
            false => Ok(JobState::Completed),
        }
    }
    fn cancel(&self,job_id:u32) -> Result<(),SlurmError> {
        self.queued.borrow_mut().remove(&job_id);
        self.cancelled.borrow_mut().push(job_id);
        Ok(())
    }
    fn user_queue(&self,_user:&str) -> Result<Vec<String>,SlurmError> {
        let queued = self.queued.borrow();
        Ok(self.names.borrow().iter().filter(|(j,_)| queued.contains(j)).map(|(_,n)| n.clone()).collect())
    }
}

fn project_in(dir:&Path) -> ProjectSettings {
    let mut p = <ProjectSettings as Config>::default();
    p.stages.proj_dir = dir.join("proj");
    p.stages.scratch_dir = dir.join("scratch");
    p.tracking_repo = dir.join("proj/code/func_processing");
    p.state_dir = dir.join("scratch/orchestrate");
    p.submit_spacing_sec = 0;
    p.slurm.poll_interval_sec = 0;
    p
}

fn add_t1(p:&ProjectSettings,subj:&str) {
    let anat = p.stages.dset_dir().join(subj).join("ses-S1/anat");
    create_dir_all(&anat).unwrap();
    File::create(anat.join(format!("{}_ses-S1_T1w.nii.gz",subj))).unwrap();
}

fn reface_output(p:&ProjectSettings,subj:&str) -> PathBuf {
    p.stages.deriv_dir().join("reface").join(subj).join("ses-S1/anat").join(format!("{}_ses-S1_desc-reface_T1w.nii.gz",subj))
}

fn reface() -> StageRequest {
    StageRequest::Reface{method:String::from("reface")}
}

/// a stand-in for the AFNI refacer that writes its `-prefix` argument in reface mode
fn fake_refacer(dir:&Path) {
    let bin = dir.join("bin");
    create_dir_all(&bin).unwrap();
    let tool = bin.join("@afni_refacer_run");
    std::fs::write(&tool,"#!/usr/bin/env bash\n[[ \" $* \" == *\" -mode_reface \"* ]] || exit 1\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-prefix\" ]; then touch \"$2\"; fi\n  shift\ndone\n").unwrap();
    Command::new("chmod").arg("+x").arg(&tool).status().unwrap();
    let path = std::env::var("PATH").unwrap_or_default();
    std::env::set_var("PATH",format!("{}:{}",bin.display(),path));
}

#[test]
fn check_fills_the_log_from_derivatives(){
    let tmp = tempfile::tempdir().unwrap();
    let mut p = project_in(tmp.path());
    for s in ["sub-4001","sub-4002","sub-4003"] {
        add_t1(&p,s);
    }
    let roster = tmp.path().join("roster.csv");
    std::fs::write(&roster,"redcap_id,exclude\n4001,\n4002,\n4003,1\n").unwrap();
    p.roster = Some(roster);
    let out = reface_output(&p,"sub-4001");
    create_dir_all(out.parent().unwrap()).unwrap();
    File::create(&out).unwrap();

    let report = pipeline::refresh_log(&p,&CheckOptions::default()).unwrap();
    assert_eq!(report.subjects,2);
    assert_eq!(report.filled.get("sub-4001").unwrap(),&vec![String::from("reface")]);
    assert_eq!(report.incomplete,vec!["sub-4001","sub-4002"]);
    assert_eq!(report.needed.get(&StageKind::Reface).unwrap(),&vec![String::from("sub-4002")]);
    assert_eq!(report.needed.get(&StageKind::AfniTask).unwrap().len(),2);
    assert!(!completion_log::is_locked(&p.log_file()));

    let log = CompletionLog::read(&p.log_file()).unwrap();
    assert_eq!(log.subjects(),vec!["sub-4001","sub-4002"]);
    assert!(!log.is_missing("sub-4001","reface"));
    assert!(log.is_missing("sub-4002","reface"));
    assert_eq!(log.columns().len(),p.expected.len() + 1);

    // filled cells are kept on the next pass
    let stamp = log.get("sub-4001","reface").unwrap().to_string();
    let report = pipeline::refresh_log(&p,&CheckOptions::default()).unwrap();
    assert!(report.filled.is_empty());
    let log = CompletionLog::read(&p.log_file()).unwrap();
    assert_eq!(log.get("sub-4001","reface").unwrap(),stamp);
}

#[test]
fn check_rebuilds_the_log_or_one_subject(){
    let tmp = tempfile::tempdir().unwrap();
    let p = project_in(tmp.path());
    for s in ["sub-4001","sub-4002"] {
        add_t1(&p,s);
    }
    let out = reface_output(&p,"sub-4001");
    create_dir_all(out.parent().unwrap()).unwrap();
    File::create(&out).unwrap();
    pipeline::refresh_log(&p,&CheckOptions::default()).unwrap();

    // a removed derivative stays logged until the log is rebuilt
    std::fs::remove_file(&out).unwrap();
    pipeline::refresh_log(&p,&CheckOptions::default()).unwrap();
    assert!(!CompletionLog::read(&p.log_file()).unwrap().is_missing("sub-4001","reface"));
    let rebuilt = CheckOptions{new_log:true,..CheckOptions::default()};
    pipeline::refresh_log(&p,&rebuilt).unwrap();
    assert!(CompletionLog::read(&p.log_file()).unwrap().is_missing("sub-4001","reface"));

    let out = reface_output(&p,"sub-4002");
    create_dir_all(out.parent().unwrap()).unwrap();
    File::create(&out).unwrap();
    File::create(reface_output(&p,"sub-4001")).unwrap();
    let one = CheckOptions{subject:Some(String::from("sub-4002")),..CheckOptions::default()};
    let report = pipeline::refresh_log(&p,&one).unwrap();
    assert_eq!(report.subjects,1);
    assert_eq!(report.filled.len(),1);
    assert!(report.filled.contains_key("sub-4002"));
    let log = CompletionLog::read(&p.log_file()).unwrap();
    assert_eq!(log.subjects(),vec!["sub-4001","sub-4002"]);
    assert!(log.is_missing("sub-4001","reface"));

    let stranger = CheckOptions{subject:Some(String::from("sub-9999")),..CheckOptions::default()};
    assert!(pipeline::refresh_log(&p,&stranger).is_err());
}

#[test]
fn dry_run_only_reports_the_queue(){
    let tmp = tempfile::tempdir().unwrap();
    let p = project_in(tmp.path());
    for s in ["sub-4001","sub-4002","sub-4004"] {
        add_t1(&p,s);
    }
    create_dir_all(p.stages.dset_dir().join("sub-4003")).unwrap();
    let out = reface_output(&p,"sub-4002");
    create_dir_all(out.parent().unwrap()).unwrap();
    File::create(&out).unwrap();

    let q = ShellQueue::new();
    let opts = SubmitOptions{batch_size:1,dry_run:true,slurm_disabled:false};
    let report = pipeline::submit_stage(&p,&reface(),&q,&opts).unwrap();
    assert_eq!(report.label,"reface");
    assert_eq!(report.queue.queued,vec!["sub-4001","sub-4004"]);
    assert_eq!(report.queue.complete,vec!["sub-4002"]);
    assert_eq!(report.queue.not_ready,vec!["sub-4003"]);
    assert_eq!(report.batch,vec!["sub-4001"]);
    assert!(report.submitted.is_empty());
    assert!(q.names.borrow().is_empty());
    assert!(!p.stage_dir("reface").exists());
}

#[test]
fn submitted_subjects_run_to_completion_once(){
    let tmp = tempfile::tempdir().unwrap();
    fake_refacer(tmp.path());
    let p = project_in(tmp.path());
    for s in ["sub-4001","sub-4002"] {
        add_t1(&p,s);
    }
    let q = ShellQueue::new();
    let opts = SubmitOptions{batch_size:8,dry_run:false,slurm_disabled:false};

    let report = pipeline::submit_stage(&p,&reface(),&q,&opts).unwrap();
    assert_eq!(report.submitted.len(),2);
    assert!(report.submitted.iter().all(|s| s.job_id.is_some()));
    assert_eq!(q.drivers.borrow().len(),2);
    let driver = std::fs::read_to_string(&q.drivers.borrow()[0]).unwrap();
    assert!(driver.contains("#SBATCH --job-name=reface-sub-4001"));
    assert!(driver.contains("#SBATCH --time=2:00:00"));

    // drivers still queued: nothing is submitted twice
    let again = pipeline::submit_stage(&p,&reface(),&q,&opts).unwrap();
    assert!(again.submitted.is_empty());
    assert_eq!(again.queue.active,vec!["sub-4001","sub-4002"]);

    // what each driver job would run on a node
    q.finish_drivers();
    for s in &report.submitted {
        assert_eq!(SubjectManager::launch(&s.config,&q).unwrap(),SubjectManagerState::Done);
    }
    assert!(reface_output(&p,"sub-4001").exists());
    assert!(q.names.borrow().iter().any(|(_,n)| n == "4002reface"));

    let summaries = pipeline::manager_summaries(&p,Some("reface"),&q).unwrap();
    assert_eq!(summaries.len(),2);
    assert!(summaries.iter().all(|s| s.state == SubjectManagerState::Done && s.next_step == 1 && s.n_steps == 1));
    assert_eq!(pipeline::wait_for_completion(&p,Some("reface"),std::time::Duration::ZERO).unwrap(),(2,2));

    let done = pipeline::submit_stage(&p,&reface(),&q,&opts).unwrap();
    assert_eq!(done.queue.complete,vec!["sub-4001","sub-4002"]);
    assert!(done.submitted.is_empty());
    assert!(pipeline::restart(&p,Some("reface"),&q,None).unwrap().is_empty());

    let report = pipeline::refresh_log(&p,&CheckOptions::default()).unwrap();
    assert_eq!(report.filled.len(),2);
}

#[test]
fn terminal_runs_fail_without_outputs_and_restart(){
    let tmp = tempfile::tempdir().unwrap();
    let p = project_in(tmp.path());
    add_t1(&p,"sub-4001");
    let q = ShellQueue::new();
    // the stand-in refacer only handles -mode_reface, so defacing leaves no output
    let mut request = reface();
    if let StageRequest::Reface{method} = &mut request {
        *method = String::from("deface");
    }
    let opts = SubmitOptions{batch_size:8,dry_run:false,slurm_disabled:true};
    let report = pipeline::submit_stage(&p,&request,&q,&opts).unwrap();
    assert_eq!(report.submitted.len(),1);
    assert_eq!(report.submitted[0].state,Some(SubjectManagerState::Failed));
    assert!(q.names.borrow().is_empty());

    let summaries = pipeline::manager_summaries(&p,None,&q).unwrap();
    assert_eq!(summaries[0].name,"deface-sub-4001");
    assert!(summaries[0].last_error.as_deref().unwrap().contains("desc-deface_T1w"));

    // the deface output shows up by other means; restarting finds it and finishes
    let out = p.stages.deriv_dir().join("deface/sub-4001/ses-S1/anat/sub-4001_ses-S1_desc-deface_T1w.nii.gz");
    create_dir_all(out.parent().unwrap()).unwrap();
    File::create(&out).unwrap();
    let restarted = pipeline::restart(&p,Some("deface"),&q,None).unwrap();
    assert_eq!(restarted.len(),1);
    assert_eq!(restarted[0].state,Some(SubjectManagerState::Done));
}

#[test]
fn killed_terminal_run_is_not_active(){
    let tmp = tempfile::tempdir().unwrap();
    let p = project_in(tmp.path());
    add_t1(&p,"sub-4001");
    let q = ShellQueue::new();
    let mut request = reface();
    if let StageRequest::Reface{method} = &mut request {
        *method = String::from("deface");
    }
    let opts = SubmitOptions{batch_size:8,dry_run:false,slurm_disabled:true};
    let report = pipeline::submit_stage(&p,&request,&q,&opts).unwrap();
    assert_eq!(report.submitted.len(),1);

    // what a terminal run killed mid step leaves behind
    let mut sm = SubjectManager::read(&report.submitted[0].config).unwrap().unwrap();
    assert!(sm.local_run().is_none());
    sm.set_state(SubjectManagerState::Running);
    sm.to_file().unwrap();

    assert!(pipeline::active_units(&p,"deface",&q).unwrap().is_empty());
    assert_eq!(pipeline::wait_for_completion(&p,Some("deface"),std::time::Duration::ZERO).unwrap(),(0,1));
    let again = pipeline::submit_stage(&p,&request,&q,&opts).unwrap();
    assert_eq!(again.submitted.len(),1);
    assert_eq!(again.submitted[0].state,Some(SubjectManagerState::Failed));

    let mut sm = SubjectManager::read(&report.submitted[0].config).unwrap().unwrap();
    sm.set_state(SubjectManagerState::Running);
    sm.to_file().unwrap();
    let out = p.stages.deriv_dir().join("deface/sub-4001/ses-S1/anat/sub-4001_ses-S1_desc-deface_T1w.nii.gz");
    create_dir_all(out.parent().unwrap()).unwrap();
    File::create(&out).unwrap();
    let restarted = pipeline::restart(&p,Some("deface"),&q,None).unwrap();
    assert_eq!(restarted.len(),1);
    assert_eq!(restarted[0].state,Some(SubjectManagerState::Done));
}

#[test]
fn cancel_stops_queued_drivers(){
    let tmp = tempfile::tempdir().unwrap();
    let p = project_in(tmp.path());
    add_t1(&p,"sub-4001");
    let q = ShellQueue::new();
    let opts = SubmitOptions{batch_size:8,dry_run:false,slurm_disabled:false};
    let report = pipeline::submit_stage(&p,&reface(),&q,&opts).unwrap();
    let jid = report.submitted[0].job_id.unwrap();

    let cancelled = pipeline::cancel(&p,Some("reface"),&q).unwrap();
    assert_eq!(cancelled,vec![(String::from("sub-4001"),vec![jid])]);
    assert_eq!(*q.cancelled.borrow(),vec![jid]);
    assert!(pipeline::active_units(&p,"reface",&q).unwrap().is_empty());
}
