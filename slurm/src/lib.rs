use std::fmt;
use std::fs::{File, create_dir_all};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug,Error)]
pub enum SlurmError {
    #[error("unable to launch {program}: {source}")]
    Launch{program:String,source:io::Error},
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{program} exited with {status}: {stderr}")]
    CommandFailed{program:String,status:String,stderr:String},
    #[error("no job ids found in slurm response '{0}'")]
    NoJobId(String),
    #[error("multiple ids found in slurm response '{0}'")]
    MultipleJobIds(String),
    #[error("memory request must be specified for job {0}")]
    MissingMemory(String),
    #[error("gave up waiting on job {job_id} after {waited:?}")]
    Timeout{job_id:u32,waited:Duration},
}

#[derive(PartialEq,Eq,Debug,Clone,Copy,Serialize,Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    OutOfMemory,
    Unknown,
}

impl JobState {
    /// interpret the state column reported by sacct. Only the last non-empty line is
    /// considered so output with or without a header parses the same.
    pub fn from_sacct(text:&str) -> JobState {
        let line = text.lines().map(|l| l.trim()).filter(|l| !l.is_empty()).last().unwrap_or("");
        let state = line.to_ascii_lowercase();
        let state = state.trim_end_matches('+');
        match state {
            "pending" => JobState::Pending,
            "running" | "completing" | "configuring" => JobState::Running,
            "completed" => JobState::Completed,
            "failed" | "node_fail" | "boot_fail" | "preempted" | "deadline" => JobState::Failed,
            "timeout" => JobState::Timeout,
            "out_of_memory" => JobState::OutOfMemory,
            s if s.starts_with("cancelled") => JobState::Cancelled,
            _ => JobState::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self,JobState::Pending | JobState::Running | JobState::Unknown)
    }

    pub fn is_success(&self) -> bool {
        *self == JobState::Completed
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f,"{:?}",self)
    }
}

#[derive(Clone,Debug)]
pub struct SBatchOpts{
    reservation:String,
    pub job_name:String,
    no_requeue:bool,
    pub memory:Option<String>,
    pub cpus_per_task:Option<u32>,
    pub wall_hours:Option<u32>,
    pub output:String,
    pub error:String,
    pub partition:String,
    pub account:Option<String>,
    pub qos:Option<String>,
    pub start_delay_sec:Option<u32>,
    pub email:Option<String>,
}

impl SBatchOpts{
    pub fn new(job_name:&str) -> SBatchOpts {
        SBatchOpts{
            job_name:job_name.to_string(),
            reservation:String::from(""),
            memory:Some(String::from("4G")),
            cpus_per_task:None,
            wall_hours:None,
            no_requeue: true,
            output:String::from(""),
            error:String::from(""),
            partition:String::from(""),
            account:None,
            qos:None,
            start_delay_sec:None,
            email:None,
        }
    }

    pub fn print(&self) -> Result<String,SlurmError> {
        let mut opts = Vec::<String>::new();
        opts.push(format!("#SBATCH --job-name={}",&self.job_name));
        if !self.reservation.is_empty(){opts.push(format!("#SBATCH --reservation={}",&self.reservation))}
        if self.no_requeue{ opts.push("#SBATCH --no-requeue".to_string())}
        if !self.output.is_empty(){ opts.push(format!("#SBATCH --output={}",&self.output))}
        if !self.error.is_empty(){ opts.push(format!("#SBATCH --error={}",&self.error))}
        if !self.partition.is_empty(){ opts.push(format!("#SBATCH --partition={}",&self.partition))}
        if let Some(account) = &self.account { opts.push(format!("#SBATCH --account={}",account))}
        if let Some(qos) = &self.qos { opts.push(format!("#SBATCH --qos={}",qos))}
        if let Some(hours) = self.wall_hours { opts.push(format!("#SBATCH --time={}:00:00",hours))}
        if let Some(cpus) = self.cpus_per_task { opts.push(format!("#SBATCH --cpus-per-task={}",cpus))}
        if let Some(delay) = self.start_delay_sec { opts.push(format!("#SBATCH --begin=now+{}",delay))}
        if let Some(email) = &self.email {
            opts.push(format!("#SBATCH --mail-user={}",email));
            opts.push("#SBATCH --mail-type=END,FAIL".to_string());
        }
        let memory = self.memory.as_ref().ok_or_else(|| SlurmError::MissingMemory(self.job_name.clone()))?;
        opts.push(format!("#SBATCH --mem={}",memory));
        Ok(opts.join("\n"))
    }
}

#[derive(Clone,Debug)]
pub struct BatchScript{
    preamble:String,
    pub options:SBatchOpts,
    pub modules:Vec<String>,
    pub commands:Vec<String>,
    pub job_id:Option<u32>
}

impl BatchScript{
    pub fn new(job_name:&str,commands:&[String]) -> BatchScript {
        BatchScript {
            preamble:"#!/usr/bin/env bash".to_string(),
            options:SBatchOpts::new(job_name),
            modules:Vec::new(),
            commands:commands.to_vec(),
            job_id:None
        }
    }

    /// commands are rendered the way `Command`'s debug output quotes them, which bash accepts
    pub fn from_commands(job_name:&str,commands:&[Command]) -> BatchScript {
        let command:Vec<String> = commands.iter().map(|cmd| format!("{:?}",cmd)).collect();
        BatchScript::new(job_name,&command)
    }

    pub fn job_name(&self) -> &str {
        &self.options.job_name
    }

    pub fn commands(&self) -> String{
        self.commands.join("\n")
    }

    pub fn print(&self) -> Result<String,SlurmError> {
        let mut elems = Vec::<String>::new();
        elems.push(self.preamble.clone());
        elems.push(self.options.print()?);
        elems.push(String::from("hostname"));
        elems.extend(self.modules.iter().map(|m| format!("module load {}",m)));
        elems.push(self.commands());
        let mut s = elems.join("\n");
        s.push('\n');
        Ok(s)
    }

    pub fn write(&self,location:&Path) -> Result<PathBuf,SlurmError>{
        if !location.exists() {
            create_dir_all(location)?;
        }
        let fname = location.join(format!("{}.bash",&self.options.job_name));
        let mut f = File::create(&fname)?;
        f.write_all(self.print()?.as_bytes())?;
        Ok(fname)
    }

    pub fn submit_later(&mut self,write_location:&Path,scheduler:&dyn Scheduler,seconds_later:u32) -> Result<u32,SlurmError>{
        self.options.start_delay_sec = Some(seconds_later);
        self.submit_now(write_location,scheduler)
    }

    pub fn submit_now(&mut self,write_location:&Path,scheduler:&dyn Scheduler) -> Result<u32,SlurmError>{
        let path = self.write(write_location)?;
        let jid = scheduler.submit(&path)?;
        info!(job_name = %self.options.job_name, job_id = jid, "submitted batch script {:?}", path);
        self.job_id = Some(jid);
        Ok(jid)
    }
}

pub fn response_to_job_id(resp:&str) -> Result<u32,SlurmError> {
    let nums:Vec<u32> = resp.split_whitespace().flat_map(|s| s.trim_end_matches(';').parse()).collect();
    match nums.len() {
        0 => Err(SlurmError::NoJobId(resp.trim().to_string())),
        1 => Ok(nums[0]),
        _ => Err(SlurmError::MultipleJobIds(resp.trim().to_string())),
    }
}

/// The scheduler seam. Everything that talks to the cluster goes through here so
/// the orchestration logic can run against a fake queue.
pub trait Scheduler {
    fn submit(&self,script:&Path) -> Result<u32,SlurmError>;
    fn is_queued(&self,job_id:u32) -> Result<bool,SlurmError>;
    fn job_state(&self,job_id:u32) -> Result<JobState,SlurmError>;
    fn cancel(&self,job_id:u32) -> Result<(),SlurmError>;
    /// names of every job `user` has in the queue
    fn user_queue(&self,user:&str) -> Result<Vec<String>,SlurmError>;
}

/// sbatch, squeue, sacct and scancel on the PATH
#[derive(Clone,Debug,Default)]
pub struct SlurmCli;

fn run(cmd:&mut Command) -> Result<Output,SlurmError> {
    let program = cmd.get_program().to_string_lossy().to_string();
    debug!("running {:?}",cmd);
    cmd.output().map_err(|source| SlurmError::Launch{program,source})
}

fn failed(program:&str,o:&Output) -> SlurmError {
    SlurmError::CommandFailed {
        program:program.to_string(),
        status:o.status.to_string(),
        stderr:String::from_utf8_lossy(&o.stderr).trim().to_string(),
    }
}

pub fn current_user() -> String {
    whoami::username()
}

pub fn hostname() -> String {
    whoami::hostname()
}

impl Scheduler for SlurmCli {
    fn submit(&self,script:&Path) -> Result<u32,SlurmError> {
        let o = run(Command::new("sbatch").arg(script))?;
        if !o.status.success() {
            return Err(failed("sbatch",&o));
        }
        response_to_job_id(&String::from_utf8_lossy(&o.stdout))
    }

    fn is_queued(&self,job_id:u32) -> Result<bool,SlurmError> {
        let o = run(Command::new("squeue").args(["-h","-o","%i","-j",&job_id.to_string()]))?;
        if !o.status.success() {
            // squeue refuses ids that have already aged out of the controller
            let err = String::from_utf8_lossy(&o.stderr);
            if err.contains("Invalid job id") {
                return Ok(false)
            }
            return Err(failed("squeue",&o));
        }
        Ok(!String::from_utf8_lossy(&o.stdout).trim().is_empty())
    }

    fn job_state(&self,job_id:u32) -> Result<JobState,SlurmError> {
        let o = run(Command::new("sacct").args(["-n","-X","-j",&job_id.to_string(),"--format","state"]))?;
        if !o.status.success() {
            return Err(failed("sacct",&o));
        }
        Ok(JobState::from_sacct(&String::from_utf8_lossy(&o.stdout)))
    }

    fn cancel(&self,job_id:u32) -> Result<(),SlurmError> {
        let o = run(Command::new("scancel").arg(job_id.to_string()))?;
        match o.status.success() {
            true => Ok(()),
            false => Err(failed("scancel",&o)),
        }
    }

    fn user_queue(&self,user:&str) -> Result<Vec<String>,SlurmError> {
        let o = run(Command::new("squeue").args(["-h","-u",user,"-o","%j"]))?;
        if !o.status.success() {
            return Err(failed("squeue",&o));
        }
        Ok(String::from_utf8_lossy(&o.stdout).lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }
}

#[derive(Clone,Debug)]
pub struct PollSettings {
    pub interval:Duration,
    pub timeout:Option<Duration>,
    pub state_retries:u16,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval:Duration::from_secs(3),
            timeout:None,
            state_retries:60,
        }
    }
}

/// ask for the state of a job until sacct reports something final
pub fn get_job_state(scheduler:&dyn Scheduler,job_id:u32,n_tries:u16,pause:Duration) -> Result<JobState,SlurmError> {
    let mut tries = n_tries;
    loop {
        let state = scheduler.job_state(job_id)?;
        if state.is_terminal() || tries == 0 {
            if !state.is_terminal() {
                warn!(job_id, "gave up waiting for a final job state");
            }
            return Ok(state)
        }
        tries -= 1;
        std::thread::sleep(pause);
    }
}

/// block until the job leaves the queue, then report how it ended
pub fn wait_for_job(scheduler:&dyn Scheduler,job_id:u32,poll:&PollSettings) -> Result<JobState,SlurmError> {
    let start = Instant::now();
    let mut wait_count = 0u64;
    while scheduler.is_queued(job_id)? {
        wait_count += 1;
        debug!(job_id, wait_count, "job still queued");
        if let Some(timeout) = poll.timeout {
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(SlurmError::Timeout{job_id,waited})
            }
        }
        std::thread::sleep(poll.interval);
    }
    get_job_state(scheduler,job_id,poll.state_retries,poll.interval)
}

/// submit a script and wait for it to leave the queue
pub fn submit_and_wait(scheduler:&dyn Scheduler,script:&mut BatchScript,write_location:&Path,poll:&PollSettings) -> Result<JobState,SlurmError> {
    let jid = script.submit_now(write_location,scheduler)?;
    let state = wait_for_job(scheduler,jid,poll)?;
    info!(job_name = %script.job_name(), job_id = jid, %state, "job left the queue");
    Ok(state)
}

pub fn cancel(scheduler:&dyn Scheduler,job_id:u32) -> bool {
    match scheduler.cancel(job_id) {
        Ok(_) => true,
        Err(e) => {
            warn!(job_id, "scancel failed: {}",e);
            false
        }
    }
}

#[derive(Clone,Debug)]
pub struct LocalRun {
    pub success:bool,
    pub stdout:String,
    pub stderr:String,
}

pub fn local_script(modules:&[String],script:&str) -> String {
    let mut lines:Vec<String> = modules.iter().map(|m| format!("module load {}",m)).collect();
    lines.push(script.to_string());
    lines.join("\n")
}

/// run a short tool invocation on this node, capturing its output
pub fn run_local(modules:&[String],script:&str) -> Result<LocalRun,SlurmError> {
    let text = local_script(modules,script);
    let o = run(Command::new("bash").arg("-c").arg(&text))?;
    let r = LocalRun {
        success:o.status.success(),
        stdout:String::from_utf8_lossy(&o.stdout).to_string(),
        stderr:String::from_utf8_lossy(&o.stderr).to_string(),
    };
    if !r.success {
        warn!("local script exited with {}: {}",o.status,r.stderr.trim());
    }
    Ok(r)
}
