use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use orchestrate::pipeline::{self, CheckOptions, SubmitOptions};
use orchestrate::project_config::{Config, ConfigFile, ProjectSettings};
use orchestrate::subject_manager::{SubjectManager, SubjectManagerConfig, SubjectManagerState};
use slurm::{BatchScript, Scheduler, SlurmCli};
use stages::StageRequest;

#[derive(clap::Parser,Debug)]
pub struct OrchestrateArgs {
    #[command(subcommand)]
    pub action: OrchestrateAction,
}

#[derive(clap::Subcommand,Debug)]
pub enum OrchestrateAction {
    /// create a new project template to modify for a new study
    NewProjectTemplate(TemplateConfigArgs),
    /// fill the completion log from the derivatives directory
    Check(CheckArgs),
    /// print the steps a stage would run for one subject
    Plan(PlanArgs),
    /// submit the next batch of subjects that need a stage
    Submit(SubmitArgs),
    /// check the status of subject managers
    Status(LabelArgs),
    /// cancel jobs associated with subject managers
    Cancel(LabelArgs),
    /// relaunch subject managers that are not done
    Restart(RestartArgs),
    /// wait for every subject manager to finish before returning
    WaitForCompletion(WaitForCompletionArgs),
    /// interact with a single subject manager
    SubjectManager(SubjectManagerCmd),
}

#[derive(Clone,clap::Subcommand,Debug)]
pub enum StageCmd {
    /// FreeSurfer and fMRIprep
    Fmriprep,
    /// AFNI preprocessing and deconvolution of a task
    AfniTask{session:String,task:String},
    /// AFNI preprocessing and seed correlation of resting state
    AfniResting{session:String,task:String},
    /// deface or reface the T1w
    Reface{
        #[clap(default_value = "reface",value_parser = ["deface","reface","reface_plus"])]
        method:String,
    },
    /// hippocampal subfield segmentation
    Ashs{session:String},
    /// paired ETAC between two behaviors of a deconvolution
    TaskGroup{
        session:String,
        task:String,
        /// deconvolution name, e.g. UniqueBehs
        decon:String,
        /// the two behaviors to contrast, comma separated
        #[clap(value_delimiter = ',')]
        behaviors:Vec<String>,
    },
    /// one-sample ETAC over a seed's z maps
    RestingGroup{task:String,seed:String},
}

impl From<StageCmd> for StageRequest {
    fn from(cmd:StageCmd) -> Self {
        match cmd {
            StageCmd::Fmriprep => StageRequest::Fmriprep,
            StageCmd::AfniTask{session,task} => StageRequest::AfniTask{session,task},
            StageCmd::AfniResting{session,task} => StageRequest::AfniResting{session,task},
            StageCmd::Reface{method} => StageRequest::Reface{method},
            StageCmd::Ashs{session} => StageRequest::Ashs{session},
            StageCmd::TaskGroup{session,task,decon,behaviors} => StageRequest::TaskGroup{session,task,decon,behaviors},
            StageCmd::RestingGroup{task,seed} => StageRequest::RestingGroup{task,seed},
        }
    }
}

#[derive(clap::Args,Debug)]
pub struct SubjectManagerCmd {
    #[command(subcommand)]
    action:SubjectManagerAction,
}

#[derive(Clone,clap::Subcommand,Debug)]
pub enum SubjectManagerAction {
    Launch(SubjectManagerLaunchArgs),
    NewConfig(NewConfigArgs),
}

#[derive(Clone,clap::Args,Debug)]
pub struct SubjectManagerLaunchArgs {
    /// path to a subject manager configuration file. Its directory is the working
    /// directory of the subject manager
    config_file:PathBuf,
}

#[derive(Clone,clap::Args,Debug)]
pub struct NewConfigArgs {
    project_settings:PathBuf,
    /// subject id (sub-4001) or group unit
    subject:String,
    output_config:PathBuf,
    #[clap(long)]
    disable_slurm:bool,
    #[command(subcommand)]
    stage:StageCmd,
}

#[derive(Clone,clap::Args,Debug)]
pub struct TemplateConfigArgs {
    /// path to the new settings file. Its extension will not be respected.
    output_config:PathBuf,
}

#[derive(Clone,clap::Args,Debug)]
pub struct CheckArgs {
    project_settings:PathBuf,
    /// skip pulling and pushing the tracking repo
    #[clap(long)]
    no_git:bool,
    /// rebuild the log from scratch instead of updating it
    #[clap(long)]
    new_log:bool,
    /// check only this subject (sub-4001)
    #[clap(long)]
    subj:Option<String>,
}

#[derive(Clone,clap::Args,Debug)]
pub struct PlanArgs {
    project_settings:PathBuf,
    subject:String,
    /// print the steps as json
    #[clap(long)]
    json:bool,
    #[command(subcommand)]
    stage:StageCmd,
}

#[derive(Clone,clap::Args,Debug)]
pub struct SubmitArgs {
    project_settings:PathBuf,
    /// print the work queue without submitting anything
    #[clap(long)]
    dry_run:bool,
    /// run without slurm scheduling. Each subject runs serially in your terminal
    #[clap(long)]
    disable_slurm:bool,
    /// number of subjects to submit (defaults to the project's batch size)
    #[clap(long)]
    batch_size:Option<usize>,
    /// supply an email to get a notification when the batch is done
    #[clap(long,short)]
    email:Option<String>,
    #[command(subcommand)]
    stage:StageCmd,
}

#[derive(Clone,clap::Args,Debug)]
pub struct LabelArgs {
    project_settings:PathBuf,
    /// stage label (fmriprep, afni_task-study ...). All stages when left out
    label:Option<String>,
    #[clap(long)]
    json:bool,
}

#[derive(Clone,clap::Args,Debug)]
pub struct RestartArgs {
    project_settings:PathBuf,
    label:Option<String>,
    #[clap(long)]
    disable_slurm:Option<bool>,
}

#[derive(Clone,clap::Args,Debug)]
pub struct WaitForCompletionArgs {
    project_settings:PathBuf,
    label:Option<String>,
    /// time between completion checks in minutes
    #[clap(long,value_parser = parse_minutes)]
    refresh_period:Option<Duration>,
}

const DEFAULT_TIME_TO_WAIT:f32 = 2.0; //minutes

fn parse_minutes(arg:&str) -> Result<Duration,String> {
    let minutes:f32 = arg.parse().map_err(|_| format!("{} is not a number of minutes",arg))?;
    match minutes > 0.0 {
        true => Duration::try_from_secs_f32(minutes*60.0).map_err(|e| format!("bad refresh period {}: {}",arg,e)),
        false => Err(format!("refresh period must be positive, got {}",arg)),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = OrchestrateArgs::parse();
    let scheduler = SlurmCli;
    match args.action {
        OrchestrateAction::SubjectManager(cmd) => match cmd.action {
            SubjectManagerAction::Launch(args) => {
                let state = SubjectManager::launch(&args.config_file,&scheduler)?;
                info!("subject manager finished in state {:?}",state);
                Ok(())
            }
            SubjectManagerAction::NewConfig(args) => new_config(args),
        },
        OrchestrateAction::NewProjectTemplate(args) => {
            <ProjectSettings as Config>::default().to_file(&args.output_config)?;
            println!("wrote {:?}",args.output_config.with_extension(ProjectSettings::file_ext()));
            Ok(())
        }
        OrchestrateAction::Check(args) => check(args),
        OrchestrateAction::Plan(args) => plan(args),
        OrchestrateAction::Submit(args) => submit(args,&scheduler),
        OrchestrateAction::Status(args) => status(args,&scheduler),
        OrchestrateAction::Cancel(args) => cancel(args,&scheduler),
        OrchestrateAction::Restart(args) => restart(args,&scheduler),
        OrchestrateAction::WaitForCompletion(args) => wait_for_completion(args),
    }
}

fn load(project_settings:&Path) -> Result<ProjectSettings> {
    ProjectSettings::from_file(project_settings)
}

fn new_config(args:NewConfigArgs) -> Result<()> {
    let p = load(&args.project_settings)?;
    let request = StageRequest::from(args.stage);
    let log_dir = args.output_config.parent().unwrap_or_else(|| Path::new(".")).join("slurm_out");
    let c = SubjectManagerConfig::new(&p,&request,&args.subject,&log_dir,args.disable_slurm)?;
    c.to_file(&args.output_config)?;
    println!("wrote {:?} with {} steps",args.output_config.with_extension(SubjectManagerConfig::file_ext()),c.steps.len());
    Ok(())
}

fn check(args:CheckArgs) -> Result<()> {
    let p = load(&args.project_settings)?;
    let opts = CheckOptions {
        sync:!args.no_git,
        new_log:args.new_log,
        subject:args.subj,
    };
    let report = pipeline::refresh_log(&p,&opts)?;
    for (subj,columns) in &report.filled {
        println!("{}: {}",subj,columns.join(", "));
    }
    let mut needed:Vec<_> = report.needed.iter().collect();
    needed.sort_by_key(|(kind,_)| format!("{:?}",kind));
    for (kind,subjects) in needed {
        println!("{:?} needed by {} subjects: {}",kind,subjects.len(),subjects.join(" "));
    }
    println!(
        "checked {} subjects. {} updated, {} still missing derivatives",
        report.subjects,report.filled.len(),report.incomplete.len()
    );
    Ok(())
}

fn plan(args:PlanArgs) -> Result<()> {
    let p = load(&args.project_settings)?;
    let stage = StageRequest::from(args.stage).build(&p.stages);
    let steps = stage.plan(&args.subject).with_context(|| format!("cannot plan {} for {}",stage.label(),args.subject))?;
    if args.json {
        println!("{}",serde_json::to_string_pretty(&steps)?);
        return Ok(())
    }
    println!("{} for {}: ready={} needed={}",stage.label(),args.subject,stage.is_ready(&args.subject),stage.is_needed(&args.subject));
    for (i,step) in steps.iter().enumerate() {
        let done = match step.is_satisfied() {
            true => "done",
            false => "todo",
        };
        let place = match step.is_scheduled() {
            true => format!("sbatch {}",step.job_name),
            false => String::from("local"),
        };
        println!("{:>3} {:<24} {:<5} {}",i,step.name,done,place);
    }
    Ok(())
}

fn submit(args:SubmitArgs,scheduler:&dyn Scheduler) -> Result<()> {
    let p = load(&args.project_settings)?;
    let request = StageRequest::from(args.stage);
    let opts = SubmitOptions {
        batch_size:args.batch_size.unwrap_or(p.batch_size),
        dry_run:args.dry_run,
        slurm_disabled:args.disable_slurm,
    };
    let report = pipeline::submit_stage(&p,&request,scheduler,&opts)?;
    println!("{}: {}",report.label,report.queue.summary());
    if args.dry_run {
        println!("would submit: {}",report.batch.join(" "));
        return Ok(())
    }
    for s in &report.submitted {
        match (s.job_id,s.state) {
            (Some(jid),_) => println!("{} job submitted with id {}",s.unit,jid),
            (None,Some(state)) => println!("{} finished as {:?}",s.unit,state),
            (None,None) => println!("{} not launched",s.unit),
        }
    }
    if let Some(email) = &args.email {
        if !args.disable_slurm && !report.submitted.is_empty() {
            let jid = slurm_watch(&args.project_settings,&p,&report.label,email,scheduler)?;
            println!("a watcher was launched on your behalf ({}). Check your email {} for notifications",jid,email);
        }
    }
    Ok(())
}

fn slurm_watch(project_settings:&Path,p:&ProjectSettings,label:&str,email:&str,scheduler:&dyn Scheduler) -> Result<u32> {
    let work_dir = p.stage_dir(label);
    let this_exe = std::env::current_exe().context("cannot determine this executable")?;
    let mut cmd = Command::new(this_exe);
    cmd.arg("wait-for-completion");
    cmd.arg(format!("--refresh-period={}",DEFAULT_TIME_TO_WAIT));
    cmd.arg(project_settings);
    cmd.arg(label);

    let mut b = BatchScript::from_commands(&format!("{}_watcher",label),&[cmd]);
    b.options.partition = p.slurm.partition.clone();
    b.options.account = p.slurm.account.clone();
    b.options.qos = p.slurm.qos.clone();
    b.options.email = Some(String::from(email));
    b.options.memory = Some(String::from("20M"));
    b.options.output = work_dir.join("watcher-%j.out").to_string_lossy().to_string();
    Ok(b.submit_now(&work_dir,scheduler)?)
}

fn status(args:LabelArgs,scheduler:&dyn Scheduler) -> Result<()> {
    let p = load(&args.project_settings)?;
    let summaries = pipeline::manager_summaries(&p,args.label.as_deref(),scheduler)?;
    if args.json {
        println!("{}",serde_json::to_string_pretty(&summaries)?);
        return Ok(())
    }
    if summaries.is_empty() {
        println!("no subject managers found");
        return Ok(())
    }
    for s in &summaries {
        let job = match (s.job_id,s.job_state) {
            (Some(jid),Some(state)) => format!("{} {}",jid,state),
            (Some(jid),None) => format!("{} unknown",jid),
            _ => String::from("not scheduled"),
        };
        println!("{} state:{:?} step:{}/{}    slurm job status:{}",s.name,s.state,s.next_step,s.n_steps,job);
        if let Some(e) = &s.last_error {
            println!("    last error: {}",e);
        }
    }
    let n_done = summaries.iter().filter(|s| s.state == SubjectManagerState::Done).count();
    println!("{} subject managers have completed of {}",n_done,summaries.len());
    Ok(())
}

fn cancel(args:LabelArgs,scheduler:&dyn Scheduler) -> Result<()> {
    let p = load(&args.project_settings)?;
    for (name,ids) in pipeline::cancel(&p,args.label.as_deref(),scheduler)? {
        match ids.is_empty() {
            true => println!("no job id found for {}",name),
            false => println!("{} cancelled ({})",name,utils::vec_to_string(&ids)),
        }
    }
    Ok(())
}

fn restart(args:RestartArgs,scheduler:&dyn Scheduler) -> Result<()> {
    let p = load(&args.project_settings)?;
    let restarted = pipeline::restart(&p,args.label.as_deref(),scheduler,args.disable_slurm)?;
    println!("restarted {} subject managers.",restarted.len());
    Ok(())
}

fn wait_for_completion(args:WaitForCompletionArgs) -> Result<()> {
    let p = load(&args.project_settings)?;
    let refresh = args.refresh_period.unwrap_or_else(|| Duration::from_secs_f32(DEFAULT_TIME_TO_WAIT*60.0));
    let (n_done,total) = pipeline::wait_for_completion(&p,args.label.as_deref(),refresh)?;
    println!("{} of {} are complete",n_done,total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args:&[&str]) -> Result<OrchestrateArgs,clap::Error> {
        OrchestrateArgs::try_parse_from(std::iter::once("orchestrate").chain(args.iter().copied()))
    }

    #[test]
    fn refresh_period_must_be_positive(){
        for bad in ["-1","0","NaN","inf","soon"] {
            let arg = format!("--refresh-period={}",bad);
            assert!(parse(&["wait-for-completion",arg.as_str(),"p.toml"]).is_err(),"accepted {}",bad);
        }
        match parse(&["wait-for-completion","--refresh-period=0.5","p.toml"]).unwrap().action {
            OrchestrateAction::WaitForCompletion(a) => assert_eq!(a.refresh_period,Some(Duration::from_secs(30))),
            a => panic!("unexpected action {:?}",a),
        }
    }

    #[test]
    fn reface_method_is_one_of_three(){
        assert!(parse(&["plan","p.toml","sub-4001","reface","nose"]).is_err());
        for method in ["deface","reface","reface_plus"] {
            match parse(&["plan","p.toml","sub-4001","reface",method]).unwrap().action {
                OrchestrateAction::Plan(a) => match StageRequest::from(a.stage) {
                    StageRequest::Reface{method:m} => assert_eq!(m,method),
                    r => panic!("unexpected request {:?}",r),
                },
                a => panic!("unexpected action {:?}",a),
            }
        }
    }

    #[test]
    fn check_takes_one_subject_or_a_new_log(){
        match parse(&["check","p.toml","--no-git","--new-log","--subj","sub-4001"]).unwrap().action {
            OrchestrateAction::Check(a) => {
                assert!(a.no_git && a.new_log);
                assert_eq!(a.subj.as_deref(),Some("sub-4001"));
            }
            a => panic!("unexpected action {:?}",a),
        }
    }
}
