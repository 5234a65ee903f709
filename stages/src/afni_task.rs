use std::path::PathBuf;
use crate::afni_prep::PrepLayout;
use tracing::warn;
use crate::artifact::{self, Artifact};
use crate::internal::InternalTask;
use crate::settings::StageSettings;
use crate::stage::{Stage, StageKind};
use crate::step::{Resources, Step};
use crate::timing::{self, DeconPlan};
use crate::StageError;

/// Preprocess one task session and fit every planned deconvolution with 3dREMLfit.
pub struct AfniTask {
    settings:StageSettings,
    sess:String,
    task:String,
}

/// `decon_<task>_<title>`, the prefix shared by every file of one deconvolution
pub fn decon_name(task:&str,title:&str) -> String {
    format!("decon_{}_{}",task,title)
}

pub fn decon_command(layout:&PrepLayout,out:&str,behaviors:&[(String,PathBuf)],dur:f32) -> String {
    let motion = layout.motion();
    let runs:Vec<String> = layout.scaled_runs().iter().map(|r| r.display().to_string()).collect();
    let mut lines = vec![
        String::from("3dDeconvolve"),
        String::from("    -x1D_stop"),
        String::from("    -GOFORIT"),
        format!("    -input {}",runs.join(" ")),
        format!("    -censor {}",motion.censor.display()),
        format!("    -ortvec {} mot_mean",motion.mean.display()),
        format!("    -ortvec {} mot_deriv",motion.deriv.display()),
        String::from("    -polort A"),
        String::from("    -float"),
        String::from("    -local_times"),
        format!("    -num_stimts {}",behaviors.len()),
    ];
    for (i,(beh,tf)) in behaviors.iter().enumerate() {
        lines.push(format!("    -stim_times {} {} 'TWOGAMpw(4,5,0.2,12,7,{})'",i+1,tf.display(),dur));
        lines.push(format!("    -stim_label {} {}",i+1,beh));
    }
    lines.extend([
        String::from("    -jobs 1"),
        format!("    -x1D X.{}.xmat.1D",out),
        format!("    -xjpeg X.{}.jpg",out),
        format!("    -x1D_uncensored X.{}.nocensor.xmat.1D",out),
        format!("    -bucket {}_stats",out),
        format!("    -cbucket {}_cbucket",out),
        format!("    -errts {}_errts",out),
    ]);
    lines.join(" \\\n")
}

/// write the 3dDeconvolve script next to its outputs for review, then run it
pub fn script_step(name:&str,layout:&PrepLayout,out:&str,command:&str,checks:Vec<PathBuf>) -> Step {
    let script = format!(
        "cd {func}\ncat > {out}.sh <<'DECON'\n{command}\nDECON\nbash {out}.sh",
        func = layout.func_dir().display(), out = out, command = command,
    );
    Step::local(name,&layout.work_dir,layout.afni_modules(),&script).checks(checks)
}

impl AfniTask {
    pub fn new(settings:StageSettings,sess:&str,task:&str) -> Self {
        Self{settings,sess:sess.to_string(),task:task.to_string()}
    }

    fn afni_root(&self,subj:&str) -> PathBuf {
        self.settings.deriv_dir().join("afni").join(subj)
    }

    fn plan_file(&self,subj:&str) -> Option<PathBuf> {
        let dir = self.settings.afni.decon_plan_dir.as_ref()?;
        let f = dir.join(format!("{}_{}_decon_plan.json",subj,self.task));
        match f.exists() {
            true => Some(f),
            false => None,
        }
    }

    fn events(&self,subj:&str) -> Vec<PathBuf> {
        let dir = self.settings.dset_dir().join(subj).join(&self.sess);
        utils::find_recursive(&dir,&format!("*{}*_events.tsv",self.task))
    }

    /// planned deconvolution titles, the default model only when there is no plan file
    fn decon_titles(&self,subj:&str) -> Result<Vec<String>,StageError> {
        match self.plan_file(subj) {
            Some(f) => Ok(timing::read_decon_plan(&f)?.keys().cloned().collect()),
            None => Ok(vec![timing::DEFAULT_DECON.to_string()]),
        }
    }

    fn n_runs(&self,subj:&str) -> usize {
        let prep = self.settings.deriv_dir().join("fmriprep").join(subj);
        let pattern = format!("*{}*{}*{}_desc-preproc_bold.nii.gz",self.sess,self.task,self.settings.afni.tplflow_str);
        utils::find_recursive(&prep,&pattern).len().max(1)
    }
}

impl Stage for AfniTask {
    fn kind(&self) -> StageKind {
        StageKind::AfniTask
    }

    fn label(&self) -> String {
        format!("afni_task_{}_{}",self.sess,self.task)
    }

    fn inputs(&self,subj:&str) -> Vec<Artifact> {
        let prep = self.settings.deriv_dir().join("fmriprep").join(subj);
        let tpl = &self.settings.afni.tplflow_str;
        let mut a = vec![
            Artifact::new("fmriprep_t1",&prep,&format!("*{}_desc-preproc_T1w.nii.gz",tpl)),
            Artifact::new("fmriprep_bold",&prep,&format!("*{}*{}*{}_desc-preproc_bold.nii.gz",self.sess,self.task,tpl)),
        ];
        if self.plan_file(subj).is_none() {
            a.push(Artifact::new("events",&self.settings.dset_dir().join(subj).join(&self.sess),&format!("*{}*_events.tsv",self.task)));
        }
        a
    }

    fn outputs(&self,subj:&str) -> Vec<Artifact> {
        let root = self.afni_root(subj);
        let mut a = vec![
            Artifact::new("wme_mask",&root,"*desc-WMe_mask*").logged_as("wme_mask"),
            Artifact::new("intersect",&root,&format!("*{}_{}_*desc-intersect_mask.nii.gz",self.sess,self.task))
                .logged_as(&format!("intersect_{}_{}",self.sess,self.task)),
        ];
        for run in 1..=self.n_runs(subj) {
            a.push(Artifact::new(&format!("scaled_run-{}",run),&root,&format!("*{}_*{}*run-{}_*desc-scaled_bold*",self.sess,self.task,run))
                .logged_as(&format!("scaled_{}_{}",self.sess,run)));
        }
        match self.decon_titles(subj) {
            Ok(titles) => for (i,title) in titles.iter().enumerate() {
                a.push(Artifact::new(&format!("decon_{}",title),&root,&format!("{}_stats_REML+tlrc.HEAD",decon_name(&self.task,title)))
                    .logged_as(&format!("decon_{}_{}",self.sess,i+1)));
            },
            Err(e) => warn!("{}: no deconvolution outputs for {}: {}",self.label(),subj,e),
        }
        a
    }

    /// an unreadable decon plan leaves the subject needed until plan() reports it
    fn is_needed(&self,subj:&str) -> bool {
        self.decon_titles(subj).is_err() || !artifact::all_present(&self.outputs(subj))
    }

    fn plan(&self,subj:&str) -> Result<Vec<Step>,StageError> {
        let layout = PrepLayout::discover(&self.settings,subj,&self.sess,&self.task)?;
        let mut steps = layout.preprocess();

        let plan:DeconPlan = match self.plan_file(subj) {
            Some(f) => timing::read_decon_plan(&f)?,
            None => {
                let events = self.events(subj);
                if events.is_empty() {
                    return Err(StageError::missing(subj,&format!("{} events files",self.task)))
                }
                let behaviors = timing::unique_behaviors(&events)?;
                let out_dir = layout.work_dir.join("timing_files");
                let prefix = format!("tf_{}",self.task);
                let plan = timing::default_plan(&behaviors,&out_dir,&prefix);
                let checks = plan.values().flat_map(|tf| tf.values().cloned()).collect();
                steps.push(Step::internal(&format!("timing_{}",self.task),&layout.work_dir,InternalTask::TimingFiles{
                    prefix,
                    out_dir,
                    events,
                    behaviors,
                }).checks(checks));
                plan
            }
        };

        let func = layout.func_dir();
        for (title,tfs) in &plan {
            let out = decon_name(&self.task,title);
            let behs:Vec<(String,PathBuf)> = tfs.iter().map(|(b,f)| (b.clone(),f.clone())).collect();
            let cmd = decon_command(&layout,&out,&behs,self.settings.afni.dur);
            steps.push(script_step(&format!("decon_{}",title),&layout,&out,&cmd,vec![
                func.join(format!("{}_stats.REML_cmd",out)),
                func.join(format!("X.{}.xmat.1D",out)),
            ]));
        }

        steps.push(layout.nuisance_step());

        let mut final_checks = Vec::new();
        for title in plan.keys() {
            let out = decon_name(&self.task,title);
            let reml = func.join(format!("{}_stats_REML+tlrc.HEAD",out));
            let script = format!(
                "cd {}\ntcsh -x {}_stats.REML_cmd -dsort {} -GOFORIT",
                func.display(),out,layout.nuisance().display(),
            );
            steps.push(Step::scheduled(&format!("reml_{}",title),&format!("{}rml",layout.num),&layout.work_dir,layout.afni_modules(),&script)
                .check(reml.clone())
                .resources(Resources::new(25,4,6)));
            final_checks.push(layout.in_final(&reml));
        }

        steps.extend(layout.finish(self.settings.afni.keep_intermediates,final_checks));
        Ok(steps)
    }

    fn driver_resources(&self) -> Resources {
        Resources::new(30,4,1)
    }
}
