use std::path::PathBuf;
use crate::artifact::Artifact;
use crate::internal::InternalTask;
use crate::settings::StageSettings;
use crate::stage::{Stage, StageKind};
use crate::step::{Resources, Step};
use crate::StageError;

/// FreeSurfer then fMRIprep on a scratch copy of the subject's raw data.
pub struct Fmriprep {
    settings:StageSettings,
}

impl Fmriprep {
    pub fn new(settings:StageSettings) -> Self {
        Self{settings}
    }

    fn fs_dir(&self) -> PathBuf {
        self.settings.scratch_deriv().join("freesurfer")
    }

    fn work_dir(&self,subj:&str) -> PathBuf {
        self.settings.scratch_deriv().join("work").join(subj)
    }

    fn prep_command(&self,subj:&str,num:&str) -> String {
        let f = &self.settings.fmriprep;
        let work = self.work_dir(subj);
        [
            String::from("singularity run --cleanenv"),
            format!("    --bind {}:/data",self.settings.scratch_dset().display()),
            format!("    --bind {}:/out",self.settings.scratch_deriv().display()),
            format!("    {}",f.sing_img.display()),
            String::from("    /data /out participant"),
            format!("    --work-dir {}",work.display()),
            format!("    --participant-label {}",num),
            format!("    --skull-strip-template {}",f.skull_strip_template),
            format!("    --output-spaces {}",f.output_spaces),
            format!("    --fs-license-file {}",f.fs_license.display()),
            format!("    --fs-subjects-dir {}",self.fs_dir().display()),
            String::from("    --skip-bids-validation"),
            format!("    --bids-database-dir {}",work.join("bids_layout").display()),
            String::from("    --nthreads 4"),
            String::from("    --omp-nthreads 4"),
            String::from("    --stop-on-first-crash"),
        ].join(" \\\n")
    }
}

impl Stage for Fmriprep {
    fn kind(&self) -> StageKind {
        StageKind::Fmriprep
    }

    fn label(&self) -> String {
        String::from("fmriprep")
    }

    fn inputs(&self,subj:&str) -> Vec<Artifact> {
        vec![Artifact::new("t1w",&self.settings.dset_dir().join(subj),"*T1w.nii.gz")]
    }

    fn outputs(&self,subj:&str) -> Vec<Artifact> {
        let prep = self.settings.deriv_dir().join("fmriprep").join(subj);
        vec![
            Artifact::new("preproc_t1",&prep,&format!("*{}_desc-preproc_T1w.nii.gz",self.settings.afni.tplflow_str)),
            Artifact::new("confounds",&prep,"*desc-confounds_timeseries.tsv"),
        ]
    }

    fn plan(&self,subj:&str) -> Result<Vec<Step>,StageError> {
        let t1 = utils::find_recursive(&self.settings.dset_dir().join(subj),"*T1w.nii.gz");
        let t1 = t1.last().ok_or_else(|| StageError::missing(subj,"a T1w image"))?;
        let num = utils::subject_number(subj);
        let work = self.work_dir(subj);
        let fs_subj = self.fs_dir().join(subj);
        let final_fs = self.settings.deriv_dir().join("freesurfer").join(subj);
        let final_prep = self.settings.deriv_dir().join("fmriprep");
        let scratch_prep = self.settings.scratch_deriv().join("fmriprep");
        let scratch_subj = self.settings.scratch_dset().join(subj);
        let f = &self.settings.fmriprep;
        let mut steps = Vec::new();

        // earlier FreeSurfer output is reused
        let mut script = format!(
            "mkdir -p {work} {fs}\n\
             cp -rn {src} {dset}/\n\
             cp -n {desc} {dset}/\n\
             if [ -d {final_fs} ] && [ ! -d {fs_subj} ]; then cp -r {final_fs} {fs}/; fi",
            work = work.display(), fs = self.fs_dir().display(),
            src = self.settings.dset_dir().join(subj).display(), dset = self.settings.scratch_dset().display(),
            desc = self.settings.dset_dir().join("dataset_description.json").display(),
            final_fs = final_fs.display(), fs_subj = fs_subj.display(),
        );
        if let Some(source) = &f.tplflow_source {
            script.push_str(&format!("\nrsync -a {}/ {}/",source.display(),f.tplflow_dir.display()));
        }
        steps.push(Step::local("copy_dset",&work,&[],&script)
            .checks(vec![scratch_subj.clone(),self.settings.scratch_dset().join("dataset_description.json")]));

        let aparc = fs_subj.join("mri/aparc+aseg.mgz");
        let script = format!(
            "recon-all -all -i {t1} -openmp 4 -subjid {subj} -sd {fs}",
            t1 = scratch_subj.join(t1.strip_prefix(self.settings.dset_dir().join(subj)).unwrap_or(t1)).display(),
            subj = subj, fs = self.fs_dir().display(),
        );
        steps.push(Step::scheduled("freesurfer",&format!("fs{}",num),&work,&[self.settings.modules.freesurfer.clone()],&script)
            .check(aparc)
            .resources(Resources::new(10,4,4)));

        let report = scratch_prep.join(format!("{}.html",subj));
        let script = format!(
            "export SINGULARITYENV_TEMPLATEFLOW_HOME={tpl}\n\
             export FS_LICENSE={lic}\n\
             export TMPDIR={tmp}\n\
             cd /\n\
             {cmd}",
            tpl = f.tplflow_dir.display(), lic = f.fs_license.display(), tmp = f.tmp_dir.display(),
            cmd = self.prep_command(subj,num),
        );
        steps.push(Step::scheduled("fmriprep",&format!("fprep{}",num),&work,&[self.settings.modules.singularity.clone()],&script)
            .check(report)
            .resources(Resources::new(10,4,4)));

        let script = format!(
            "mkdir -p {final_prep} {final_fs_root}\n\
             cp -r {scratch_prep}/{subj} {scratch_prep}/{subj}.html {final_prep}/\n\
             cp -r {fs_subj} {final_fs_root}/",
            final_prep = final_prep.display(), final_fs_root = self.settings.deriv_dir().join("freesurfer").display(),
            scratch_prep = scratch_prep.display(), subj = subj, fs_subj = fs_subj.display(),
        );
        steps.push(Step::local("copy_final",&work,&[],&script)
            .checks(vec![final_prep.join(format!("{}.html",subj)),final_fs.join("mri/aparc+aseg.mgz")]));

        for (name,dir) in [("remove_dset",scratch_subj),("remove_prep",scratch_prep.join(subj)),("remove_freesurfer",fs_subj),("remove_work",work.clone())] {
            steps.push(Step::internal(name,&work,InternalTask::RemoveDir{dir}));
        }
        Ok(steps)
    }

    fn driver_resources(&self) -> Resources {
        Resources::new(20,4,1)
    }
}
