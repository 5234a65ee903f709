//! Shared AFNI preprocessing of fMRIprep output: copy, blur, masks, scaling and
//! motion files. Task and resting stages both start from this layout.

use std::path::{Path, PathBuf};
use crate::internal::InternalTask;
use crate::motion::{self, MotionFileNames};
use crate::settings::StageSettings;
use crate::step::{Resources, Step};
use crate::StageError;

/// `{base}_desc-{desc}_mask.nii.gz` where base is the anatomical prefix with the
/// session widened to `{sess}_{task}`
pub fn task_mask_name(anat_str:&str,sess:&str,task:&str,desc:&str) -> String {
    let sess_task = format!("{}_{}",sess,task);
    let base = match anat_str.contains(sess) {
        true => anat_str.replacen(sess,&sess_task,1),
        false => match anat_str.split_once('_') {
            Some((subj,rest)) => format!("{}_{}_{}",subj,sess_task,rest),
            None => format!("{}_{}",anat_str,sess_task),
        }
    };
    format!("{}_desc-{}_mask.nii.gz",base,desc)
}

fn joined(paths:&[PathBuf]) -> String {
    paths.iter().map(|p| p.display().to_string()).collect::<Vec<String>>().join(" ")
}

#[derive(Clone,Debug)]
pub struct PrepLayout {
    pub subj:String,
    pub num:String,
    pub sess:String,
    pub task:String,
    pub work_dir:PathBuf,
    pub final_dir:PathBuf,
    pub anat_str:String,
    pub anat_src:Vec<PathBuf>,
    pub epi_src:Vec<PathBuf>,
    pub confound_src:Vec<PathBuf>,
    pub do_blur:bool,
    pub blur_mult:f32,
    afni:Vec<String>,
    afni_c3d:Vec<String>,
}

const ANAT_SUFFIXES:[&str;5] = [
    "desc-preproc_T1w.nii.gz",
    "desc-brain_mask.nii.gz",
    "label-GM_probseg.nii.gz",
    "label-WM_probseg.nii.gz",
    "label-CSF_probseg.nii.gz",
];

fn in_session(files:Vec<PathBuf>,sess:&str) -> Vec<PathBuf> {
    let tag = format!("_{}_",sess);
    let with_sess:Vec<PathBuf> = files.iter().filter(|f| utils::file_name(f).contains(&tag)).cloned().collect();
    match with_sess.is_empty() {
        true => files,
        false => with_sess,
    }
}

impl PrepLayout {
    /// find the fMRIprep files for one subject, session and task
    pub fn discover(settings:&StageSettings,subj:&str,sess:&str,task:&str) -> Result<Self,StageError> {
        let prep_dir = settings.deriv_dir().join("fmriprep").join(subj);
        let tpl = &settings.afni.tplflow_str;

        let t1 = in_session(utils::find_recursive(&prep_dir,&format!("*{}_desc-preproc_T1w.nii.gz",tpl)),sess);
        let t1 = t1.first().ok_or_else(|| StageError::missing(subj,"a preprocessed T1w in template space"))?;
        let t1_name = utils::file_name(t1);
        let anat_str = t1_name.split("_desc").next().unwrap_or(&t1_name).to_string();

        let mut anat_src = Vec::new();
        for suffix in ANAT_SUFFIXES {
            let name = format!("{}_{}",anat_str,suffix);
            let f = utils::find_recursive(&prep_dir,&name).into_iter().next().ok_or_else(|| StageError::missing(subj,&name))?;
            anat_src.push(f);
        }

        let epi_src = in_session(utils::find_recursive(&prep_dir,&format!("*{}*{}_desc-preproc_bold.nii.gz",task,tpl)),sess);
        let confound_src = in_session(utils::find_recursive(&prep_dir,&format!("*{}*desc-confounds_timeseries.tsv",task)),sess);
        if epi_src.is_empty() {
            return Err(StageError::missing(subj,&format!("preprocessed {} runs",task)))
        }
        if epi_src.len() != confound_src.len() {
            return Err(StageError::RunMismatch{subj:subj.to_string(),epi:epi_src.len(),confounds:confound_src.len()})
        }

        let afni = vec![settings.modules.afni.clone()];
        Ok(Self {
            subj:subj.to_string(),
            num:utils::subject_number(subj).to_string(),
            sess:sess.to_string(),
            task:task.to_string(),
            work_dir:settings.scratch_deriv().join("afni").join(subj).join(sess),
            final_dir:settings.deriv_dir().join("afni").join(subj).join(sess),
            anat_str,
            anat_src,
            epi_src,
            confound_src,
            do_blur:settings.afni.do_blur,
            blur_mult:settings.afni.blur_mult,
            afni_c3d:vec![settings.modules.afni.clone(),settings.modules.c3d.clone()],
            afni,
        })
    }

    pub fn afni_modules(&self) -> &[String] {
        &self.afni
    }

    pub fn anat_dir(&self) -> PathBuf {
        self.work_dir.join("anat")
    }

    pub fn func_dir(&self) -> PathBuf {
        self.work_dir.join("func")
    }

    fn anat(&self,suffix:&str) -> PathBuf {
        self.anat_dir().join(format!("{}_{}",self.anat_str,suffix))
    }

    pub fn brain_mask(&self) -> PathBuf {
        self.anat("desc-brain_mask.nii.gz")
    }

    fn prob_mask(&self,tissue:&str) -> PathBuf {
        self.anat(&format!("label-{}_probseg.nii.gz",tissue))
    }

    /// eroded tissue mask, e.g. desc-WMe
    pub fn eroded_mask(&self,tissue:&str) -> PathBuf {
        self.anat(&format!("desc-{}e_mask.nii.gz",tissue))
    }

    pub fn intersect_mask(&self) -> PathBuf {
        self.anat_dir().join(task_mask_name(&self.anat_str,&self.sess,&self.task,"intersect"))
    }

    pub fn minval_mask(&self) -> PathBuf {
        self.anat_dir().join(task_mask_name(&self.anat_str,&self.sess,&self.task,"minval"))
    }

    pub fn epi(&self) -> Vec<PathBuf> {
        self.epi_src.iter().map(|f| self.func_dir().join(utils::file_name(f))).collect()
    }

    pub fn confounds(&self) -> Vec<PathBuf> {
        self.confound_src.iter().map(|f| self.func_dir().join(utils::file_name(f))).collect()
    }

    pub fn run_number(epi:&Path) -> String {
        utils::bids_entity(&utils::file_name(epi),"run").unwrap_or_else(|| String::from("1"))
    }

    pub fn smoothed(epi:&Path) -> PathBuf {
        epi.with_file_name(utils::file_name(epi).replace("desc-preproc","desc-smoothed"))
    }

    /// the run that gets masked and scaled, blurred or not
    pub fn scale_input(&self,epi:&Path) -> PathBuf {
        match self.do_blur {
            true => Self::smoothed(epi),
            false => epi.to_owned(),
        }
    }

    pub fn scaled(epi:&Path) -> PathBuf {
        epi.with_file_name(utils::file_name(epi).replace("desc-preproc","desc-scaled"))
    }

    pub fn scaled_runs(&self) -> Vec<PathBuf> {
        self.epi().iter().map(|e| Self::scaled(e)).collect()
    }

    pub fn motion(&self) -> MotionFileNames {
        motion::motion_file_names(&self.confound_src[0],&self.func_dir(),&self.task)
    }

    pub fn nuisance(&self) -> PathBuf {
        let first = &self.scaled_runs()[0];
        first.with_file_name(utils::file_name(first).replace("_run-1","").replace("desc-scaled","desc-nuissance"))
    }

    /// where a scratch file ends up once copied back to the project
    pub fn in_final(&self,scratch:&Path) -> PathBuf {
        match scratch.strip_prefix(&self.work_dir) {
            Ok(rel) => self.final_dir.join(rel),
            Err(_) => scratch.to_owned(),
        }
    }

    fn job(&self,tag:&str) -> String {
        format!("{}{}",self.num,tag)
    }

    pub fn copy_step(&self) -> Step {
        let mut script = format!("mkdir -p {} {} {}\n",self.anat_dir().display(),self.func_dir().display(),self.work_dir.join("sbatch_out").display());
        let mut checks = Vec::new();
        for src in &self.anat_src {
            script.push_str(&format!("cp -n {} {}/\n",src.display(),self.anat_dir().display()));
            checks.push(self.anat_dir().join(utils::file_name(src)));
        }
        for src in self.epi_src.iter().chain(self.confound_src.iter()) {
            script.push_str(&format!("cp -n {} {}/\n",src.display(),self.func_dir().display()));
            checks.push(self.func_dir().join(utils::file_name(src)));
        }
        Step::local(&format!("copy_{}",self.task),&self.work_dir,&[],&script).checks(checks)
    }

    pub fn blur_steps(&self) -> Vec<Step> {
        if !self.do_blur {
            return vec![]
        }
        self.epi().iter().map(|epi| {
            let run = Self::run_number(epi);
            let out = Self::smoothed(epi);
            let script = format!(
                "blur=$(3dinfo -dk {epi} | awk -v m={mult} '{{b=m*$1; r=int(b); if (r<b) r=r+1; print r}}')\n\
                 3dmerge -1blur_fwhm $blur -doall -prefix {out} {epi}",
                epi = epi.display(), mult = self.blur_mult, out = out.display(),
            );
            Step::scheduled(&format!("blur_{}_run-{}",self.task,run),&self.job(&format!("b{}",run)),&self.work_dir,&self.afni,&script)
                .check(out)
        }).collect()
    }

    pub fn intersect_step(&self) -> Step {
        let mut script = format!("cd {}\n",self.work_dir.display());
        let mut run_masks = Vec::new();
        for epi in self.epi() {
            let run = Self::run_number(&epi);
            let m = format!("func/tmp_{}_run-{}_mask.nii.gz",self.task,run);
            script.push_str(&format!("3dAutomask -prefix {} {}\n",m,self.scale_input(&epi).display()));
            run_masks.push(m);
        }
        let all_runs = format!("func/tmp_{}_mask_allRuns.nii.gz",self.task);
        script.push_str(&format!("3dmask_tool -input {} -union -prefix {}\n",run_masks.join(" "),all_runs));
        script.push_str(&format!("3dmask_tool -input {} {} -inter -prefix {}",all_runs,self.brain_mask().display(),self.intersect_mask().display()));
        Step::scheduled(&format!("intersect_mask_{}",self.task),&self.job("uni"),&self.work_dir,&self.afni,&script)
            .check(self.intersect_mask())
    }

    pub fn tissue_step(&self) -> Step {
        let mut script = format!("cd {}\n",self.work_dir.display());
        let mut checks = Vec::new();
        for tissue in ["GM","WM"] {
            let bin = format!("anat/tmp_{}_bin.nii.gz",tissue);
            let out = self.eroded_mask(tissue);
            script.push_str(&format!("c3d {} -thresh 0.5 1 1 0 -o {}\n",self.prob_mask(tissue).display(),bin));
            script.push_str(&format!("3dmask_tool -input {} -dilate_input -1 -prefix {}\n",bin,out.display()));
            checks.push(out);
        }
        Step::scheduled("tissue_masks",&self.job("tiss"),&self.work_dir,&self.afni_c3d,&script).checks(checks)
    }

    pub fn minimum_step(&self) -> Step {
        let mut script = format!("cd {}\n",self.work_dir.display());
        for epi in self.epi() {
            let run = Self::run_number(&epi);
            let bin = format!("func/tmp_{}_run-{}_bin.nii.gz",self.task,run);
            script.push_str(&format!("3dcalc -overwrite -a {} -expr 1 -prefix {}\n",epi.display(),bin));
            script.push_str(&format!("3dTstat -min -prefix func/tmp_{}_run-{}_min.nii.gz {}\n",self.task,run,bin));
        }
        let mean = format!("func/tmp_mask_mean_{}.nii.gz",self.task);
        script.push_str(&format!("3dMean -datum short -prefix {} func/tmp_{}_run-*_min.nii.gz\n",mean,self.task));
        script.push_str(&format!("3dcalc -a {} -expr 'step(a-0.999)' -prefix {}",mean,self.minval_mask().display()));
        Step::scheduled(&format!("minimum_mask_{}",self.task),&self.job("min"),&self.work_dir,&self.afni,&script)
            .check(self.minval_mask())
    }

    pub fn scale_steps(&self) -> Vec<Step> {
        self.epi().iter().map(|epi| {
            let run = Self::run_number(epi);
            let input = self.scale_input(epi);
            let tstat = self.func_dir().join(format!("tmp_tstat_{}",utils::file_name(epi)));
            let out = Self::scaled(epi);
            let script = format!(
                "3dTstat -prefix {tstat} {input}\n\
                 3dcalc -a {input} -b {tstat} -c {mask} -expr 'c * min(200, a/b*100)*step(a)*step(b)' -prefix {out}",
                tstat = tstat.display(), input = input.display(), mask = self.minval_mask().display(), out = out.display(),
            );
            Step::scheduled(&format!("scale_{}_run-{}",self.task,run),&self.job(&format!("s{}",run)),&self.work_dir,&self.afni,&script)
                .check(out)
        }).collect()
    }

    pub fn motion_step(&self) -> Step {
        let names = self.motion();
        let task = InternalTask::MotionFiles{
            task:self.task.clone(),
            out_dir:self.func_dir(),
            confounds:self.confounds(),
        };
        Step::internal(&format!("motion_{}",self.task),&self.work_dir,task)
            .checks(vec![names.mean,names.deriv,names.censor,names.censor_inv])
    }

    /// white matter timeseries used by 3dREMLfit/3dTproject as a voxelwise regressor
    pub fn nuisance_step(&self) -> Step {
        let tcat = format!("tmp_tcat_{}.nii.gz",self.task);
        let wm = format!("tmp_epi_WMe_{}.nii.gz",self.task);
        let script = format!(
            "cd {func}\n\
             3dTcat -prefix {tcat} {runs}\n\
             3dcalc -a {tcat} -b {mask} -expr 'a*bool(b)' -datum float -prefix {wm}\n\
             3dmerge -1blur_fwhm 20 -doall -prefix {out} {wm}",
            func = self.func_dir().display(), tcat = tcat, runs = joined(&self.scaled_runs()),
            mask = self.eroded_mask("WM").display(), wm = wm, out = self.nuisance().display(),
        );
        Step::scheduled(&format!("nuisance_{}",self.task),&self.job("wts"),&self.work_dir,&self.afni,&script)
            .check(self.nuisance())
            .resources(Resources::new(1,4,1))
    }

    pub fn preprocess(&self) -> Vec<Step> {
        let mut steps = vec![self.copy_step()];
        steps.extend(self.blur_steps());
        steps.push(self.intersect_step());
        steps.push(self.tissue_step());
        steps.push(self.minimum_step());
        steps.extend(self.scale_steps());
        steps.push(self.motion_step());
        steps
    }

    /// remove temporaries, copy the session back to the project, drop scratch
    pub fn finish(&self,keep_intermediates:bool,final_checks:Vec<PathBuf>) -> Vec<Step> {
        let mut steps = Vec::new();
        if !keep_intermediates {
            steps.push(Step::internal(&format!("cleanup_{}",self.task),&self.work_dir,InternalTask::RemoveMatching{
                dir:self.work_dir.clone(),
                patterns:vec![String::from("tmp*")],
            }));
        }
        let script = format!("mkdir -p {dst}\ncp -r {src}/. {dst}/",src = self.work_dir.display(),dst = self.final_dir.display());
        steps.push(Step::local(&format!("copy_final_{}",self.task),&self.work_dir,&[],&script).checks(final_checks));
        steps.push(Step::internal(&format!("remove_scratch_{}",self.task),&self.work_dir,InternalTask::RemoveDir{dir:self.work_dir.clone()}));
        steps
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs::{create_dir_all, File};

    /// a minimal fMRIprep tree for one subject
    pub(crate) fn fake_fmriprep(settings:&StageSettings,subj:&str,sess:&str,task:&str,runs:u32) {
        let tpl = &settings.afni.tplflow_str;
        let base = settings.deriv_dir().join("fmriprep").join(subj);
        let anat = base.join(sess).join("anat");
        let func = base.join(sess).join("func");
        create_dir_all(&anat).unwrap();
        create_dir_all(&func).unwrap();
        let anat_str = format!("{}_{}_{}",subj,sess,tpl);
        for suffix in ANAT_SUFFIXES {
            File::create(anat.join(format!("{}_{}",anat_str,suffix))).unwrap();
        }
        for r in 1..=runs {
            File::create(func.join(format!("{}_{}_{}_run-{}_{}_desc-preproc_bold.nii.gz",subj,sess,task,r,tpl))).unwrap();
            File::create(func.join(format!("{}_{}_{}_run-{}_desc-confounds_timeseries.tsv",subj,sess,task,r))).unwrap();
        }
    }

    pub(crate) fn settings_in(dir:&Path) -> StageSettings {
        let mut s = StageSettings::default();
        s.proj_dir = dir.join("proj");
        s.scratch_dir = dir.join("scratch");
        s
    }

    #[test]
    fn mask_names(){
        let tpl = "space-MNIPediatricAsym_cohort-5_res-2";
        assert_eq!(
            task_mask_name(&format!("sub-4001_ses-S1_{}",tpl),"ses-S1","task-study","intersect"),
            format!("sub-4001_ses-S1_task-study_{}_desc-intersect_mask.nii.gz",tpl)
        );
        assert_eq!(
            task_mask_name(&format!("sub-4001_{}",tpl),"ses-S2","task-rest","minval"),
            format!("sub-4001_ses-S2_task-rest_{}_desc-minval_mask.nii.gz",tpl)
        );
    }

    #[test]
    fn discovers_runs_and_names_outputs(){
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        fake_fmriprep(&settings,"sub-4001","ses-S1","task-study",2);
        let l = PrepLayout::discover(&settings,"sub-4001","ses-S1","task-study").unwrap();
        assert_eq!(l.epi().len(),2);
        assert_eq!(l.num,"4001");
        assert!(utils::file_name(&l.nuisance()).contains("task-study_space"));
        assert!(utils::file_name(&l.nuisance()).ends_with("desc-nuissance_bold.nii.gz"));
        assert!(utils::file_name(&l.scaled_runs()[1]).contains("run-2_space-MNIPediatricAsym_cohort-5_res-2_desc-scaled_bold"));

        let steps = l.preprocess();
        let names:Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names,vec![
            "copy_task-study",
            "intersect_mask_task-study",
            "tissue_masks",
            "minimum_mask_task-study",
            "scale_task-study_run-1",
            "scale_task-study_run-2",
            "motion_task-study",
        ]);
        assert_eq!(steps[4].job_name,"4001s1");
        assert!(steps.iter().all(|s| !s.checks.is_empty()));
    }

    #[test]
    fn blur_adds_a_job_per_run(){
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = settings_in(tmp.path());
        settings.afni.do_blur = true;
        fake_fmriprep(&settings,"sub-4001","ses-S1","task-study",2);
        let l = PrepLayout::discover(&settings,"sub-4001","ses-S1","task-study").unwrap();
        let blur = l.blur_steps();
        assert_eq!(blur.len(),2);
        assert_eq!(blur[1].job_name,"4001b2");
        assert!(utils::file_name(&l.scale_input(&l.epi()[0])).contains("desc-smoothed"));
    }

    #[test]
    fn missing_confounds_are_a_mismatch(){
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        fake_fmriprep(&settings,"sub-4001","ses-S1","task-study",2);
        let func = settings.deriv_dir().join("fmriprep/sub-4001/ses-S1/func");
        std::fs::remove_file(func.join("sub-4001_ses-S1_task-study_run-2_desc-confounds_timeseries.tsv")).unwrap();
        assert!(matches!(
            PrepLayout::discover(&settings,"sub-4001","ses-S1","task-study"),
            Err(StageError::RunMismatch{epi:2,confounds:1,..})
        ));
    }
}
