use std::path::PathBuf;
use crate::afni_prep::PrepLayout;
use crate::afni_task::script_step;
use crate::artifact::Artifact;
use crate::settings::StageSettings;
use crate::stage::{Stage, StageKind};
use crate::step::{Resources, Step};
use crate::StageError;

/// Resting state: preprocessing, a nuisance regression matrix, anaticor style
/// projection, data quality metrics and Fisher z seed correlation maps.
pub struct AfniResting {
    settings:StageSettings,
    sess:String,
    task:String,
}

impl AfniResting {
    pub fn new(settings:StageSettings,sess:&str,task:&str) -> Self {
        Self{settings,sess:sess.to_string(),task:task.to_string()}
    }

    /// prefix of the regression matrix files
    pub fn regression(&self) -> String {
        format!("decon_{}",self.task)
    }

    pub fn projected(&self) -> String {
        format!("{}_anaticor",self.regression())
    }

    fn regression_command(&self,layout:&PrepLayout,out:&str) -> String {
        let motion = layout.motion();
        let runs:Vec<String> = layout.scaled_runs().iter().map(|r| r.display().to_string()).collect();
        [
            String::from("3dDeconvolve"),
            String::from("    -x1D_stop"),
            String::from("    -GOFORIT"),
            format!("    -input {}",runs.join(" ")),
            format!("    -censor {}",motion.censor.display()),
            format!("    -ortvec {} mot_mean",motion.mean.display()),
            format!("    -ortvec {} mot_deriv",motion.deriv.display()),
            String::from("    -polort A"),
            String::from("    -float"),
            String::from("    -num_stimts 0"),
            String::from("    -jobs 1"),
            format!("    -x1D X.{}.xmat.1D",out),
            format!("    -xjpeg X.{}.jpg",out),
            format!("    -x1D_uncensored X.{}.nocensor.xmat.1D",out),
        ].join(" \\\n")
    }

    /// Temporal SNR, global correlation and ACF smoothness estimates of the
    /// projected series. Each metric is its own job keyed on its output file.
    fn metric_steps(&self,layout:&PrepLayout) -> Vec<Step> {
        let func = layout.func_dir();
        let afni = layout.afni_modules().to_vec();
        let epi = layout.scaled_runs()[0].clone();
        let epi_name = utils::file_name(&epi);
        let censor = layout.motion().censor;
        let mask = layout.intersect_mask();
        let proj_path = func.join(self.projected());
        let proj = proj_path.display();

        let snr = epi.with_file_name(epi_name.replace("scaled","tsnr"));
        let script = format!(
            "cd {func}\n\
             used=$(1d_tool.py -infile {censor} -show_trs_uncensored encoded)\n\
             3dTstat -mean -prefix {mean} {epi}\"[$used]\"\n\
             3dTstat -stdev -prefix {sd} {proj}+tlrc\"[$used]\"\n\
             3dcalc -a {mean} -b {sd} -c {mask} -expr 'c*a/b' -prefix {snr}",
            func = func.display(), censor = censor.display(), epi = epi.display(), proj = proj,
            mean = epi.with_file_name(epi_name.replace("scaled","meanTS")).display(),
            sd = epi.with_file_name(epi_name.replace("scaled","sdTS")).display(),
            mask = mask.display(), snr = snr.display(),
        );
        let tsnr = Step::scheduled("tsnr",&format!("{}SNR",layout.num),&layout.work_dir,&afni,&script)
            .check(snr)
            .resources(Resources::new(1,8,1));

        let gcor_file = func.join(format!("{}_gcor.1D",self.projected()));
        let script = format!(
            "cd {func}\n\
             3dTnorm -norm2 -prefix {proj}_unit+tlrc {proj}+tlrc\n\
             3dmaskave -quiet -mask {mask} {proj}_unit+tlrc > {proj}_gmean.1D\n\
             3dTstat -sos -prefix - {proj}_gmean.1D\\' > {gcor}",
            func = func.display(), proj = proj, mask = mask.display(), gcor = gcor_file.display(),
        );
        let gcor = Step::scheduled("gcor",&format!("{}GCOR",layout.num),&layout.work_dir,&afni,&script)
            .check(gcor_file)
            .resources(Resources::new(1,8,1));

        let acf_avg = func.join(format!("{}_ACF-average.1D",self.projected()));
        let epi_acf = epi_name.replace("_bold.nii.gz","");
        let script = format!(
            "cd {func}\n\
             used=$(1d_tool.py -infile X.{out}.xmat.1D -show_trs_uncensored encoded -show_trs_run 1)\n\
             3dFWHMx -mask {mask} -ACF {epi_acf}_ACF-estimates.1D {epi}\"[$used]\" > {epi_acf}_ACF-average.1D\n\
             3dFWHMx -mask {mask} -ACF {proj}_ACF-estimates.1D {proj}+tlrc\"[$used]\" > {avg}",
            func = func.display(), out = self.regression(), mask = mask.display(),
            epi_acf = epi_acf, epi = epi.display(), proj = proj, avg = acf_avg.display(),
        );
        let fwhm = Step::scheduled("fwhmx",&format!("{}FWHMx",layout.num),&layout.work_dir,&afni,&script)
            .check(acf_avg)
            .resources(Resources::new(2,8,4));

        vec![tsnr,gcor,fwhm]
    }
}

impl Stage for AfniResting {
    fn kind(&self) -> StageKind {
        StageKind::AfniResting
    }

    fn label(&self) -> String {
        format!("afni_rest_{}_{}",self.sess,self.task)
    }

    fn inputs(&self,subj:&str) -> Vec<Artifact> {
        let prep = self.settings.deriv_dir().join("fmriprep").join(subj);
        let tpl = &self.settings.afni.tplflow_str;
        vec![
            Artifact::new("fmriprep_t1",&prep,&format!("*{}_desc-preproc_T1w.nii.gz",tpl)),
            Artifact::new("fmriprep_bold",&prep,&format!("*{}*{}*{}_desc-preproc_bold.nii.gz",self.sess,self.task,tpl)),
        ]
    }

    fn outputs(&self,subj:&str) -> Vec<Artifact> {
        let root = self.settings.deriv_dir().join("afni").join(subj);
        let proj = self.projected();
        let mut a = vec![
            Artifact::new("intersect",&root,&format!("*{}_{}_*desc-intersect_mask.nii.gz",self.sess,self.task))
                .logged_as(&format!("intersect_{}_{}",self.sess,self.task)),
            Artifact::new("scaled",&root,&format!("*{}_*desc-scaled_bold*",self.task)).logged_as("scaled_resting"),
            Artifact::new("regression",&root,&format!("X.{}.xmat.1D",self.regression()))
                .logged_as("decon_resting"),
        ];
        for seed in self.settings.afni.seeds.keys() {
            a.push(Artifact::new(&format!("ztrans_{}",seed),&root,&format!("{}_{}_ztrans+tlrc.HEAD",proj,seed)));
        }
        a
    }

    fn plan(&self,subj:&str) -> Result<Vec<Step>,StageError> {
        let layout = PrepLayout::discover(&self.settings,subj,&self.sess,&self.task)?;
        let func = layout.func_dir();
        let afni = layout.afni_modules().to_vec();
        let mut steps = layout.preprocess();

        let out = self.regression();
        let xmat = func.join(format!("X.{}.xmat.1D",out));
        let cmd = self.regression_command(&layout,&out);
        steps.push(script_step("regression",&layout,&out,&cmd,vec![xmat.clone()]));
        steps.push(layout.nuisance_step());

        let proj = self.projected();
        let proj_head = func.join(format!("{}+tlrc.HEAD",proj));
        let script = format!(
            "cd {func}\n\
             3dTproject -polort 0 -input {runs} -censor {censor} -cenmode ZERO -ort X.{out}.nocensor.xmat.1D -dsort {nuiss} -prefix {proj}",
            func = func.display(),
            runs = layout.scaled_runs().iter().map(|r| r.display().to_string()).collect::<Vec<String>>().join(" "),
            censor = layout.motion().censor.display(),
            out = out,
            nuiss = layout.nuisance().display(),
            proj = proj,
        );
        steps.push(Step::scheduled("anaticor",&format!("{}atc",layout.num),&layout.work_dir,&afni,&script)
            .check(proj_head)
            .resources(Resources::new(2,8,1)));
        steps.extend(self.metric_steps(&layout));

        let mut final_checks = vec![layout.in_final(&xmat)];
        for (seed,coord) in &self.settings.afni.seeds {
            let seed_mask = layout.intersect_mask().with_file_name(
                utils::file_name(&layout.intersect_mask()).replace("desc-intersect",&format!("desc-RS{}",seed))
            );
            let seed_ts = layout.motion().censor.with_file_name(
                utils::file_name(&layout.motion().censor).replace("desc-censor",&format!("desc-RS{}",seed))
            );
            let xyz = layout.anat_dir().join(format!("tmp_{}.txt",seed));
            let script = format!(
                "echo {coord} > {xyz}\n\
                 3dUndump -prefix {mask} -master {proj}+tlrc -srad 2 -xyz {xyz}\n\
                 3dROIstats -quiet -mask {mask} {proj}+tlrc > {ts}",
                coord = coord, xyz = xyz.display(), mask = seed_mask.display(),
                proj = func.join(&proj).display(), ts = seed_ts.display(),
            );
            steps.push(Step::local(&format!("seed_{}",seed),&layout.work_dir,&afni,&script).checks(vec![seed_mask.clone(),seed_ts.clone()]));

            let corr = format!("{}_{}_corr",proj,seed);
            let ztrans = format!("{}_{}_ztrans",proj,seed);
            let head = func.join(format!("{}+tlrc.HEAD",ztrans));
            let script = format!(
                "cd {func}\n\
                 3dTcorr1D -mask {mask} -prefix {corr} {proj}+tlrc {ts}\n\
                 3dcalc -a {corr}+tlrc -expr 'log((1+a)/(1-a))/2' -prefix {ztrans}",
                func = func.display(), mask = layout.intersect_mask().display(), corr = corr,
                proj = proj, ts = seed_ts.display(), ztrans = ztrans,
            );
            steps.push(Step::scheduled(&format!("ztrans_{}",seed),&format!("{}Ztran",layout.num),&layout.work_dir,&afni,&script)
                .check(head.clone())
                .resources(Resources::new(1,4,1)));
            final_checks.push(layout.in_final(&head));
        }

        steps.extend(layout.finish(self.settings.afni.keep_intermediates,final_checks));
        Ok(steps)
    }

    fn driver_resources(&self) -> Resources {
        Resources::new(10,4,1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afni_prep::tests::{fake_fmriprep, settings_in};

    #[test]
    fn seeds_get_a_ztrans_map(){
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        fake_fmriprep(&settings,"sub-4001","ses-S2","task-rest",1);
        let stage = AfniResting::new(settings,"ses-S2","task-rest");
        assert!(stage.is_ready("sub-4001"));
        let steps = stage.plan("sub-4001").unwrap();
        let names:Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        for n in ["regression","nuisance_task-rest","anaticor","seed_rPCC","ztrans_rPCC","copy_final_task-rest"] {
            assert!(names.contains(&n),"missing {}",n);
        }
        let z = steps.iter().find(|s| s.name == "ztrans_rPCC").unwrap();
        assert!(utils::file_name(&z.checks[0]) == "decon_task-rest_anaticor_rPCC_ztrans+tlrc.HEAD");
        let seed = steps.iter().find(|s| s.name == "seed_rPCC").unwrap();
        assert!(!seed.is_scheduled());

        let pos = |n:&str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("anaticor") < pos("tsnr"));
        assert!(pos("fwhmx") < pos("seed_rPCC"));

        let cols:Vec<String> = stage.outputs("sub-4001").iter().filter_map(|a| a.log_column.clone()).collect();
        assert_eq!(cols,vec!["intersect_ses-S2_task-rest","scaled_resting","decon_resting"]);
        let pattern:Vec<PathBuf> = stage.outputs("sub-4001").iter().map(|a| PathBuf::from(&a.pattern)).collect();
        assert!(pattern.contains(&PathBuf::from("X.decon_task-rest.xmat.1D")));
    }

    #[test]
    fn quality_metrics_follow_the_projection(){
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        fake_fmriprep(&settings,"sub-4001","ses-S2","task-rest",1);
        let stage = AfniResting::new(settings,"ses-S2","task-rest");
        let steps = stage.plan("sub-4001").unwrap();
        let by_name = |n:&str| steps.iter().find(|s| s.name == n).unwrap();

        let tsnr = by_name("tsnr");
        assert!(tsnr.is_scheduled());
        assert_eq!(tsnr.job_name,"4001SNR");
        let snr_file = utils::file_name(&tsnr.checks[0]);
        assert!(snr_file.contains("tsnr") && !snr_file.contains("scaled"));

        let gcor = by_name("gcor");
        assert_eq!(gcor.job_name,"4001GCOR");
        assert_eq!(utils::file_name(&gcor.checks[0]),"decon_task-rest_anaticor_gcor.1D");

        let fwhm = by_name("fwhmx");
        assert_eq!(fwhm.job_name,"4001FWHMx");
        assert_eq!(utils::file_name(&fwhm.checks[0]),"decon_task-rest_anaticor_ACF-average.1D");
        assert_eq!(fwhm.resources.cpus,4);
        assert_eq!(fwhm.resources.wall_hours,2);
    }
}
