use std::path::PathBuf;
use crate::artifact::Artifact;
use crate::settings::StageSettings;
use crate::stage::{Stage, StageKind};
use crate::step::{Resources, Step};
use crate::StageError;

/// De/reface the raw T1w with `@afni_refacer_run`. Method is one of deface, reface
/// or reface_plus and names the derivatives directory.
pub struct Reface {
    settings:StageSettings,
    method:String,
}

impl Reface {
    pub fn new(settings:StageSettings,method:&str) -> Self {
        Self{settings,method:method.to_string()}
    }

    /// sorted, so the latest session comes last
    fn t1_files(&self,subj:&str) -> Vec<PathBuf> {
        utils::find_recursive(&self.settings.dset_dir().join(subj),"*_T1w.nii.gz")
    }
}

impl Stage for Reface {
    fn kind(&self) -> StageKind {
        StageKind::Reface
    }

    fn label(&self) -> String {
        self.method.clone()
    }

    fn inputs(&self,subj:&str) -> Vec<Artifact> {
        vec![Artifact::new("t1w",&self.settings.dset_dir().join(subj),"*_T1w.nii.gz")]
    }

    fn outputs(&self,subj:&str) -> Vec<Artifact> {
        let a = Artifact::new(&self.method,&self.settings.deriv_dir().join(&self.method).join(subj),&format!("*desc-{}*",self.method));
        vec![a.logged_as(&self.method)]
    }

    fn plan(&self,subj:&str) -> Result<Vec<Step>,StageError> {
        let t1 = self.t1_files(subj).into_iter().last().ok_or_else(|| StageError::missing(subj,"a T1w image"))?;
        let t1_name = utils::file_name(&t1);
        // sub-1234_ses-A_T1w.nii.gz
        let sess = match t1_name.split('_').nth(1) {
            Some(s) if s.starts_with("ses-") => s.to_string(),
            _ => return Err(StageError::missing(subj,"a session entity in the T1w name")),
        };
        let out_dir = self.settings.deriv_dir().join(&self.method).join(subj).join(&sess).join("anat");
        let t1_out = out_dir.join(t1_name.replace("_T1w",&format!("_desc-{}_T1w",self.method)));
        let script = format!(
            "mkdir -p {out}\n\
             export TMPDIR={out}\n\
             @afni_refacer_run -input {t1} -mode_{method} -anonymize_output -prefix {t1_out}\n\
             rm -f {out}/*.face.nii.gz\n\
             rm -rf {out}/*_QC",
            out = out_dir.display(), t1 = t1.display(), method = self.method, t1_out = t1_out.display(),
        );
        let num = utils::subject_number(subj);
        let step = Step::scheduled(&self.method,&format!("{}{}",num,self.method),&out_dir,&[self.settings.modules.afni.clone()],&script)
            .check(t1_out);
        Ok(vec![step])
    }

    fn driver_resources(&self) -> Resources {
        Resources::new(2,1,1)
    }
}
