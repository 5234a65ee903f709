use std::path::PathBuf;
use crate::artifact::Artifact;
use crate::internal::InternalTask;
use crate::settings::StageSettings;
use crate::stage::{Stage, StageKind};
use crate::step::{Resources, Step};
use crate::StageError;

pub const LABELS:[(&str,&str);2] = [("ashs_L","left_lfseg_corr_usegray"),("ashs_R","right_lfseg_corr_usegray")];

/// Hippocampal subfield labels from the ASHS container, worked in scratch and copied
/// back from its `final/` directory.
pub struct Ashs {
    settings:StageSettings,
    sess:String,
}

impl Ashs {
    pub fn new(settings:StageSettings,sess:&str) -> Self {
        Self{settings,sess:sess.to_string()}
    }

    fn anat_dir(&self,subj:&str) -> PathBuf {
        self.settings.dset_dir().join(subj).join(&self.sess).join("anat")
    }

    fn search(&self,subj:&str,key:&str) -> Vec<PathBuf> {
        utils::find_recursive(&self.anat_dir(subj),&format!("*{}*.nii.gz",key))
    }
}

impl Stage for Ashs {
    fn kind(&self) -> StageKind {
        StageKind::Ashs
    }

    fn label(&self) -> String {
        format!("ashs_{}",self.sess)
    }

    fn inputs(&self,subj:&str) -> Vec<Artifact> {
        let a = &self.settings.ashs;
        vec![
            Artifact::new("t1",&self.anat_dir(subj),&format!("*{}*.nii.gz",a.t1_search)),
            Artifact::new("t2",&self.anat_dir(subj),&format!("*{}*.nii.gz",a.t2_search)),
        ]
    }

    fn outputs(&self,subj:&str) -> Vec<Artifact> {
        let root = self.settings.deriv_dir().join("ashs").join(subj);
        LABELS.iter().map(|(col,pat)| Artifact::new(col,&root,&format!("*{}*",pat)).logged_as(col)).collect()
    }

    fn plan(&self,subj:&str) -> Result<Vec<Step>,StageError> {
        let a = &self.settings.ashs;
        let t1 = self.search(subj,&a.t1_search).into_iter().next().ok_or_else(|| StageError::missing(subj,"a T1-weighted image"))?;
        let t2 = self.search(subj,&a.t2_search).into_iter().next().ok_or_else(|| StageError::missing(subj,"a T2-weighted image"))?;
        let work = self.settings.scratch_deriv().join("ashs").join(subj).join(&self.sess);
        let dest = self.settings.deriv_dir().join("ashs").join(subj).join(&self.sess);
        let num = utils::subject_number(subj);

        let script = format!(
            "mkdir -p {work}\n\
             singularity run --cleanenv --bind {anat}:/data_dir --bind {work}:/work_dir --bind {atlas}:/atlas_dir {img} -i {subj} -g {t1} -f {t2} -a {atlas_str}",
            work = work.display(), anat = self.anat_dir(subj).display(), atlas = a.atlas_dir.display(),
            img = a.sing_img.display(), subj = subj, t1 = utils::file_name(&t1), t2 = utils::file_name(&t2),
            atlas_str = a.atlas_str,
        );
        let label_file = |dir:&PathBuf,pat:&str| dir.join(format!("{}_{}.nii.gz",subj,pat));
        let work_final = work.join("final");
        let segment = Step::scheduled("segment",&format!("ashs{}",num),&work,&[self.settings.modules.singularity.clone()],&script)
            .checks(LABELS.iter().map(|(_,p)| label_file(&work_final,p)).collect())
            .resources(Resources::new(2,4,6));

        let copy = Step::local("copy_final",&work,&[],&format!("mkdir -p {dest}\ncp -r {src}/. {dest}/",src = work_final.display(),dest = dest.display()))
            .checks(LABELS.iter().map(|(_,p)| label_file(&dest,p)).collect());
        let clean = Step::internal("remove_scratch",&work,InternalTask::RemoveDir{dir:work.clone()});
        Ok(vec![segment,copy,clean])
    }

    fn driver_resources(&self) -> Resources {
        Resources::new(4,4,1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afni_prep::tests::settings_in;
    use std::fs::{create_dir_all, File};

    #[test]
    fn needs_both_weightings(){
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        let anat = settings.dset_dir().join("sub-4001/ses-S1/anat");
        create_dir_all(&anat).unwrap();
        File::create(anat.join("sub-4001_ses-S1_T1w.nii.gz")).unwrap();
        let stage = Ashs::new(settings,"ses-S1");
        assert!(!stage.is_ready("sub-4001"));
        assert!(stage.plan("sub-4001").is_err());

        File::create(anat.join("sub-4001_ses-S1_PD.nii.gz")).unwrap();
        assert!(stage.is_ready("sub-4001"));
        let steps = stage.plan("sub-4001").unwrap();
        assert_eq!(steps[0].job_name,"ashs4001");
        assert_eq!(steps[0].resources,Resources::new(2,4,6));
        match &steps[0].action {
            crate::step::Action::Shell{script,..} => assert!(script.contains("-g sub-4001_ses-S1_T1w.nii.gz -f sub-4001_ses-S1_PD.nii.gz -a ashs_atlas_magdeburg")),
            a => panic!("unexpected action {:?}",a),
        }
        assert!(utils::file_name(&steps[1].checks[0]) == "sub-4001_left_lfseg_corr_usegray.nii.gz");
    }
}
