use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// One column of the completion log: the derivatives sub-directory to search and the
/// fragment that identifies the finished file. Searched as `<deriv_dir>/<subj>/**/*<pattern>*`.
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct ExpectedDerivative {
    pub column:String,
    pub deriv_dir:String,
    pub pattern:String,
}

impl ExpectedDerivative {
    pub fn new(column:&str,deriv_dir:&str,pattern:&str) -> Self {
        Self {
            column:column.to_string(),
            deriv_dir:deriv_dir.to_string(),
            pattern:pattern.to_string(),
        }
    }

    pub fn subject_dir(&self,deriv_root:&Path,subj:&str) -> PathBuf {
        deriv_root.join(&self.deriv_dir).join(subj)
    }

    pub fn glob(&self) -> String {
        format!("*{}*",self.pattern)
    }

    /// first matching file for this subject, if any
    pub fn find(&self,deriv_root:&Path,subj:&str) -> Option<PathBuf> {
        utils::find_recursive(&self.subject_dir(deriv_root,subj),&self.glob()).into_iter().next()
    }
}

pub fn default_expected() -> Vec<ExpectedDerivative> {
    let tpl = "space-MNIPediatricAsym_cohort-5_res-2";
    let mut e = vec![ExpectedDerivative::new("wme_mask","afni","desc-WMe_mask")];
    for (sess,task) in [("ses-S1","task-study"),("ses-S2","task-test"),("ses-S2","task-rest")] {
        e.push(ExpectedDerivative::new(
            &format!("intersect_{}_{}",sess,task),
            "afni",
            &format!("{}_{}_{}_desc-intersect_mask.nii.gz",sess,task,tpl),
        ));
    }
    for (sess,n_runs) in [("ses-S1",2),("ses-S2",3)] {
        for run in 1..=n_runs {
            e.push(ExpectedDerivative::new(
                &format!("scaled_{}_{}",sess,run),
                "afni",
                &format!("{}_*_run-{}_*_desc-scaled_bold",sess,run),
            ));
        }
    }
    e.push(ExpectedDerivative::new("scaled_resting","afni","task-rest_*_desc-scaled_bold"));
    e.push(ExpectedDerivative::new("decon_ses-S1_1","afni","decon_task-study_UniqueBehs_stats_REML+tlrc.HEAD"));
    e.push(ExpectedDerivative::new("decon_ses-S2_1","afni","decon_task-test_UniqueBehs_stats_REML+tlrc.HEAD"));
    e.push(ExpectedDerivative::new("decon_resting","afni","X.decon_task-rest.xmat.1D"));
    e.push(ExpectedDerivative::new("ashs_L","ashs","left_lfseg_corr_usegray"));
    e.push(ExpectedDerivative::new("ashs_R","ashs","right_lfseg_corr_usegray"));
    e.push(ExpectedDerivative::new("reface","reface","desc-reface"));
    e
}
