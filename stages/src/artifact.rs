use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};

/// A file a stage consumes or produces, found by a recursive glob under `root`.
#[derive(Clone,Debug,PartialEq,Eq,Serialize,Deserialize)]
pub struct Artifact {
    pub key:String,
    pub root:PathBuf,
    pub pattern:String,
    pub log_column:Option<String>,
}

impl Artifact {
    pub fn new(key:&str,root:&Path,pattern:&str) -> Self {
        Self {
            key:key.to_string(),
            root:root.to_owned(),
            pattern:pattern.to_string(),
            log_column:None,
        }
    }

    pub fn logged_as(mut self,column:&str) -> Self {
        self.log_column = Some(column.to_string());
        self
    }

    pub fn find(&self) -> Vec<PathBuf> {
        utils::find_recursive(&self.root,&self.pattern)
    }

    pub fn is_present(&self) -> bool {
        !self.find().is_empty()
    }
}

pub fn all_present(artifacts:&[Artifact]) -> bool {
    artifacts.iter().all(|a| a.is_present())
}

pub fn missing(artifacts:&[Artifact]) -> Vec<&Artifact> {
    artifacts.iter().filter(|a| !a.is_present()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, File};

    #[test]
    fn presence_follows_the_filesystem(){
        let tmp = tempfile::tempdir().unwrap();
        let func = tmp.path().join("sub-4001/ses-S1/func");
        create_dir_all(&func).unwrap();
        let a = Artifact::new("scaled",&tmp.path().join("sub-4001"),"*run-1*desc-scaled_bold*").logged_as("scaled_ses-S1_1");
        assert!(!a.is_present());
        File::create(func.join("sub-4001_ses-S1_task-study_run-1_desc-scaled_bold.nii.gz")).unwrap();
        assert!(a.is_present());
        assert_eq!(a.log_column.as_deref(),Some("scaled_ses-S1_1"));
        let b = Artifact::new("decon",&tmp.path().join("sub-4001"),"*REML+tlrc.HEAD");
        assert_eq!(missing(&[a.clone(),b.clone()]),vec![&b]);
        assert!(!all_present(&[a,b]));
    }
}
