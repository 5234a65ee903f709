use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use crate::StageError;
use crate::{motion, timing};

/// Work done in-process by the subject manager rather than by an external tool.
#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum InternalTask {
    MotionFiles{task:String,out_dir:PathBuf,confounds:Vec<PathBuf>},
    TimingFiles{prefix:String,out_dir:PathBuf,events:Vec<PathBuf>,behaviors:Vec<String>},
    RemoveMatching{dir:PathBuf,patterns:Vec<String>},
    RemoveDir{dir:PathBuf},
    TaskEtacScript{
        beh_a:String,
        beh_b:String,
        mask:PathBuf,
        prefix:String,
        etac_blur:String,
        script:PathBuf,
        modules:Vec<String>,
        subjects:Vec<String>,
        decon_files:Vec<PathBuf>,
    },
}

impl InternalTask {
    pub fn run(&self) -> Result<(),StageError> {
        match self {
            InternalTask::MotionFiles{task,out_dir,confounds} => {
                let summary = motion::write_motion_files(confounds,out_dir,task)?;
                info!("{} of {} volumes kept for {}",summary.included_volumes,summary.total_volumes,task);
            }
            InternalTask::TimingFiles{prefix,out_dir,events,behaviors} => {
                let files = timing::write_timing_files(events,behaviors,out_dir,prefix)?;
                info!("wrote {} timing files to {:?}",files.len(),out_dir);
            }
            InternalTask::RemoveMatching{dir,patterns} => remove_matching(dir,patterns)?,
            InternalTask::RemoveDir{dir} => {
                if dir.exists() {
                    info!("removing {:?}",dir);
                    std::fs::remove_dir_all(dir).map_err(StageError::io(dir))?;
                }
            }
            InternalTask::TaskEtacScript{beh_a,beh_b,mask,prefix,etac_blur,script,modules,subjects,decon_files} => {
                let (set_a,set_b) = paired_sets(modules,beh_a,beh_b,subjects,decon_files)?;
                let cmd = crate::group::etac_command(mask,prefix,etac_blur,&[
                    (beh_a.as_str(),set_a),
                    (beh_b.as_str(),set_b),
                ]);
                if let Some(parent) = script.parent() {
                    std::fs::create_dir_all(parent).map_err(StageError::io(parent))?;
                }
                std::fs::write(script,cmd).map_err(StageError::io(script))?;
                info!("wrote {:?}",script);
            }
        }
        Ok(())
    }
}

/// delete every file below `dir` whose name matches one of the glob patterns
pub fn remove_matching(dir:&Path,patterns:&[String]) -> Result<(),StageError> {
    for pattern in patterns {
        for f in utils::find_recursive(dir,pattern) {
            let r = match f.is_dir() {
                true => std::fs::remove_dir_all(&f),
                false => std::fs::remove_file(&f),
            };
            if let Err(e) = r {
                warn!("unable to remove {:?}: {}",f,e);
            }
        }
    }
    Ok(())
}

fn label_index(modules:&[String],beh:&str,decon:&Path) -> Result<Option<String>,StageError> {
    let r = slurm::run_local(modules,&format!("3dinfo -label2index '{}#0_Coef' {}",beh,decon.display()))?;
    let idx = r.stdout.trim().to_string();
    match idx.is_empty() || !r.success {
        true => Ok(None),
        false => Ok(Some(idx)),
    }
}

/// subjects whose decon output carries both behaviors, as 3dttest++ set arguments
fn paired_sets(modules:&[String],beh_a:&str,beh_b:&str,subjects:&[String],decon_files:&[PathBuf]) -> Result<(Vec<String>,Vec<String>),StageError> {
    let mut set_a = Vec::<String>::new();
    let mut set_b = Vec::<String>::new();
    let mut n = 0;
    for (subj,decon) in subjects.iter().zip(decon_files) {
        let a = label_index(modules,beh_a,decon)?;
        let b = label_index(modules,beh_b,decon)?;
        if let (Some(a),Some(b)) = (a,b) {
            info!("adding {} to ETAC sets",subj);
            set_a.push(format!("{} {}'[{}]'",subj,decon.display(),a));
            set_b.push(format!("{} {}'[{}]'",subj,decon.display(),b));
            n += 1;
        }
    }
    if n < 2 {
        return Err(StageError::InsufficientSubjects{needed:2,found:n})
    }
    Ok((set_a,set_b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, File};

    #[test]
    fn removes_temporaries_only(){
        let tmp = tempfile::tempdir().unwrap();
        let func = tmp.path().join("func");
        create_dir_all(&func).unwrap();
        File::create(func.join("tmp_tstat.nii.gz")).unwrap();
        File::create(func.join("sub-1_desc-scaled_bold.nii.gz")).unwrap();
        InternalTask::RemoveMatching{dir:tmp.path().to_owned(),patterns:vec![String::from("tmp*")]}.run().unwrap();
        assert!(!func.join("tmp_tstat.nii.gz").exists());
        assert!(func.join("sub-1_desc-scaled_bold.nii.gz").exists());

        InternalTask::RemoveDir{dir:func.clone()}.run().unwrap();
        assert!(!func.exists());
        // already gone
        InternalTask::RemoveDir{dir:func}.run().unwrap();
    }
}
