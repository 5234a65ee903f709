use std::path::{Path, PathBuf};
use std::process::Command;
use chrono::Local;
use tracing::{debug, info};
use crate::LogError;

/// The git checkout that carries the completion log. Shells out to `git`.
#[derive(Clone,Debug)]
pub struct GitSync {
    pub repo_dir:PathBuf,
    pub remote:Option<String>,
}

impl GitSync {
    pub fn new(repo_dir:&Path,remote:Option<&str>) -> Self {
        Self {
            repo_dir:repo_dir.to_owned(),
            remote:remote.map(|r| r.to_string()),
        }
    }

    fn git(&self,dir:&Path,args:&[&str]) -> Result<String,LogError> {
        debug!("git {} in {:?}",args.join(" "),dir);
        let o = Command::new("git").current_dir(dir).args(args).output().map_err(LogError::io(dir))?;
        match o.status.success() {
            true => Ok(String::from_utf8_lossy(&o.stdout).to_string()),
            false => Err(LogError::Git{
                args:args.join(" "),
                dir:dir.to_owned(),
                stderr:String::from_utf8_lossy(&o.stderr).trim().to_string(),
            })
        }
    }

    /// clone the tracking repo if it isn't there yet, otherwise pull
    pub fn update(&self) -> Result<(),LogError> {
        match (self.repo_dir.join(".git").exists(),&self.remote) {
            (true,Some(_)) => {
                info!("updating repo {:?}",self.repo_dir);
                self.git(&self.repo_dir,&["pull"])?;
            }
            (true,None) => {}
            (false,Some(remote)) => {
                info!("cloning repo to {:?}",self.repo_dir);
                let parent = self.repo_dir.parent().unwrap_or(Path::new("."));
                std::fs::create_dir_all(parent).map_err(LogError::io(parent))?;
                let dest = self.repo_dir.to_string_lossy().to_string();
                self.git(parent,&["clone",remote,&dest])?;
            }
            (false,None) => {
                info!("initializing repo {:?}",self.repo_dir);
                std::fs::create_dir_all(&self.repo_dir).map_err(LogError::io(&self.repo_dir))?;
                self.git(&self.repo_dir,&["init"])?;
            }
        }
        Ok(())
    }

    pub fn commit_message() -> String {
        format!("Updated completed_preprocess.tsv at {}",Local::now().format(utils::LOG_TIME_FORMAT))
    }

    /// add, commit and (with a remote) push the log file
    pub fn publish(&self,log_file:&Path) -> Result<(),LogError> {
        let rel = log_file.strip_prefix(&self.repo_dir).unwrap_or(log_file).to_string_lossy().to_string();
        self.git(&self.repo_dir,&["add",&rel])?;
        let staged = self.git(&self.repo_dir,&["status","--porcelain","--",&rel])?;
        if staged.trim().is_empty() {
            info!("{} unchanged, nothing to commit",rel);
            return Ok(())
        }
        self.git(&self.repo_dir,&["commit","-m",&Self::commit_message()])?;
        if self.remote.is_some() {
            info!("pushing updates ...");
            self.git(&self.repo_dir,&["push"])?;
        }
        Ok(())
    }
}
