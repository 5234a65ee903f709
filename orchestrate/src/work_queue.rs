use std::collections::HashSet;
use stages::Stage;
use tracing::debug;

/// Units of work for one stage, sorted into what can be submitted and why the
/// rest can't.
#[derive(Clone,Debug,Default,PartialEq)]
pub struct WorkQueue {
    pub queued:Vec<String>,
    pub not_ready:Vec<String>,
    pub complete:Vec<String>,
    pub active:Vec<String>,
}

impl WorkQueue {
    /// Units whose inputs are present and outputs missing, minus those with a live
    /// manager. Subject order is kept.
    pub fn build(stage:&dyn Stage,subjects:&[String],active:&HashSet<String>) -> Self {
        let mut q = WorkQueue::default();
        for unit in stage.units(subjects) {
            if active.contains(&unit) {
                q.active.push(unit);
            }else if !stage.is_needed(&unit) {
                q.complete.push(unit);
            }else if !stage.is_ready(&unit) {
                debug!("{} is missing inputs for {}",unit,stage.label());
                q.not_ready.push(unit);
            }else {
                q.queued.push(unit);
            }
        }
        q
    }

    /// first `batch` queued units
    pub fn take(&self,batch:usize) -> Vec<String> {
        self.queued.iter().take(batch).cloned().collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} queued, {} waiting on inputs, {} complete, {} already running",
            self.queued.len(),self.not_ready.len(),self.complete.len(),self.active.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use stages::{Artifact, Resources, StageError, StageKind, Step};

    /// inputs present for every subject but sub-3, outputs present for sub-2
    struct Fake {
        root:PathBuf,
    }

    impl Stage for Fake {
        fn kind(&self) -> StageKind { StageKind::Reface }
        fn label(&self) -> String { String::from("fake") }
        fn inputs(&self,subj:&str) -> Vec<Artifact> {
            vec![Artifact::new("in",&self.root.join("in"),&format!("{}.txt",subj))]
        }
        fn outputs(&self,subj:&str) -> Vec<Artifact> {
            vec![Artifact::new("out",&self.root.join("out"),&format!("{}.txt",subj))]
        }
        fn plan(&self,_subj:&str) -> Result<Vec<Step>,StageError> { Ok(vec![]) }
        fn driver_resources(&self) -> Resources { Resources::default() }
    }

    #[test]
    fn sorts_subjects(){
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("in")).unwrap();
        std::fs::create_dir_all(tmp.path().join("out")).unwrap();
        for s in ["sub-1","sub-2","sub-4","sub-5"] {
            std::fs::File::create(tmp.path().join("in").join(format!("{}.txt",s))).unwrap();
        }
        std::fs::File::create(tmp.path().join("out/sub-2.txt")).unwrap();
        let subjects:Vec<String> = (1..=5).map(|i| format!("sub-{}",i)).collect();
        let active:HashSet<String> = [String::from("sub-4")].into_iter().collect();

        let q = WorkQueue::build(&Fake{root:tmp.path().to_owned()},&subjects,&active);
        assert_eq!(q.queued,vec!["sub-1","sub-5"]);
        assert_eq!(q.complete,vec!["sub-2"]);
        assert_eq!(q.not_ready,vec!["sub-3"]);
        assert_eq!(q.active,vec!["sub-4"]);
        assert_eq!(q.take(1),vec!["sub-1"]);
        assert_eq!(q.take(10).len(),2);
    }
}
