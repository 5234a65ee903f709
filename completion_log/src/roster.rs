use std::collections::HashSet;
use std::path::Path;
use tracing::info;
use crate::LogError;

/// Consented participants. Read from a csv with at least `redcap_id` and `exclude`
/// columns; any non-empty `exclude` marks the participant as excluded.
#[derive(Clone,Debug,Default)]
pub struct Roster {
    consented:HashSet<String>,
    excluded:HashSet<String>,
}

fn bids_subject(id:&str) -> String {
    format!("sub-{}",utils::subject_number(id.trim()))
}

impl Roster {
    pub fn from_file(path:&Path) -> Result<Self,LogError> {
        let mut rdr = csv::Reader::from_path(path).map_err(LogError::csv(path))?;
        let header = rdr.headers().map_err(LogError::csv(path))?.clone();
        let id_col = header.iter().position(|h| h == "redcap_id").ok_or_else(|| LogError::MissingRosterId(path.to_owned()))?;
        let ex_col = header.iter().position(|h| h == "exclude");
        let mut roster = Roster::default();
        for record in rdr.records() {
            let record = record.map_err(LogError::csv(path))?;
            let id = match record.get(id_col) {
                Some(id) if !id.trim().is_empty() => bids_subject(id),
                _ => continue
            };
            let excluded = ex_col.and_then(|c| record.get(c)).map(|v| {
                let v = v.trim();
                !v.is_empty() && v != "nan"
            }).unwrap_or(false);
            if excluded {
                roster.excluded.insert(id.clone());
            }
            roster.consented.insert(id);
        }
        info!("roster {:?}: {} consented, {} excluded",path,roster.consented.len(),roster.excluded.len());
        Ok(roster)
    }

    pub fn allows(&self,subj:&str) -> bool {
        self.consented.contains(subj) && !self.excluded.contains(subj)
    }

    /// subjects that are both in the dataset and allowed by the roster, in the given order
    pub fn filter(&self,subjects:&[String]) -> Vec<String> {
        subjects.iter().filter(|s| self.allows(s)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_consented_and_not_excluded(){
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("guid_list.csv");
        std::fs::write(&path,"guid,redcap_id,exclude,comments\nA,4001,,\nB,4002,1,withdrew\nC,4003,,\n").unwrap();
        let roster = Roster::from_file(&path).unwrap();
        let dset:Vec<String> = ["sub-4001","sub-4002","sub-4004"].iter().map(|s| s.to_string()).collect();
        assert_eq!(roster.filter(&dset),vec!["sub-4001"]);
    }

    #[test]
    fn needs_id_column(){
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("guid_list.csv");
        std::fs::write(&path,"guid,exclude\nA,\n").unwrap();
        assert!(matches!(Roster::from_file(&path),Err(LogError::MissingRosterId(_))));
    }
}
