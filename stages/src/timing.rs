//! AFNI onset timing files from BIDS events tables.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use crate::StageError;

pub const DEFAULT_DECON:&str = "UniqueBehs";

/// decon title -> behavior -> timing file
pub type DeconPlan = BTreeMap<String,BTreeMap<String,PathBuf>>;

struct Event {
    onset:String,
    trial_type:String,
}

fn read_events(path:&Path) -> Result<Vec<Event>,StageError> {
    let mut rdr = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path).map_err(StageError::table(path))?;
    let headers = rdr.headers().map_err(StageError::table(path))?.clone();
    let col = |name:&str| headers.iter().position(|h| h == name).ok_or_else(|| StageError::MissingColumn{path:path.to_owned(),column:name.to_string()});
    let onset = col("onset")?;
    let trial_type = col("trial_type")?;
    let mut events = Vec::new();
    for record in rdr.records() {
        let record = record.map_err(StageError::table(path))?;
        let t = record.get(trial_type).unwrap_or("").trim();
        if t.is_empty() || t == "n/a" {
            continue
        }
        let o = record.get(onset).unwrap_or("").trim();
        o.parse::<f64>().map_err(|_| StageError::BadValue{path:path.to_owned(),value:o.to_string()})?;
        events.push(Event{onset:o.to_string(),trial_type:t.to_string()});
    }
    Ok(events)
}

/// every trial_type across the runs, sorted
pub fn unique_behaviors(events:&[PathBuf]) -> Result<Vec<String>,StageError> {
    let mut behs = BTreeSet::<String>::new();
    for e in events {
        behs.extend(read_events(e)?.into_iter().map(|ev| ev.trial_type));
    }
    Ok(behs.into_iter().collect())
}

pub fn timing_file(out_dir:&Path,prefix:&str,beh:&str) -> PathBuf {
    out_dir.join(format!("{}_{}.txt",prefix,beh))
}

/// One line per run, onsets separated by spaces, `*` for a run without the behavior.
pub fn write_timing_files(events:&[PathBuf],behaviors:&[String],out_dir:&Path,prefix:&str) -> Result<BTreeMap<String,PathBuf>,StageError> {
    std::fs::create_dir_all(out_dir).map_err(StageError::io(out_dir))?;
    let runs = events.iter().map(|e| read_events(e)).collect::<Result<Vec<_>,_>>()?;
    let mut files = BTreeMap::new();
    for beh in behaviors {
        let lines:Vec<String> = runs.iter().map(|run| {
            let onsets:Vec<&str> = run.iter().filter(|ev| &ev.trial_type == beh).map(|ev| ev.onset.as_str()).collect();
            match onsets.is_empty() {
                true => String::from("*"),
                false => onsets.join(" "),
            }
        }).collect();
        let p = timing_file(out_dir,prefix,beh);
        std::fs::write(&p,lines.join("\n") + "\n").map_err(StageError::io(&p))?;
        files.insert(beh.clone(),p);
    }
    Ok(files)
}

/// the plan used when a subject has no plan file: every behavior in one model
pub fn default_plan(behaviors:&[String],out_dir:&Path,prefix:&str) -> DeconPlan {
    let tf = behaviors.iter().map(|b| (b.clone(),timing_file(out_dir,prefix,b))).collect();
    let mut plan = DeconPlan::new();
    plan.insert(DEFAULT_DECON.to_string(),tf);
    plan
}

pub fn read_decon_plan(path:&Path) -> Result<DeconPlan,StageError> {
    let text = std::fs::read_to_string(path).map_err(StageError::io(path))?;
    serde_json::from_str(&text).map_err(StageError::json(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_line_per_run(){
        let tmp = tempfile::tempdir().unwrap();
        let r1 = tmp.path().join("sub-1_ses-S1_task-study_run-1_events.tsv");
        let r2 = tmp.path().join("sub-1_ses-S1_task-study_run-2_events.tsv");
        std::fs::write(&r1,"onset\tduration\ttrial_type\n4.5\t2\tneg\n10\t2\tneu\n16.25\t2\tneg\n20\t1\tn/a\n").unwrap();
        std::fs::write(&r2,"onset\tduration\ttrial_type\n3\t2\tneu\n").unwrap();
        let events = vec![r1,r2];
        let behs = unique_behaviors(&events).unwrap();
        assert_eq!(behs,vec!["neg","neu"]);
        let out = tmp.path().join("timing_files");
        let files = write_timing_files(&events,&behs,&out,"tf_task-study").unwrap();
        assert_eq!(std::fs::read_to_string(&files["neg"]).unwrap(),"4.5 16.25\n*\n");
        assert_eq!(std::fs::read_to_string(&files["neu"]).unwrap(),"10\n3\n");
        let plan = default_plan(&behs,&out,"tf_task-study");
        assert_eq!(plan[DEFAULT_DECON]["neg"],files["neg"]);
    }

    #[test]
    fn plan_json(){
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("plan.json");
        std::fs::write(&p,r#"{"NegNeu": {"negTH": "/tf/neg_hit.txt", "neuTH": "/tf/neu_hit.txt"}}"#).unwrap();
        let plan = read_decon_plan(&p).unwrap();
        assert_eq!(plan["NegNeu"].len(),2);
        assert_eq!(plan["NegNeu"]["negTH"],PathBuf::from("/tf/neg_hit.txt"));
    }
}
