use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};
use crate::{ExpectedDerivative, LogError};

pub const SUBJECT_COLUMN:&str = "subjID";
pub const LOG_FILE_NAME:&str = "completed_preprocessing.tsv";

/// Tab separated table of which subjects have which derivatives. The first column is
/// `subjID`; every other cell is either empty (missing) or the mtime of the file found.
#[derive(Clone,Debug,PartialEq)]
pub struct CompletionLog {
    columns:Vec<String>,
    rows:BTreeMap<String,BTreeMap<String,String>>,
}

impl CompletionLog {

    pub fn new(columns:&[String],subjects:&[String]) -> Self {
        let mut log = Self {
            columns:Vec::new(),
            rows:BTreeMap::new(),
        };
        log.ensure_columns(columns);
        subjects.iter().for_each(|s| log.ensure_subject(s));
        log
    }

    pub fn read(path:&Path) -> Result<Self,LogError> {
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_path(path)
            .map_err(LogError::csv(path))?;
        let header:Vec<String> = rdr.headers().map_err(LogError::csv(path))?.iter().map(|h| h.to_string()).collect();
        match header.first() {
            Some(first) if first == SUBJECT_COLUMN => {},
            _ => return Err(LogError::MissingSubjectColumn(path.to_owned()))
        }
        let columns = header[1..].to_vec();
        let mut rows = BTreeMap::<String,BTreeMap<String,String>>::new();
        for record in rdr.records() {
            let record = record.map_err(LogError::csv(path))?;
            let subj = match record.get(0) {
                Some(s) if !s.trim().is_empty() => s.trim().to_string(),
                _ => continue
            };
            let mut cells = BTreeMap::new();
            for (col,val) in columns.iter().zip(record.iter().skip(1)) {
                let val = val.trim();
                // pandas writes missing cells as empty or nan
                if !val.is_empty() && val != "nan" {
                    cells.insert(col.clone(),val.to_string());
                }
            }
            rows.insert(subj,cells);
        }
        debug!("read {} subjects from {:?}",rows.len(),path);
        Ok(Self{columns,rows})
    }

    pub fn write(&self,path:&Path) -> Result<(),LogError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(LogError::io(parent))?;
        }
        let mut wtr = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .from_path(path)
            .map_err(LogError::csv(path))?;
        let mut header = vec![SUBJECT_COLUMN.to_string()];
        header.extend(self.columns.iter().cloned());
        wtr.write_record(&header).map_err(LogError::csv(path))?;
        for (subj,cells) in &self.rows {
            let mut record = vec![subj.clone()];
            record.extend(self.columns.iter().map(|c| cells.get(c).cloned().unwrap_or_default()));
            wtr.write_record(&record).map_err(LogError::csv(path))?;
        }
        wtr.flush().map_err(LogError::io(path))?;
        info!("wrote {} subjects to {:?}",self.rows.len(),path);
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// subjects in sorted order
    pub fn subjects(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }

    pub fn ensure_subject(&mut self,subj:&str) {
        self.rows.entry(subj.to_string()).or_default();
    }

    /// append any columns not already present, keeping the existing order
    pub fn ensure_columns(&mut self,columns:&[String]) {
        for c in columns {
            if c != SUBJECT_COLUMN && !self.columns.contains(c) {
                self.columns.push(c.clone());
            }
        }
    }

    pub fn get(&self,subj:&str,column:&str) -> Option<&str> {
        self.rows.get(subj)?.get(column).map(|s| s.as_str())
    }

    pub fn is_missing(&self,subj:&str,column:&str) -> bool {
        self.get(subj,column).is_none()
    }

    pub fn set(&mut self,subj:&str,column:&str,value:&str) -> Result<(),LogError> {
        if !self.columns.iter().any(|c| c == column) {
            return Err(LogError::UnknownColumn(column.to_string()))
        }
        let row = self.rows.get_mut(subj).ok_or_else(|| LogError::UnknownSubject(subj.to_string()))?;
        match value.is_empty() {
            true => row.remove(column),
            false => row.insert(column.to_string(),value.to_string()),
        };
        Ok(())
    }

    /// Fill empty cells for `subj` from the derivatives directory. Cells that already hold
    /// a timestamp are left alone. Returns the columns filled by this call.
    pub fn check_subject(&mut self,deriv_root:&Path,subj:&str,expected:&[ExpectedDerivative]) -> Vec<String> {
        self.ensure_subject(subj);
        self.ensure_columns(&expected.iter().map(|e| e.column.clone()).collect::<Vec<String>>());
        let mut filled = Vec::<String>::new();
        for e in expected {
            if !self.is_missing(subj,&e.column) {
                continue
            }
            let stamp = e.find(deriv_root,subj).and_then(|f| utils::modified_timestamp(&f).ok());
            if let Some(stamp) = stamp {
                debug!(subj, column = %e.column, "found {}",stamp);
                if let Some(row) = self.rows.get_mut(subj) {
                    row.insert(e.column.clone(),stamp);
                }
                filled.push(e.column.clone());
            }
        }
        filled
    }

    pub fn missing_columns(&self,subj:&str) -> Vec<String> {
        self.columns.iter().filter(|c| self.is_missing(subj,c)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{create_dir_all, File};

    fn cols(c:&[&str]) -> Vec<String> {
        c.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rows_are_written_sorted(){
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join(LOG_FILE_NAME);
        let mut log = CompletionLog::new(&cols(&["reface","ashs_L"]),&cols(&["sub-4010","sub-4001"]));
        log.set("sub-4010","reface","2021-06-01 10:00:00").unwrap();
        log.write(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text,"subjID\treface\tashs_L\nsub-4001\t\t\nsub-4010\t2021-06-01 10:00:00\t\n");
        let back = CompletionLog::read(&path).unwrap();
        assert_eq!(back,log);
    }

    #[test]
    fn rejects_table_without_subject_column(){
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.tsv");
        std::fs::write(&path,"subject\treface\nsub-1\t\n").unwrap();
        assert!(matches!(CompletionLog::read(&path),Err(LogError::MissingSubjectColumn(_))));
    }

    #[test]
    fn nan_cells_read_as_missing(){
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("log.tsv");
        std::fs::write(&path,"subjID\treface\nsub-1\tnan\n").unwrap();
        let log = CompletionLog::read(&path).unwrap();
        assert!(log.is_missing("sub-1","reface"));
    }

    #[test]
    fn check_fills_only_empty_cells(){
        let tmp = tempfile::tempdir().unwrap();
        let deriv = tmp.path().join("derivatives");
        let anat = deriv.join("reface/sub-4001/ses-S1/anat");
        create_dir_all(&anat).unwrap();
        File::create(anat.join("sub-4001_ses-S1_desc-reface_T1w.nii.gz")).unwrap();

        let expected = vec![
            ExpectedDerivative::new("reface","reface","desc-reface"),
            ExpectedDerivative::new("ashs_L","ashs","left_lfseg_corr_usegray"),
        ];
        let mut log = CompletionLog::new(&[],&[]);
        let filled = log.check_subject(&deriv,"sub-4001",&expected);
        assert_eq!(filled,vec!["reface"]);
        assert_eq!(log.missing_columns("sub-4001"),vec!["ashs_L"]);

        log.set("sub-4001","reface","2020-01-01 00:00:00").unwrap();
        assert!(log.check_subject(&deriv,"sub-4001",&expected).is_empty());
        assert_eq!(log.get("sub-4001","reface"),Some("2020-01-01 00:00:00"));
    }

    #[test]
    fn set_validates_names(){
        let mut log = CompletionLog::new(&cols(&["reface"]),&cols(&["sub-1"]));
        assert!(matches!(log.set("sub-1","nope","x"),Err(LogError::UnknownColumn(_))));
        assert!(matches!(log.set("sub-2","reface","x"),Err(LogError::UnknownSubject(_))));
    }
}
