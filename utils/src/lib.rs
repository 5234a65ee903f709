use std::path::{Path, PathBuf};
use std::fs::File;
use std::io::{self, Write, Read};
use std::time::SystemTime;
use chrono::{DateTime, Local};
use glob::{glob, Pattern};
use regex::Regex;
use walkdir::WalkDir;

pub const LOG_TIME_FORMAT:&str = "%Y-%m-%d %H:%M:%S";

pub fn read_to_string(filepath:&Path,extension:&str) -> io::Result<String> {
    let p = filepath.with_extension(extension);
    let mut f = File::open(&p)?;
    let mut s = String::new();
    f.read_to_string(&mut s)?;
    Ok(s)
}

pub fn write_to_file(filepath:&Path,extension:&str,string:&str) -> io::Result<()> {
    let p = filepath.with_extension(extension);
    let mut f = File::create(p)?;
    f.write_all(string.as_bytes())
}

fn glob_paths(pattern:&str) -> Vec<PathBuf> {
    match glob(pattern) {
        Ok(paths) => paths.flatten().collect(),
        Err(_) => Vec::new()
    }
}

fn escaped(dir:&Path) -> String {
    Pattern::escape(&dir.to_string_lossy())
}

/// every path under `base_dir` (at any depth) matching `pattern`, sorted.
/// The base directory is escaped so bracketed project paths are taken literally.
pub fn find_recursive(base_dir:&Path,pattern:&str) -> Vec<PathBuf> {
    let pat = format!("{}/**/{}",escaped(base_dir),pattern);
    let mut matches = glob_paths(&pat);
    matches.sort();
    matches.dedup();
    matches
}

// recursive walk
pub fn find_files(base_dir:&Path,extension:&str) -> Option<Vec<PathBuf>>  {
    let mut files = Vec::<PathBuf>::new();
    for entry in WalkDir::new(base_dir).into_iter().filter_map(|e| e.ok()) {
        if let Some(ext) = entry.path().extension() {
            if ext.to_string_lossy() == extension {
                files.push(entry.path().to_owned());
            }
        }
    }
    match files.len(){
        0 => None,
        _=> Some(files)
    }
}

/// sub-1234 -> 1234
pub fn subject_number(subject:&str) -> &str {
    match subject.rsplit_once('-') {
        Some((_,num)) => num,
        None => subject
    }
}

/// names of all sub-* directories in a BIDS dataset directory, sorted
pub fn list_subjects(dset_dir:&Path) -> io::Result<Vec<String>> {
    let mut subjects = Vec::<String>::new();
    for entry in std::fs::read_dir(dset_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("sub-") {
            subjects.push(name);
        }
    }
    subjects.sort();
    Ok(subjects)
}

/// value of a BIDS key-value entity in a file name, e.g. run-2 -> "2"
pub fn bids_entity(file_name:&str,key:&str) -> Option<String> {
    let re = Regex::new(&format!(r"(?:^|[_/]){}-([A-Za-z0-9]+)",regex::escape(key))).ok()?;
    re.captures(file_name).map(|c| c[1].to_string())
}

pub fn file_name(path:&Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
}

/// name for a directory of slurm output, e.g. afni_24-03-01_13:05
pub fn timestamped_name(prefix:&str,now:&DateTime<Local>) -> String {
    format!("{}_{}",prefix,now.format("%y-%m-%d_%H:%M"))
}

pub fn format_time(time:SystemTime) -> String {
    let t:DateTime<Local> = time.into();
    t.format(LOG_TIME_FORMAT).to_string()
}

pub fn modified_timestamp(path:&Path) -> io::Result<String> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(format_time(modified))
}

pub fn vec_to_string<T>(vec:&[T]) -> String
    where T:std::string::ToString {
    let vstr:Vec<String> = vec.iter().map(|num| num.to_string()).collect();
    vstr.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::create_dir_all;

    #[test]
    fn subject_numbers(){
        assert_eq!(subject_number("sub-4001"),"4001");
        assert_eq!(subject_number("4001"),"4001");
    }

    #[test]
    fn entities(){
        let f = "sub-4001_ses-S1_task-study_run-2_space-MNI_desc-preproc_bold.nii.gz";
        assert_eq!(bids_entity(f,"run"),Some(String::from("2")));
        assert_eq!(bids_entity(f,"ses"),Some(String::from("S1")));
        assert_eq!(bids_entity(f,"acq"),None);
    }

    #[test]
    fn recursive_search(){
        let tmp = tempfile::tempdir().unwrap();
        let deep = tmp.path().join("sub-01/ses-A/anat");
        create_dir_all(&deep).unwrap();
        File::create(deep.join("sub-01_ses-A_T1w.nii.gz")).unwrap();
        File::create(tmp.path().join("sub-01").join("notes.txt")).unwrap();
        let found = find_recursive(&tmp.path().join("sub-01"),"*T1w.nii*");
        assert_eq!(found.len(),1);
        assert!(find_recursive(&tmp.path().join("sub-02"),"*T1w.nii*").is_empty());
        // the base directory itself is searched too
        assert_eq!(find_recursive(&tmp.path().join("sub-01"),"*.txt").len(),1);
    }

    #[test]
    fn subjects_are_sorted_dirs(){
        let tmp = tempfile::tempdir().unwrap();
        for s in ["sub-02","sub-01","derivatives"] {
            create_dir_all(tmp.path().join(s)).unwrap();
        }
        File::create(tmp.path().join("sub-03")).unwrap();
        assert_eq!(list_subjects(tmp.path()).unwrap(),vec!["sub-01","sub-02"]);
    }

    #[test]
    fn extension_round_trip(){
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("settings");
        write_to_file(&p,"project_settings","a = 1").unwrap();
        assert!(tmp.path().join("settings.project_settings").exists());
        assert_eq!(read_to_string(&p,"project_settings").unwrap(),"a = 1");
    }
}
