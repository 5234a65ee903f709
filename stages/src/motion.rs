//! Motion regressors and censor vectors from fMRIprep confound tables.
//!
//! Runs are concatenated into one file per regressor set instead of zero padding each
//! run. Files are written as headerless, tab separated 1D text since AFNI treats a tsv
//! as having a header.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::debug;
use crate::StageError;

pub const MEAN_COLUMNS:[&str;6] = ["trans_x","trans_y","trans_z","rot_x","rot_y","rot_z"];
pub const DERIV_COLUMNS:[&str;6] = [
    "trans_x_derivative1",
    "trans_y_derivative1",
    "trans_z_derivative1",
    "rot_x_derivative1",
    "rot_y_derivative1",
    "rot_z_derivative1",
];

#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct CensorSummary {
    pub total_volumes:usize,
    pub included_volumes:usize,
    pub proportion_excluded:f64,
}

impl CensorSummary {
    pub fn new(censor:&[u8]) -> Self {
        let total = censor.len();
        let included = censor.iter().filter(|c| **c == 1).count();
        let prop = match total {
            0 => 0.0,
            _ => round(1.0 - included as f64 / total as f64,3),
        };
        Self{total_volumes:total,included_volumes:included,proportion_excluded:prop}
    }
}

#[derive(Clone,Debug,PartialEq)]
pub struct MotionFileNames {
    pub mean:PathBuf,
    pub deriv:PathBuf,
    pub censor:PathBuf,
    pub censor_inv:PathBuf,
    pub info:PathBuf,
}

fn round(x:f64,places:i32) -> f64 {
    let m = 10f64.powi(places);
    (x*m).round()/m
}

/// Output names follow the first run's confound file with the run entity dropped,
/// e.g. `sub-1_task-study_desc-censor_timeseries.1D`.
pub fn motion_file_names(first_confounds:&Path,out_dir:&Path,task:&str) -> MotionFileNames {
    let base = utils::file_name(first_confounds).replace("run-1_","");
    let named = |kind:&str| out_dir.join(base.replace("confounds",kind).replace(".tsv",".1D"));
    MotionFileNames {
        mean:named("mean"),
        deriv:named("deriv"),
        censor:named("censor"),
        censor_inv:named("censorInv"),
        info:out_dir.join(format!("info_{}_censored_volumes.json",task)),
    }
}

struct RunMotion {
    mean:Vec<[f64;6]>,
    deriv:Vec<[f64;6]>,
    censor:Vec<u8>,
}

fn parse(path:&Path,v:&str) -> Result<f64,StageError> {
    let v = v.trim();
    match v {
        "" | "n/a" | "nan" | "NaN" => Ok(f64::NAN),
        _ => v.parse::<f64>().map_err(|_| StageError::BadValue{path:path.to_owned(),value:v.to_string()})
    }
}

fn column(headers:&csv::StringRecord,path:&Path,name:&str) -> Result<usize,StageError> {
    headers.iter().position(|h| h == name).ok_or_else(|| StageError::MissingColumn{path:path.to_owned(),column:name.to_string()})
}

fn read_run(path:&Path) -> Result<RunMotion,StageError> {
    let mut rdr = csv::ReaderBuilder::new().delimiter(b'\t').from_path(path).map_err(StageError::table(path))?;
    let headers = rdr.headers().map_err(StageError::table(path))?.clone();
    let mean_idx = MEAN_COLUMNS.iter().map(|c| column(&headers,path,c)).collect::<Result<Vec<usize>,_>>()?;
    let deriv_idx = DERIV_COLUMNS.iter().map(|c| column(&headers,path,c)).collect::<Result<Vec<usize>,_>>()?;
    let outlier_idx:Vec<usize> = headers.iter().enumerate().filter(|(_,h)| h.contains("motion_outlier")).map(|(i,_)| i).collect();

    let mut run = RunMotion{mean:Vec::new(),deriv:Vec::new(),censor:Vec::new()};
    for record in rdr.records() {
        let record = record.map_err(StageError::table(path))?;
        let mut m = [0f64;6];
        let mut d = [0f64;6];
        for k in 0..6 {
            m[k] = round(parse(path,record.get(mean_idx[k]).unwrap_or(""))?,6);
            let dv = parse(path,record.get(deriv_idx[k]).unwrap_or(""))?;
            d[k] = match dv.is_nan() {
                true => 0.0,
                false => round(dv,6),
            };
        }
        let mut outlier = false;
        for i in &outlier_idx {
            let v = parse(path,record.get(*i).unwrap_or(""))?;
            outlier |= !v.is_nan() && v != 0.0;
        }
        run.mean.push(m);
        run.deriv.push(d);
        run.censor.push(match outlier { true => 0, false => 1 });
    }
    // the volume before each outlier is censored too
    let flagged:Vec<usize> = run.censor.iter().enumerate().filter(|(_,c)| **c == 0).map(|(i,_)| i).collect();
    for i in flagged {
        if i > 0 {
            run.censor[i-1] = 0;
        }
    }
    Ok(run)
}

fn write_rows(path:&Path,rows:&[[f64;6]]) -> Result<(),StageError> {
    let text:String = rows.iter().map(|r| {
        let vals:Vec<String> = r.iter().map(|v| format!("{:.6}",v)).collect();
        vals.join("\t") + "\n"
    }).collect();
    std::fs::write(path,text).map_err(StageError::io(path))
}

fn write_vector(path:&Path,values:&[u8]) -> Result<(),StageError> {
    let text:String = values.iter().map(|v| format!("{}\n",v)).collect();
    std::fs::write(path,text).map_err(StageError::io(path))
}

/// Write mean, derivative, censor and inverted censor files plus the censor summary
/// json for every confound table of one task, runs in the order given.
pub fn write_motion_files(confounds:&[PathBuf],out_dir:&Path,task:&str) -> Result<CensorSummary,StageError> {
    let first = confounds.first().ok_or_else(|| StageError::missing(task,"confound timeseries"))?;
    let names = motion_file_names(first,out_dir,task);
    std::fs::create_dir_all(out_dir).map_err(StageError::io(out_dir))?;

    let mut mean = Vec::<[f64;6]>::new();
    let mut deriv = Vec::<[f64;6]>::new();
    let mut censor = Vec::<u8>::new();
    for c in confounds {
        debug!("reading confounds {:?}",c);
        let run = read_run(c)?;
        mean.extend(run.mean);
        deriv.extend(run.deriv);
        censor.extend(run.censor);
    }
    let inverse:Vec<u8> = censor.iter().map(|c| 1 - c).collect();

    write_rows(&names.mean,&mean)?;
    write_rows(&names.deriv,&deriv)?;
    write_vector(&names.censor,&censor)?;
    write_vector(&names.censor_inv,&inverse)?;

    let summary = CensorSummary::new(&censor);
    let json = serde_json::to_string(&summary).map_err(StageError::json(&names.info))?;
    std::fs::write(&names.info,json).map_err(StageError::io(&names.info))?;
    Ok(summary)
}
