use std::collections::BTreeMap;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};

#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct ModuleSettings {
    pub afni:String,
    pub c3d:String,
    pub freesurfer:String,
    pub singularity:String,
}

impl Default for ModuleSettings {
    fn default() -> Self {
        Self {
            afni:String::from("afni-20.2.06"),
            c3d:String::from("c3d-1.0.0-gcc-8.2.0"),
            freesurfer:String::from("freesurfer-7.1"),
            singularity:String::from("singularity-3.8.2"),
        }
    }
}

#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct FmriprepSettings {
    pub sing_img:PathBuf,
    pub fs_license:PathBuf,
    pub tplflow_dir:PathBuf,
    /// when set, the templateflow cache is refreshed from here before each run
    pub tplflow_source:Option<PathBuf>,
    pub tmp_dir:PathBuf,
    pub skull_strip_template:String,
    pub output_spaces:String,
}

impl Default for FmriprepSettings {
    fn default() -> Self {
        Self {
            sing_img:PathBuf::from("/home/data/madlab/singularity-images/nipreps_fmriprep_20.2.3.sif"),
            fs_license:PathBuf::from("/home/data/madlab/singularity-images/fs_license.txt"),
            tplflow_dir:PathBuf::from("/home/data/madlab/singularity-images/templateflow"),
            tplflow_source:None,
            tmp_dir:PathBuf::from("/scratch/madlab/temp"),
            skull_strip_template:String::from("MNIPediatricAsym:cohort-5"),
            output_spaces:String::from("MNIPediatricAsym:cohort-5:res-2"),
        }
    }
}

#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct AfniSettings {
    pub tplflow_str:String,
    pub do_blur:bool,
    pub blur_mult:f32,
    /// modelled event duration in seconds
    pub dur:f32,
    pub keep_intermediates:bool,
    /// directory of `<subj>_<task>_decon_plan.json` files
    pub decon_plan_dir:Option<PathBuf>,
    pub template_gm:PathBuf,
    pub seeds:BTreeMap<String,String>,
}

impl Default for AfniSettings {
    fn default() -> Self {
        let mut seeds = BTreeMap::new();
        seeds.insert(String::from("rPCC"),String::from("5 -55 25"));
        Self {
            tplflow_str:String::from("space-MNIPediatricAsym_cohort-5_res-2"),
            do_blur:false,
            blur_mult:1.5,
            dur:2.0,
            keep_intermediates:false,
            decon_plan_dir:None,
            template_gm:PathBuf::from("/home/data/madlab/atlases/templateflow/tpl-MNIPediatricAsym/cohort-5/tpl-MNIPediatricAsym_cohort-5_res-2_label-GM_probseg.nii.gz"),
            seeds,
        }
    }
}

#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct AshsSettings {
    pub sing_img:PathBuf,
    pub atlas_dir:PathBuf,
    pub atlas_str:String,
    pub t1_search:String,
    pub t2_search:String,
}

impl Default for AshsSettings {
    fn default() -> Self {
        Self {
            sing_img:PathBuf::from("/home/data/madlab/singularity-images/ashs_latest.simg"),
            atlas_dir:PathBuf::from("/home/data/madlab/atlases"),
            atlas_str:String::from("ashs_atlas_magdeburg"),
            t1_search:String::from("T1w"),
            t2_search:String::from("PD"),
        }
    }
}

/// Everything a stage needs to lay out its plan.
#[derive(Clone,Debug,PartialEq,Serialize,Deserialize)]
pub struct StageSettings {
    pub proj_dir:PathBuf,
    pub scratch_dir:PathBuf,
    pub modules:ModuleSettings,
    pub fmriprep:FmriprepSettings,
    pub afni:AfniSettings,
    pub ashs:AshsSettings,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            proj_dir:PathBuf::from("/home/data/madlab/McMakin_EMUR01"),
            scratch_dir:PathBuf::from("/scratch/madlab/McMakin_EMUR01"),
            modules:ModuleSettings::default(),
            fmriprep:FmriprepSettings::default(),
            afni:AfniSettings::default(),
            ashs:AshsSettings::default(),
        }
    }
}

impl StageSettings {
    pub fn dset_dir(&self) -> PathBuf {
        self.proj_dir.join("dset")
    }
    pub fn deriv_dir(&self) -> PathBuf {
        self.proj_dir.join("derivatives")
    }
    pub fn scratch_dset(&self) -> PathBuf {
        self.scratch_dir.join("dset")
    }
    pub fn scratch_deriv(&self) -> PathBuf {
        self.scratch_dir.join("derivatives")
    }
}
