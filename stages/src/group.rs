//! Group level ETAC tests over every subject with finished single subject output.
//! Both stages run as one unit named `group-<label>`.

use std::path::{Path, PathBuf};
use crate::afni_task::decon_name;
use crate::artifact::Artifact;
use crate::internal::InternalTask;
use crate::settings::StageSettings;
use crate::stage::{Stage, StageKind};
use crate::step::{Resources, Step};
use crate::StageError;

const ETAC_OPT:&str = "NN=2:sid=2:hpow=0:pthr=0.01,0.005,0.002,0.001:name=etac";

/// `3dttest++ -ETAC` over one (one-sample) or two (paired) labelled sets.
/// Set entries are `"<subj> <dataset>"` pairs.
pub fn etac_command(mask:&Path,prefix:&str,etac_blur:&str,sets:&[(&str,Vec<String>)]) -> String {
    let mut lines = vec![String::from("3dttest++")];
    if sets.len() > 1 {
        lines.push(String::from("    -paired"));
    }
    lines.push(format!("    -mask {}",mask.display()));
    lines.push(format!("    -prefix {}",prefix));
    lines.push(format!("    -prefix_clustsim {}_clustsim",prefix));
    lines.push(String::from("    -ETAC"));
    lines.push(format!("    -ETAC_blur {}",etac_blur));
    lines.push(format!("    -ETAC_opt {}",ETAC_OPT));
    for ((label,files),flag) in sets.iter().zip(["-setA","-setB"]) {
        lines.push(format!("    {} {} {}",flag,label,files.join(" ")));
    }
    lines.join(" \\\n")
}

pub fn etac_output(group_dir:&Path,prefix:&str) -> PathBuf {
    group_dir.join(format!("{}_clustsim.etac.ETACmask.global.2sid.5perc.nii.gz",prefix))
}

fn group_dir(settings:&StageSettings) -> PathBuf {
    afni_root(settings).join("analyses")
}

fn afni_root(settings:&StageSettings) -> PathBuf {
    settings.deriv_dir().join("afni")
}

/// data already blurred in preprocessing is not blurred again by ETAC
fn etac_blur(settings:&StageSettings) -> String {
    match settings.afni.do_blur {
        true => String::from("0"),
        false => String::from("4 8"),
    }
}

/// one file per subject below `<deriv>/afni/<subj>/`, optionally limited to a session
fn member_files(settings:&StageSettings,sess:Option<&str>,name:&str) -> Vec<(String,PathBuf)> {
    let root = afni_root(settings);
    let mut members:Vec<(String,PathBuf)> = Vec::new();
    for f in utils::find_recursive(&root,name) {
        let subj = match f.strip_prefix(&root).ok().and_then(|r| r.components().next()) {
            Some(c) => c.as_os_str().to_string_lossy().to_string(),
            None => continue,
        };
        if !subj.starts_with("sub-") || members.iter().any(|(s,_)| *s == subj) {
            continue
        }
        if let Some(sess) = sess {
            if !f.components().any(|c| c.as_os_str() == sess) {
                continue
            }
        }
        members.push((subj,f));
    }
    members
}

/// strip `.HEAD` so AFNI sub-brick selectors apply to the dataset
fn dataset(head:&Path) -> PathBuf {
    let name = utils::file_name(head);
    head.with_file_name(name.trim_end_matches(".HEAD"))
}

fn group_mask(settings:&StageSettings,task:&str) -> PathBuf {
    group_dir(settings).join(format!("tpl-MNIPediatricAsym_cohort-5_res-2_{}_desc-grpIntx_mask.nii.gz",task))
}

fn group_gm_mask(settings:&StageSettings,task:&str) -> PathBuf {
    group_dir(settings).join(format!("tpl-MNIPediatricAsym_cohort-5_res-2_{}_desc-grpIntxGM_mask.nii.gz",task))
}

/// intersection of member masks, then restricted to template gray matter
fn mask_steps(settings:&StageSettings,task:&str,subjects:&[String]) -> Vec<Step> {
    let dir = group_dir(settings);
    let root = afni_root(settings);
    let masks:Vec<String> = subjects.iter()
        .filter_map(|s| utils::find_recursive(&root.join(s),&format!("{}_*_{}_*intersect_mask.nii.gz",s,task)).into_iter().next())
        .map(|m| m.display().to_string())
        .collect();
    let intx = group_mask(settings,task);
    let gm = group_gm_mask(settings,task);
    let script = format!(
        "mkdir -p {dir}\n\
         3dmask_tool -frac 1 -prefix {intx} -input {masks}",
        dir = dir.display(), intx = intx.display(), masks = masks.join(" "),
    );
    let intx_step = Step::local(&format!("group_mask_{}",task),&dir,&[settings.modules.afni.clone()],&script).check(intx.clone());

    let tmp = dir.join(format!("tmp_gm_{}.nii.gz",task));
    let script = format!(
        "c3d {intx} {tpl} -reslice-identity -o {tmp}\n\
         c3d {tmp} {intx} -multiply -o {gm}\n\
         c3d {gm} -thresh 0.5 1 1 0 -o {gm}\n\
         rm -f {tmp}",
        intx = intx.display(), tpl = settings.afni.template_gm.display(), tmp = tmp.display(), gm = gm.display(),
    );
    let gm_step = Step::local(&format!("group_gm_mask_{}",task),&dir,&[settings.modules.c3d.clone()],&script).check(gm);
    vec![intx_step,gm_step]
}

fn enough(found:usize) -> Result<(),StageError> {
    match found < 2 {
        true => Err(StageError::InsufficientSubjects{needed:2,found}),
        false => Ok(()),
    }
}

/// Paired A vs B test of two behaviors from one deconvolution.
pub struct TaskGroup {
    settings:StageSettings,
    sess:String,
    task:String,
    decon:String,
    behaviors:Vec<String>,
}

impl TaskGroup {
    pub fn new(settings:StageSettings,sess:&str,task:&str,decon:&str,behaviors:&[String]) -> Self {
        Self {
            settings,
            sess:sess.to_string(),
            task:task.to_string(),
            decon:decon.to_string(),
            behaviors:behaviors.to_vec(),
        }
    }

    fn decon_file(&self) -> String {
        format!("{}_stats_REML+tlrc.HEAD",decon_name(&self.task,&self.decon))
    }

    fn prefix(&self) -> String {
        format!("FINAL_{}",self.behaviors.join("-"))
    }

    fn members(&self) -> Vec<(String,PathBuf)> {
        member_files(&self.settings,Some(&self.sess),&self.decon_file())
    }
}

impl Stage for TaskGroup {
    fn kind(&self) -> StageKind {
        StageKind::TaskGroup
    }

    fn label(&self) -> String {
        format!("{}_{}",self.task,self.behaviors.join("-"))
    }

    fn units(&self,_subjects:&[String]) -> Vec<String> {
        vec![format!("group-{}",self.label())]
    }

    fn inputs(&self,_unit:&str) -> Vec<Artifact> {
        let tpl = &self.settings.afni.template_gm;
        vec![
            Artifact::new("template_gm",tpl.parent().unwrap_or(tpl),&utils::file_name(tpl)),
            Artifact::new("decon",&afni_root(&self.settings),&self.decon_file()),
        ]
    }

    fn outputs(&self,_unit:&str) -> Vec<Artifact> {
        vec![Artifact::new("etac",&group_dir(&self.settings),&utils::file_name(&etac_output(&group_dir(&self.settings),&self.prefix())))]
    }

    fn is_ready(&self,unit:&str) -> bool {
        self.behaviors.len() == 2
            && crate::artifact::all_present(&self.inputs(unit))
            && self.members().len() >= 2
    }

    fn plan(&self,_unit:&str) -> Result<Vec<Step>,StageError> {
        let (beh_a,beh_b) = match self.behaviors.as_slice() {
            [a,b] => (a.clone(),b.clone()),
            _ => return Err(StageError::BehaviorCount(self.behaviors.len())),
        };
        let members = self.members();
        enough(members.len())?;
        let subjects:Vec<String> = members.iter().map(|(s,_)| s.clone()).collect();
        let dir = group_dir(&self.settings);
        let prefix = self.prefix();
        let script = dir.join(format!("{}.sh",prefix));

        let mut steps = mask_steps(&self.settings,&self.task,&subjects);
        let afni = vec![self.settings.modules.afni.clone()];
        steps.push(Step::internal("etac_script",&dir,InternalTask::TaskEtacScript{
            beh_a,
            beh_b,
            mask:group_gm_mask(&self.settings,&self.task),
            prefix:prefix.clone(),
            etac_blur:etac_blur(&self.settings),
            script:script.clone(),
            modules:afni.clone(),
            subjects,
            decon_files:members.iter().map(|(_,f)| dataset(f)).collect(),
        }).check(script.clone()));

        let run = format!("cd {}\nbash {}",dir.display(),script.display());
        steps.push(Step::scheduled("etac","taskETAC",&dir,&afni,&run)
            .check(etac_output(&dir,&prefix))
            .resources(Resources::new(20,4,10)));
        Ok(steps)
    }

    fn driver_resources(&self) -> Resources {
        Resources::new(24,4,1)
    }
}

/// One-sample test of a resting seed's z maps.
pub struct RestingGroup {
    settings:StageSettings,
    task:String,
    seed:String,
}

impl RestingGroup {
    pub fn new(settings:StageSettings,task:&str,seed:&str) -> Self {
        Self{settings,task:task.to_string(),seed:seed.to_string()}
    }

    fn ztrans_file(&self) -> String {
        format!("decon_{}_anaticor_{}_ztrans+tlrc.HEAD",self.task,self.seed)
    }

    fn prefix(&self) -> String {
        format!("FINAL_RS-{}",self.seed)
    }

    fn members(&self) -> Vec<(String,PathBuf)> {
        member_files(&self.settings,None,&self.ztrans_file())
    }
}

impl Stage for RestingGroup {
    fn kind(&self) -> StageKind {
        StageKind::RestingGroup
    }

    fn label(&self) -> String {
        format!("{}_{}",self.task,self.seed)
    }

    fn units(&self,_subjects:&[String]) -> Vec<String> {
        vec![format!("group-{}",self.label())]
    }

    fn inputs(&self,_unit:&str) -> Vec<Artifact> {
        let tpl = &self.settings.afni.template_gm;
        vec![
            Artifact::new("template_gm",tpl.parent().unwrap_or(tpl),&utils::file_name(tpl)),
            Artifact::new("ztrans",&afni_root(&self.settings),&self.ztrans_file()),
        ]
    }

    fn outputs(&self,_unit:&str) -> Vec<Artifact> {
        vec![Artifact::new("etac",&group_dir(&self.settings),&utils::file_name(&etac_output(&group_dir(&self.settings),&self.prefix())))]
    }

    fn is_ready(&self,unit:&str) -> bool {
        crate::artifact::all_present(&self.inputs(unit)) && self.members().len() >= 2
    }

    fn plan(&self,_unit:&str) -> Result<Vec<Step>,StageError> {
        let members = self.members();
        enough(members.len())?;
        let subjects:Vec<String> = members.iter().map(|(s,_)| s.clone()).collect();
        let dir = group_dir(&self.settings);
        let prefix = self.prefix();
        let files:Vec<String> = members.iter().map(|(s,f)| format!("{} {}",s,dataset(f).display())).collect();

        let mut steps = mask_steps(&self.settings,&self.task,&subjects);
        let cmd = etac_command(&group_gm_mask(&self.settings,&self.task),&prefix,&etac_blur(&self.settings),&[(self.seed.as_str(),files)]);
        let script = format!("cd {}\n{}",dir.display(),cmd);
        steps.push(Step::scheduled("etac","rsETAC",&dir,&[self.settings.modules.afni.clone()],&script)
            .check(etac_output(&dir,&prefix))
            .resources(Resources::new(20,4,10)));
        Ok(steps)
    }

    fn driver_resources(&self) -> Resources {
        Resources::new(24,4,1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::afni_prep::tests::settings_in;
    use crate::step::Action;
    use std::fs::{create_dir_all, File};

    fn fake_resting(settings:&StageSettings,subj:&str) {
        let base = settings.deriv_dir().join("afni").join(subj).join("ses-S2");
        create_dir_all(base.join("anat")).unwrap();
        create_dir_all(base.join("func")).unwrap();
        File::create(base.join("anat").join(format!("{}_ses-S2_task-rest_space-MNIPediatricAsym_cohort-5_res-2_desc-intersect_mask.nii.gz",subj))).unwrap();
        File::create(base.join("func/decon_task-rest_anaticor_rPCC_ztrans+tlrc.HEAD")).unwrap();
    }

    fn with_template(tmp:&Path) -> StageSettings {
        let mut settings = settings_in(tmp);
        settings.afni.template_gm = tmp.join("tpl/tpl_GM_probseg.nii.gz");
        create_dir_all(tmp.join("tpl")).unwrap();
        File::create(&settings.afni.template_gm).unwrap();
        settings
    }

    #[test]
    fn paired_and_one_sample_commands(){
        let mask = PathBuf::from("/g/mask.nii.gz");
        let one = etac_command(&mask,"FINAL_RS-rPCC","4 8",&[("rPCC",vec![String::from("sub-1 a+tlrc"),String::from("sub-2 b+tlrc")])]);
        assert!(!one.contains("-paired"));
        assert!(one.contains("-setA rPCC sub-1 a+tlrc sub-2 b+tlrc"));
        assert!(!one.contains("-setB"));
        assert!(one.contains("-ETAC_blur 4 8"));

        let two = etac_command(&mask,"FINAL_neg-neu","0",&[("neg",vec![String::from("sub-1 a'[1]'")]),("neu",vec![String::from("sub-1 a'[4]'")])]);
        assert!(two.contains("-paired"));
        assert!(two.contains("-setB neu sub-1 a'[4]'"));
        assert!(two.contains("-prefix_clustsim FINAL_neg-neu_clustsim"));
    }

    #[test]
    fn resting_group_needs_two_subjects(){
        let tmp = tempfile::tempdir().unwrap();
        let settings = with_template(tmp.path());
        let stage = RestingGroup::new(settings.clone(),"task-rest","rPCC");
        let units = stage.units(&[String::from("sub-4001"),String::from("sub-4002")]);
        assert_eq!(units,vec!["group-task-rest_rPCC"]);

        fake_resting(&settings,"sub-4001");
        assert!(!stage.is_ready(&units[0]));
        assert!(matches!(stage.plan(&units[0]),Err(StageError::InsufficientSubjects{needed:2,found:1})));

        fake_resting(&settings,"sub-4002");
        assert!(stage.is_ready(&units[0]));
        assert!(stage.is_needed(&units[0]));
        let steps = stage.plan(&units[0]).unwrap();
        assert_eq!(steps.len(),3);
        assert!(!steps[0].is_scheduled());
        assert_eq!(steps[2].job_name,"rsETAC");
        assert_eq!(steps[2].resources,Resources::new(20,4,10));
        match &steps[0].action {
            Action::Shell{script,..} => assert_eq!(script.matches("desc-intersect_mask").count(),2),
            a => panic!("unexpected {:?}",a),
        }
        match &steps[2].action {
            Action::Shell{script,..} => {
                assert!(script.contains("sub-4001 "));
                assert!(script.contains("ztrans+tlrc sub-4002"));
                assert!(!script.contains(".HEAD"));
            }
            a => panic!("unexpected {:?}",a),
        }
    }

    #[test]
    fn task_group_writes_script_before_etac(){
        let tmp = tempfile::tempdir().unwrap();
        let settings = with_template(tmp.path());
        for subj in ["sub-4001","sub-4002","sub-4003"] {
            let func = settings.deriv_dir().join("afni").join(subj).join("ses-S1/func");
            create_dir_all(&func).unwrap();
            File::create(func.join("decon_task-study_UniqueBehs_stats_REML+tlrc.HEAD")).unwrap();
        }
        let behs = vec![String::from("neg"),String::from("neu")];
        let stage = TaskGroup::new(settings.clone(),"ses-S1","task-study","UniqueBehs",&behs);
        let unit = &stage.units(&[])[0];
        assert_eq!(unit,"group-task-study_neg-neu");
        assert!(stage.is_ready(unit));
        // other session
        assert!(!TaskGroup::new(settings.clone(),"ses-S2","task-study","UniqueBehs",&behs).is_ready(unit));

        let steps = stage.plan(unit).unwrap();
        let names:Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names,vec!["group_mask_task-study","group_gm_mask_task-study","etac_script","etac"]);
        match &steps[2].action {
            Action::Internal{task:InternalTask::TaskEtacScript{subjects,decon_files,etac_blur,..}} => {
                assert_eq!(subjects.len(),3);
                assert_eq!(utils::file_name(&decon_files[0]),"decon_task-study_UniqueBehs_stats_REML+tlrc");
                assert_eq!(etac_blur,"4 8");
            }
            a => panic!("unexpected {:?}",a),
        }
        assert!(utils::file_name(&steps[3].checks[0]).starts_with("FINAL_neg-neu_clustsim.etac"));

        let one = TaskGroup::new(settings,"ses-S1","task-study","UniqueBehs",&behs[..1]);
        assert!(!one.is_ready(unit));
        assert!(matches!(one.plan(unit),Err(StageError::BehaviorCount(1))));
    }
}
