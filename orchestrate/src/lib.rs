pub mod project_config;
pub mod work_queue;
pub mod subject_manager;
pub mod pipeline;
