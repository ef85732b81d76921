use super::{Comparison, Job, JobId, JobKind};
use crate::config::{Config, E3smDiagsConfig};
use ignore::WalkBuilder;
use std::fs;
use std::path::{Path, PathBuf};

/// Model-vs-model or model-vs-observation diagnostics over one year window.
/// Waits on the climatology job covering the same window.
#[derive(Debug, Clone)]
pub struct E3smDiags {
    pub backend: String,
    pub short_comp_name: String,
    pub output_path: PathBuf,
}

pub fn new(
    id: JobId,
    case: &str,
    short_name: &str,
    window: (i32, i32),
    config: &Config,
    diags: &E3smDiagsConfig,
    comparison: Comparison,
) -> Result<Job, std::io::Error> {
    let short_comp_name = match &comparison {
        Comparison::Obs => "obs".to_owned(),
        Comparison::Case(other) => config
            .simulations
            .cases
            .get(other)
            .map(|case| case.short_name.clone())
            .unwrap_or_else(|| other.clone()),
    };

    let output_path = config
        .global
        .project_path
        .join("output")
        .join("diags")
        .join(short_name)
        .join("e3sm_diags")
        .join(format!(
            "{:04}_{:04}_vs_{short_comp_name}",
            window.0, window.1
        ));
    fs::create_dir_all(&output_path)?;

    let mut job = Job::build(
        id,
        JobKind::E3smDiags(E3smDiags {
            backend: diags.backend.clone(),
            short_comp_name,
            output_path,
        }),
        case,
        short_name,
        window,
    );
    job.comparison = Some(comparison);
    job.batch_overrides = diags.custom_args.clone();
    Ok(job)
}

impl E3smDiags {
    pub fn render_cmd(&self, input_dir: &Path) -> Vec<String> {
        vec![
            "e3sm_diags".to_owned(),
            "--backend".to_owned(),
            self.backend.clone(),
            "--reference_name".to_owned(),
            self.short_comp_name.clone(),
            "--test_data_path".to_owned(),
            input_dir.display().to_string(),
            "--results_dir".to_owned(),
            self.output_path.display().to_string(),
        ]
    }

    /// the rendered viewer index is the completion marker
    pub fn validate(&self) -> bool {
        if fs::metadata(&self.output_path).is_err() {
            return false;
        }
        WalkBuilder::new(&self.output_path)
            .build()
            .filter_map(Result::ok)
            .any(|entry| entry.file_name().to_str() == Some("index.html"))
    }
}
