use super::{matching_files, produced, Job, JobId, JobKind};
use crate::catalog::{CatalogError, Provenance, SharedCatalog};
use crate::config::{Config, RegridConfig, RegridStream};
use std::fs;
use std::path::{Path, PathBuf};

/// Regridding of one raw output stream onto a destination grid.
#[derive(Debug, Clone)]
pub struct Regrid {
    pub stream: String,
    pub output_path: PathBuf,
    pub regrid_map_path: PathBuf,
}

pub fn new(
    id: JobId,
    case: &str,
    short_name: &str,
    window: (i32, i32),
    config: &Config,
    regrid: &RegridConfig,
    stream: &str,
    stream_config: &RegridStream,
) -> Result<Job, std::io::Error> {
    let output_path = config
        .global
        .project_path
        .join("output")
        .join("pp")
        .join(format!("regrid_{}", stream_config.destination_grid_name))
        .join(short_name)
        .join(stream);
    fs::create_dir_all(&output_path)?;

    let mut job = Job::build(
        id,
        JobKind::Regrid(Regrid {
            stream: stream.to_owned(),
            output_path,
            regrid_map_path: stream_config.regrid_map_path.clone(),
        }),
        case,
        short_name,
        window,
    );
    job.run_type = Some(stream.to_owned());
    job.batch_overrides = regrid.custom_args.clone();
    Ok(job)
}

impl Regrid {
    pub fn render_cmd(&self, input_dir: &Path) -> Vec<String> {
        vec![
            "ncremap".to_owned(),
            "-I".to_owned(),
            input_dir.display().to_string(),
            "--map".to_owned(),
            self.regrid_map_path.display().to_string(),
            "-O".to_owned(),
            self.output_path.display().to_string(),
        ]
    }

    /// at least one regridded file per year of the window
    pub fn validate(&self, start: i32, end: i32) -> bool {
        let names = matching_files(&self.output_path, "*.nc");
        if names.is_empty() {
            return false;
        }
        (start..=end).all(|year| names.iter().any(|name| name.contains(&format!("{year:04}"))))
    }

    pub fn ingest_output(
        &self,
        catalog: &SharedCatalog,
        case: &str,
        start: i32,
        end: i32,
    ) -> Result<(), CatalogError> {
        let files = produced(&self.output_path, "*.nc", case, start, end);
        catalog.ingest(
            &format!("regrid_{}", self.stream),
            &files,
            Provenance::Derived,
        )
    }
}
