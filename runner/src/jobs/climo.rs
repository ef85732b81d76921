use super::{matching_files, produced, Job, JobId, JobKind};
use crate::catalog::{CatalogError, Provenance, SharedCatalog};
use crate::config::{ClimoConfig, Config};
use std::fs;
use std::path::{Path, PathBuf};

/// expected per-window output count, 12 months plus 4 seasons plus annual
const CLIMO_FILE_COUNT: usize = 17;

/// Climatology generation over one year window. Produces a native-grid and
/// a regridded set of mean files.
#[derive(Debug, Clone)]
pub struct Climo {
    pub output_path: PathBuf,
    pub regrid_path: PathBuf,
    pub regrid_map_path: PathBuf,
}

pub fn new(
    id: JobId,
    case: &str,
    short_name: &str,
    window: (i32, i32),
    config: &Config,
    climo: &ClimoConfig,
) -> Result<Job, std::io::Error> {
    let length = window.1 - window.0 + 1;
    let pp = config.global.project_path.join("output").join("pp");

    let output_path = pp
        .join("climo_native")
        .join(short_name)
        .join(format!("{length}yr"));
    let regrid_path = pp
        .join("climo_regrid")
        .join(&climo.destination_grid_name)
        .join(short_name)
        .join(format!("{length}yr"));
    fs::create_dir_all(&output_path)?;
    fs::create_dir_all(&regrid_path)?;

    let mut job = Job::build(
        id,
        JobKind::Climo(Climo {
            output_path,
            regrid_path,
            regrid_map_path: climo.regrid_map_path.clone(),
        }),
        case,
        short_name,
        window,
    );
    job.batch_overrides = climo.custom_args.clone();
    Ok(job)
}

impl Climo {
    pub fn render_cmd(&self, case: &str, start: i32, end: i32, input_dir: &Path) -> Vec<String> {
        vec![
            "ncclimo".to_owned(),
            "-c".to_owned(),
            case.to_owned(),
            "-a".to_owned(),
            "sdd".to_owned(),
            "-s".to_owned(),
            start.to_string(),
            "-e".to_owned(),
            end.to_string(),
            "-i".to_owned(),
            input_dir.display().to_string(),
            "-r".to_owned(),
            self.regrid_map_path.display().to_string(),
            "-o".to_owned(),
            self.output_path.display().to_string(),
            "-O".to_owned(),
            self.regrid_path.display().to_string(),
            "--no_amwg_links".to_owned(),
        ]
    }

    fn window_glob(start: i32, end: i32) -> String {
        format!("*_{start:04}??_{end:04}??_climo.nc")
    }

    /// both output sets must hold the full complement of mean files for
    /// this window
    pub fn validate(&self, start: i32, end: i32) -> bool {
        let glob = Self::window_glob(start, end);
        matching_files(&self.regrid_path, &glob).len() >= CLIMO_FILE_COUNT
            && matching_files(&self.output_path, &glob).len() >= CLIMO_FILE_COUNT
    }

    pub fn ingest_output(
        &self,
        catalog: &SharedCatalog,
        case: &str,
        start: i32,
        end: i32,
    ) -> Result<(), CatalogError> {
        let glob = Self::window_glob(start, end);
        let regrid_files = produced(&self.regrid_path, &glob, case, start, end);
        catalog.ingest("climo_regrid", &regrid_files, Provenance::Derived)?;

        let native_files = produced(&self.output_path, &glob, case, start, end);
        catalog.ingest("climo_native", &native_files, Provenance::Derived)
    }
}
