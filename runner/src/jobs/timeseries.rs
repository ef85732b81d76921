use super::{Job, JobId, JobKind};
use crate::catalog::{CatalogError, ProducedFile, Provenance, SharedCatalog};
use crate::config::{Config, TimeseriesConfig};
use std::fs;
use std::path::{Path, PathBuf};

/// Per-variable time series extraction from one output stream, optionally
/// regridded as a second product.
#[derive(Debug, Clone)]
pub struct Timeseries {
    pub stream: String,
    pub variables: Vec<String>,
    pub output_path: PathBuf,
    pub regrid_path: Option<PathBuf>,
    pub regrid_map_path: Option<PathBuf>,
}

pub fn new(
    id: JobId,
    case: &str,
    short_name: &str,
    window: (i32, i32),
    config: &Config,
    timeseries: &TimeseriesConfig,
    stream: &str,
) -> Result<Job, std::io::Error> {
    let length = window.1 - window.0 + 1;
    let pp = config.global.project_path.join("output").join("pp");

    let output_path = pp
        .join("ts_native")
        .join(short_name)
        .join(stream)
        .join(format!("{length}yr"));
    fs::create_dir_all(&output_path)?;

    let regrid_path = match (&timeseries.destination_grid_name, &timeseries.regrid_map_path) {
        (Some(grid), Some(_)) => {
            let path = pp
                .join("ts_regrid")
                .join(grid)
                .join(short_name)
                .join(stream)
                .join(format!("{length}yr"));
            fs::create_dir_all(&path)?;
            Some(path)
        }
        _ => None,
    };

    let mut job = Job::build(
        id,
        JobKind::Timeseries(Timeseries {
            stream: stream.to_owned(),
            variables: timeseries.streams.get(stream).cloned().unwrap_or_default(),
            output_path,
            regrid_path,
            regrid_map_path: timeseries.regrid_map_path.clone(),
        }),
        case,
        short_name,
        window,
    );
    job.run_type = Some(stream.to_owned());
    job.batch_overrides = timeseries.custom_args.clone();
    Ok(job)
}

impl Timeseries {
    fn series_file_name(var: &str, start: i32, end: i32) -> String {
        format!("{var}_{start:04}01_{end:04}12.nc")
    }

    pub fn render_cmd(&self, case: &str, start: i32, end: i32, input_dir: &Path) -> Vec<String> {
        let mut cmd = vec![
            "ncclimo".to_owned(),
            "--split".to_owned(),
            "-c".to_owned(),
            case.to_owned(),
            "-v".to_owned(),
            self.variables.join(","),
            "-s".to_owned(),
            start.to_string(),
            "-e".to_owned(),
            end.to_string(),
            "-i".to_owned(),
            input_dir.display().to_string(),
            "-o".to_owned(),
            self.output_path.display().to_string(),
        ];
        if let (Some(regrid_path), Some(map)) = (&self.regrid_path, &self.regrid_map_path) {
            cmd.extend([
                "--map".to_owned(),
                map.display().to_string(),
                "-O".to_owned(),
                regrid_path.display().to_string(),
            ]);
        }
        cmd
    }

    /// every configured variable must have its extracted series on disk, in
    /// the regridded set too when regridding is on
    pub fn validate(&self, start: i32, end: i32) -> bool {
        self.variables.iter().all(|var| {
            let name = Self::series_file_name(var, start, end);
            let native = self.output_path.join(&name).exists();
            let regrid = self
                .regrid_path
                .as_ref()
                .map_or(true, |path| path.join(&name).exists());
            native && regrid
        })
    }

    pub fn ingest_output(
        &self,
        catalog: &SharedCatalog,
        case: &str,
        start: i32,
        end: i32,
    ) -> Result<(), CatalogError> {
        let rows = |dir: &Path| -> Vec<ProducedFile> {
            self.variables
                .iter()
                .map(|var| {
                    let name = Self::series_file_name(var, start, end);
                    ProducedFile {
                        local_path: dir.join(&name),
                        name,
                        case: case.to_owned(),
                        year: start,
                        month: end,
                    }
                })
                .filter(|file| file.local_path.exists())
                .collect()
        };

        catalog.ingest("ts_native", &rows(&self.output_path), Provenance::Derived)?;
        if let Some(regrid_path) = &self.regrid_path {
            catalog.ingest("ts_regrid", &rows(regrid_path), Provenance::Derived)?;
        }
        Ok(())
    }
}
