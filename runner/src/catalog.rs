use crate::config::{render_template, Config, RenderVars};
use itertools::iproduct;
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog query failed")]
    Store(#[from] rusqlite::Error),
    #[error("datatype {0} is not defined in the data_types configuration")]
    UnknownDataType(String),
    #[error("failed to touch the catalog backing file")]
    Io(#[from] std::io::Error),
}

/// presence of a tracked file at its expected local path
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy)]
#[repr(i8)]
pub enum FileStatus {
    Present = 0,
    NotPresent = 1,
    InTransit = 2,
}

impl FileStatus {
    fn from_code(code: i8) -> Self {
        match code {
            0 => Self::Present,
            2 => Self::InTransit,
            _ => Self::NotPresent,
        }
    }
}

/// where a catalog row came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    RawOutput,
    Derived,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RawOutput => "raw_output",
            Self::Derived => "derived",
        }
    }
}

/// how rows of a datatype are keyed on the year axis
///
/// monthly raw data carries one row per (year, month); derived window
/// products carry a single row keyed year = window start, month = window end
#[derive(Debug, Clone, Copy)]
pub struct DataTypeMeta {
    pub monthly: bool,
    pub windowed: bool,
}

/// one file produced by a completed job, ready for ingestion
#[derive(Debug, Clone)]
pub struct ProducedFile {
    pub name: String,
    pub local_path: PathBuf,
    pub case: String,
    pub year: i32,
    pub month: i32,
}

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists data_files (
    id integer primary key,
    case_name text not null,
    datatype text not null,
    name text not null,
    year integer not null,
    month integer not null,
    local_path text not null,
    local_status tinyint not null,
    super_type text not null
);",
    "create index if not exists data_files_case_type
    on data_files (case_name, datatype);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

const INSERT_ROW: &str = "insert into data_files
    (case_name, datatype, name, year, month, local_path, local_status, super_type)
    values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

/// The single source of truth for which files exist. Backed by a SQLite
/// file that is deleted and rebuilt from configuration on every startup.
#[derive(Debug)]
pub struct Catalog {
    connection: Connection,
    data_types: BTreeMap<String, DataTypeMeta>,
}

impl Catalog {
    pub fn open(path: &Path, config: &Config) -> Result<Self, CatalogError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // state is re-derived from disk on every run, a stale store would lie
        if path.exists() {
            fs::remove_file(path)?;
        }

        let connection = Connection::open(path)?;
        Self::from_connection(connection, config)
    }

    #[cfg(test)]
    pub fn in_memory(config: &Config) -> Result<Self, CatalogError> {
        Self::from_connection(Connection::open_in_memory()?, config)
    }

    fn from_connection(connection: Connection, config: &Config) -> Result<Self, CatalogError> {
        for (counter, statement) in SQL_SCHEMA.iter().enumerate() {
            connection.execute(statement, [])?;
            debug!("applied SQL schema ({}/{SQL_SCHEMA_NUMBER})", counter + 1);
        }

        let data_types = config
            .data_types
            .iter()
            .map(|(name, datatype)| {
                (
                    name.clone(),
                    DataTypeMeta {
                        monthly: datatype.monthly,
                        windowed: false,
                    },
                )
            })
            .collect();

        Ok(Self {
            connection,
            data_types,
        })
    }

    /// make job-produced datatypes known ahead of time so a readiness query
    /// against a not-yet-produced product reads as "no rows" instead of an
    /// unknown datatype
    pub fn register_derived(&mut self, tags: impl IntoIterator<Item = String>) {
        for tag in tags {
            self.data_types.entry(tag).or_insert(DataTypeMeta {
                monthly: true,
                windowed: true,
            });
        }
    }

    /// expand every (case, datatype) filename template across the year range
    /// and bulk-insert the expected rows as NOT_PRESENT
    pub fn populate(&self, config: &Config) -> Result<(), CatalogError> {
        info!("creating file table");

        let start = config.simulations.start_year;
        let end = config.simulations.end_year;

        let tx = self.connection.unchecked_transaction()?;
        {
            let mut insert = tx.prepare_cached(INSERT_ROW)?;

            for (case_name, case) in config.simulations.cases.iter() {
                for (datatype, datatype_config) in config.data_types.iter() {
                    if !case.data_type_enabled(datatype) {
                        continue;
                    }

                    let (file_format, dir_template) = datatype_config.resolve(case_name);
                    let dir = PathBuf::from(render_template(
                        dir_template,
                        &RenderVars {
                            project_path: &config.global.project_path,
                            case: case_name,
                            local_path: case.local_path.as_deref().unwrap_or(""),
                            start_year: start,
                            end_year: end,
                            year: None,
                            month: None,
                        },
                    ));
                    fs::create_dir_all(&dir)?;

                    if datatype_config.monthly {
                        for (year, month) in iproduct!(start..=end, 1..=12u32) {
                            let name = render_template(
                                file_format,
                                &RenderVars {
                                    project_path: &config.global.project_path,
                                    case: case_name,
                                    local_path: case.local_path.as_deref().unwrap_or(""),
                                    start_year: start,
                                    end_year: end,
                                    year: Some(year),
                                    month: Some(month),
                                },
                            );
                            insert.execute(params![
                                case_name,
                                datatype,
                                name,
                                year,
                                month,
                                dir.join(&name).display().to_string(),
                                FileStatus::NotPresent as i8,
                                Provenance::RawOutput.as_str(),
                            ])?;
                        }
                    } else {
                        let name = render_template(
                            file_format,
                            &RenderVars {
                                project_path: &config.global.project_path,
                                case: case_name,
                                local_path: case.local_path.as_deref().unwrap_or(""),
                                start_year: start,
                                end_year: end,
                                year: None,
                                month: None,
                            },
                        );
                        insert.execute(params![
                            case_name,
                            datatype,
                            name,
                            0,
                            0,
                            dir.join(&name).display().to_string(),
                            FileStatus::NotPresent as i8,
                            Provenance::RawOutput.as_str(),
                        ])?;
                    }
                }
            }
        }
        tx.commit()?;

        info!("catalog populated");
        Ok(())
    }

    /// re-stat every missing row and flip it to PRESENT when found,
    /// returns how many files newly appeared
    pub fn refresh_local_status(&self) -> Result<usize, CatalogError> {
        let missing = self
            .connection
            .prepare_cached(
                "select id, name, local_path from data_files where local_status = ?1",
            )?
            .query_map(params![FileStatus::NotPresent as i8], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);
                Ok::<Vec<(i64, String, String)>, CatalogError>(init)
            })?;

        let mut found = Vec::new();
        for (id, name, local_path) in missing {
            if Path::new(&local_path).exists() {
                found.push(id);
            } else {
                debug!("{name} is not present at {local_path}");
            }
        }

        let count = found.len();
        if count > 0 {
            let tx = self.connection.unchecked_transaction()?;
            {
                let mut update = tx
                    .prepare_cached("update data_files set local_status = ?1 where id = ?2")?;
                for id in found {
                    update.execute(params![FileStatus::Present as i8, id])?;
                }
            }
            tx.commit()?;
            info!("{count} tracked files newly present");
        }

        Ok(count)
    }

    /// true iff every requested datatype has at least one matching row and
    /// every matching row is PRESENT
    pub fn is_ready(
        &self,
        datatypes: &[String],
        case: &str,
        bounds: Option<(i32, i32)>,
    ) -> Result<bool, CatalogError> {
        for datatype in datatypes {
            let meta = self
                .data_types
                .get(datatype)
                .ok_or_else(|| CatalogError::UnknownDataType(datatype.clone()))?;

            let (total, present): (i64, i64) = match (meta.windowed, meta.monthly, bounds) {
                (true, _, Some((start, end))) => self
                    .connection
                    .prepare_cached(
                        "select count(*), coalesce(sum(local_status = 0), 0) from data_files
                         where case_name = ?1 and datatype = ?2 and year = ?3 and month = ?4",
                    )?
                    .query_row(params![case, datatype, start, end], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?,
                (false, true, Some((start, end))) => self
                    .connection
                    .prepare_cached(
                        "select count(*), coalesce(sum(local_status = 0), 0) from data_files
                         where case_name = ?1 and datatype = ?2 and year >= ?3 and year <= ?4",
                    )?
                    .query_row(params![case, datatype, start, end], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?,
                _ => self
                    .connection
                    .prepare_cached(
                        "select count(*), coalesce(sum(local_status = 0), 0) from data_files
                         where case_name = ?1 and datatype = ?2",
                    )?
                    .query_row(params![case, datatype], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })?,
            };

            if total == 0 || present < total {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// local paths of PRESENT rows matching the filter, in (year, month,
    /// name) order, empty when the datatype has no matching rows
    pub fn file_paths(
        &self,
        datatype: &str,
        case: &str,
        bounds: Option<(i32, i32)>,
    ) -> Result<Vec<PathBuf>, CatalogError> {
        let meta = self
            .data_types
            .get(datatype)
            .ok_or_else(|| CatalogError::UnknownDataType(datatype.to_owned()))?;

        let (sql, year_bounds) = match (meta.windowed, meta.monthly, bounds) {
            (true, _, Some(window)) => (
                "select local_path from data_files
                 where case_name = ?1 and datatype = ?2 and year = ?3 and month = ?4
                   and local_status = 0
                 order by year, month, name",
                Some(window),
            ),
            (false, true, Some(window)) => (
                "select local_path from data_files
                 where case_name = ?1 and datatype = ?2 and year >= ?3 and year <= ?4
                   and local_status = 0
                 order by year, month, name",
                Some(window),
            ),
            _ => (
                "select local_path from data_files
                 where case_name = ?1 and datatype = ?2 and local_status = 0
                 order by year, month, name",
                None,
            ),
        };

        let mut statement = self.connection.prepare_cached(sql)?;
        let mut rows = match year_bounds {
            Some((start, end)) => statement.query(params![case, datatype, start, end])?,
            None => statement.query(params![case, datatype])?,
        };

        let mut paths = Vec::new();
        while let Some(row) = rows.next()? {
            paths.push(PathBuf::from(row.get::<_, String>(0)?));
        }
        Ok(paths)
    }

    /// insert one PRESENT row per produced file
    ///
    /// rows are inserted unconditionally, a completion handler that runs
    /// twice leaves duplicate rows behind
    pub fn ingest(
        &mut self,
        datatype: &str,
        files: &[ProducedFile],
        provenance: Provenance,
    ) -> Result<(), CatalogError> {
        if files.is_empty() {
            return Ok(());
        }

        self.data_types
            .entry(datatype.to_owned())
            .or_insert(DataTypeMeta {
                monthly: true,
                windowed: true,
            });

        let tx = self.connection.unchecked_transaction()?;
        {
            let mut insert = tx.prepare_cached(INSERT_ROW)?;
            for file in files {
                insert.execute(params![
                    file.case,
                    datatype,
                    file.name,
                    file.year,
                    file.month,
                    file.local_path.display().to_string(),
                    FileStatus::Present as i8,
                    provenance.as_str(),
                ])?;
            }
        }
        tx.commit()?;

        info!("ingested {} {datatype} files", files.len());
        Ok(())
    }

    pub fn close(mut self) -> Result<(), CatalogError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(
                error = ?error,
                "failed to close the catalog connection: {error}, trying again {counter}/3"
            );

            if counter == 3 {
                return Err(CatalogError::Store(error));
            }
        }

        debug!("closed the catalog connection");
        Ok(())
    }

    /// true when no tracked file is missing
    pub fn all_present(&self) -> Result<bool, CatalogError> {
        let missing: i64 = self
            .connection
            .prepare_cached("select count(*) from data_files where local_status != 0")?
            .query_row([], |row| row.get(0))?;
        Ok(missing == 0)
    }

    /// write a human readable dump of the catalog for operator inspection
    pub fn write_report(&self, path: &Path) -> Result<(), CatalogError> {
        let cases = self
            .connection
            .prepare_cached("select distinct case_name from data_files order by case_name")?
            .query_map([], |row| row.get::<_, String>(0))?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);
                Ok::<Vec<String>, CatalogError>(init)
            })?;

        let mut out = String::new();
        for case in cases {
            out.push_str(&"+".repeat(45));
            out.push_str(&format!("\n\t{case}\t\n"));
            out.push_str(&"+".repeat(45));
            out.push('\n');

            let datatypes = self
                .connection
                .prepare_cached(
                    "select distinct datatype from data_files where case_name = ?1
                     order by datatype",
                )?
                .query_map(params![case], |row| row.get::<_, String>(0))?
                .try_fold(Vec::new(), |mut init, result| {
                    init.push(result?);
                    Ok::<Vec<String>, CatalogError>(init)
                })?;

            for datatype in datatypes {
                out.push_str(&format!("===================================\n\t{datatype}:\n"));

                let mut rows = self.connection.prepare_cached(
                    "select name, year, month, local_path, local_status from data_files
                     where case_name = ?1 and datatype = ?2 order by year, month, name",
                )?;
                let mut query = rows.query(params![case, datatype])?;
                while let Some(row) = query.next()? {
                    let name: String = row.get(0)?;
                    let year: i32 = row.get(1)?;
                    let month: i32 = row.get(2)?;
                    let local_path: String = row.get(3)?;
                    let status = FileStatus::from_code(row.get::<_, i8>(4)?);
                    out.push_str(&format!(
                        "-------------------------------------\n\
                         \t     name: {name}\n\
                         \t     status: {status:?}\n\
                         \t     local_path: {local_path}\n\
                         \t     year: {year}\n\
                         \t     month: {month}\n"
                    ));
                }
            }
        }

        fs::write(path, out)?;
        Ok(())
    }
}

/// Transparent, shareable wrapper over `Catalog`, one lock around the
/// connection so jobs and the run manager can hold it at the same time.
#[derive(Debug, Clone)]
pub struct SharedCatalog(Arc<FairMutex<Catalog>>);

impl SharedCatalog {
    pub fn new(catalog: Catalog) -> Self {
        Self(Arc::new(FairMutex::new(catalog)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, Catalog> {
        self.0.lock_arc()
    }

    pub fn register_derived(&self, tags: impl IntoIterator<Item = String>) {
        self.lock().register_derived(tags)
    }

    pub fn populate(&self, config: &Config) -> Result<(), CatalogError> {
        self.lock().populate(config)
    }

    pub fn refresh_local_status(&self) -> Result<usize, CatalogError> {
        self.lock().refresh_local_status()
    }

    pub fn is_ready(
        &self,
        datatypes: &[String],
        case: &str,
        bounds: Option<(i32, i32)>,
    ) -> Result<bool, CatalogError> {
        self.lock().is_ready(datatypes, case, bounds)
    }

    pub fn file_paths(
        &self,
        datatype: &str,
        case: &str,
        bounds: Option<(i32, i32)>,
    ) -> Result<Vec<PathBuf>, CatalogError> {
        self.lock().file_paths(datatype, case, bounds)
    }

    pub fn ingest(
        &self,
        datatype: &str,
        files: &[ProducedFile],
        provenance: Provenance,
    ) -> Result<(), CatalogError> {
        self.lock().ingest(datatype, files, provenance)
    }

    pub fn all_present(&self) -> Result<bool, CatalogError> {
        self.lock().all_present()
    }

    pub fn write_report(&self, path: &Path) -> Result<(), CatalogError> {
        self.lock().write_report(path)
    }

    /// consume the last live handle and close the connection
    pub fn close(self) -> Result<(), CatalogError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }
}
