//! CSV ingest of the calibration tables.
//!
//! Tables read here:
//!
//! - species parameters (one row per species)
//! - gear parameters (one row per species x gear)
//! - catch-at-length (one row per species x gear x length bin)
//! - optional Ecopath estimates, diet composition and kernel fits
//!
//! Design goals:
//! - **Header normalization** (case, whitespace, BOM) before schema matching
//! - **Row-level validation** (skip bad rows, but report what happened)
//! - **Deterministic behavior** (row order is preserved)
//! - **Separation of concerns**: no calibration logic here

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::StringRecord;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::calibration::CalibrationInput;
use crate::domain::{
    DietEntry, EcopathEstimate, GearParams, KernelFit, LengthBin, ObservedCatch, SpeciesParams,
};
use crate::error::AppError;

/// A row-level error encountered during ingest.
#[derive(Debug, Clone)]
pub struct RowError {
    pub table: &'static str,
    pub line: usize,
    pub message: String,
}

/// Parsed rows of one table plus the rows that were skipped.
#[derive(Debug, Clone)]
pub struct Table<T> {
    pub rows: Vec<T>,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

pub const SPECIES_COLUMNS: &[&str] = &["species", "w_max", "w_mat", "h", "gamma", "ks"];
pub const GEAR_COLUMNS: &[&str] = &["species", "gear", "sel_func", "l25", "l50", "catchability"];
pub const CATCH_COLUMNS: &[&str] = &["species", "gear", "length", "dl", "count"];
pub const ECOPATH_COLUMNS: &[&str] = &[
    "group",
    "biomass",
    "consumption_per_biomass",
    "production_per_consumption",
];
pub const DIET_COLUMNS: &[&str] = &["predator", "prey", "proportion"];
pub const KERNEL_COLUMNS: &[&str] = &["species", "kernel_exponent", "ll", "ul", "lr", "ur"];

/// Locations of the input tables of a run.
#[derive(Debug, Clone, Default)]
pub struct InputPaths {
    pub species: PathBuf,
    pub gears: PathBuf,
    pub catch: PathBuf,
    pub ecopath: Option<PathBuf>,
    pub diet: Option<PathBuf>,
    pub kernels: Option<PathBuf>,
}

/// Everything read for a run, ready for the pipeline.
#[derive(Debug, Clone)]
pub struct IngestedData {
    pub input: CalibrationInput,
    pub row_errors: Vec<RowError>,
    pub rows_read: usize,
}

/// One row of the catch-at-length table.
#[derive(Debug, Clone, Deserialize)]
struct CatchRow {
    species: String,
    gear: String,
    length: f64,
    dl: f64,
    count: f64,
}

/// Load all tables named in `paths`.
pub fn load_input(paths: &InputPaths) -> Result<IngestedData, AppError> {
    let species: Table<SpeciesParams> = read_table(&paths.species, "species", SPECIES_COLUMNS)?;
    let gears: Table<GearParams> = read_table(&paths.gears, "gears", GEAR_COLUMNS)?;
    let catch_rows: Table<CatchRow> = read_table(&paths.catch, "catch", CATCH_COLUMNS)?;
    let ecopath: Table<EcopathEstimate> =
        read_optional_table(paths.ecopath.as_deref(), "ecopath", ECOPATH_COLUMNS)?;
    let diet: Table<DietEntry> = read_optional_table(paths.diet.as_deref(), "diet", DIET_COLUMNS)?;
    let kernels: Table<KernelFit> =
        read_optional_table(paths.kernels.as_deref(), "kernels", KERNEL_COLUMNS)?;

    if species.rows.is_empty() {
        return Err(AppError::new(2, "No valid rows in the species table."));
    }

    let rows_read = species.rows_read
        + gears.rows_read
        + catch_rows.rows_read
        + ecopath.rows_read
        + diet.rows_read
        + kernels.rows_read;
    let mut row_errors = Vec::new();
    row_errors.extend(species.row_errors);
    row_errors.extend(gears.row_errors);
    row_errors.extend(catch_rows.row_errors);
    row_errors.extend(ecopath.row_errors);
    row_errors.extend(diet.row_errors);
    row_errors.extend(kernels.row_errors);

    Ok(IngestedData {
        input: CalibrationInput {
            species: species.rows,
            gears: gears.rows,
            catches: group_catch_rows(catch_rows.rows),
            ecopath: ecopath.rows,
            diet: diet.rows,
            kernels: kernels.rows,
        },
        row_errors,
        rows_read,
    })
}

/// Read a CSV table from a file.
pub fn read_table<T: DeserializeOwned>(
    path: &Path,
    table: &'static str,
    required: &[&str],
) -> Result<Table<T>, AppError> {
    let file = File::open(path).map_err(|e| {
        AppError::new(
            2,
            format!("Failed to open {table} table '{}': {e}", path.display()),
        )
    })?;
    read_table_from(file, table, required)
}

fn read_optional_table<T: DeserializeOwned>(
    path: Option<&Path>,
    table: &'static str,
    required: &[&str],
) -> Result<Table<T>, AppError> {
    match path {
        Some(path) => read_table(path, table, required),
        None => Ok(Table {
            rows: Vec::new(),
            row_errors: Vec::new(),
            rows_read: 0,
        }),
    }
}

/// Read a CSV table from any reader, skipping (and reporting) malformed rows.
pub fn read_table_from<R: Read, T: DeserializeOwned>(
    reader: R,
    table: &'static str,
    required: &[&str],
) -> Result<Table<T>, AppError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = reader
        .headers()
        .map_err(|e| AppError::new(2, format!("Failed to read {table} table headers: {e}")))?
        .clone();
    let headers: StringRecord = headers.iter().map(normalize_header_name).collect();
    let header_map = build_header_map(&headers);
    check_required(&header_map, required, table)?;

    let mut rows = Vec::new();
    let mut row_errors = Vec::new();
    let mut rows_read = 0usize;

    for (idx, result) in reader.records().enumerate() {
        // Header is line 1.
        let line = idx + 2;
        rows_read += 1;

        let record = match result {
            Ok(r) => r,
            Err(e) => {
                row_errors.push(RowError {
                    table,
                    line,
                    message: format!("CSV parse error: {e}"),
                });
                continue;
            }
        };
        if record.iter().all(str::is_empty) {
            continue;
        }
        match parse_row::<T>(&record, &headers) {
            Ok(row) => rows.push(row),
            Err(message) => row_errors.push(RowError { table, line, message }),
        }
    }

    Ok(Table {
        rows,
        row_errors,
        rows_read,
    })
}

fn build_header_map(headers: &StringRecord) -> HashMap<String, usize> {
    headers
        .iter()
        .enumerate()
        .map(|(idx, name)| (name.to_string(), idx))
        .collect()
}

fn normalize_header_name(name: &str) -> String {
    // Spreadsheet exports may prefix the first header with a UTF-8 BOM.
    let name = name.trim().trim_start_matches('\u{feff}');
    name.to_ascii_lowercase()
}

fn parse_row<T: DeserializeOwned>(record: &StringRecord, headers: &StringRecord) -> Result<T, String> {
    // Missing trailing cells in a flexible CSV read as empty (null) values.
    let mut padded = record.clone();
    while padded.len() < headers.len() {
        padded.push_field("");
    }
    padded
        .deserialize(Some(headers))
        .map_err(|e| describe_error(&e, headers))
}

fn describe_error(e: &csv::Error, headers: &StringRecord) -> String {
    match e.kind() {
        csv::ErrorKind::Deserialize { err, .. } => {
            match err.field().and_then(|i| headers.get(i as usize)) {
                Some(name) => format!("column `{name}`: {}", err.kind()),
                None => err.kind().to_string(),
            }
        }
        _ => e.to_string(),
    }
}

fn check_required(
    header_map: &HashMap<String, usize>,
    required: &[&str],
    table: &str,
) -> Result<(), AppError> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| !header_map.contains_key(*name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(AppError::new(
            2,
            format!("Missing required column(s) in {table} table: {}", missing.join(", ")),
        ))
    }
}

/// Group catch rows by (species, gear) in first-seen order, bins sorted by length.
fn group_catch_rows(rows: Vec<CatchRow>) -> Vec<ObservedCatch> {
    let mut out: Vec<ObservedCatch> = Vec::new();
    for row in rows {
        let bin = LengthBin {
            length: row.length,
            dl: row.dl,
            count: row.count,
        };
        match out
            .iter_mut()
            .find(|c| c.species == row.species && c.gear == row.gear)
        {
            Some(catch) => catch.bins.push(bin),
            None => out.push(ObservedCatch {
                species: row.species,
                gear: row.gear,
                bins: vec![bin],
                yield_observed: None,
                production_observed: None,
            }),
        }
    }
    for catch in &mut out {
        catch.bins.sort_by(|a, b| a.length.total_cmp(&b.length));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SelectivityKind;

    #[test]
    fn species_table_with_bom_and_optional_columns() {
        let csv = "\u{feff}Species, W_max ,w_mat,h,gamma,ks,mu_mat,age_mat\n\
                   cod,5000,1000,20,20,2,0.3,4\n\
                   haddock,2000,300,15,12,1.5,,\n";
        let table: Table<SpeciesParams> = read_table_from(csv.as_bytes(), "species", SPECIES_COLUMNS).unwrap();
        assert!(table.row_errors.is_empty(), "{:?}", table.row_errors);
        assert_eq!(table.rows.len(), 2);
        let cod = &table.rows[0];
        assert_eq!(cod.species, "cod");
        assert_eq!(cod.w_max, 5000.0);
        assert_eq!(cod.mu_mat, Some(0.3));
        // Defaults for absent columns.
        assert_eq!(cod.w_min, 0.001);
        assert_eq!(cod.n, 0.7);
        assert_eq!(table.rows[1].mu_mat, None);
        assert_eq!(table.rows[1].age_mat, None);
    }

    #[test]
    fn malformed_rows_are_reported_and_skipped() {
        let csv = "species,gear,sel_func,l25,l50,catchability\n\
                   cod,trawl,sigmoid_length,34,40,0.3\n\
                   cod,seine,sigmoid_length,abc,40,0.3\n\
                   cod,net,double_sigmoid_length,30,35,0.1\n";
        let table: Table<GearParams> = read_table_from(csv.as_bytes(), "gears", GEAR_COLUMNS).unwrap();
        assert_eq!(table.rows_read, 3);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].sel_func, SelectivityKind::DoubleSigmoid);
        assert_eq!(table.rows[1].l50_right, None);
        assert_eq!(table.rows[1].effort, 1.0);
        assert_eq!(table.row_errors.len(), 1);
        assert_eq!(table.row_errors[0].line, 3);
        assert!(table.row_errors[0].message.contains("l25"), "{}", table.row_errors[0].message);
    }

    #[test]
    fn catch_rows_are_grouped_per_gear() {
        let csv = "species,gear,length,dl,count\n\
                   cod,trawl,22,2,5\n\
                   cod,trawl,20,2,3\n\
                   cod,net,20,2,1\n";
        let table: Table<CatchRow> = read_table_from(csv.as_bytes(), "catch", CATCH_COLUMNS).unwrap();
        let catches = group_catch_rows(table.rows);
        assert_eq!(catches.len(), 2);
        assert_eq!(catches[0].gear, "trawl");
        assert_eq!(catches[0].bins[0].length, 20.0);
        assert_eq!(catches[0].total_count(), 8.0);
        assert_eq!(catches[1].bins.len(), 1);
    }

    #[test]
    fn missing_required_column_is_an_error() {
        let csv = "predator,prey\ncod,herring\n";
        let err = read_table_from::<_, DietEntry>(csv.as_bytes(), "diet", DIET_COLUMNS).unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("proportion"));
    }
}
