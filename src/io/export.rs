//! Export calibrated tables to CSV.
//!
//! The exported species and gear tables use the same columns as the input
//! tables, so a calibrated run can be fed straight back into `scal run`.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::calibration::CalibrationReport;
use crate::error::AppError;

/// Write the calibrated species table.
pub fn write_species_csv(path: &Path, report: &CalibrationReport) -> Result<(), AppError> {
    let file = create(path, "species")?;
    write_rows(file, &report.species_table())
}

/// Write the calibrated gear table.
pub fn write_gears_csv(path: &Path, report: &CalibrationReport) -> Result<(), AppError> {
    let file = create(path, "gear")?;
    write_rows(file, &report.gear_table())
}

fn create(path: &Path, what: &str) -> Result<File, AppError> {
    File::create(path)
        .map_err(|e| AppError::new(2, format!("Failed to create {what} CSV '{}': {e}", path.display())))
}

/// Serialize `rows` as CSV (header from the field names).
pub fn write_rows<W: Write, T: Serialize>(writer: W, rows: &[T]) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_writer(writer);
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| AppError::new(2, format!("Failed to write export CSV row: {e}")))?;
    }
    writer
        .flush()
        .map_err(|e| AppError::new(2, format!("Failed to flush export CSV: {e}")))?;
    Ok(())
}
