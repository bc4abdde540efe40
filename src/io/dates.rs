use crate::types::{MaskError, MaskResult};
use chrono::{Duration, NaiveDate};
use regex::Regex;
use std::path::Path;

/// Extract the acquisition date embedded in a product file name.
///
/// The first run of eight digits that forms a valid `YYYYMMDD` calendar date
/// wins, e.g. `WV01_20150422_1020010040E27C00_dem.tif` -> 2015-04-22.
pub fn extract_acquisition_date<P: AsRef<Path>>(path: P) -> MaskResult<NaiveDate> {
    let name = path
        .as_ref()
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            MaskError::InvalidInput(format!("No file name in {}", path.as_ref().display()))
        })?;

    let pattern = Regex::new(r"[0-9]{8,}")
        .map_err(|e| MaskError::Processing(format!("Bad date pattern: {}", e)))?;

    for run in pattern.find_iter(name) {
        let digits = run.as_str();
        // Longer digit runs (timestamps) may hold the date at any offset
        for start in 0..=digits.len() - 8 {
            let candidate = &digits[start..start + 8];
            if let Ok(date) = NaiveDate::parse_from_str(candidate, "%Y%m%d") {
                if (1950..=2100).contains(&chrono::Datelike::year(&date)) {
                    log::debug!("Acquisition date {} from {}", date, name);
                    return Ok(date);
                }
            }
        }
    }

    Err(MaskError::Unavailable(format!(
        "No acquisition date found in file name {}",
        name
    )))
}

/// Dates from `start` (inclusive) to `end` (exclusive) spaced by `step`
pub fn date_range(start: NaiveDate, end: NaiveDate, step: Duration) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    if step <= Duration::zero() {
        return dates;
    }
    let mut current = start;
    while current < end {
        dates.push(current);
        current = match current.checked_add_signed(step) {
            Some(next) => next,
            None => break,
        };
    }
    dates
}
