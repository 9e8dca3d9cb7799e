//! # Row-oriented skim table reconciliation
//!
//! Some simulators deliver skims as CSV rows keyed by
//! (time period, path type, origin, destination) instead of matrices. The
//! merge rule is newest-observation-wins per key: an observed key replaces
//! the cumulative row wholesale, everything else is carried over.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use super::MergeError;

/// The CSV columns forming the merge key, in file order.
const KEY_COLUMNS: [&str; 4] = ["timePeriod", "pathType", "origin", "destination"];

/// Missing-value sentinel recognized on read.
const INFINITY_TOKEN: &str = "\u{221e}";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub time_period: String,
    pub path_type: String,
    pub origin: u32,
    pub destination: u32,
}

impl RowKey {
    pub fn new(
        time_period: impl Into<String>,
        path_type: impl Into<String>,
        origin: u32,
        destination: u32,
    ) -> Self {
        Self {
            time_period: time_period.into(),
            path_type: path_type.into(),
            origin,
            destination,
        }
    }
}

/// A keyed, column-oriented skim table.
///
/// Measure columns are ordered; every row holds one value per column.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SkimTable {
    columns: Vec<String>,
    rows: BTreeMap<RowKey, Vec<f64>>,
}

impl SkimTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Measure column names (key columns excluded).
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn get(&self, key: &RowKey) -> Option<&[f64]> {
        self.rows.get(key).map(Vec::as_slice)
    }

    /// The value of one measure column for one key.
    pub fn value(&self, key: &RowKey, column: &str) -> Option<f64> {
        let position = self.columns.iter().position(|c| c == column)?;
        self.rows.get(key).map(|row| row[position])
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RowKey> {
        self.rows.keys()
    }

    /// Parses a CSV skim table. The header must begin with the four key
    /// columns; everything after is a measure column. The string `"∞"` parses
    /// as infinity, an empty field as 0.0.
    ///
    /// # Errors
    ///
    /// Fails on malformed CSV, a missing key column, or an unparseable value.
    pub fn from_csv<R: Read>(reader: R) -> Result<Self, MergeError> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader.headers()?.clone();
        for (position, expected) in KEY_COLUMNS.iter().copied().enumerate() {
            if headers.get(position) != Some(expected) {
                return Err(MergeError::InvalidRecord(format!(
                    "column {position} must be {expected:?}"
                )));
            }
        }
        let columns: Vec<String> = headers
            .iter()
            .skip(KEY_COLUMNS.len())
            .map(String::from)
            .collect();

        let mut rows = BTreeMap::new();
        for record in reader.records() {
            let record = record?;
            let key = RowKey::new(
                &record[0],
                &record[1],
                parse_zone(record.get(2).unwrap_or_default())?,
                parse_zone(record.get(3).unwrap_or_default())?,
            );
            let values = record
                .iter()
                .skip(KEY_COLUMNS.len())
                .map(parse_value)
                .collect::<Result<Vec<f64>, MergeError>>()?;
            rows.insert(key, values);
        }
        Ok(Self { columns, rows })
    }

    /// Writes the table back out with the key columns first.
    ///
    /// # Errors
    ///
    /// Fails only on I/O errors.
    pub fn to_csv<W: Write>(&self, writer: W) -> Result<(), MergeError> {
        let mut writer = csv::Writer::from_writer(writer);
        let header: Vec<&str> = KEY_COLUMNS
            .iter()
            .copied()
            .chain(self.columns.iter().map(String::as_str))
            .collect();
        writer.write_record(&header)?;
        for (key, values) in &self.rows {
            let mut record = vec![
                key.time_period.clone(),
                key.path_type.clone(),
                key.origin.to_string(),
                key.destination.to_string(),
            ];
            record.extend(values.iter().map(|v| format_value(*v)));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Merges an observation table into this one.
    ///
    /// Every key present in the observation replaces the corresponding row
    /// wholesale; keys absent from the observation are carried over
    /// unchanged. Columns are unioned (observation columns appended after
    /// existing ones) with missing values defaulting to 0.0.
    pub fn merge_from(&mut self, observation: &SkimTable) {
        let added: Vec<String> = observation
            .columns
            .iter()
            .filter(|c| !self.columns.contains(c))
            .cloned()
            .collect();
        if !added.is_empty() {
            for row in self.rows.values_mut() {
                row.extend(std::iter::repeat_n(0.0, added.len()));
            }
            self.columns.extend(added);
        }

        for (key, values) in &observation.rows {
            let mut row = vec![0.0; self.columns.len()];
            for (column, &value) in observation.columns.iter().zip(values) {
                let position = self
                    .columns
                    .iter()
                    .position(|c| c == column)
                    .expect("observation columns unioned above");
                row[position] = value;
            }
            self.rows.insert(key.clone(), row);
        }
    }
}

/// Merges the table at `source` into `cumulative`, returning the source that
/// was consumed so the caller can track it for staleness.
///
/// # Errors
///
/// [`MergeError::StaleObservation`] when `source` equals the previously
/// consumed source (no new data); [`MergeError::MissingSkims`] when the file
/// does not exist.
pub fn merge_from_source(
    cumulative: &mut SkimTable,
    source: &Path,
    previous_source: Option<&Path>,
) -> Result<PathBuf, MergeError> {
    if previous_source == Some(source) {
        return Err(MergeError::StaleObservation);
    }
    if !source.exists() {
        return Err(MergeError::MissingSkims(source.to_path_buf()));
    }
    let file = std::fs::File::open(source)?;
    let observation = SkimTable::from_csv(file)?;
    cumulative.merge_from(&observation);
    Ok(source.to_path_buf())
}

fn parse_zone(field: &str) -> Result<u32, MergeError> {
    field
        .trim()
        .parse()
        .map_err(|_| MergeError::InvalidRecord(format!("zone id {field:?} is not an integer")))
}

fn parse_value(field: &str) -> Result<f64, MergeError> {
    let field = field.trim();
    if field == INFINITY_TOKEN {
        return Ok(f64::INFINITY);
    }
    if field.is_empty() {
        return Ok(0.0);
    }
    field
        .parse()
        .map_err(|_| MergeError::InvalidRecord(format!("value {field:?} is not a number")))
}

fn format_value(value: f64) -> String {
    if value == f64::INFINITY {
        INFINITY_TOKEN.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(csv: &str) -> SkimTable {
        SkimTable::from_csv(csv.as_bytes()).unwrap()
    }

    #[test]
    fn test_read_with_infinity_sentinel() {
        let t = table(
            "timePeriod,pathType,origin,destination,time,distance\n\
             AM,SOV,1,2,12.5,\u{221e}\n",
        );
        let key = RowKey::new("AM", "SOV", 1, 2);
        assert_eq!(t.value(&key, "time"), Some(12.5));
        assert_eq!(t.value(&key, "distance"), Some(f64::INFINITY));
    }

    #[test]
    fn test_observed_key_replaces_row_others_carry_over() {
        let mut cumulative = table(
            "timePeriod,pathType,origin,destination,time\n\
             AM,SOV,1,2,10.0\n\
             PM,SOV,1,2,20.0\n",
        );
        let observation = table(
            "timePeriod,pathType,origin,destination,time\n\
             AM,SOV,1,2,15.0\n",
        );
        cumulative.merge_from(&observation);

        assert_eq!(
            cumulative.value(&RowKey::new("AM", "SOV", 1, 2), "time"),
            Some(15.0)
        );
        assert_eq!(
            cumulative.value(&RowKey::new("PM", "SOV", 1, 2), "time"),
            Some(20.0)
        );
        assert_eq!(cumulative.len(), 2);
    }

    #[test]
    fn test_column_union_defaults_to_zero() {
        let mut cumulative = table(
            "timePeriod,pathType,origin,destination,time\n\
             AM,SOV,1,2,10.0\n\
             PM,SOV,1,2,20.0\n",
        );
        let observation = table(
            "timePeriod,pathType,origin,destination,time,fare\n\
             AM,SOV,1,2,15.0,2.5\n",
        );
        cumulative.merge_from(&observation);

        assert_eq!(cumulative.columns(), &["time", "fare"]);
        assert_eq!(
            cumulative.value(&RowKey::new("AM", "SOV", 1, 2), "fare"),
            Some(2.5)
        );
        assert_eq!(
            cumulative.value(&RowKey::new("PM", "SOV", 1, 2), "fare"),
            Some(0.0),
            "carried rows default the new column to zero"
        );
    }

    #[test]
    fn test_round_trip_preserves_table() {
        let original = table(
            "timePeriod,pathType,origin,destination,time,distance\n\
             AM,SOV,1,2,10.0,\u{221e}\n\
             MD,HOV,3,4,7.25,1.5\n",
        );
        let mut bytes = Vec::new();
        original.to_csv(&mut bytes).unwrap();
        let reloaded = SkimTable::from_csv(bytes.as_slice()).unwrap();
        assert_eq!(reloaded, original);
    }

    #[test]
    fn test_stale_source_is_rejected() {
        let mut cumulative = SkimTable::new();
        let source = Path::new("/tmp/skims.csv");
        let result = merge_from_source(&mut cumulative, source, Some(source));
        assert!(matches!(result, Err(MergeError::StaleObservation)));
    }

    #[test]
    fn test_missing_source_is_reported() {
        let mut cumulative = SkimTable::new();
        let source = Path::new("/nonexistent/skims.csv");
        let result = merge_from_source(&mut cumulative, source, None);
        assert!(matches!(result, Err(MergeError::MissingSkims(_))));
    }

    #[test]
    fn test_unexpected_key_column_is_rejected() {
        let result = SkimTable::from_csv(
            "period,pathType,origin,destination,time\nAM,SOV,1,2,1.0\n".as_bytes(),
        );
        assert!(result.is_err());
    }
}
