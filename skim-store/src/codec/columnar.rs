//! # Columnar skim interchange container
//!
//! A self-describing container of named 2-D float64 datasets with a root
//! attribute table and a named zone-to-index mapping. Unlike the legacy
//! binary layout, every dataset carries its (timeperiod, mode, metric)
//! attributes, so the file can be scanned and regrouped without knowing the
//! producing simulator's matrix order.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use itertools::Itertools;
use tracing::debug;

use super::{CodecError, TagReader, TagWriter};
use crate::{SkimCube, SkimKey, SkimMatrix, UNREACHABLE_SENTINEL, ZoneIndex};

const MAGIC: &[u8; 8] = b"SKIMCOL1";
const TAG_ATTRIBUTES: &[u8; 4] = b"CATT";
const TAG_ZONE_MAP: &[u8; 4] = b"ZMAP";
const TAG_DATASET: &[u8; 4] = b"DSET";

/// The key the zone mapping dataset is stored under.
const ZONE_MAPPING_NAME: &str = "taz";

/// Decodes a columnar skim container into a cube.
///
/// Every dataset is scanned and grouped by its (timeperiod, mode, metric)
/// attributes. For each (mode, metric) group, all intervals declared in the
/// root attributes must be present.
///
/// # Errors
///
/// Fails with [`CodecError::CorruptFormat`] on structural damage and
/// [`CodecError::MissingMatrix`] when a declared combination is absent.
pub fn read_cube<R: Read + Seek>(reader: R) -> Result<SkimCube, CodecError> {
    let mut reader = TagReader::new(reader);
    reader.expect_tag(MAGIC)?;

    // Root attribute table: interval count + the full sorted interval list.
    reader.expect_tag(TAG_ATTRIBUTES)?;
    let interval_count = reader.read_u32()? as usize;
    let mut intervals = Vec::with_capacity(interval_count);
    for _ in 0..interval_count {
        let marker = reader.read_f32()?;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        intervals.push(marker.round() as u32);
    }

    // Zone mapping dataset.
    reader.expect_tag(TAG_ZONE_MAP)?;
    let mapping_name = reader.read_string()?;
    if mapping_name != ZONE_MAPPING_NAME {
        return Err(reader.corrupt(format!(
            "zone mapping is keyed {mapping_name:?}, expected {ZONE_MAPPING_NAME:?}"
        )));
    }
    let zone_count = reader.read_u32()? as usize;
    let mut pairs = Vec::with_capacity(zone_count);
    for _ in 0..zone_count {
        let zone = reader.read_u32()?;
        let index = reader.read_u32()?;
        pairs.push((zone, index));
    }
    let zones = ZoneIndex::from_pairs(pairs)?;
    let cells = zones.len() * zones.len();

    let mut cube = SkimCube::new(zones, intervals.clone());

    let dataset_count = reader.read_u32()? as usize;
    for _ in 0..dataset_count {
        reader.expect_tag(TAG_DATASET)?;
        let name = reader.read_string()?;
        let timeperiod = reader.read_string()?;
        let mode = reader.read_string()?;
        let metric = reader.read_string()?;
        let interval: u32 = timeperiod.parse().map_err(|_| {
            reader.corrupt(format!(
                "dataset {name:?} has non-numeric timeperiod {timeperiod:?}"
            ))
        })?;

        let mut data = Vec::with_capacity(cells);
        for _ in 0..cells {
            let value = reader.read_f64()?;
            data.push(if value >= UNREACHABLE_SENTINEL {
                f64::INFINITY
            } else {
                value
            });
        }
        let matrix = SkimMatrix::from_vec(cube.zone_count(), data)?;
        cube.insert(SkimKey::new(mode, metric, interval), matrix)?;
    }

    validate_presence(&cube, &intervals)?;
    debug!(
        matrices = cube.len(),
        zones = cube.zone_count(),
        "Loaded columnar skim container"
    );
    Ok(cube)
}

/// Every (mode, metric) group must cover the full declared interval list.
fn validate_presence(cube: &SkimCube, intervals: &[u32]) -> Result<(), CodecError> {
    let groups: BTreeSet<(&str, &str)> = cube
        .keys()
        .map(|key| (key.mode.as_str(), key.measure.as_str()))
        .collect();
    for (mode, metric) in groups {
        for &interval in intervals {
            if cube.get(mode, metric, interval).is_none() {
                return Err(CodecError::MissingMatrix(dataset_name(
                    mode, interval, metric,
                )));
            }
        }
    }
    Ok(())
}

/// Encodes a cube. Datasets are written for every (metric x mode x interval)
/// combination in declared order; combinations absent from the cube are
/// zero-filled so the container always carries the complete grid.
///
/// # Errors
///
/// Fails only on I/O errors.
pub fn write_cube<W: Write>(writer: W, cube: &SkimCube) -> Result<(), CodecError> {
    let mut writer = TagWriter::new(writer);
    writer.tag(MAGIC)?;

    writer.tag(TAG_ATTRIBUTES)?;
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32(cube.intervals().len() as u32)?;
    for &interval in cube.intervals() {
        #[allow(clippy::cast_precision_loss)]
        writer.write_f32(interval as f32)?;
    }

    writer.tag(TAG_ZONE_MAP)?;
    writer.write_string(ZONE_MAPPING_NAME)?;
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32(cube.zone_count() as u32)?;
    for (zone, index) in cube.zones().pairs() {
        writer.write_u32(zone)?;
        writer.write_u32(index)?;
    }

    let modes: Vec<String> = cube.modes().into_iter().map(String::from).collect();
    let metrics: Vec<String> = cube
        .keys()
        .map(|key| key.measure.clone())
        .unique()
        .sorted()
        .collect();

    let combinations = metrics.len() * modes.len() * cube.intervals().len();
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32(combinations as u32)?;

    let zeros = SkimMatrix::zeros(cube.zone_count());
    for metric in &metrics {
        for mode in &modes {
            for &interval in cube.intervals() {
                let matrix = cube.get(mode, metric, interval).unwrap_or(&zeros);
                writer.tag(TAG_DATASET)?;
                writer.write_string(&dataset_name(mode, interval, metric))?;
                writer.write_string(&interval.to_string())?;
                writer.write_string(mode)?;
                writer.write_string(metric)?;
                for &value in matrix.data() {
                    let stored = if value.is_finite() && value < UNREACHABLE_SENTINEL {
                        value
                    } else {
                        UNREACHABLE_SENTINEL
                    };
                    writer.write_f64(stored)?;
                }
            }
        }
    }

    writer.flush()
}

/// Reads a columnar skim container from disk.
///
/// # Errors
///
/// See [`read_cube`]; file open errors surface as [`CodecError::Io`].
pub fn open(path: impl AsRef<Path>) -> Result<SkimCube, CodecError> {
    let file = BufReader::new(File::open(path)?);
    read_cube(file)
}

/// Writes a columnar skim container to disk.
///
/// # Errors
///
/// See [`write_cube`].
pub fn save(path: impl AsRef<Path>, cube: &SkimCube) -> Result<(), CodecError> {
    let file = BufWriter::new(File::create(path)?);
    write_cube(file, cube)
}

/// `"{mode}_{interval}_{metric}"`, the dataset naming convention shared with
/// the demand models reading the container.
pub fn dataset_name(mode: &str, interval: u32, metric: &str) -> String {
    format!("{mode}_{interval}_{metric}")
}
