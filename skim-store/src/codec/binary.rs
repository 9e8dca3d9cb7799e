//! # Length-tagged binary skim format
//!
//! The legacy container written by the traffic assignment simulator. A file
//! is a sequence of tagged sections in a fixed order; which sections are
//! present depends on the format version, announced by a chain of 8-byte
//! version tags at the start of the file. Decoding is an explicit state
//! machine over a [`TagReader`]: each step either consumes the section it
//! expects or rewinds and falls through to the older grammar.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

use tracing::warn;

use super::{CodecError, TagMatch, TagReader, TagWriter};
use crate::{SkimCube, SkimKey, SkimMatrix, ZoneIndex};

pub const VERSION_TAG_V1: &[u8; 8] = b"SKIM:V01";
pub const VERSION_TAG_V2: &[u8; 8] = b"SKIM:V02";
pub const VERSION_TAG_V3: &[u8; 8] = b"SKIM:V03";

const TAG_MODE: &[u8; 4] = b"MODE";
const TAG_BZON: &[u8; 4] = b"BZON";
const TAG_EZON: &[u8; 4] = b"EZON";
const TAG_BINT: &[u8; 4] = b"BINT";
const TAG_EINT: &[u8; 4] = b"EINT";
const TAG_BMAT: &[u8; 4] = b"BMAT";
const TAG_EMAT: &[u8; 4] = b"EMAT";

/// Minutes-in-day sentinel bounding the legacy derived interval list.
const MINUTES_IN_DAY: u32 = 1441;

/// The f32 the format stores for unreachable OD pairs.
#[allow(clippy::cast_possible_truncation)]
const SENTINEL_F32: f32 = crate::UNREACHABLE_SENTINEL as f32;

fn decode_cell(raw: f32) -> f64 {
    if raw >= SENTINEL_F32 {
        f64::INFINITY
    } else {
        f64::from(raw)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn encode_cell(value: f64) -> f32 {
    if value.is_finite() && value < crate::UNREACHABLE_SENTINEL {
        value as f32
    } else {
        SENTINEL_F32
    }
}

/// Format versions, in tag-chain order. Each version enables the sections of
/// every version before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FormatVersion {
    /// Untagged legacy layout: a bare (mode count, zone count) pair and a
    /// derived interval list.
    V0,
    V1,
    /// Adds per-interval distance and cost matrices for highway files.
    V2,
    /// Adds the explicit mode count and tagged zone section.
    V3,
}

/// The matrix block grammar of one skim file family.
///
/// Matrix sections are stored interval-major: for each interval, for each
/// mode, for each measure, one `BMAT`/payload/`EMAT` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkimLayout {
    modes: Vec<String>,
    measures: Vec<String>,
}

impl SkimLayout {
    pub fn new(modes: Vec<String>, measures: Vec<String>) -> Self {
        Self { modes, measures }
    }

    pub fn modes(&self) -> &[String] {
        &self.modes
    }

    pub fn measures(&self) -> &[String] {
        &self.measures
    }

    /// Matrix blocks per interval.
    pub fn blocks_per_interval(&self) -> usize {
        self.modes.len() * self.measures.len()
    }
}

/// The two file families the simulator produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkimFamily {
    Highway,
    Transit,
}

/// Fixed ordered mode list for transit files.
pub const TRANSIT_MODES: [&str; 4] = ["walk_bus", "walk_rail", "drive_bus", "drive_rail"];

/// Fixed ordered measure list for transit files.
pub const TRANSIT_MEASURES: [&str; 4] = ["ivt", "wait", "access", "fare"];

impl SkimFamily {
    /// The matrix grammar for this family at a given version.
    pub fn layout(self, version: FormatVersion) -> SkimLayout {
        match self {
            SkimFamily::Highway => {
                let measures = if version >= FormatVersion::V2 {
                    vec!["time".into(), "distance".into(), "cost".into()]
                } else {
                    vec!["time".into()]
                };
                SkimLayout::new(vec!["car".into()], measures)
            }
            SkimFamily::Transit => SkimLayout::new(
                TRANSIT_MODES.iter().map(|&m| m.into()).collect(),
                TRANSIT_MEASURES.iter().map(|&m| m.into()).collect(),
            ),
        }
    }
}

/// A decoded binary skim file: the cube plus the version the file declared.
#[derive(Debug, Clone, PartialEq)]
pub struct BinarySkimFile {
    pub version: FormatVersion,
    pub cube: SkimCube,
}

/// Decodes a binary skim file.
///
/// Truncated matrix payloads are recovered by substituting the previous
/// interval's matrix for the same (mode, measure), with a warning; a
/// mismatched mandatory tag is fatal.
///
/// # Errors
///
/// Fails with [`CodecError::CorruptFormat`] on a mandatory tag mismatch or a
/// truncated non-matrix payload.
pub fn read_cube<R: Read + Seek>(
    reader: R,
    family: SkimFamily,
) -> Result<BinarySkimFile, CodecError> {
    let mut reader = TagReader::new(reader);

    let version = read_version_chain(&mut reader)?;
    let layout = family.layout(version);

    // Explicit mode count, if tagged (V3 always writes it).
    let mut mode_count = None;
    if reader.try_tag(TAG_MODE)? == TagMatch::Matched {
        mode_count = Some(reader.read_u32()? as usize);
    }

    let zones = read_zone_section(&mut reader, &mut mode_count)?;
    if let Some(count) = mode_count
        && count != layout.modes().len()
    {
        warn!(
            declared = count,
            expected = layout.modes().len(),
            "Mode count in file does not match the expected layout"
        );
    }

    let intervals = read_interval_section(&mut reader)?;
    let cube = read_matrix_sections(&mut reader, zones, &intervals, &layout)?;

    Ok(BinarySkimFile { version, cube })
}

/// Encodes a cube, always writing every section tag for the target version
/// so the output re-reads byte-for-byte under the same grammar.
///
/// Matrix blocks follow the family layout in declared order; combinations
/// absent from the cube are written zero-filled.
///
/// # Errors
///
/// Fails only on I/O errors.
pub fn write_cube<W: Write>(
    writer: W,
    cube: &SkimCube,
    family: SkimFamily,
    version: FormatVersion,
) -> Result<(), CodecError> {
    let mut writer = TagWriter::new(writer);
    let layout = family.layout(version);

    if version >= FormatVersion::V1 {
        writer.tag(VERSION_TAG_V1)?;
    }
    if version >= FormatVersion::V2 {
        writer.tag(VERSION_TAG_V2)?;
    }
    if version >= FormatVersion::V3 {
        writer.tag(VERSION_TAG_V3)?;
        writer.tag(TAG_MODE)?;
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32(layout.modes().len() as u32)?;
    }

    writer.tag(TAG_BZON)?;
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32(cube.zone_count() as u32)?;
    for (zone, index) in cube.zones().pairs() {
        writer.write_u32(zone)?;
        writer.write_u32(index)?;
    }
    writer.tag(TAG_EZON)?;

    writer.tag(TAG_BINT)?;
    #[allow(clippy::cast_possible_truncation)]
    writer.write_u32(cube.intervals().len() as u32)?;
    for &interval in cube.intervals() {
        writer.write_u32(interval)?;
    }
    writer.tag(TAG_EINT)?;

    let zeros = SkimMatrix::zeros(cube.zone_count());
    for &interval in cube.intervals() {
        for mode in layout.modes() {
            for measure in layout.measures() {
                let matrix = cube
                    .get(mode, measure, interval)
                    .unwrap_or(&zeros);
                writer.tag(TAG_BMAT)?;
                for &value in matrix.data() {
                    writer.write_f32(encode_cell(value))?;
                }
                writer.tag(TAG_EMAT)?;
            }
        }
    }

    writer.flush()
}

/// Reads a binary skim file from disk.
///
/// # Errors
///
/// See [`read_cube`]; file open errors surface as [`CodecError::Io`].
pub fn open(path: impl AsRef<Path>, family: SkimFamily) -> Result<BinarySkimFile, CodecError> {
    let file = BufReader::new(File::open(path)?);
    read_cube(file, family)
}

/// Writes a binary skim file to disk.
///
/// # Errors
///
/// See [`write_cube`].
pub fn save(
    path: impl AsRef<Path>,
    cube: &SkimCube,
    family: SkimFamily,
    version: FormatVersion,
) -> Result<(), CodecError> {
    let file = BufWriter::new(File::create(path)?);
    write_cube(file, cube, family, version)
}

/// Matches the version tag chain `SKIM:V01` → `SKIM:V02` → `SKIM:V03`.
/// Each successive match raises the version; no tag at all means V0.
fn read_version_chain<R: Read + Seek>(
    reader: &mut TagReader<R>,
) -> Result<FormatVersion, CodecError> {
    let mut version = FormatVersion::V0;
    if reader.try_tag(VERSION_TAG_V1)? == TagMatch::Matched {
        version = FormatVersion::V1;
        if reader.try_tag(VERSION_TAG_V2)? == TagMatch::Matched {
            version = FormatVersion::V2;
            if reader.try_tag(VERSION_TAG_V3)? == TagMatch::Matched {
                version = FormatVersion::V3;
            }
        }
    }
    Ok(version)
}

/// Reads the zone section: either the tagged (zone, index) pair list, or the
/// legacy untagged (mode count, zone count) pair with a synthesized 1-based
/// contiguous zone system.
fn read_zone_section<R: Read + Seek>(
    reader: &mut TagReader<R>,
    mode_count: &mut Option<usize>,
) -> Result<ZoneIndex, CodecError> {
    if reader.try_tag(TAG_BZON)? == TagMatch::Matched {
        let count = reader.read_u32()? as usize;
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let zone = reader.read_u32()?;
            let index = reader.read_u32()?;
            pairs.push((zone, index));
        }
        reader.expect_tag(TAG_EZON)?;
        Ok(ZoneIndex::from_pairs(pairs)?)
    } else {
        let legacy_mode_count = reader.read_u32()? as usize;
        let zone_count = reader.read_u32()? as usize;
        if mode_count.is_none() {
            *mode_count = Some(legacy_mode_count);
        }
        Ok(ZoneIndex::contiguous(zone_count))
    }
}

/// Reads the interval section: either the tagged explicit list, or the
/// legacy single increment from which intervals are derived by repeated
/// addition up to the minutes-in-day sentinel.
fn read_interval_section<R: Read + Seek>(
    reader: &mut TagReader<R>,
) -> Result<Vec<u32>, CodecError> {
    if reader.try_tag(TAG_BINT)? == TagMatch::Matched {
        let count = reader.read_u32()? as usize;
        let mut intervals = Vec::with_capacity(count);
        for _ in 0..count {
            intervals.push(reader.read_u32()?);
        }
        reader.expect_tag(TAG_EINT)?;
        Ok(intervals)
    } else {
        let increment = reader.read_u32()?;
        if increment == 0 {
            return Err(reader.corrupt("interval increment of zero"));
        }
        let mut intervals = Vec::new();
        let mut marker = increment;
        while marker < MINUTES_IN_DAY {
            intervals.push(marker);
            marker += increment;
        }
        Ok(intervals)
    }
}

/// Reads every matrix block in layout order. Once the stream runs short,
/// each remaining matrix is substituted from the previous interval.
fn read_matrix_sections<R: Read + Seek>(
    reader: &mut TagReader<R>,
    zones: ZoneIndex,
    intervals: &[u32],
    layout: &SkimLayout,
) -> Result<SkimCube, CodecError> {
    let size = zones.len();
    let cells = size * size;
    let mut cube = SkimCube::new(zones, intervals.to_vec());
    let mut truncated = false;

    // Matrix blocks follow the file's declared interval order, which is also
    // what "previous interval" means for substitution.
    for (position, &interval) in intervals.iter().enumerate() {
        for mode in layout.modes() {
            for measure in layout.measures() {
                let key = SkimKey::new(mode.clone(), measure.clone(), interval);
                if truncated {
                    substitute_matrix(&mut cube, &key, intervals, position)?;
                    continue;
                }
                match reader.try_tag(TAG_BMAT)? {
                    TagMatch::Matched => {
                        let raw = reader.read_f32_block_partial(cells)?;
                        if raw.len() < cells {
                            warn!(
                                mode,
                                measure,
                                interval,
                                expected = cells,
                                actual = raw.len(),
                                "Truncated matrix payload; substituting previous interval"
                            );
                            truncated = true;
                            substitute_matrix(&mut cube, &key, intervals, position)?;
                        } else {
                            reader.expect_tag(TAG_EMAT)?;
                            let data = raw.into_iter().map(decode_cell).collect();
                            let matrix = SkimMatrix::from_vec(size, data)?;
                            cube.insert(key, matrix)?;
                        }
                    }
                    TagMatch::Eof => {
                        warn!(
                            mode,
                            measure,
                            interval,
                            "Matrix section missing at end of file; substituting previous interval"
                        );
                        truncated = true;
                        substitute_matrix(&mut cube, &key, intervals, position)?;
                    }
                    TagMatch::Mismatch => {
                        return Err(reader.corrupt("expected tag \"BMAT\""));
                    }
                }
            }
        }
    }

    Ok(cube)
}

/// Replaces a damaged matrix with a copy of the previous interval's matrix
/// for the same (mode, measure), or zeros if this is the first interval.
fn substitute_matrix(
    cube: &mut SkimCube,
    key: &SkimKey,
    intervals: &[u32],
    interval_position: usize,
) -> Result<(), CodecError> {
    let replacement = if interval_position > 0 {
        let previous = intervals[interval_position - 1];
        cube.get(&key.mode, &key.measure, previous)
            .cloned()
            .unwrap_or_else(|| SkimMatrix::zeros(cube.zone_count()))
    } else {
        SkimMatrix::zeros(cube.zone_count())
    };
    cube.insert(key.clone(), replacement)?;
    Ok(())
}
