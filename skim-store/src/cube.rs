use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use thiserror::Error;

use crate::ZoneIndex;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CubeError {
    #[error("Matrix has {actual} cells but the zone system requires {expected}.")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Interval {0} is not declared in this cube.")]
    UndeclaredInterval(u32),
}

/// A square zone-to-zone matrix of one travel cost measure.
///
/// Values are stored row-major and indexed `[origin_index, destination_index]`
/// using dense [`ZoneIndex`] positions.
#[derive(Debug, Clone, PartialEq)]
pub struct SkimMatrix {
    size: usize,
    data: Vec<f64>,
}

impl SkimMatrix {
    pub fn zeros(size: usize) -> Self {
        Self {
            size,
            data: vec![0.0; size * size],
        }
    }

    /// Wraps a row-major value vector.
    ///
    /// # Errors
    ///
    /// Fails if the vector does not hold exactly `size * size` values.
    pub fn from_vec(size: usize, data: Vec<f64>) -> Result<Self, CubeError> {
        if data.len() != size * size {
            return Err(CubeError::DimensionMismatch {
                expected: size * size,
                actual: data.len(),
            });
        }
        Ok(Self { size, data })
    }

    /// The zone count (the matrix is `size × size`).
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn get(&self, origin: usize, destination: usize) -> f64 {
        self.data[origin * self.size + destination]
    }

    #[inline]
    pub fn set(&mut self, origin: usize, destination: usize, value: f64) {
        self.data[origin * self.size + destination] = value;
    }

    /// The flat row-major cell buffer. Mask-style passes operate on this
    /// directly rather than indexing cell by cell.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }
}

/// The composite key of one matrix within a cube.
///
/// This flattens the historical mode → interval → measure nesting into a
/// single tuple-like struct so the key space is uniform across highway and
/// transit skims.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SkimKey {
    /// Path/mode identifier (e.g. a drive-alone or walk-to-bus path).
    pub mode: String,
    /// Measure identifier (travel time, distance, wait, fare, ...).
    pub measure: String,
    /// Time interval end marker.
    pub interval: u32,
}

impl SkimKey {
    pub fn new(mode: impl Into<String>, measure: impl Into<String>, interval: u32) -> Self {
        Self {
            mode: mode.into(),
            measure: measure.into(),
            interval,
        }
    }
}

impl Display for SkimKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}_{}", self.mode, self.interval, self.measure)
    }
}

/// A collection of skim matrices sharing one zone system and one declared
/// interval set.
///
/// Every matrix is keyed by a [`SkimKey`]; missing (mode, measure, interval)
/// combinations are simply absent. Iteration order over keys is
/// deterministic.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SkimCube {
    zones: ZoneIndex,
    intervals: Vec<u32>,
    matrices: BTreeMap<SkimKey, SkimMatrix>,
}

impl SkimCube {
    /// Creates an empty cube over a zone system and interval set.
    /// Intervals are sorted and deduplicated.
    pub fn new(zones: ZoneIndex, mut intervals: Vec<u32>) -> Self {
        intervals.sort_unstable();
        intervals.dedup();
        Self {
            zones,
            intervals,
            matrices: BTreeMap::new(),
        }
    }

    pub fn zones(&self) -> &ZoneIndex {
        &self.zones
    }

    pub fn zone_count(&self) -> usize {
        self.zones.len()
    }

    /// Declared interval end markers, sorted ascending.
    pub fn intervals(&self) -> &[u32] {
        &self.intervals
    }

    /// Inserts a matrix under a key.
    ///
    /// # Errors
    ///
    /// Fails if the matrix size does not match the zone system or the key
    /// references an undeclared interval.
    pub fn insert(&mut self, key: SkimKey, matrix: SkimMatrix) -> Result<(), CubeError> {
        if matrix.size() != self.zones.len() {
            return Err(CubeError::DimensionMismatch {
                expected: self.zones.len() * self.zones.len(),
                actual: matrix.size() * matrix.size(),
            });
        }
        if !self.intervals.contains(&key.interval) {
            return Err(CubeError::UndeclaredInterval(key.interval));
        }
        self.matrices.insert(key, matrix);
        Ok(())
    }

    pub fn get(&self, mode: &str, measure: &str, interval: u32) -> Option<&SkimMatrix> {
        self.matrices.get(&SkimKey::new(mode, measure, interval))
    }

    pub fn get_key(&self, key: &SkimKey) -> Option<&SkimMatrix> {
        self.matrices.get(key)
    }

    pub fn get_mut(&mut self, key: &SkimKey) -> Option<&mut SkimMatrix> {
        self.matrices.get_mut(key)
    }

    /// Returns a mutable reference to the matrix under `key`, inserting a
    /// zero-filled matrix first if absent.
    ///
    /// # Errors
    ///
    /// Fails if the key references an undeclared interval.
    pub fn get_mut_or_zeros(&mut self, key: &SkimKey) -> Result<&mut SkimMatrix, CubeError> {
        if !self.matrices.contains_key(key) {
            let zeros = SkimMatrix::zeros(self.zones.len());
            self.insert(key.clone(), zeros)?;
        }
        Ok(self
            .matrices
            .get_mut(key)
            .expect("matrix inserted just above"))
    }

    pub fn contains(&self, key: &SkimKey) -> bool {
        self.matrices.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &SkimKey> {
        self.matrices.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SkimKey, &SkimMatrix)> {
        self.matrices.iter()
    }

    pub fn len(&self) -> usize {
        self.matrices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrices.is_empty()
    }

    /// Unique mode identifiers, sorted.
    pub fn modes(&self) -> Vec<&str> {
        let mut modes: Vec<&str> = self.matrices.keys().map(|k| k.mode.as_str()).collect();
        modes.dedup();
        modes
    }

    /// Unique measure identifiers under one mode, sorted.
    pub fn measures_for(&self, mode: &str) -> Vec<&str> {
        let mut measures: Vec<&str> = self
            .matrices
            .keys()
            .filter(|k| k.mode == mode)
            .map(|k| k.measure.as_str())
            .collect();
        measures.sort_unstable();
        measures.dedup();
        measures
    }

    /// Declares an additional interval. Existing matrices are untouched.
    pub fn add_interval(&mut self, interval: u32) {
        if let Err(position) = self.intervals.binary_search(&interval) {
            self.intervals.insert(position, interval);
        }
    }

    /// Removes an interval and drops every matrix keyed on it.
    pub fn remove_interval(&mut self, interval: u32) {
        self.intervals.retain(|&i| i != interval);
        self.matrices.retain(|key, _| key.interval != interval);
    }
}
