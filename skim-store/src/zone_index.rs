use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ZoneIndexError {
    #[error("Zone {0} appears more than once in the zone system.")]
    DuplicateZone(u32),
    #[error("Zone {0} is not part of this zone system.")]
    UnknownZone(u32),
    #[error("Dense indices do not form a contiguous 0-based range.")]
    NonContiguous,
}

/// A bijective mapping between external zone identifiers and dense, 0-based
/// matrix positions.
///
/// Zone order is stable and reversible but carries no meaning beyond the
/// dense index assignment: `zone_at(index_of(z)) == z` for every zone in the
/// system.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ZoneIndex {
    /// Zone IDs in dense-index order.
    zones: Vec<u32>,
    lookup: HashMap<u32, usize>,
}

impl ZoneIndex {
    /// Builds an index from zone IDs, assigning dense indices in iteration
    /// order.
    ///
    /// # Errors
    ///
    /// Fails with [`ZoneIndexError::DuplicateZone`] if any ID repeats.
    pub fn from_ids(ids: impl IntoIterator<Item = u32>) -> Result<Self, ZoneIndexError> {
        let zones: Vec<u32> = ids.into_iter().collect();
        let mut lookup = HashMap::with_capacity(zones.len());
        for (index, &zone) in zones.iter().enumerate() {
            if lookup.insert(zone, index).is_some() {
                return Err(ZoneIndexError::DuplicateZone(zone));
            }
        }
        Ok(Self { zones, lookup })
    }

    /// Builds an index from explicit (zone ID, dense index) pairs, as stored
    /// in the V3 binary zone section.
    ///
    /// # Errors
    ///
    /// Fails if any zone repeats, or if the indices are not a permutation of
    /// `0..pairs.len()`.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (u32, u32)>) -> Result<Self, ZoneIndexError> {
        let pairs: Vec<(u32, u32)> = pairs.into_iter().collect();
        let count = pairs.len();
        let mut zones = vec![None; count];
        let mut lookup = HashMap::with_capacity(count);
        for (zone, index) in pairs {
            let index = index as usize;
            let slot = zones.get_mut(index).ok_or(ZoneIndexError::NonContiguous)?;
            if slot.replace(zone).is_some() {
                return Err(ZoneIndexError::NonContiguous);
            }
            if lookup.insert(zone, index).is_some() {
                return Err(ZoneIndexError::DuplicateZone(zone));
            }
        }
        let zones = zones
            .into_iter()
            .collect::<Option<Vec<u32>>>()
            .ok_or(ZoneIndexError::NonContiguous)?;
        Ok(Self { zones, lookup })
    }

    /// Synthesizes the legacy 1-based contiguous zone system used by binary
    /// files without an explicit zone section: zone `i + 1` maps to index `i`.
    pub fn contiguous(count: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let zones: Vec<u32> = (1..=count as u32).collect();
        let lookup = zones
            .iter()
            .enumerate()
            .map(|(index, &zone)| (zone, index))
            .collect();
        Self { zones, lookup }
    }

    /// The dense index for a zone ID.
    ///
    /// # Errors
    ///
    /// Fails with [`ZoneIndexError::UnknownZone`] if the zone is absent.
    pub fn index_of(&self, zone: u32) -> Result<usize, ZoneIndexError> {
        self.lookup
            .get(&zone)
            .copied()
            .ok_or(ZoneIndexError::UnknownZone(zone))
    }

    /// The zone ID at a dense index, if in range.
    pub fn zone_at(&self, index: usize) -> Option<u32> {
        self.zones.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Zone IDs in dense-index order.
    pub fn zones(&self) -> impl Iterator<Item = u32> + '_ {
        self.zones.iter().copied()
    }

    /// (zone ID, dense index) pairs in dense-index order.
    #[allow(clippy::cast_possible_truncation)]
    pub fn pairs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.zones
            .iter()
            .enumerate()
            .map(|(index, &zone)| (zone, index as u32))
    }
}
