//! # Zone-to-zone skim matrix store
//!
//! Representation, on-disk encodings, and iterative reconciliation of
//! zone-to-zone travel cost matrices ("skims") exchanged between a traffic
//! assignment simulator and the demand models downstream of it.

// Private modules by default
mod cube;
mod zone_index;
pub mod codec;
pub mod merge;

// Pub use for re-export without too many levels of hierarchy.
// The codec and merge modules have enough surface to warrant their own
// namespaces; the core data model is flat.
pub use cube::{CubeError, SkimCube, SkimKey, SkimMatrix};
pub use zone_index::{ZoneIndex, ZoneIndexError};

/// The largest finite value the legacy binary format can store.
///
/// Cells at or above this value represent unreachable/undefined OD pairs
/// and are translated to [`f64::INFINITY`] on load (and back on save).
pub const UNREACHABLE_SENTINEL: f64 = 1.789_569_8e7;
