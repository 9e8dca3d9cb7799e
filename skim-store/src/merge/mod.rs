//! # Iterative skim reconciliation
//!
//! One simulation iteration produces partial, noisy skim observations; these
//! engines fold them into the cumulative store carried across iterations.
//! [`matrix`] is the core matrix-form reconciliation, [`tabular`] the
//! row-oriented variant, and [`origin`] the per-origin ride-hail variant.

pub mod matrix;
pub mod origin;
pub mod tabular;

use std::path::PathBuf;

use thiserror::Error;

use crate::CubeError;

pub use matrix::{MergeReport, PropagationMap, merge_iteration};
pub use origin::OriginSkimStore;
pub use tabular::SkimTable;

#[derive(Debug, Error)]
pub enum MergeError {
    /// Recoverable: callers fall back to the previous cumulative skims.
    #[error("No skim output found at {0}.")]
    MissingSkims(PathBuf),
    /// Non-fatal: the upstream producer has not delivered anything new.
    #[error("The observation source is unchanged since the last merge.")]
    StaleObservation,
    #[error("Malformed record: {0}")]
    InvalidRecord(String),
    #[error(transparent)]
    Cube(#[from] CubeError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How a measure is folded into the cumulative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureClass {
    /// Purely cumulative counter; added, never overwritten.
    Trips,
    /// Purely cumulative counter; added, never overwritten.
    Failures,
    /// Smoothed toward the observation (distance).
    Smoothed,
    /// Overwritten with the observation scaled to demand-model minute units.
    ScaledMinutes,
    /// The designated total in-vehicle time; drives feasibility and carries
    /// the cancellation/penalization rules.
    TotalInVehicleTime,
    /// Seeded once from static base data; never touched by simulation output.
    Toll,
    /// Plain overwrite where trips completed.
    Overwrite,
}

/// Measure classification and the empirically chosen merge constants.
///
/// The numeric defaults are inherited from unit-convention mismatches between
/// the simulator and the demand model and are preserved exactly; they are
/// fields rather than literals so a calibration run can vary them.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    pub trips_measure: String,
    pub failures_measure: String,
    /// Measures smoothed as `factor * (cumulative + observation)`.
    pub smoothed_measures: Vec<String>,
    /// Measures overwritten as `observation * minutes_scale`.
    pub scaled_minute_measures: Vec<String>,
    /// The designated total in-vehicle time measure.
    pub total_ivt_measure: String,
    /// Companion in-vehicle time measure zeroed together with the total.
    pub key_ivt_measure: String,
    /// The wait measure scaled up when a cell is penalized.
    pub wait_measure: String,
    /// Suffix marking toll measures, which are never merged.
    pub toll_suffix: String,

    /// A cell is cancelled when failures exceed this count...
    pub cancel_min_failures: f64,
    /// ...and exceed this multiple of completed trips.
    pub cancel_failure_ratio: f64,
    /// Impossible-OD discovery: aggregate completed trips required.
    pub discovery_min_completed: f64,
    /// Impossible-OD discovery: aggregate failed trips required.
    pub discovery_min_failed: f64,
    /// Walk-access transit sub-paths participating in the discovery pass.
    pub walk_access_modes: Vec<String>,

    pub smoothing_factor: f64,
    pub minutes_scale: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            trips_measure: "trips".into(),
            failures_measure: "failures".into(),
            smoothed_measures: vec!["distance".into()],
            scaled_minute_measures: vec!["wait".into(), "access".into(), "egress".into()],
            total_ivt_measure: "total_ivt".into(),
            key_ivt_measure: "key_ivt".into(),
            wait_measure: "wait".into(),
            toll_suffix: "toll".into(),
            cancel_min_failures: 10.0,
            cancel_failure_ratio: 2.0,
            discovery_min_completed: 50.0,
            discovery_min_failed: 50.0,
            walk_access_modes: vec!["walk_bus".into(), "walk_rail".into()],
            smoothing_factor: 0.5,
            minutes_scale: 100.0,
        }
    }
}

impl MergeConfig {
    /// Dispatches a measure name to its update rule. Toll-suffixed measures
    /// take precedence over every other class.
    pub fn classify(&self, measure: &str) -> MeasureClass {
        if measure.ends_with(&self.toll_suffix) {
            MeasureClass::Toll
        } else if measure == self.trips_measure {
            MeasureClass::Trips
        } else if measure == self.failures_measure {
            MeasureClass::Failures
        } else if measure == self.total_ivt_measure {
            MeasureClass::TotalInVehicleTime
        } else if self.smoothed_measures.iter().any(|m| m == measure) {
            MeasureClass::Smoothed
        } else if self.scaled_minute_measures.iter().any(|m| m == measure) {
            MeasureClass::ScaledMinutes
        } else {
            MeasureClass::Overwrite
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let config = MergeConfig::default();
        assert_eq!(config.classify("trips"), MeasureClass::Trips);
        assert_eq!(config.classify("failures"), MeasureClass::Failures);
        assert_eq!(config.classify("distance"), MeasureClass::Smoothed);
        assert_eq!(config.classify("wait"), MeasureClass::ScaledMinutes);
        assert_eq!(
            config.classify("total_ivt"),
            MeasureClass::TotalInVehicleTime
        );
        assert_eq!(config.classify("cost_toll"), MeasureClass::Toll);
        assert_eq!(config.classify("fare"), MeasureClass::Overwrite);
    }

    #[test]
    fn test_toll_suffix_wins_over_other_classes() {
        let config = MergeConfig::default();
        assert_eq!(config.classify("distance_toll"), MeasureClass::Toll);
    }
}
