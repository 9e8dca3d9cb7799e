//! # Matrix-form skim reconciliation
//!
//! Folds one iteration's partial matrix observations into the cumulative
//! cube. Updates are count-gated: a cell is only touched where the iteration
//! actually completed trips, so never-observed OD pairs keep their prior
//! value. Each update rule is a named mask/update function over the flat
//! cell buffers.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{MeasureClass, MergeConfig, MergeError};
use crate::{SkimCube, SkimKey, SkimMatrix};

/// Source mode to derived modes needing identical values (e.g. a base auto
/// mode feeding toll/HOV variants sharing the same physical network).
pub type PropagationMap = BTreeMap<String, Vec<String>>;

/// Counts of what one reconciliation call did, for logging and assertions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub updated_cells: usize,
    pub cancelled_ods: usize,
    pub penalized_ods: usize,
    /// ODs zeroed by the impossible-OD discovery pass.
    pub suppressed_ods: usize,
    pub propagated_matrices: usize,
}

/// Reconciles one iteration's observation cube into the cumulative store.
///
/// Per-(mode, interval) update blocks run first, in deterministic key order;
/// cross-mode propagation and the impossible-OD discovery pass run strictly
/// afterwards, over the fully updated store.
///
/// # Errors
///
/// Fails if observation matrices do not match the cumulative zone system.
pub fn merge_iteration(
    cumulative: &mut SkimCube,
    observation: &SkimCube,
    propagation: &PropagationMap,
    config: &MergeConfig,
) -> Result<MergeReport, MergeError> {
    let mut report = MergeReport::default();

    for &interval in observation.intervals() {
        cumulative.add_interval(interval);
    }

    let modes: Vec<String> = observation.modes().into_iter().map(String::from).collect();
    for mode in &modes {
        for &interval in observation.intervals() {
            let has_counts = observation
                .get(mode, &config.trips_measure, interval)
                .is_some()
                && observation
                    .get(mode, &config.failures_measure, interval)
                    .is_some();
            if !has_counts {
                continue;
            }
            merge_block(cumulative, observation, mode, interval, config, &mut report)?;
        }
    }

    propagate_modes(cumulative, propagation, config, &mut report)?;
    suppress_impossible_ods(cumulative, observation, config, &mut report);

    info!(
        updated_cells = report.updated_cells,
        cancelled_ods = report.cancelled_ods,
        penalized_ods = report.penalized_ods,
        suppressed_ods = report.suppressed_ods,
        propagated_matrices = report.propagated_matrices,
        "Merged skim observation into cumulative store"
    );
    Ok(report)
}

/// One (mode, interval) update block.
#[allow(clippy::too_many_lines)]
fn merge_block(
    cumulative: &mut SkimCube,
    observation: &SkimCube,
    mode: &str,
    interval: u32,
    config: &MergeConfig,
    report: &mut MergeReport,
) -> Result<(), MergeError> {
    let completed = observation
        .get(mode, &config.trips_measure, interval)
        .expect("caller checked counts")
        .data()
        .to_vec();
    let failed = observation
        .get(mode, &config.failures_measure, interval)
        .expect("caller checked counts")
        .data()
        .to_vec();

    let measures: Vec<String> = observation
        .keys()
        .filter(|key| key.mode == mode && key.interval == interval)
        .map(|key| key.measure.clone())
        .collect();

    // Wait-time penalty factors are collected during the in-vehicle time
    // rule and applied after every measure's own update has run.
    let mut penalties: Vec<(usize, f64)> = Vec::new();

    for measure in &measures {
        let obs = observation
            .get(mode, measure, interval)
            .expect("measure listed from observation keys")
            .data()
            .to_vec();
        let key = SkimKey::new(mode, measure.clone(), interval);

        match config.classify(measure) {
            MeasureClass::Toll => {}
            MeasureClass::Trips => {
                let cum = cumulative.get_mut_or_zeros(&key)?;
                report.updated_cells += accumulate_where(cum.data_mut(), &obs, &completed);
            }
            MeasureClass::Failures => {
                let cum = cumulative.get_mut_or_zeros(&key)?;
                report.updated_cells += accumulate_where(cum.data_mut(), &obs, &failed);
            }
            MeasureClass::Smoothed => {
                let cum = cumulative.get_mut_or_zeros(&key)?;
                report.updated_cells +=
                    smooth_where(cum.data_mut(), &obs, &completed, config.smoothing_factor);
            }
            MeasureClass::ScaledMinutes => {
                let cum = cumulative.get_mut_or_zeros(&key)?;
                report.updated_cells +=
                    scale_overwrite_where(cum.data_mut(), &obs, &completed, config.minutes_scale);
            }
            MeasureClass::Overwrite => {
                let cum = cumulative.get_mut_or_zeros(&key)?;
                report.updated_cells += overwrite_where(cum.data_mut(), &obs, &completed);
            }
            MeasureClass::TotalInVehicleTime => {
                let companion_key =
                    SkimKey::new(mode, config.key_ivt_measure.clone(), interval);

                // Snapshot the "currently nonzero" condition before mutating.
                let nonzero = nonzero_either(
                    cumulative.get_key(&key),
                    cumulative.get_key(&companion_key),
                    completed.len(),
                );
                let cancel = cancellation_mask(&completed, &failed, &nonzero, config);
                let penalize = penalization_mask(&completed, &failed, &cancel, &nonzero);

                let main = cumulative.get_mut_or_zeros(&key)?.data_mut();
                for i in 0..main.len() {
                    if cancel[i] {
                        main[i] = 0.0;
                        report.cancelled_ods += 1;
                    } else if penalize[i] {
                        // Left as-is; the wait measure takes the penalty.
                        penalties.push((i, (failed[i] + 1.0) / (completed[i] + 1.0)));
                        report.penalized_ods += 1;
                    } else if completed[i] > 0.0 {
                        main[i] = obs[i] * config.minutes_scale;
                        report.updated_cells += 1;
                    }
                }

                let companion = cumulative.get_mut_or_zeros(&companion_key)?.data_mut();
                for i in 0..companion.len() {
                    if cancel[i] {
                        companion[i] = 0.0;
                    }
                }
            }
        }
    }

    if !penalties.is_empty() {
        let wait_key = SkimKey::new(mode, config.wait_measure.clone(), interval);
        let wait = cumulative.get_mut_or_zeros(&wait_key)?.data_mut();
        for &(i, factor) in &penalties {
            wait[i] *= factor;
        }
    }

    debug!(mode, interval, measures = measures.len(), "Merged block");
    Ok(())
}

/// `cumulative += observation` where the gate count is positive.
fn accumulate_where(cumulative: &mut [f64], observation: &[f64], gate: &[f64]) -> usize {
    let mut updated = 0;
    for i in 0..cumulative.len() {
        if gate[i] > 0.0 {
            cumulative[i] += observation[i];
            updated += 1;
        }
    }
    updated
}

/// `cumulative = factor * (cumulative + observation)` where trips completed.
/// With the historical factor of 0.5 this is the iteration-noise damping
/// average.
fn smooth_where(cumulative: &mut [f64], observation: &[f64], gate: &[f64], factor: f64) -> usize {
    let mut updated = 0;
    for i in 0..cumulative.len() {
        if gate[i] > 0.0 {
            cumulative[i] = factor * (cumulative[i] + observation[i]);
            updated += 1;
        }
    }
    updated
}

/// `cumulative = observation * scale` where trips completed.
fn scale_overwrite_where(
    cumulative: &mut [f64],
    observation: &[f64],
    gate: &[f64],
    scale: f64,
) -> usize {
    let mut updated = 0;
    for i in 0..cumulative.len() {
        if gate[i] > 0.0 {
            cumulative[i] = observation[i] * scale;
            updated += 1;
        }
    }
    updated
}

/// `cumulative = observation` where trips completed.
fn overwrite_where(cumulative: &mut [f64], observation: &[f64], gate: &[f64]) -> usize {
    let mut updated = 0;
    for i in 0..cumulative.len() {
        if gate[i] > 0.0 {
            cumulative[i] = observation[i];
            updated += 1;
        }
    }
    updated
}

/// Per-cell "the cumulative in-vehicle time or its companion is nonzero".
fn nonzero_either(
    main: Option<&SkimMatrix>,
    companion: Option<&SkimMatrix>,
    cells: usize,
) -> Vec<bool> {
    (0..cells)
        .map(|i| {
            main.is_some_and(|m| m.data()[i] != 0.0)
                || companion.is_some_and(|m| m.data()[i] != 0.0)
        })
        .collect()
}

/// The OD pair is marked impossible: failures exceed the minimum count, and
/// exceed the configured multiple of completed trips, at a cell that
/// currently has an in-vehicle time.
fn cancellation_mask(
    completed: &[f64],
    failed: &[f64],
    nonzero: &[bool],
    config: &MergeConfig,
) -> Vec<bool> {
    (0..completed.len())
        .map(|i| {
            failed[i] > config.cancel_min_failures
                && failed[i] > config.cancel_failure_ratio * completed[i]
                && nonzero[i]
        })
        .collect()
}

/// Unreliable but not impossible: more failures than completions, below the
/// cancellation threshold, at a cell with an in-vehicle time.
fn penalization_mask(
    completed: &[f64],
    failed: &[f64],
    cancel: &[bool],
    nonzero: &[bool],
) -> Vec<bool> {
    (0..completed.len())
        .map(|i| failed[i] > completed[i] && !cancel[i] && nonzero[i])
        .collect()
}

/// Copies every non-toll measure matrix of each source mode verbatim into
/// its derived modes. Derived modes share the source's physical skim and
/// differ only in toll application.
fn propagate_modes(
    cumulative: &mut SkimCube,
    propagation: &PropagationMap,
    config: &MergeConfig,
    report: &mut MergeReport,
) -> Result<(), MergeError> {
    for (source, derived_modes) in propagation {
        let source_matrices: Vec<(SkimKey, SkimMatrix)> = cumulative
            .iter()
            .filter(|(key, _)| {
                key.mode == *source && config.classify(&key.measure) != MeasureClass::Toll
            })
            .map(|(key, matrix)| (key.clone(), matrix.clone()))
            .collect();
        for derived in derived_modes {
            for (key, matrix) in &source_matrices {
                cumulative.insert(
                    SkimKey::new(derived, key.measure.clone(), key.interval),
                    matrix.clone(),
                )?;
                report.propagated_matrices += 1;
            }
        }
    }
    Ok(())
}

/// The impossible-OD discovery pass (transit-only).
///
/// Where the walk-access sub-paths collectively saw plenty of traffic at a
/// cell but one sub-path completed nothing there, that sub-path's
/// in-vehicle time is zeroed: a statistical-significance threshold keeping a
/// single bad observation from holding a dead route alive.
fn suppress_impossible_ods(
    cumulative: &mut SkimCube,
    observation: &SkimCube,
    config: &MergeConfig,
    report: &mut MergeReport,
) {
    let cells = cumulative.zone_count() * cumulative.zone_count();
    for &interval in observation.intervals() {
        let mut aggregate_completed = vec![0.0; cells];
        let mut aggregate_failed = vec![0.0; cells];
        for mode in &config.walk_access_modes {
            if let Some(trips) = observation.get(mode, &config.trips_measure, interval) {
                for (total, &value) in aggregate_completed.iter_mut().zip(trips.data()) {
                    *total += value;
                }
            }
            if let Some(failures) = observation.get(mode, &config.failures_measure, interval) {
                for (total, &value) in aggregate_failed.iter_mut().zip(failures.data()) {
                    *total += value;
                }
            }
        }

        for mode in &config.walk_access_modes {
            let Some(own_completed) = observation.get(mode, &config.trips_measure, interval)
            else {
                continue;
            };
            let own_completed = own_completed.data().to_vec();
            let ivt_key = SkimKey::new(mode, config.total_ivt_measure.clone(), interval);
            let Some(ivt) = cumulative.get_mut(&ivt_key) else {
                continue;
            };
            let ivt = ivt.data_mut();
            for i in 0..cells {
                if own_completed[i] == 0.0
                    && aggregate_completed[i] > config.discovery_min_completed
                    && aggregate_failed[i] > config.discovery_min_failed
                    && ivt[i] != 0.0
                {
                    ivt[i] = 0.0;
                    report.suppressed_ods += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ZoneIndex;

    const N: usize = 2;

    fn cube_with(matrices: &[(&str, &str, f64)]) -> SkimCube {
        let zones = ZoneIndex::from_ids([1, 2]).unwrap();
        let mut cube = SkimCube::new(zones, vec![360]);
        for &(mode, measure, value) in matrices {
            let mut matrix = SkimMatrix::zeros(N);
            matrix.fill(value);
            cube.insert(SkimKey::new(mode, measure, 360), matrix)
                .unwrap();
        }
        cube
    }

    fn empty_cube() -> SkimCube {
        let zones = ZoneIndex::from_ids([1, 2]).unwrap();
        SkimCube::new(zones, vec![360])
    }

    #[test]
    fn test_additive_idempotence_doubles_trips() {
        let observation = cube_with(&[("car", "trips", 3.0), ("car", "failures", 1.0)]);
        let mut cumulative = empty_cube();
        let config = MergeConfig::default();
        merge_iteration(&mut cumulative, &observation, &PropagationMap::new(), &config).unwrap();
        merge_iteration(&mut cumulative, &observation, &PropagationMap::new(), &config).unwrap();

        let trips = cumulative.get("car", "trips", 360).unwrap();
        assert_eq!(trips.get(0, 0), 6.0);
        let failures = cumulative.get("car", "failures", 360).unwrap();
        assert_eq!(failures.get(1, 1), 2.0);
    }

    #[test]
    fn test_unobserved_cells_keep_prior_value() {
        let mut observation = cube_with(&[("car", "failures", 0.0)]);
        let mut trips = SkimMatrix::zeros(N);
        trips.set(0, 0, 5.0); // only one cell observed
        observation
            .insert(SkimKey::new("car", "trips", 360), trips)
            .unwrap();
        let mut time = SkimMatrix::zeros(N);
        time.set(0, 0, 11.0);
        time.set(0, 1, 22.0);
        observation
            .insert(SkimKey::new("car", "time", 360), time)
            .unwrap();

        let mut cumulative = cube_with(&[("car", "time", 99.0)]);
        merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();

        let time = cumulative.get("car", "time", 360).unwrap();
        assert_eq!(time.get(0, 0), 11.0, "observed cell overwritten");
        assert_eq!(time.get(0, 1), 99.0, "unobserved cell untouched");
    }

    #[test]
    fn test_distance_is_smoothed() {
        let observation = cube_with(&[
            ("car", "trips", 1.0),
            ("car", "failures", 0.0),
            ("car", "distance", 10.0),
        ]);
        let mut cumulative = cube_with(&[("car", "distance", 30.0)]);
        merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();
        assert_eq!(
            cumulative.get("car", "distance", 360).unwrap().get(0, 0),
            20.0
        );
    }

    #[test]
    fn test_wait_is_scaled_to_minute_units() {
        let observation = cube_with(&[
            ("car", "trips", 1.0),
            ("car", "failures", 0.0),
            ("car", "wait", 2.5),
        ]);
        let mut cumulative = empty_cube();
        merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();
        assert_eq!(cumulative.get("car", "wait", 360).unwrap().get(0, 0), 250.0);
    }

    #[test]
    fn test_toll_measures_are_never_merged() {
        let observation = cube_with(&[
            ("car", "trips", 1.0),
            ("car", "failures", 0.0),
            ("car", "cost_toll", 7.0),
        ]);
        let mut cumulative = cube_with(&[("car", "cost_toll", 3.0)]);
        merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();
        assert_eq!(
            cumulative.get("car", "cost_toll", 360).unwrap().get(0, 0),
            3.0
        );
    }

    #[test]
    fn test_impossible_od_is_cancelled() {
        // completed=0, failed=20 at every cell; existing nonzero IVT.
        let observation = cube_with(&[
            ("walk_bus", "trips", 0.0),
            ("walk_bus", "failures", 20.0),
            ("walk_bus", "total_ivt", 5.0),
        ]);
        let mut cumulative = cube_with(&[
            ("walk_bus", "total_ivt", 44.0),
            ("walk_bus", "key_ivt", 12.0),
        ]);
        let report = merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();

        assert_eq!(
            cumulative.get("walk_bus", "total_ivt", 360).unwrap().get(0, 1),
            0.0
        );
        assert_eq!(
            cumulative.get("walk_bus", "key_ivt", 360).unwrap().get(0, 1),
            0.0
        );
        assert_eq!(report.cancelled_ods, N * N);
    }

    #[test]
    fn test_borderline_failures_do_not_cancel() {
        // failed=10 does not exceed the threshold of 10.
        let observation = cube_with(&[
            ("walk_bus", "trips", 0.0),
            ("walk_bus", "failures", 10.0),
            ("walk_bus", "total_ivt", 5.0),
        ]);
        let mut cumulative = cube_with(&[("walk_bus", "total_ivt", 44.0)]);
        merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();
        assert_eq!(
            cumulative.get("walk_bus", "total_ivt", 360).unwrap().get(0, 0),
            44.0,
            "penalized, not cancelled: in-vehicle time left as-is"
        );
    }

    #[test]
    fn test_penalization_scales_wait() {
        // completed=5, failed=8: below the cancel threshold, above the
        // penalize threshold; wait scaled by (8+1)/(5+1) = 1.5.
        let observation = cube_with(&[
            ("walk_bus", "trips", 5.0),
            ("walk_bus", "failures", 8.0),
            ("walk_bus", "total_ivt", 9.0),
            ("walk_bus", "wait", 2.0),
        ]);
        let mut cumulative = cube_with(&[("walk_bus", "total_ivt", 44.0)]);
        let report = merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();

        // Wait's own update ran first (2.0 * 100), then the penalty.
        assert_eq!(
            cumulative.get("walk_bus", "wait", 360).unwrap().get(0, 0),
            2.0 * 100.0 * 1.5
        );
        assert_eq!(
            cumulative.get("walk_bus", "total_ivt", 360).unwrap().get(0, 0),
            44.0,
            "penalized cells keep their in-vehicle time"
        );
        assert_eq!(report.penalized_ods, N * N);
    }

    #[test]
    fn test_propagation_copies_non_toll_measures() {
        let observation = cube_with(&[
            ("car", "trips", 2.0),
            ("car", "failures", 0.0),
            ("car", "time", 17.0),
            ("car", "cost_toll", 4.0),
        ]);
        let mut cumulative = empty_cube();
        let propagation: PropagationMap =
            [("car".to_string(), vec!["car_toll".to_string()])].into();
        merge_iteration(
            &mut cumulative,
            &observation,
            &propagation,
            &MergeConfig::default(),
        )
        .unwrap();

        assert_eq!(
            cumulative.get("car_toll", "time", 360),
            cumulative.get("car", "time", 360),
        );
        assert_eq!(
            cumulative.get("car_toll", "trips", 360),
            cumulative.get("car", "trips", 360),
        );
        assert!(
            cumulative.get("car_toll", "cost_toll", 360).is_none(),
            "toll measures are not propagated"
        );
    }

    #[test]
    fn test_discovery_pass_zeroes_dead_subpath() {
        let zones = ZoneIndex::from_ids([1, 2]).unwrap();
        let mut observation = SkimCube::new(zones, vec![360]);
        // walk_bus saw nothing at (0, 1); walk_rail saw heavy traffic there.
        let mut bus_trips = SkimMatrix::zeros(N);
        bus_trips.set(0, 0, 5.0);
        let mut rail_trips = SkimMatrix::zeros(N);
        rail_trips.set(0, 1, 60.0);
        let mut rail_failures = SkimMatrix::zeros(N);
        rail_failures.set(0, 1, 60.0);
        observation
            .insert(SkimKey::new("walk_bus", "trips", 360), bus_trips)
            .unwrap();
        observation
            .insert(SkimKey::new("walk_bus", "failures", 360), SkimMatrix::zeros(N))
            .unwrap();
        observation
            .insert(SkimKey::new("walk_rail", "trips", 360), rail_trips)
            .unwrap();
        observation
            .insert(SkimKey::new("walk_rail", "failures", 360), rail_failures)
            .unwrap();

        let mut cumulative = cube_with(&[("walk_bus", "total_ivt", 30.0)]);
        let report = merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();

        let ivt = cumulative.get("walk_bus", "total_ivt", 360).unwrap();
        assert_eq!(ivt.get(0, 1), 0.0, "dead sub-path cell suppressed");
        assert_eq!(ivt.get(0, 0), 30.0, "observed cell untouched");
        assert_eq!(report.suppressed_ods, 1);
    }

    #[test]
    fn test_observation_interval_is_declared_in_cumulative() {
        let observation = cube_with(&[("car", "trips", 1.0), ("car", "failures", 0.0)]);
        let zones = ZoneIndex::from_ids([1, 2]).unwrap();
        let mut cumulative = SkimCube::new(zones, vec![720]);
        merge_iteration(
            &mut cumulative,
            &observation,
            &PropagationMap::new(),
            &MergeConfig::default(),
        )
        .unwrap();
        assert_eq!(cumulative.intervals(), &[360, 720]);
    }
}
