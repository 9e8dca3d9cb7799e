//! # Per-origin ride-hail skim reconciliation
//!
//! Ride-hail wait times and costs are observed per origin zone rather than
//! per OD pair. Hourly rows are bucketed into the five demand-model time
//! periods and aggregated per (period, reservation type, origin) before
//! being blended into the cumulative per-origin store.

use std::collections::BTreeMap;
use std::io::Read;

use serde::Deserialize;
use tracing::debug;

use super::MergeError;

/// Fallback emitted for groups with zero completed requests, so downstream
/// models never see a NaN.
const FALLBACK_WAIT_MINUTES: f64 = 6.0;
const FALLBACK_COST_PER_MILE: f64 = 5.0;

/// Trip and failure counts blend 50/50 with the previous iteration.
const COUNT_BLEND: f64 = 0.5;

/// One row of the ride-hail observation CSV.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RideHailObservation {
    #[serde(rename = "tazId")]
    pub taz_id: u32,
    pub hour: u32,
    #[serde(rename = "reservationType")]
    pub reservation_type: String,
    #[serde(rename = "waitTime")]
    pub wait_time: f64,
    #[serde(rename = "costPerMile")]
    pub cost_per_mile: f64,
    /// Fraction of requests that went unmatched, in `[0, 1]`.
    #[serde(rename = "unmatchedRequestsPercent")]
    pub unmatched_requests_percent: f64,
    pub observations: f64,
    pub iterations: f64,
}

/// The five demand-model time-of-day buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeBucket {
    EarlyMorning,
    AmPeak,
    Midday,
    PmPeak,
    Evening,
}

impl TimeBucket {
    /// Maps an hour-of-day to its bucket. Hours past midnight fold into the
    /// evening bucket.
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..3 => TimeBucket::Evening,
            3..6 => TimeBucket::EarlyMorning,
            6..10 => TimeBucket::AmPeak,
            10..15 => TimeBucket::Midday,
            15..19 => TimeBucket::PmPeak,
            _ => TimeBucket::Evening,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OriginGroupKey {
    pub period: TimeBucket,
    pub reservation_type: String,
    pub origin: u32,
}

/// Aggregated observation for one (period, reservation type, origin) group.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginAggregate {
    /// Mean wait time, weighted by completed requests.
    pub wait_time: f64,
    /// Mean cost per mile, weighted by completed requests.
    pub cost_per_mile: f64,
    /// `1 - completed / observations`.
    pub unmatched_share: f64,
    pub completed: f64,
    pub observations: f64,
}

/// Groups hourly rows by (period, reservation type, origin) and aggregates
/// them, weighting by completed requests. Groups with zero completed
/// requests get the fixed fallback values.
pub fn aggregate(rows: &[RideHailObservation]) -> BTreeMap<OriginGroupKey, OriginAggregate> {
    struct Accumulator {
        wait_weighted: f64,
        cost_weighted: f64,
        completed: f64,
        observations: f64,
    }

    let mut groups: BTreeMap<OriginGroupKey, Accumulator> = BTreeMap::new();
    for row in rows {
        let key = OriginGroupKey {
            period: TimeBucket::from_hour(row.hour),
            reservation_type: row.reservation_type.clone(),
            origin: row.taz_id,
        };
        let completed = row.observations * (1.0 - row.unmatched_requests_percent);
        let entry = groups.entry(key).or_insert(Accumulator {
            wait_weighted: 0.0,
            cost_weighted: 0.0,
            completed: 0.0,
            observations: 0.0,
        });
        entry.wait_weighted += row.wait_time * completed;
        entry.cost_weighted += row.cost_per_mile * completed;
        entry.completed += completed;
        entry.observations += row.observations;
    }

    groups
        .into_iter()
        .map(|(key, acc)| {
            let aggregate = if acc.completed > 0.0 {
                OriginAggregate {
                    wait_time: acc.wait_weighted / acc.completed,
                    cost_per_mile: acc.cost_weighted / acc.completed,
                    unmatched_share: 1.0 - acc.completed / acc.observations,
                    completed: acc.completed,
                    observations: acc.observations,
                }
            } else {
                OriginAggregate {
                    wait_time: FALLBACK_WAIT_MINUTES,
                    cost_per_mile: FALLBACK_COST_PER_MILE,
                    unmatched_share: 1.0,
                    completed: 0.0,
                    observations: acc.observations,
                }
            };
            (key, aggregate)
        })
        .collect()
}

/// The cumulative per-origin row carried across iterations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OriginSkimRow {
    pub wait_time: f64,
    pub cost_per_mile: f64,
    pub unmatched_share: f64,
    pub trips: f64,
    pub failures: f64,
    /// `failures / (trips + failures)`, 0.0 when nothing was requested.
    pub rejection_probability: f64,
}

/// The cumulative per-origin skim store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OriginSkimStore {
    rows: BTreeMap<OriginGroupKey, OriginSkimRow>,
}

impl OriginSkimStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &OriginGroupKey) -> Option<&OriginSkimRow> {
        self.rows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OriginGroupKey, &OriginSkimRow)> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Folds one iteration's observation rows into the store.
    ///
    /// Wait, cost, and unmatched share take the new aggregate; trip and
    /// failure counts blend 50/50 with the previous iteration, and the
    /// rejection probability is re-derived from the blended counts.
    pub fn merge_observations(&mut self, observations: &[RideHailObservation]) {
        let aggregates = aggregate(observations);
        debug!(groups = aggregates.len(), "Merging ride-hail observations");
        for (key, aggregate) in aggregates {
            let row = self.rows.entry(key).or_default();
            let failed = aggregate.observations - aggregate.completed;
            row.trips = COUNT_BLEND * (row.trips + aggregate.completed);
            row.failures = COUNT_BLEND * (row.failures + failed);
            row.wait_time = aggregate.wait_time;
            row.cost_per_mile = aggregate.cost_per_mile;
            row.unmatched_share = aggregate.unmatched_share;
            let requested = row.trips + row.failures;
            row.rejection_probability = if requested > 0.0 {
                row.failures / requested
            } else {
                0.0
            };
        }
    }
}

/// Reads ride-hail observation rows from CSV.
///
/// # Errors
///
/// Fails on malformed CSV or rows not matching the expected schema.
pub fn read_observations<R: Read>(reader: R) -> Result<Vec<RideHailObservation>, MergeError> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(
        taz_id: u32,
        hour: u32,
        wait_time: f64,
        unmatched: f64,
        observations: f64,
    ) -> RideHailObservation {
        RideHailObservation {
            taz_id,
            hour,
            reservation_type: "on_demand".into(),
            wait_time,
            cost_per_mile: 2.0,
            unmatched_requests_percent: unmatched,
            observations,
            iterations: 1.0,
        }
    }

    fn key(origin: u32, period: TimeBucket) -> OriginGroupKey {
        OriginGroupKey {
            period,
            reservation_type: "on_demand".into(),
            origin,
        }
    }

    #[test]
    fn test_hour_bucketing() {
        assert_eq!(TimeBucket::from_hour(0), TimeBucket::Evening);
        assert_eq!(TimeBucket::from_hour(2), TimeBucket::Evening);
        assert_eq!(TimeBucket::from_hour(3), TimeBucket::EarlyMorning);
        assert_eq!(TimeBucket::from_hour(5), TimeBucket::EarlyMorning);
        assert_eq!(TimeBucket::from_hour(6), TimeBucket::AmPeak);
        assert_eq!(TimeBucket::from_hour(9), TimeBucket::AmPeak);
        assert_eq!(TimeBucket::from_hour(10), TimeBucket::Midday);
        assert_eq!(TimeBucket::from_hour(14), TimeBucket::Midday);
        assert_eq!(TimeBucket::from_hour(15), TimeBucket::PmPeak);
        assert_eq!(TimeBucket::from_hour(18), TimeBucket::PmPeak);
        assert_eq!(TimeBucket::from_hour(19), TimeBucket::Evening);
        assert_eq!(TimeBucket::from_hour(23), TimeBucket::Evening);
    }

    #[test]
    fn test_weighted_aggregation_across_hours() {
        // Both rows land in the AM peak; wait is weighted by completed
        // requests: (4.0 * 10 + 8.0 * 30) / 40 = 7.0.
        let rows = vec![row(5, 7, 4.0, 0.0, 10.0), row(5, 9, 8.0, 0.0, 30.0)];
        let aggregates = aggregate(&rows);
        let a = &aggregates[&key(5, TimeBucket::AmPeak)];
        assert!((a.wait_time - 7.0).abs() < 1e-12);
        assert_eq!(a.completed, 40.0);
        assert_eq!(a.unmatched_share, 0.0);
    }

    #[test]
    fn test_unmatched_fraction_reduces_completed() {
        let rows = vec![row(5, 7, 4.0, 0.25, 40.0)];
        let aggregates = aggregate(&rows);
        let a = &aggregates[&key(5, TimeBucket::AmPeak)];
        assert_eq!(a.completed, 30.0);
        assert_eq!(a.unmatched_share, 0.25);
    }

    #[test]
    fn test_zero_completed_gets_fallback_defaults() {
        let rows = vec![row(5, 7, 4.0, 1.0, 40.0)];
        let aggregates = aggregate(&rows);
        let a = &aggregates[&key(5, TimeBucket::AmPeak)];
        assert_eq!(a.wait_time, FALLBACK_WAIT_MINUTES);
        assert_eq!(a.cost_per_mile, FALLBACK_COST_PER_MILE);
        assert_eq!(a.unmatched_share, 1.0);
        assert!(a.wait_time.is_finite(), "fallback, never NaN");
    }

    #[test]
    fn test_counts_blend_fifty_fifty() {
        let mut store = OriginSkimStore::new();
        store.merge_observations(&[row(5, 7, 4.0, 0.25, 40.0)]);
        // First merge from empty: trips = 0.5 * (0 + 30) = 15, failures =
        // 0.5 * (0 + 10) = 5.
        let first = store.get(&key(5, TimeBucket::AmPeak)).unwrap().clone();
        assert_eq!(first.trips, 15.0);
        assert_eq!(first.failures, 5.0);
        assert_eq!(first.rejection_probability, 0.25);

        store.merge_observations(&[row(5, 7, 4.0, 0.25, 40.0)]);
        let second = store.get(&key(5, TimeBucket::AmPeak)).unwrap();
        assert_eq!(second.trips, 0.5 * (15.0 + 30.0));
        assert_eq!(second.failures, 0.5 * (5.0 + 10.0));
    }

    #[test]
    fn test_rejection_probability_clamps_to_zero() {
        let mut store = OriginSkimStore::new();
        store.merge_observations(&[row(5, 7, 4.0, 0.0, 0.0)]);
        let r = store.get(&key(5, TimeBucket::AmPeak)).unwrap();
        assert_eq!(r.rejection_probability, 0.0);
    }

    #[test]
    fn test_csv_schema_round_trip() {
        let csv = "tazId,hour,reservationType,waitTime,costPerMile,unmatchedRequestsPercent,observations,iterations\n\
                   17,8,on_demand,5.5,1.75,0.1,20,3\n";
        let rows = read_observations(csv.as_bytes()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].taz_id, 17);
        assert_eq!(rows[0].reservation_type, "on_demand");
        assert_eq!(rows[0].unmatched_requests_percent, 0.1);
    }
}
