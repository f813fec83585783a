use crate::analysis_tasks::AnalysisTask;
use crate::cluster_messages::RegionalWorkResult;
use crate::propagation::PropagationConsumer;
use crate::{SECONDS_PER_MINUTE, UNREACHED};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReducerError {
    #[error("{got} iterations supplied; expected {expected}")]
    WrongIterationCount { expected: usize, got: usize },
    #[error("{got} opportunity counts supplied for {expected} targets")]
    WrongOpportunityCount { expected: usize, got: usize },
}

/// Travel times in minutes for every requested percentile at every target,
/// `[percentile][target]`. Starts out all UNREACHED so an origin that is not
/// connected to the street network still produces a full grid.
#[derive(Debug)]
pub struct TravelTimeResult {
    pub values: Vec<Vec<i32>>,
}

/// Cumulative opportunities within the cutoff at this one origin,
/// `[destination pointset][cutoff][percentile]`. One pointset and one cutoff
/// are produced per task today; the shape leaves room for more.
#[derive(Debug)]
pub struct AccessibilityResult {
    pub values: Vec<Vec<Vec<f64>>>,
}

/// Everything one origin's computation produced.
pub struct OneOriginResult {
    pub travel_times: Option<TravelTimeResult>,
    pub accessibility: Option<AccessibilityResult>,
}

impl OneOriginResult {
    /// Package for the POST back to the broker. Opportunity totals are
    /// rounded to whole counts at the wire boundary.
    pub fn into_regional_result(self, task: &AnalysisTask) -> RegionalWorkResult {
        let (job_id, task_id) = match task.regional() {
            Some(detail) => (detail.job_id.clone(), detail.task_id),
            None => (String::new(), 0),
        };
        RegionalWorkResult {
            job_id,
            task_id,
            error: None,
            travel_times_by_percentile: self.travel_times.map(|t| t.values),
            accessibility: self.accessibility.map(|a| {
                a.values
                    .iter()
                    .map(|per_cutoff| {
                        per_cutoff
                            .iter()
                            .map(|per_p| per_p.iter().map(|v| v.round() as i32).collect())
                            .collect()
                    })
                    .collect()
            }),
        }
    }
}

/// Collapses the long list of per-iteration travel times at each destination
/// into a few percentiles, then optionally accumulates that destination's
/// opportunity count into the cumulative accessibility figure for the
/// origin.
#[derive(Debug)]
pub struct TravelTimeReducer {
    max_trip_duration_minutes: i32,
    times_per_destination: usize,
    percentile_indexes: Vec<usize>,
    n_percentiles: usize,
    travel_times: Option<TravelTimeResult>,
    accessibility: Option<AccessibilityResult>,
    /// Opportunity count per target; absent means one opportunity per cell
    /// (plain reachable-area accessibility).
    opportunities: Option<Vec<f64>>,
    /// Scratch for one target's percentile minutes, reused across targets.
    minutes_scratch: Vec<i32>,
}

impl TravelTimeReducer {
    pub fn new(
        task: &AnalysisTask,
        opportunities: Option<Vec<f64>>,
    ) -> Result<TravelTimeReducer, ReducerError> {
        let n_targets = task.n_targets();
        if let Some(counts) = &opportunities {
            if counts.len() != n_targets {
                return Err(ReducerError::WrongOpportunityCount {
                    expected: n_targets,
                    got: counts.len(),
                });
            }
        }
        let times_per_destination = task.iterations_per_origin();
        let n_percentiles = task.n_percentiles();
        let percentile_indexes = task
            .percentiles
            .iter()
            .map(|&p| find_percentile_index(times_per_destination, p as f64))
            .collect();

        let travel_times = task.records_times().then(|| TravelTimeResult {
            values: vec![vec![UNREACHED; n_targets]; n_percentiles],
        });
        let accessibility = task.records_accessibility().then(|| AccessibilityResult {
            values: vec![vec![vec![0.0; n_percentiles]]],
        });

        Ok(TravelTimeReducer {
            max_trip_duration_minutes: task.max_trip_duration_minutes,
            times_per_destination,
            percentile_indexes,
            n_percentiles,
            travel_times,
            accessibility,
            opportunities,
            minutes_scratch: vec![0; n_percentiles],
        })
    }

    pub fn times_per_destination(&self) -> usize {
        self.times_per_destination
    }

    /// One unvarying travel time (walking, biking, driving): every
    /// percentile collapses to the same minute value.
    pub fn record_unvarying(&mut self, target: usize, seconds: i32) {
        let minutes = self.convert_to_minutes(seconds);
        for slot in self.minutes_scratch.iter_mut() {
            *slot = minutes;
        }
        self.record_minutes(target);
    }

    /// Extract the pre-computed percentile indexes from a full iteration
    /// list. Destructively sorts the supplied slice; positions no longer
    /// correspond to the iterations that produced them afterwards.
    pub fn extract_and_record(&mut self, target: usize, seconds: &mut [i32]) -> Result<(), ReducerError> {
        if seconds.len() != self.times_per_destination {
            return Err(ReducerError::WrongIterationCount {
                expected: self.times_per_destination,
                got: seconds.len(),
            });
        }
        seconds.sort_unstable();
        for p in 0..self.n_percentiles {
            let minutes = self.convert_to_minutes(seconds[self.percentile_indexes[p]]);
            self.minutes_scratch[p] = minutes;
        }
        self.record_minutes(target);
        Ok(())
    }

    fn record_minutes(&mut self, target: usize) {
        if let Some(result) = &mut self.travel_times {
            for p in 0..self.n_percentiles {
                result.values[p][target] = self.minutes_scratch[p];
            }
        }
        if let Some(result) = &mut self.accessibility {
            let amount = match &self.opportunities {
                Some(counts) => counts[target],
                None => 1.0,
            };
            for p in 0..self.n_percentiles {
                // strict less-than: minute m stands for the half-open bucket
                // [m, m+1), matching the frontend's bucketing
                if self.minutes_scratch[p] < self.max_trip_duration_minutes {
                    result.values[0][0][p] += amount;
                }
            }
        }
    }

    /// Seconds to whole minutes, truncating toward zero; anything at or past
    /// the trip duration limit becomes UNREACHED.
    fn convert_to_minutes(&self, seconds: i32) -> i32 {
        if seconds == UNREACHED {
            return UNREACHED;
        }
        let minutes = seconds / SECONDS_PER_MINUTE;
        if minutes < self.max_trip_duration_minutes {
            minutes
        } else {
            UNREACHED
        }
    }

    pub fn finish(self) -> OneOriginResult {
        OneOriginResult {
            travel_times: self.travel_times,
            accessibility: self.accessibility,
        }
    }
}

impl PropagationConsumer for TravelTimeReducer {
    fn accept(&mut self, target: usize, travel_times_seconds: &mut [i32]) -> Result<(), ReducerError> {
        self.extract_and_record(target, travel_times_seconds)
    }

    fn accept_unvarying(&mut self, target: usize, seconds: i32) -> Result<(), ReducerError> {
        self.record_unvarying(target, seconds);
        Ok(())
    }
}

/// Index of percentile `p` in a sorted list of `n_elements`, using the
/// non-interpolated definition: the smallest value such that no more than p
/// percent of the data is strictly below it. Ceiling, not truncation; the
/// two differ exactly on integer boundaries.
fn find_percentile_index(n_elements: usize, percentile: f64) -> usize {
    let index = (percentile / 100.0 * n_elements as f64).ceil() as usize;
    index.saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_tasks::{RegionalDetail, TaskDetail};

    fn task(percentiles: Vec<u8>, window_minutes: i32, record_times: bool) -> AnalysisTask {
        AnalysisTask {
            network_id: "nl".to_string(),
            worker_version: "v1.0".to_string(),
            zoom: 9,
            west: 0,
            north: 0,
            width: 3,
            height: 1,
            from_time: 0,
            to_time: window_minutes * 60,
            monte_carlo_draws: 0,
            percentiles,
            max_trip_duration_minutes: 120,
            walk_speed_mps: 1.3,
            transit_modes: vec![],
            in_routing_fare_calculator: None,
            detail: TaskDetail::Regional(RegionalDetail {
                job_id: "job-1".to_string(),
                task_id: 0,
                record_accessibility: true,
                record_times,
                origin_pointset_key: None,
                include_path_results: false,
                opportunity_column: None,
            }),
        }
    }

    #[test]
    fn percentile_indexes_follow_ceiling_definition() {
        assert_eq!(find_percentile_index(100, 5.0), 4);
        assert_eq!(find_percentile_index(100, 50.0), 49);
        assert_eq!(find_percentile_index(100, 95.0), 94);
        assert_eq!(find_percentile_index(100, 100.0), 99);
        assert_eq!(find_percentile_index(1, 50.0), 0);
        // integer boundary: ceil, not truncate-plus-nothing
        assert_eq!(find_percentile_index(10, 25.0), 2);
    }

    #[test]
    fn extracts_percentiles_from_hundred_iterations() {
        let mut reducer = TravelTimeReducer::new(&task(vec![5, 50, 95], 100, true), None).unwrap();
        let mut seconds: Vec<i32> = (0..100).map(|i| i * 60).collect();
        reducer.extract_and_record(0, &mut seconds).unwrap();
        let result = reducer.finish();
        let times = result.travel_times.unwrap();
        assert_eq!(times.values[0][0], 4);
        assert_eq!(times.values[1][0], 49);
        assert_eq!(times.values[2][0], 94);
    }

    #[test]
    fn values_at_or_past_cutoff_become_unreached() {
        let mut task = task(vec![50], 1, true);
        task.max_trip_duration_minutes = 90;
        let mut reducer = TravelTimeReducer::new(&task, None).unwrap();
        reducer.extract_and_record(0, &mut [90 * 60]).unwrap();
        reducer.extract_and_record(1, &mut [90 * 60 - 1]).unwrap();
        reducer.extract_and_record(2, &mut [UNREACHED]).unwrap();
        let times = reducer.finish().travel_times.unwrap();
        assert_eq!(times.values[0][0], UNREACHED);
        assert_eq!(times.values[0][1], 89);
        assert_eq!(times.values[0][2], UNREACHED);
    }

    #[test]
    fn extraction_is_idempotent_on_sorted_input() {
        let mut reducer = TravelTimeReducer::new(&task(vec![50], 10, true), None).unwrap();
        let mut seconds: Vec<i32> = vec![540, 60, 300, 420, 120, 180, 240, 360, 480, 600];
        reducer.extract_and_record(0, &mut seconds).unwrap();
        // slice is now sorted; a second pass must read off the same answer
        let first = reducer.travel_times.as_ref().unwrap().values[0][0];
        reducer.extract_and_record(0, &mut seconds).unwrap();
        assert_eq!(reducer.travel_times.as_ref().unwrap().values[0][0], first);
    }

    #[test]
    fn iteration_count_mismatch_is_rejected() {
        let mut reducer = TravelTimeReducer::new(&task(vec![50], 10, false), None).unwrap();
        let err = reducer.extract_and_record(0, &mut [60, 120]).unwrap_err();
        assert_eq!(
            err,
            ReducerError::WrongIterationCount {
                expected: 10,
                got: 2
            }
        );
    }

    #[test]
    fn accessibility_counts_strictly_below_cutoff() {
        let mut task = task(vec![50], 1, false);
        task.max_trip_duration_minutes = 10;
        let mut reducer =
            TravelTimeReducer::new(&task, Some(vec![5.0, 7.0, 100.0])).unwrap();
        reducer.record_unvarying(0, 9 * 60 + 59); // minute 9, inside
        reducer.record_unvarying(1, 10 * 60); // minute 10, exactly at cutoff
        reducer.record_unvarying(2, UNREACHED);
        let access = reducer.finish().accessibility.unwrap();
        assert_eq!(access.values[0][0][0], 5.0);
    }

    #[test]
    fn unvarying_times_fill_every_percentile() {
        let mut reducer = TravelTimeReducer::new(&task(vec![5, 95], 10, true), None).unwrap();
        reducer.record_unvarying(1, 240);
        let times = reducer.finish().travel_times.unwrap();
        assert_eq!(times.values[0][1], 4);
        assert_eq!(times.values[1][1], 4);
        assert_eq!(times.values[0][0], UNREACHED);
    }

    #[test]
    fn opportunity_count_shape_is_checked() {
        let err = TravelTimeReducer::new(&task(vec![50], 10, false), Some(vec![1.0])).unwrap_err();
        assert_eq!(
            err,
            ReducerError::WrongOpportunityCount {
                expected: 3,
                got: 1
            }
        );
    }
}
