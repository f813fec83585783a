use crate::categories::WorkerCategory;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body of a worker's short poll. Doubles as the heartbeat: workers send one
/// of these every second or so even when they are busy and asking for zero
/// tasks, so the broker's catalog stays current.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub graph_id: String,
    pub worker_version: String,
    #[serde(default)]
    pub ip_address: String,
    pub max_tasks_requested: usize,
    pub tasks_in_flight: usize,
    #[serde(default)]
    pub single_point_capable: bool,
}

impl WorkerStatus {
    pub fn category(&self) -> WorkerCategory {
        WorkerCategory::new(self.graph_id.clone(), self.worker_version.clone())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResultShapeError {
    #[error("{got} percentile rows supplied; job expects {expected}")]
    PercentileCount { expected: usize, got: usize },
    #[error("percentile row {row} has {got} destinations; job expects {expected}")]
    TargetCount {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[error("accessibility array has {got} percentile entries; job expects {expected}")]
    AccessibilityShape { expected: usize, got: usize },
    #[error("result carries neither travel times nor accessibility")]
    EmptyResult,
}

/// Everything a worker reports back for one origin of a regional job.
/// Results are idempotent: a redelivered task produces a byte-identical
/// message, and the assembler may see the same task id twice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionalWorkResult {
    pub job_id: String,
    pub task_id: i32,
    /// Set when the worker failed to compute this origin. The payload fields
    /// are ignored and the job stops delivering.
    #[serde(default)]
    pub error: Option<String>,
    /// Travel time in minutes, percentile-major: `[percentile][target]`.
    #[serde(default)]
    pub travel_times_by_percentile: Option<Vec<Vec<i32>>>,
    /// Cumulative opportunities, `[destination pointset][cutoff][percentile]`.
    /// Only one pointset and one cutoff are produced per job today.
    #[serde(default)]
    pub accessibility: Option<Vec<Vec<Vec<i32>>>>,
}

impl RegionalWorkResult {
    /// Check payload dimensions against the job contract. Called by the
    /// assembler before any bytes are written so a malformed result can never
    /// poison the output file.
    pub fn check_shape(
        &self,
        n_percentiles: usize,
        n_targets: usize,
    ) -> Result<(), ResultShapeError> {
        if self.travel_times_by_percentile.is_none() && self.accessibility.is_none() {
            return Err(ResultShapeError::EmptyResult);
        }
        if let Some(times) = &self.travel_times_by_percentile {
            if times.len() != n_percentiles {
                return Err(ResultShapeError::PercentileCount {
                    expected: n_percentiles,
                    got: times.len(),
                });
            }
            for (row, targets) in times.iter().enumerate() {
                if targets.len() != n_targets {
                    return Err(ResultShapeError::TargetCount {
                        row,
                        expected: n_targets,
                        got: targets.len(),
                    });
                }
            }
        }
        if let Some(accessibility) = &self.accessibility {
            if accessibility.is_empty() || accessibility.iter().any(|c| c.is_empty()) {
                return Err(ResultShapeError::AccessibilityShape {
                    expected: n_percentiles,
                    got: 0,
                });
            }
            for per_cutoff in accessibility {
                for per_percentile in per_cutoff {
                    if per_percentile.len() != n_percentiles {
                        return Err(ResultShapeError::AccessibilityShape {
                            expected: n_percentiles,
                            got: per_percentile.len(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> RegionalWorkResult {
        RegionalWorkResult {
            job_id: "job-1".to_string(),
            task_id: 3,
            error: None,
            travel_times_by_percentile: Some(vec![vec![1, 2, 3], vec![4, 5, 6]]),
            accessibility: Some(vec![vec![vec![9, 9]]]),
        }
    }

    #[test]
    fn well_formed_result_passes() {
        assert_eq!(result().check_shape(2, 3), Ok(()));
    }

    #[test]
    fn wrong_percentile_count_rejected() {
        let err = result().check_shape(3, 3).unwrap_err();
        assert_eq!(
            err,
            ResultShapeError::PercentileCount {
                expected: 3,
                got: 2
            }
        );
    }

    #[test]
    fn wrong_target_count_rejected() {
        let mut bad = result();
        bad.travel_times_by_percentile.as_mut().unwrap()[1].pop();
        let err = bad.check_shape(2, 3).unwrap_err();
        assert!(matches!(err, ResultShapeError::TargetCount { row: 1, .. }));
    }

    #[test]
    fn payload_free_result_rejected() {
        let bad = RegionalWorkResult {
            job_id: "job-1".to_string(),
            task_id: 0,
            error: None,
            travel_times_by_percentile: None,
            accessibility: None,
        };
        assert_eq!(bad.check_shape(1, 1), Err(ResultShapeError::EmptyResult));
    }
}
