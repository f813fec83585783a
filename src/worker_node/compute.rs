use crate::network::{RoutingEngine, RoutingError};
use speedwell::analysis_tasks::AnalysisTask;
use speedwell::cluster_messages::RegionalWorkResult;
use speedwell::propagation::{PerTargetPropagator, PropagationError};
use speedwell::reducer::{ReducerError, TravelTimeReducer};
use speedwell::SECONDS_PER_MINUTE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("routing failed: {0}")]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Propagation(#[from] PropagationError),
    #[error(transparent)]
    Reducer(#[from] ReducerError),
}

/// Run one origin end to end: routing, propagation, reduction. Failures are
/// packaged into the result's error field rather than raised, so a bad
/// origin reports itself to the broker instead of killing the worker loop.
pub fn compute_result(engine: &dyn RoutingEngine, task: &AnalysisTask) -> RegionalWorkResult {
    let (job_id, task_id) = match task.regional() {
        Some(detail) => (detail.job_id.clone(), detail.task_id),
        None => (String::new(), -1),
    };
    match try_compute(engine, task) {
        Ok(result) => result,
        Err(failure) => {
            log::warn!("task {} of job {} failed: {}", task_id, job_id, failure);
            RegionalWorkResult {
                job_id,
                task_id,
                error: Some(failure.to_string()),
                travel_times_by_percentile: None,
                accessibility: None,
            }
        }
    }
}

fn try_compute(
    engine: &dyn RoutingEngine,
    task: &AnalysisTask,
) -> Result<RegionalWorkResult, ComputeError> {
    let inputs = engine.route(task)?;
    let mut reducer = TravelTimeReducer::new(task, inputs.opportunities)?;
    let propagator = PerTargetPropagator::new(
        &inputs.travel_times_to_stops,
        &inputs.non_transit_times,
        &inputs.egress,
        task.walk_speed_mps,
        task.max_trip_duration_minutes * SECONDS_PER_MINUTE,
        task.records_times(),
    );
    propagator.propagate(&mut reducer)?;
    Ok(reducer.finish().into_regional_result(task))
}
