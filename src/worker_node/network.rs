use ahash::AHashMap;
use speedwell::analysis_tasks::AnalysisTask;
use speedwell::propagation::EgressTables;
use speedwell::SECONDS_PER_MINUTE;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("task is not a regional task")]
    NotRegional,
    #[error("origin {task_id} outside the {width}x{height} grid")]
    OriginOutsideGrid { task_id: i32, width: i32, height: i32 },
}

/// Everything the propagation kernel needs for one origin, produced by the
/// routing stage: street times to every transit stop per iteration, pure
/// street times to every target, egress tables, and the destination
/// pointset's opportunity counts.
pub struct PropagationInputs {
    pub travel_times_to_stops: Vec<Vec<i32>>,
    pub non_transit_times: Vec<i32>,
    pub egress: EgressTables,
    pub opportunities: Option<Vec<f64>>,
}

/// The routing stage behind the worker: street search plus the transit
/// profile search over a loaded transport network. Real networks are built
/// and routed by the routing engine this crate orchestrates; the synthetic
/// engine below keeps a cluster runnable without one.
pub trait RoutingEngine: Send + Sync {
    fn route(&self, task: &AnalysisTask) -> Result<PropagationInputs, RoutingError>;
}

/// Deterministic free-flow engine for offline clusters and redelivery
/// testing: a world with no transit where street travel time grows with
/// grid distance from the origin. Every destination cell carries one
/// opportunity.
pub struct SyntheticRoutingEngine {
    seconds_per_cell: i32,
}

impl SyntheticRoutingEngine {
    pub fn new() -> SyntheticRoutingEngine {
        SyntheticRoutingEngine {
            seconds_per_cell: 2 * SECONDS_PER_MINUTE,
        }
    }
}

impl Default for SyntheticRoutingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingEngine for SyntheticRoutingEngine {
    fn route(&self, task: &AnalysisTask) -> Result<PropagationInputs, RoutingError> {
        let detail = task.regional().ok_or(RoutingError::NotRegional)?;
        let width = task.width;
        let height = task.height;
        let task_id = detail.task_id;
        if task_id < 0 || task_id >= width * height {
            return Err(RoutingError::OriginOutsideGrid {
                task_id,
                width,
                height,
            });
        }
        let origin_x = task_id % width;
        let origin_y = task_id / width;

        let n_targets = task.n_targets();
        let mut non_transit_times = Vec::with_capacity(n_targets);
        for target in 0..n_targets as i32 {
            let dx = (target % width - origin_x).abs();
            let dy = (target / width - origin_y).abs();
            non_transit_times.push((dx + dy) * self.seconds_per_cell);
        }

        let iterations = task.iterations_per_origin().max(1);
        Ok(PropagationInputs {
            // no transit in the free-flow world: zero stops, every iteration
            travel_times_to_stops: vec![Vec::new(); iterations],
            non_transit_times,
            egress: EgressTables {
                stops_for_target: vec![Vec::new(); n_targets],
            },
            opportunities: Some(vec![1.0; n_targets]),
        })
    }
}

/// Engines by network id. Workers normally load exactly one network and
/// stick with it, but nothing stops a large-memory worker from serving
/// several.
pub struct NetworkCache {
    engines: std::sync::Mutex<AHashMap<String, Arc<dyn RoutingEngine>>>,
}

impl NetworkCache {
    pub fn new() -> NetworkCache {
        NetworkCache {
            engines: std::sync::Mutex::new(AHashMap::new()),
        }
    }

    pub fn get_or_load(&self, network_id: &str) -> Arc<dyn RoutingEngine> {
        let mut engines = self.engines.lock().unwrap();
        engines
            .entry(network_id.to_string())
            .or_insert_with(|| {
                log::info!("loading network {}", network_id);
                Arc::new(SyntheticRoutingEngine::new())
            })
            .clone()
    }
}

impl Default for NetworkCache {
    fn default() -> Self {
        Self::new()
    }
}
