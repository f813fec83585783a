use crate::categories::WorkerCategory;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitMode {
    Bus,
    Tram,
    Subway,
    Rail,
    Ferry,
    CableCar,
    Gondola,
    Funicular,
}

/// Output container format for interactive single point requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceFormat {
    Grid,
    Geotiff,
}

/// Fields only meaningful for one origin of a regional job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegionalDetail {
    pub job_id: String,
    /// Origin index within the job, also the slot this origin's results land
    /// in inside the assembled output files.
    pub task_id: i32,
    #[serde(default)]
    pub record_accessibility: bool,
    #[serde(default)]
    pub record_times: bool,
    /// Set when origins come from a freeform pointset rather than the grid.
    #[serde(default)]
    pub origin_pointset_key: Option<String>,
    #[serde(default)]
    pub include_path_results: bool,
    /// Which column of the destination pointset supplies opportunity counts.
    #[serde(default)]
    pub opportunity_column: Option<String>,
}

/// The two kinds of work a worker can be asked to do. Serialized with a
/// `type` tag so the wire shape stays flat and workers can dispatch without
/// sniffing fields.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskDetail {
    TravelTimeSurface { format: SurfaceFormat },
    Regional(RegionalDetail),
}

/// One unit of analysis work. Shared routing parameters are hoisted here;
/// everything specific to the interactive or regional flavor lives in
/// `detail`. A regional job's template task is one of these with
/// `task_id == -1`, cloned and renumbered as tasks are delivered.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub network_id: String,
    pub worker_version: String,

    // Destination grid extents, web mercator pixel space at `zoom`.
    pub zoom: i32,
    pub west: i32,
    pub north: i32,
    pub width: i32,
    pub height: i32,

    /// Departure window, seconds since midnight.
    pub from_time: i32,
    pub to_time: i32,
    /// Total Monte Carlo draws over the whole window. Zero means half-headway
    /// boarding, one deterministic result per departure minute.
    pub monte_carlo_draws: i32,

    pub percentiles: Vec<u8>,
    pub max_trip_duration_minutes: i32,
    pub walk_speed_mps: f32,
    #[serde(default)]
    pub transit_modes: Vec<TransitMode>,
    /// Name of an in-routing fare calculator. Non-null switches the routing
    /// stage to the slow multi-criteria search, which samples departure times
    /// instead of running draws within every minute.
    #[serde(default)]
    pub in_routing_fare_calculator: Option<String>,

    #[serde(flatten)]
    pub detail: TaskDetail,
}

impl AnalysisTask {
    pub fn worker_category(&self) -> WorkerCategory {
        WorkerCategory::new(self.network_id.clone(), self.worker_version.clone())
    }

    pub fn has_transit(&self) -> bool {
        !self.transit_modes.is_empty()
    }

    pub fn n_targets(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }

    pub fn n_percentiles(&self) -> usize {
        self.percentiles.len()
    }

    pub fn time_window_length_minutes(&self) -> i32 {
        (self.to_time - self.from_time) / crate::SECONDS_PER_MINUTE
    }

    pub fn monte_carlo_draws_per_minute(&self) -> i32 {
        let window = self.time_window_length_minutes();
        if window <= 0 {
            return 0;
        }
        // round up so the requested number of draws is always reached
        (self.monte_carlo_draws + window - 1) / window
    }

    /// How many travel times the routing stage produces per destination, and
    /// therefore how many values the reducer expects for every target.
    pub fn iterations_per_origin(&self) -> usize {
        if self.in_routing_fare_calculator.is_some() {
            // The multi-criteria fare search is slow, so it samples whole
            // departure times rather than drawing within each minute.
            self.monte_carlo_draws as usize
        } else if self.monte_carlo_draws == 0 {
            self.time_window_length_minutes() as usize
        } else {
            (self.time_window_length_minutes() * self.monte_carlo_draws_per_minute()) as usize
        }
    }

    pub fn regional(&self) -> Option<&RegionalDetail> {
        match &self.detail {
            TaskDetail::Regional(detail) => Some(detail),
            TaskDetail::TravelTimeSurface { .. } => None,
        }
    }

    /// Whether this task wants per-destination travel times retained.
    pub fn records_times(&self) -> bool {
        match &self.detail {
            TaskDetail::TravelTimeSurface { .. } => true,
            TaskDetail::Regional(detail) => detail.record_times,
        }
    }

    pub fn records_accessibility(&self) -> bool {
        match &self.detail {
            TaskDetail::TravelTimeSurface { .. } => false,
            TaskDetail::Regional(detail) => detail.record_accessibility,
        }
    }

    /// Clone a regional template into the concrete task for one origin.
    pub fn materialize_regional(&self, task_id: i32) -> AnalysisTask {
        let mut task = self.clone();
        if let TaskDetail::Regional(detail) = &mut task.detail {
            detail.task_id = task_id;
        }
        task
    }
}
