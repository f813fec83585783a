use crate::analysis_tasks::AnalysisTask;
use crate::assembler::MultiOriginAssembler;
use crate::categories::{WorkerCategory, WorkerTags};
use crate::cluster_messages::{RegionalWorkResult, WorkerStatus};
use crate::epoch_ms;
use crate::events::{Event, EventBus, RegionalAnalysisState, WorkerAction, WorkerRole};
use crate::file_storage::FileStorage;
use crate::job::{Job, JobStatus};
use crate::worker_catalog::{WorkerCatalog, WorkerObservation};
use crate::worker_launcher::WorkerLauncher;
use ahash::AHashMap;
use itertools::Itertools;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// The most tasks handed to one worker per poll. Handing out too many at
/// once gives the whole tail of a job to a single worker and starves the
/// rest of the fleet.
pub const MAX_TASKS_PER_WORKER: usize = 16;

/// Fleet sizing targets for the automatic spot request. Transit tasks cost
/// far more than street-only tasks, so the ratios differ by a factor of five.
pub const TARGET_TASKS_PER_WORKER_TRANSIT: usize = 800;
pub const TARGET_TASKS_PER_WORKER_NONTRANSIT: usize = 4_000;

/// Boost the fleet once results are flowing, after the result for this
/// arbitrary task toward the beginning of the job arrives.
pub const AUTO_START_SPOT_INSTANCES_AT_TASK: i32 = 42;

/// Ceiling on one automatic spot request.
pub const MAX_WORKERS_PER_CATEGORY: usize = 250;

/// How long to give requested workers to boot and start polling before a
/// category becomes eligible for another launch request.
pub const WORKER_STARTUP_TIME_MS: i64 = 60 * 60 * 1000;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub offline: bool,
    pub max_workers: usize,
    /// Jobs enqueued for redelivery testing skip worker launching and
    /// lifecycle events.
    pub test_task_redelivery: bool,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("job {0} is already enqueued")]
    DuplicateJob(String),
}

struct BrokerState {
    /// Active and errored jobs, grouped by the worker category that can
    /// serve them.
    jobs: AHashMap<WorkerCategory, Vec<Job>>,
    /// One assembler per job, shared with in-flight result handling outside
    /// the lock.
    assemblers: AHashMap<String, Arc<MultiOriginAssembler>>,
    /// When we last asked the launcher for workers per category, so a
    /// category has at most one launch request pending at a time.
    recently_requested_workers: AHashMap<WorkerCategory, i64>,
}

impl BrokerState {
    fn find_job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.jobs.values_mut().flatten().find(|j| j.job_id == job_id)
    }

    fn find_job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.values().flatten().find(|j| j.job_id == job_id)
    }

    fn remove_job(&mut self, job_id: &str) -> Option<Job> {
        let category = self.find_job(job_id)?.category.clone();
        let jobs = self.jobs.get_mut(&category)?;
        let index = jobs.iter().position(|j| j.job_id == job_id)?;
        let job = jobs.remove(index);
        if jobs.is_empty() {
            self.jobs.remove(&category);
        }
        Some(job)
    }
}

/// Everything the autoscale decision needs from a job, copied out so the
/// decision runs without the state lock.
struct AutoscaleSnapshot {
    category: WorkerCategory,
    tags: WorkerTags,
    n_tasks_total: usize,
    has_transit: bool,
    zoom: i32,
    freeform_origins: bool,
    include_path_results: bool,
}

impl AutoscaleSnapshot {
    fn of(job: &Job) -> AutoscaleSnapshot {
        let detail = job.template.regional();
        AutoscaleSnapshot {
            category: job.category.clone(),
            tags: job.tags.clone(),
            n_tasks_total: job.n_tasks_total,
            has_transit: job.template.has_transit(),
            zoom: job.template.zoom,
            freeform_origins: detail
                .map(|d| d.origin_pointset_key.is_some())
                .unwrap_or(false),
            include_path_results: detail.map(|d| d.include_path_results).unwrap_or(false),
        }
    }
}

/// Distributes the tasks making up regional jobs to workers.
///
/// Respects each worker's declared network affinity, giving it tasks for the
/// network it already has in memory. Workers short-poll and sleep rather
/// than long-poll; every poll doubles as a heartbeat, so the catalog stays
/// accurate even when workers are busy and asking for nothing.
///
/// Most operations take the single state lock because they run on many HTTP
/// handler threads at once. The deliberately unlocked parts are the slow
/// ones: writing result bytes through the assembler, moving finished files
/// into storage, launching workers, and emitting events.
pub struct Broker {
    config: BrokerConfig,
    file_storage: Arc<dyn FileStorage>,
    event_bus: Arc<dyn EventBus>,
    worker_launcher: Arc<dyn WorkerLauncher>,
    catalog: Mutex<WorkerCatalog>,
    state: Mutex<BrokerState>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        file_storage: Arc<dyn FileStorage>,
        event_bus: Arc<dyn EventBus>,
        worker_launcher: Arc<dyn WorkerLauncher>,
    ) -> Broker {
        Broker {
            config,
            file_storage,
            event_bus,
            worker_launcher,
            catalog: Mutex::new(WorkerCatalog::new()),
            state: Mutex::new(BrokerState {
                jobs: AHashMap::new(),
                assemblers: AHashMap::new(),
                recently_requested_workers: AHashMap::new(),
            }),
        }
    }

    /// Register a regional job and its assembler, then make sure at least
    /// one worker exists for its category.
    pub fn enqueue_regional_job(
        &self,
        job: Job,
        assembler: MultiOriginAssembler,
    ) -> Result<(), BrokerError> {
        let job_id = job.job_id.clone();
        let category = job.category.clone();
        let tags = job.tags.clone();
        log::info!("enqueuing {} tasks for job {} on {}", job.n_tasks_total, job_id, category);

        let workers_exist = !self
            .catalog
            .lock()
            .unwrap()
            .no_workers_available(&category, self.config.offline);
        {
            let mut state = self.state.lock().unwrap();
            if state.find_job(&job_id).is_some() {
                return Err(BrokerError::DuplicateJob(job_id));
            }
            state.jobs.entry(category.clone()).or_default().push(job);
            state.assemblers.insert(job_id.clone(), Arc::new(assembler));
            if workers_exist {
                // a worker for this category is live; stop waiting on any
                // earlier launch request
                state.recently_requested_workers.remove(&category);
            }
        }

        if self.config.test_task_redelivery {
            // fake job driven by the redelivery test harness; no fleet and
            // no lifecycle noise
            return Ok(());
        }

        if !workers_exist {
            self.create_workers_in_category(&category, &tags, 1, 0);
        }
        self.event_bus.send(Event::RegionalAnalysis {
            job_id,
            state: RegionalAnalysisState::Started,
            tags,
        });
        Ok(())
    }

    /// Request workers for a category, subject to the launch guardrails.
    /// Failures are logged rather than raised; this often runs inside worker
    /// poll handlers where an exception would reach nobody useful.
    pub fn create_workers_in_category(
        &self,
        category: &WorkerCategory,
        tags: &WorkerTags,
        n_on_demand: usize,
        n_spot: usize,
    ) {
        if self.config.offline {
            log::info!("working offline, not creating workers for {}", category);
            return;
        }
        if n_on_demand + n_spot == 0 {
            log::error!("no workers requested, not starting any");
            return;
        }

        // Zeno's fleet management: never start more than half the remaining
        // capacity in one request.
        let current_total = self.catalog.lock().unwrap().total_worker_count();
        let max_to_start = self.config.max_workers.saturating_sub(current_total) / 2;
        if max_to_start == 0 {
            log::error!("at capacity ({} workers), not starting any more", current_total);
            return;
        }
        let (mut n_on_demand, mut n_spot) = (n_on_demand, n_spot);
        if n_on_demand + n_spot > max_to_start {
            log::warn!(
                "request for {} workers is more than half the remaining pool capacity",
                n_on_demand + n_spot
            );
            n_spot = max_to_start;
            n_on_demand = 0;
            log::warn!("lowered to {} on-demand and {} spot workers", n_on_demand, n_spot);
        }
        if current_total + n_on_demand + n_spot > self.config.max_workers {
            log::error!(
                "starting workers would exceed the maximum capacity of {}; jobs may stall on {}",
                self.config.max_workers,
                category
            );
            return;
        }

        {
            let mut state = self.state.lock().unwrap();
            let now = epoch_ms();
            if let Some(&requested_at) = state.recently_requested_workers.get(category) {
                if requested_at >= now - WORKER_STARTUP_TIME_MS {
                    log::debug!("workers still starting on {}, not starting more", category);
                    return;
                }
            }
            state.recently_requested_workers.insert(category.clone(), now);
        }

        self.worker_launcher.launch(category, tags, n_on_demand, n_spot);
        if n_spot > 0 {
            self.event_bus.send(Event::Worker {
                role: WorkerRole::Regional,
                category: category.clone(),
                action: WorkerAction::Requested,
                count: n_spot,
                tags: tags.clone(),
            });
        }
        if n_on_demand > 0 {
            self.event_bus.send(Event::Worker {
                role: WorkerRole::SinglePoint,
                category: category.clone(),
                action: WorkerAction::Requested,
                count: n_on_demand,
                tags: tags.clone(),
            });
        }
        log::info!(
            "requested {} on-demand and {} spot workers on {}",
            n_on_demand,
            n_spot,
            category
        );
    }

    /// Find up to `max_requested` tasks for a polling worker. Always returns
    /// a list, possibly empty. In offline mode the single local worker
    /// serves every network, so affinity is ignored.
    pub fn get_some_work(&self, category: &WorkerCategory, max_requested: usize) -> Vec<AnalysisTask> {
        if max_requested == 0 {
            return Vec::new();
        }
        let max_tasks = max_requested.min(MAX_TASKS_PER_WORKER);
        let now = epoch_ms();
        let mut state = self.state.lock().unwrap();
        let job = if self.config.offline {
            state
                .jobs
                .values_mut()
                .flatten()
                .find(|j| j.has_tasks_to_deliver_at(now))
        } else {
            state
                .jobs
                .get_mut(category)
                .and_then(|jobs| jobs.iter_mut().find(|j| j.has_tasks_to_deliver_at(now)))
        };
        match job {
            Some(job) => job.generate_some_tasks_to_deliver_at(max_tasks, now),
            None => Vec::new(),
        }
    }

    /// Record what a polling worker said about itself. A worker showing up
    /// for a category also resolves any pending launch request for it: the
    /// fleet we were waiting on has started arriving.
    pub fn record_worker_observation(&self, status: &WorkerStatus) {
        self.catalog.lock().unwrap().catalog(status);
        self.state
            .lock()
            .unwrap()
            .recently_requested_workers
            .remove(&status.category());
    }

    /// Slot one result from a worker into the right job and output files,
    /// and consider boosting the fleet once early results are flowing.
    /// Nothing is allowed to propagate out of here: any failure becomes a
    /// recorded job error plus an error event.
    pub fn handle_regional_work_result(&self, result: RegionalWorkResult) {
        if let Err(failure) = self.try_handle_result(&result) {
            let detail = format!("assembling result for job {}: {:#}", result.job_id, failure);
            log::error!("{}", detail);
            self.record_job_error(&result.job_id, detail.clone());
            self.event_bus.send(Event::Error { detail });
        }
    }

    fn try_handle_result(&self, result: &RegionalWorkResult) -> anyhow::Result<()> {
        let assembler;
        let autoscale;
        let completed_event;
        {
            let mut state = self.state.lock().unwrap();
            let state = &mut *state;
            let Some(found) = state.assemblers.get(&result.job_id).cloned() else {
                // expected after deletion races; tasks in flight keep landing
                log::debug!("ignoring result for unknown job {}", result.job_id);
                return Ok(());
            };
            let Some(job) = state.jobs.values_mut().flatten().find(|j| j.job_id == result.job_id)
            else {
                log::debug!("ignoring result for unknown job {}", result.job_id);
                return Ok(());
            };
            if !job.is_active() {
                log::debug!("ignoring result for inactive job {}", result.job_id);
                return Ok(());
            }
            if let Some(worker_error) = &result.error {
                // the job stops delivering but stays visible until the user
                // deletes it
                job.errors.push(worker_error.clone());
                return Ok(());
            }

            // Mark completed before the assembler ever sees the result: on
            // the final task this makes the job invisible to stray
            // redeliveries before finalization starts.
            if !job.mark_task_completed(result.task_id) {
                log::error!(
                    "failed to mark task {} completed on job {}",
                    result.task_id,
                    result.job_id
                );
            }
            assembler = found;
            autoscale = if result.task_id == AUTO_START_SPOT_INSTANCES_AT_TASK {
                Some(AutoscaleSnapshot::of(job))
            } else {
                None
            };
            if job.is_complete() {
                let tags = job.tags.clone();
                state.remove_job(&result.job_id);
                state.assemblers.remove(&result.job_id);
                completed_event = Some(Event::RegionalAnalysis {
                    job_id: result.job_id.clone(),
                    state: RegionalAnalysisState::Completed,
                    tags,
                });
            } else {
                completed_event = None;
            }
        }

        // Slow work below runs without the broker lock: disk writes in the
        // assembler, the storage handoff, launching workers, events.
        if let Some(event) = completed_event {
            self.event_bus.send(event);
        }
        if let Some(files) = assembler.handle_message(result)? {
            for (key, path) in files {
                self.file_storage.move_into_storage(&key, &path)?;
            }
        }
        if let Some(snapshot) = autoscale {
            self.request_extra_workers_if_appropriate(&snapshot);
        }
        Ok(())
    }

    fn record_job_error(&self, job_id: &str, error: String) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.find_job_mut(job_id) {
            job.errors.push(error);
        }
    }

    /// Early results are flowing, so the job is running smoothly; size the
    /// spot fleet to the amount of work remaining.
    fn request_extra_workers_if_appropriate(&self, snapshot: &AutoscaleSnapshot) {
        let already_running = self
            .catalog
            .lock()
            .unwrap()
            .count_workers_in_category(&snapshot.category);
        if already_running >= MAX_WORKERS_PER_CATEGORY {
            return;
        }
        let mut target = if snapshot.has_transit {
            // Transit cost scales with stop density, which the origin count
            // proxies poorly at high zoom; scale the target down as zoom
            // rises.
            let transit_scale_factor = 9.0_f32 / snapshot.zoom as f32;
            ((snapshot.n_tasks_total / TARGET_TASKS_PER_WORKER_TRANSIT) as f32
                * transit_scale_factor) as usize
        } else {
            snapshot.n_tasks_total / TARGET_TASKS_PER_WORKER_NONTRANSIT
        };
        target = target.min(MAX_WORKERS_PER_CATEGORY);
        // guardrails until freeform origins and path output see more load
        if snapshot.freeform_origins {
            target = target.min(80);
        }
        if snapshot.include_path_results {
            target = target.min(20);
        }
        let n_spot = target.saturating_sub(already_running);
        self.create_workers_in_category(&snapshot.category, &snapshot.tags, 0, n_spot);
    }

    /// Remove a job, shutting down its assembler and releasing its
    /// temporary files. Returns false if the job was unknown or cleanup
    /// failed.
    pub fn delete_job(&self, job_id: &str) -> bool {
        let (job, assembler) = {
            let mut state = self.state.lock().unwrap();
            let Some(job) = state.remove_job(job_id) else {
                return false;
            };
            (job, state.assemblers.remove(job_id))
        };
        let mut success = true;
        if let Some(assembler) = assembler {
            if let Err(failure) = assembler.terminate() {
                log::error!(
                    "could not terminate result assembler, this may waste disk space: {}",
                    failure
                );
                success = false;
            }
        }
        self.event_bus.send(Event::RegionalAnalysis {
            job_id: job.job_id.clone(),
            state: RegionalAnalysisState::Canceled,
            tags: job.tags,
        });
        success
    }

    pub fn get_all_job_statuses(&self) -> Vec<JobStatus> {
        let workers = self.catalog.lock().unwrap().active_workers_per_category();
        let state = self.state.lock().unwrap();
        state
            .jobs
            .values()
            .flatten()
            .map(|job| {
                let mut status = job.status();
                status.active_workers = workers.get(&job.category).copied().unwrap_or(0);
                status
            })
            .sorted_by(|a, b| a.job_id.cmp(&b.job_id))
            .collect()
    }

    pub fn find_job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.state.lock().unwrap().find_job(job_id).map(|j| j.status())
    }

    pub fn any_jobs_active(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .flatten()
            .any(|j| j.is_active())
    }

    pub fn worker_observations(&self) -> Vec<WorkerObservation> {
        self.catalog.lock().unwrap().observations()
    }

    /// Address of a worker able to serve interactive single point requests
    /// on this network, if one is up.
    pub fn get_worker_address(&self, category: &WorkerCategory) -> Option<String> {
        if self.config.offline {
            return Some("localhost".to_string());
        }
        self.catalog.lock().unwrap().single_point_worker_address(category)
    }

    pub fn log_job_status(&self) {
        for status in self.get_all_job_statuses() {
            log::info!(
                "job {}: {}/{} done, {} delivered, {} workers, errored={}",
                status.job_id,
                status.n_tasks_completed,
                status.n_tasks_total,
                status.n_tasks_delivered,
                status.active_workers,
                status.errored
            );
        }
    }
}
