use crate::analysis_tasks::AnalysisTask;
use crate::categories::{WorkerCategory, WorkerTags};
use crate::epoch_ms;
use serde::Serialize;

/// How long a delivered task stays invisible before it becomes eligible for
/// redelivery. Regional tasks take seconds to low minutes each, so five
/// minutes keeps spurious redeliveries rare while bounding the damage from a
/// crashed worker.
pub const DEFAULT_REDELIVERY_TIMEOUT_MS: i64 = 5 * 60 * 1000;

/// One regional analysis: an immutable template task plus the mutable
/// bookkeeping for delivering its origins to workers and collecting
/// completions. All mutation happens under the broker's state lock.
pub struct Job {
    pub job_id: String,
    pub category: WorkerCategory,
    pub tags: WorkerTags,
    pub template: AnalysisTask,
    pub n_tasks_total: usize,
    pub errors: Vec<String>,

    delivered: Vec<bool>,
    completed: Vec<bool>,
    /// Redelivery-due time for delivered-but-unfinished tasks, epoch ms.
    deadline_ms: Vec<i64>,
    n_delivered: usize,
    n_completed: usize,
    /// Lowest index that has never been delivered. Undelivered tasks go out
    /// before any redelivery so the head of the job keeps moving forward.
    next_undelivered: usize,
    redelivery_timeout_ms: i64,
}

impl Job {
    /// The template must carry a regional detail block; its job id names the
    /// job everywhere (maps, result messages, output files).
    pub fn new(template: AnalysisTask, tags: WorkerTags, n_tasks_total: usize) -> Option<Job> {
        let job_id = template.regional()?.job_id.clone();
        Some(Job {
            job_id,
            category: template.worker_category(),
            tags,
            template,
            n_tasks_total,
            errors: Vec::new(),
            delivered: vec![false; n_tasks_total],
            completed: vec![false; n_tasks_total],
            deadline_ms: vec![0; n_tasks_total],
            n_delivered: 0,
            n_completed: 0,
            next_undelivered: 0,
            redelivery_timeout_ms: DEFAULT_REDELIVERY_TIMEOUT_MS,
        })
    }

    pub fn with_redelivery_timeout_ms(mut self, timeout_ms: i64) -> Job {
        self.redelivery_timeout_ms = timeout_ms;
        self
    }

    pub fn is_errored(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.n_completed == self.n_tasks_total
    }

    pub fn is_active(&self) -> bool {
        !self.is_errored() && !self.is_complete()
    }

    pub fn n_completed(&self) -> usize {
        self.n_completed
    }

    pub fn n_delivered(&self) -> usize {
        self.n_delivered
    }

    pub fn has_tasks_to_deliver(&self) -> bool {
        self.has_tasks_to_deliver_at(epoch_ms())
    }

    pub(crate) fn has_tasks_to_deliver_at(&self, now_ms: i64) -> bool {
        if self.is_errored() || self.is_complete() {
            return false;
        }
        if self.next_undelivered < self.n_tasks_total {
            return true;
        }
        self.first_redeliverable(0, now_ms).is_some()
    }

    fn first_redeliverable(&self, from: usize, now_ms: i64) -> Option<usize> {
        (from..self.n_tasks_total)
            .find(|&i| self.delivered[i] && !self.completed[i] && now_ms > self.deadline_ms[i])
    }

    /// Hand out up to `max_tasks` tasks, marking them delivered and arming
    /// their redelivery deadline. Never-delivered tasks (ascending) come
    /// before timed-out redeliveries so the long tail is not ignored.
    pub fn generate_some_tasks_to_deliver(&mut self, max_tasks: usize) -> Vec<AnalysisTask> {
        self.generate_some_tasks_to_deliver_at(max_tasks, epoch_ms())
    }

    pub(crate) fn generate_some_tasks_to_deliver_at(
        &mut self,
        max_tasks: usize,
        now_ms: i64,
    ) -> Vec<AnalysisTask> {
        let mut task_ids: Vec<usize> = Vec::with_capacity(max_tasks);
        while self.next_undelivered < self.n_tasks_total && task_ids.len() < max_tasks {
            task_ids.push(self.next_undelivered);
            self.next_undelivered += 1;
        }
        let mut scan = 0;
        while task_ids.len() < max_tasks {
            match self.first_redeliverable(scan, now_ms) {
                Some(i) => {
                    task_ids.push(i);
                    scan = i + 1;
                }
                None => break,
            }
        }
        for &i in &task_ids {
            if !self.delivered[i] {
                self.delivered[i] = true;
                self.n_delivered += 1;
            }
            self.deadline_ms[i] = now_ms + self.redelivery_timeout_ms;
        }
        task_ids
            .iter()
            .map(|&i| self.template.materialize_regional(i as i32))
            .collect()
    }

    /// Set the completion bit. Idempotent: the bit transitions 0 to 1 at most
    /// once and replays are no-ops. Returns false for a task id that is out
    /// of range or was never delivered, which indicates a broker bug or a
    /// forged result.
    pub fn mark_task_completed(&mut self, task_id: i32) -> bool {
        let Ok(i) = usize::try_from(task_id) else {
            return false;
        };
        if i >= self.n_tasks_total || !self.delivered[i] {
            return false;
        }
        if !self.completed[i] {
            self.completed[i] = true;
            self.n_completed += 1;
        }
        true
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.job_id.clone(),
            graph_id: self.category.graph_id.clone(),
            worker_version: self.category.worker_version.clone(),
            n_tasks_total: self.n_tasks_total,
            n_tasks_delivered: self.n_delivered,
            n_tasks_completed: self.n_completed,
            complete: self.is_complete(),
            errored: self.is_errored(),
            errors: self.errors.clone(),
            active_workers: 0,
        }
    }
}

/// Read-only projection of a job for the HTTP API and the status log.
#[derive(Clone, Debug, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub graph_id: String,
    pub worker_version: String,
    pub n_tasks_total: usize,
    pub n_tasks_delivered: usize,
    pub n_tasks_completed: usize,
    pub complete: bool,
    pub errored: bool,
    pub errors: Vec<String>,
    /// Fresh workers in this job's category, filled in by the broker.
    pub active_workers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis_tasks::{RegionalDetail, TaskDetail};

    fn job(n_tasks: usize) -> Job {
        let template = AnalysisTask {
            network_id: "nl".to_string(),
            worker_version: "v1.0".to_string(),
            zoom: 9,
            west: 0,
            north: 0,
            width: n_tasks as i32,
            height: 1,
            from_time: 0,
            to_time: 3600,
            monte_carlo_draws: 0,
            percentiles: vec![50],
            max_trip_duration_minutes: 120,
            walk_speed_mps: 1.3,
            transit_modes: vec![],
            in_routing_fare_calculator: None,
            detail: TaskDetail::Regional(RegionalDetail {
                job_id: "job-1".to_string(),
                task_id: -1,
                record_accessibility: true,
                record_times: false,
                origin_pointset_key: None,
                include_path_results: false,
                opportunity_column: None,
            }),
        };
        Job::new(template, WorkerTags::default(), n_tasks).unwrap()
    }

    fn task_ids(tasks: &[AnalysisTask]) -> Vec<i32> {
        tasks.iter().map(|t| t.regional().unwrap().task_id).collect()
    }

    #[test]
    fn delivers_undelivered_tasks_in_order() {
        let mut job = job(5);
        let now = epoch_ms();
        let first = job.generate_some_tasks_to_deliver_at(3, now);
        assert_eq!(task_ids(&first), vec![0, 1, 2]);
        let rest = job.generate_some_tasks_to_deliver_at(10, now);
        assert_eq!(task_ids(&rest), vec![3, 4]);
        // everything delivered, nothing timed out yet
        assert!(job.generate_some_tasks_to_deliver_at(10, now).is_empty());
        assert!(!job.has_tasks_to_deliver_at(now));
    }

    #[test]
    fn redelivery_only_after_deadline() {
        let mut job = job(2);
        let now = epoch_ms();
        job.generate_some_tasks_to_deliver_at(2, now);
        let before = now + DEFAULT_REDELIVERY_TIMEOUT_MS;
        assert!(!job.has_tasks_to_deliver_at(before));
        let after = before + 1;
        assert!(job.has_tasks_to_deliver_at(after));
        let redelivered = job.generate_some_tasks_to_deliver_at(10, after);
        assert_eq!(task_ids(&redelivered), vec![0, 1]);
        assert_eq!(job.n_delivered(), 2);
    }

    #[test]
    fn completed_tasks_are_never_redelivered() {
        let mut job = job(2);
        let now = epoch_ms();
        job.generate_some_tasks_to_deliver_at(2, now);
        assert!(job.mark_task_completed(0));
        let after = now + DEFAULT_REDELIVERY_TIMEOUT_MS + 1;
        assert_eq!(task_ids(&job.generate_some_tasks_to_deliver_at(10, after)), vec![1]);
    }

    #[test]
    fn undelivered_tasks_precede_redeliveries() {
        let mut job = job(4).with_redelivery_timeout_ms(0);
        let now = epoch_ms();
        job.generate_some_tasks_to_deliver_at(2, now);
        // tasks 0 and 1 are already redeliverable, but 2 and 3 go first
        let batch = job.generate_some_tasks_to_deliver_at(3, now + 1);
        assert_eq!(task_ids(&batch), vec![2, 3, 0]);
    }

    #[test]
    fn completion_is_idempotent_and_requires_delivery() {
        let mut job = job(3);
        assert!(!job.mark_task_completed(0)); // never delivered
        assert!(!job.mark_task_completed(-1));
        assert!(!job.mark_task_completed(99));
        job.generate_some_tasks_to_deliver_at(3, epoch_ms());
        assert!(job.mark_task_completed(0));
        assert!(job.mark_task_completed(0));
        assert_eq!(job.n_completed(), 1);
        job.mark_task_completed(1);
        job.mark_task_completed(2);
        assert!(job.is_complete());
        assert!(!job.is_active());
    }

    #[test]
    fn errored_job_stops_delivering_but_stays_queryable() {
        let mut job = job(3);
        job.generate_some_tasks_to_deliver_at(1, epoch_ms());
        job.errors.push("worker exploded".to_string());
        assert!(job.is_errored());
        assert!(!job.is_active());
        assert!(!job.has_tasks_to_deliver());
        let status = job.status();
        assert!(status.errored);
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.n_tasks_delivered, 1);
    }
}
