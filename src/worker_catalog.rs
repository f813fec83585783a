use crate::categories::WorkerCategory;
use crate::cluster_messages::WorkerStatus;
use crate::epoch_ms;
use ahash::{AHashMap, AHashSet};
use serde::Serialize;

/// Observations older than this are treated as a dead worker. Workers poll
/// roughly every second, so a minute of silence means the instance is gone
/// or wedged.
pub const LIVENESS_WINDOW_MS: i64 = 60_000;

/// What we know about one worker, refreshed on every poll.
#[derive(Clone, Debug, Serialize)]
pub struct WorkerObservation {
    pub worker_id: String,
    pub category: WorkerCategory,
    pub ip_address: String,
    pub single_point_capable: bool,
    pub tasks_in_flight: usize,
    pub last_seen_ms: i64,
}

/// Index of the churning worker population: by id, and by category so the
/// broker can count affinity for each network. Not internally locked; the
/// broker wraps the catalog in its own mutex, separate from the job state
/// lock.
#[derive(Default)]
pub struct WorkerCatalog {
    observations: AHashMap<String, WorkerObservation>,
    workers_by_category: AHashMap<WorkerCategory, AHashSet<String>>,
}

impl WorkerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the observation from one poll, stamping the current time.
    pub fn catalog(&mut self, status: &WorkerStatus) {
        self.catalog_at(status, epoch_ms());
    }

    pub(crate) fn catalog_at(&mut self, status: &WorkerStatus, now_ms: i64) {
        self.purge_stale(now_ms);
        let category = status.category();
        if let Some(previous) = self.observations.get(&status.worker_id) {
            if previous.category != category {
                // worker migrated to another network; drop the old index entry
                if let Some(ids) = self.workers_by_category.get_mut(&previous.category) {
                    ids.remove(&status.worker_id);
                }
            }
        }
        self.workers_by_category
            .entry(category.clone())
            .or_default()
            .insert(status.worker_id.clone());
        let entry = self
            .observations
            .entry(status.worker_id.clone())
            .or_insert_with(|| WorkerObservation {
                worker_id: status.worker_id.clone(),
                category: category.clone(),
                ip_address: status.ip_address.clone(),
                single_point_capable: status.single_point_capable,
                tasks_in_flight: status.tasks_in_flight,
                last_seen_ms: now_ms,
            });
        entry.category = category;
        entry.ip_address = status.ip_address.clone();
        entry.single_point_capable = status.single_point_capable;
        entry.tasks_in_flight = status.tasks_in_flight;
        // last-seen is monotonically non-decreasing
        if now_ms > entry.last_seen_ms {
            entry.last_seen_ms = now_ms;
        }
    }

    fn purge_stale(&mut self, now_ms: i64) {
        let cutoff = now_ms - LIVENESS_WINDOW_MS;
        let stale: Vec<String> = self
            .observations
            .values()
            .filter(|obs| obs.last_seen_ms < cutoff)
            .map(|obs| obs.worker_id.clone())
            .collect();
        for worker_id in stale {
            if let Some(obs) = self.observations.remove(&worker_id) {
                if let Some(ids) = self.workers_by_category.get_mut(&obs.category) {
                    ids.remove(&worker_id);
                    if ids.is_empty() {
                        self.workers_by_category.remove(&obs.category);
                    }
                }
            }
        }
    }

    /// Count of fresh workers per category, for job status reporting and
    /// autoscale decisions.
    pub fn active_workers_per_category(&mut self) -> AHashMap<WorkerCategory, usize> {
        self.purge_stale(epoch_ms());
        self.workers_by_category
            .iter()
            .filter(|(_, ids)| !ids.is_empty())
            .map(|(category, ids)| (category.clone(), ids.len()))
            .collect()
    }

    /// True iff no fresh worker can serve this category. In offline mode one
    /// local worker serves every network, so any live observation counts.
    pub fn no_workers_available(&mut self, category: &WorkerCategory, offline: bool) -> bool {
        self.purge_stale(epoch_ms());
        if offline {
            return self.observations.is_empty();
        }
        self.count_in_category(category) == 0
    }

    pub fn total_worker_count(&mut self) -> usize {
        self.purge_stale(epoch_ms());
        self.observations.len()
    }

    pub fn count_workers_in_category(&mut self, category: &WorkerCategory) -> usize {
        self.purge_stale(epoch_ms());
        self.count_in_category(category)
    }

    fn count_in_category(&self, category: &WorkerCategory) -> usize {
        self.workers_by_category
            .get(category)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    /// Any fresh worker in the category that advertises the synchronous
    /// single point API, for the interactive UI to talk to directly.
    pub fn single_point_worker_address(&mut self, category: &WorkerCategory) -> Option<String> {
        self.purge_stale(epoch_ms());
        let ids = self.workers_by_category.get(category)?;
        ids.iter()
            .filter_map(|id| self.observations.get(id))
            .find(|obs| obs.single_point_capable && !obs.ip_address.is_empty())
            .map(|obs| obs.ip_address.clone())
    }

    pub fn observations(&mut self) -> Vec<WorkerObservation> {
        self.purge_stale(epoch_ms());
        self.observations.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(worker_id: &str, graph_id: &str) -> WorkerStatus {
        WorkerStatus {
            worker_id: worker_id.to_string(),
            graph_id: graph_id.to_string(),
            worker_version: "v1.0".to_string(),
            ip_address: format!("10.0.0.{}", worker_id.len()),
            max_tasks_requested: 16,
            tasks_in_flight: 0,
            single_point_capable: true,
        }
    }

    #[test]
    fn upsert_is_unique_by_worker_id() {
        let mut catalog = WorkerCatalog::new();
        catalog.catalog(&status("w1", "nl"));
        catalog.catalog(&status("w1", "nl"));
        catalog.catalog(&status("w2", "nl"));
        assert_eq!(catalog.total_worker_count(), 2);
        assert_eq!(
            catalog.count_workers_in_category(&WorkerCategory::new("nl", "v1.0")),
            2
        );
    }

    #[test]
    fn stale_observations_are_evicted() {
        let mut catalog = WorkerCatalog::new();
        let now = epoch_ms();
        catalog.catalog_at(&status("old", "nl"), now - LIVENESS_WINDOW_MS - 1_000);
        catalog.catalog_at(&status("fresh", "nl"), now);
        assert_eq!(catalog.total_worker_count(), 1);
        assert!(!catalog.no_workers_available(&WorkerCategory::new("nl", "v1.0"), false));
    }

    #[test]
    fn last_seen_never_goes_backwards() {
        let mut catalog = WorkerCatalog::new();
        let now = epoch_ms();
        catalog.catalog_at(&status("w1", "nl"), now);
        catalog.catalog_at(&status("w1", "nl"), now - 5_000);
        let obs = catalog.observations();
        assert_eq!(obs[0].last_seen_ms, now);
    }

    #[test]
    fn category_migration_moves_index_entry() {
        let mut catalog = WorkerCatalog::new();
        catalog.catalog(&status("w1", "nl"));
        catalog.catalog(&status("w1", "de"));
        assert_eq!(
            catalog.count_workers_in_category(&WorkerCategory::new("nl", "v1.0")),
            0
        );
        assert_eq!(
            catalog.count_workers_in_category(&WorkerCategory::new("de", "v1.0")),
            1
        );
    }

    #[test]
    fn offline_mode_accepts_any_live_worker() {
        let mut catalog = WorkerCatalog::new();
        catalog.catalog(&status("w1", "nl"));
        let other = WorkerCategory::new("de", "v1.0");
        assert!(catalog.no_workers_available(&other, false));
        assert!(!catalog.no_workers_available(&other, true));
    }

    #[test]
    fn single_point_lookup_requires_capability() {
        let mut catalog = WorkerCatalog::new();
        let mut incapable = status("w1", "nl");
        incapable.single_point_capable = false;
        catalog.catalog(&incapable);
        let category = WorkerCategory::new("nl", "v1.0");
        assert_eq!(catalog.single_point_worker_address(&category), None);
        catalog.catalog(&status("w2", "nl"));
        assert!(catalog.single_point_worker_address(&category).is_some());
    }
}
