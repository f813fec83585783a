use crate::categories::{WorkerCategory, WorkerTags};

/// Seam to whatever provisions compute: EC2 fleets, kubernetes, or a human
/// starting processes by hand. Launch requests are best-effort with no ack,
/// and implementations must never block the broker; the catalog finding out
/// about new workers through their polls is the only confirmation.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        category: &WorkerCategory,
        tags: &WorkerTags,
        n_on_demand: usize,
        n_spot: usize,
    );
}

/// Launcher for offline and bare-metal deployments: records what the broker
/// wanted so an operator (or nothing at all) can act on it.
pub struct LocalWorkerLauncher;

impl WorkerLauncher for LocalWorkerLauncher {
    fn launch(
        &self,
        category: &WorkerCategory,
        _tags: &WorkerTags,
        n_on_demand: usize,
        n_spot: usize,
    ) {
        log::info!(
            "would launch {} on-demand and {} spot worker(s) for {}; start speedwell-worker processes manually",
            n_on_demand,
            n_spot,
            category
        );
    }
}
