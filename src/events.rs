use crate::categories::{WorkerCategory, WorkerTags};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionalAnalysisState {
    Started,
    Completed,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerRole {
    SinglePoint,
    Regional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerAction {
    Requested,
}

/// Lifecycle notifications emitted by the broker. Fire-and-forget; nothing
/// in the scheduling path ever waits on a listener.
#[derive(Clone, Debug)]
pub enum Event {
    RegionalAnalysis {
        job_id: String,
        state: RegionalAnalysisState,
        tags: WorkerTags,
    },
    Worker {
        role: WorkerRole,
        category: WorkerCategory,
        action: WorkerAction,
        count: usize,
        tags: WorkerTags,
    },
    Error {
        detail: String,
    },
}

pub trait EventBus: Send + Sync {
    fn send(&self, event: Event);
}

/// Default bus: everything goes to the log. Deployments wanting webhooks or
/// a notification queue plug in their own implementation.
pub struct LogEventBus;

impl EventBus for LogEventBus {
    fn send(&self, event: Event) {
        match event {
            Event::RegionalAnalysis { job_id, state, .. } => {
                log::info!("regional analysis {} is now {:?}", job_id, state);
            }
            Event::Worker {
                role,
                category,
                action,
                count,
                ..
            } => {
                log::info!(
                    "{:?} {} worker(s) ({:?}) on {}",
                    action,
                    count,
                    role,
                    category
                );
            }
            Event::Error { detail } => {
                log::error!("error event: {}", detail);
            }
        }
    }
}
