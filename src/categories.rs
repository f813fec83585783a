use serde::{Deserialize, Serialize};
use std::fmt;

/// The pair (transport network, software version) a worker has loaded.
/// Tasks are only handed to workers whose declared category matches the
/// job's, so a worker never has to page a multi-gigabyte network in and out
/// mid-job.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerCategory {
    pub graph_id: String,
    pub worker_version: String,
}

impl WorkerCategory {
    pub fn new(graph_id: impl Into<String>, worker_version: impl Into<String>) -> Self {
        WorkerCategory {
            graph_id: graph_id.into(),
            worker_version: worker_version.into(),
        }
    }
}

impl fmt::Display for WorkerCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.graph_id, self.worker_version)
    }
}

/// Opaque labels attached to launched workers and lifecycle events so the
/// surrounding platform can attribute cloud spend and notifications.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WorkerTags {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub regional_analysis_id: Option<String>,
}
