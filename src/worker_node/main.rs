#![deny(
    clippy::mutable_key_type,
    clippy::map_entry,
    clippy::boxed_local,
    clippy::let_unit_value,
    clippy::redundant_allocation,
    clippy::bool_comparison,
    clippy::bind_instead_of_map,
    clippy::vec_box,
    clippy::while_let_loop,
    clippy::useless_asref,
    clippy::repeat_once,
    clippy::deref_addrof,
    clippy::suspicious_map,
    clippy::arc_with_non_send_sync,
    clippy::single_char_pattern,
    clippy::for_kv_map,
    clippy::let_and_return,
    clippy::iter_nth,
    clippy::iter_cloned_collect
)]

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod compute;
mod network;

use clap::Parser;
use crossbeam::deque::{Injector, Steal};
use network::NetworkCache;
use rand::Rng;
use speedwell::analysis_tasks::AnalysisTask;
use speedwell::cluster_messages::{RegionalWorkResult, WorkerStatus};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stateless compute worker for the speedwell analysis cluster", long_about = None)]
struct Args {
    #[arg(long, default_value = "http://localhost:7070")]
    broker_url: String,

    /// Transport network this worker loads and declares affinity for
    #[arg(long)]
    network_id: String,

    #[arg(long, default_value = "v1.0")]
    worker_version: String,

    /// Advertise the synchronous single point API to the broker
    #[arg(long, default_value_t = false)]
    single_point: bool,

    /// Address the broker should hand to single point clients
    #[arg(long, default_value = "")]
    advertised_address: String,

    /// Compute threads; defaults to the number of cores
    #[arg(long)]
    threads: Option<usize>,

    /// Cap on tasks held at once, queued plus running; defaults to twice
    /// the compute thread count
    #[arg(long)]
    max_tasks: Option<usize>,

    #[arg(long, default_value_t = 1000)]
    poll_interval_ms: u64,
}

struct WorkerState {
    queue: Injector<AnalysisTask>,
    tasks_in_flight: AtomicUsize,
    networks: NetworkCache,
}

/// One compute thread: steal a task, run the kernel, post the result.
/// Propagation is pure CPU work, so it runs under spawn_blocking to stay off
/// the reactor threads.
async fn compute_loop(
    state: Arc<WorkerState>,
    client: reqwest::Client,
    results_url: String,
) {
    loop {
        match state.queue.steal() {
            Steal::Success(task) => {
                let engine = state.networks.get_or_load(&task.network_id);
                let result = tokio::task::spawn_blocking(move || {
                    compute::compute_result(engine.as_ref(), &task)
                })
                .await;
                match result {
                    Ok(result) => post_result(&client, &results_url, &result).await,
                    Err(join_failure) => {
                        log::error!("compute task panicked or was cancelled: {}", join_failure);
                    }
                }
                state.tasks_in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Steal::Retry => {}
            Steal::Empty => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

/// Results are delivered at least once; keep trying for a while before
/// dropping one on the floor. The broker redelivers the task eventually if
/// we fail here.
async fn post_result(client: &reqwest::Client, results_url: &str, result: &RegionalWorkResult) {
    for attempt in 0..5u32 {
        match client.post(results_url).json(result).send().await {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => {
                log::warn!(
                    "broker answered {} for task {} of job {}",
                    response.status(),
                    result.task_id,
                    result.job_id
                );
            }
            Err(failure) => {
                log::warn!("posting result failed (attempt {}): {}", attempt + 1, failure);
            }
        }
        tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
    }
    log::error!(
        "giving up on task {} of job {}; the broker will redeliver it",
        result.task_id,
        result.job_id
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let worker_id = Uuid::new_v4().to_string();
    let threads = args.threads.unwrap_or_else(|| {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
    });
    // keep a little headroom queued so threads never starve between polls
    let max_tasks = args.max_tasks.unwrap_or(threads * 2);
    log::info!(
        "worker {} serving network {} with {} compute threads, holding up to {} tasks",
        worker_id,
        args.network_id,
        threads,
        max_tasks
    );

    let state = Arc::new(WorkerState {
        queue: Injector::new(),
        tasks_in_flight: AtomicUsize::new(0),
        networks: NetworkCache::new(),
    });
    // load the declared network up front so the first task doesn't pay for it
    state.networks.get_or_load(&args.network_id);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let poll_url = format!("{}/internal/poll", args.broker_url);
    let results_url = format!("{}/internal/results", args.broker_url);

    for _ in 0..threads {
        tokio::spawn(compute_loop(
            state.clone(),
            client.clone(),
            results_url.clone(),
        ));
    }

    // Short-poll forever. Every poll is also the heartbeat that keeps this
    // worker in the broker's catalog, so poll even when saturated.
    loop {
        let tasks_in_flight = state.tasks_in_flight.load(Ordering::SeqCst);
        let status = WorkerStatus {
            worker_id: worker_id.clone(),
            graph_id: args.network_id.clone(),
            worker_version: args.worker_version.clone(),
            ip_address: args.advertised_address.clone(),
            max_tasks_requested: max_tasks.saturating_sub(tasks_in_flight),
            tasks_in_flight,
            single_point_capable: args.single_point,
        };
        match client.post(&poll_url).json(&status).send().await {
            Ok(response) => match response.json::<Vec<AnalysisTask>>().await {
                Ok(tasks) => {
                    if !tasks.is_empty() {
                        log::info!("received {} task(s)", tasks.len());
                    }
                    for task in tasks {
                        state.tasks_in_flight.fetch_add(1, Ordering::SeqCst);
                        state.queue.push(task);
                    }
                }
                Err(failure) => log::warn!("unreadable poll response: {}", failure),
            },
            Err(failure) => {
                log::warn!("poll failed: {}; backing off", failure);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
        // jitter so a fleet started at the same instant doesn't poll in phase
        let jitter = rand::rng().random_range(0..250);
        tokio::time::sleep(Duration::from_millis(args.poll_interval_ms + jitter)).await;
    }
}
