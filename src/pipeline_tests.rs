//! End to end: propagate a tiny street-only job through the reducer, post
//! the per-origin results to the broker out of order, and check the bytes
//! that land in storage.

use crate::analysis_tasks::{AnalysisTask, RegionalDetail, TaskDetail};
use crate::assembler::MultiOriginAssembler;
use crate::broker::{Broker, BrokerConfig};
use crate::categories::{WorkerCategory, WorkerTags};
use crate::events::LogEventBus;
use crate::file_storage::LocalFileStorage;
use crate::job::Job;
use crate::propagation::{EgressTables, PerTargetPropagator};
use crate::reducer::TravelTimeReducer;
use crate::time_grid::read_grid;
use crate::worker_launcher::LocalWorkerLauncher;
use std::sync::Arc;

const N_ORIGINS: usize = 4;
const N_DESTINATIONS: usize = 9;

fn template(job_id: &str) -> AnalysisTask {
    AnalysisTask {
        network_id: "tiny".to_string(),
        worker_version: "v1.0".to_string(),
        zoom: 9,
        west: 10,
        north: 20,
        width: 3,
        height: 3,
        from_time: 0,
        to_time: 60, // one departure minute, one iteration
        monte_carlo_draws: 0,
        percentiles: vec![50],
        max_trip_duration_minutes: 10, // cutoff 600 seconds
        walk_speed_mps: 1.3,
        transit_modes: vec![],
        in_routing_fare_calculator: None,
        detail: TaskDetail::Regional(RegionalDetail {
            job_id: job_id.to_string(),
            task_id: -1,
            record_accessibility: true,
            record_times: true,
            origin_pointset_key: Some("four-origins".to_string()),
            include_path_results: false,
            opportunity_column: None,
        }),
    }
}

/// The street stage of the tiny world: every origin sees the same times to
/// the nine destinations, 60 through 540 seconds.
fn compute_origin(task: &AnalysisTask) -> crate::cluster_messages::RegionalWorkResult {
    let non_transit: Vec<i32> = (1..=N_DESTINATIONS as i32).map(|d| d * 60).collect();
    let travel_times_to_stops: Vec<Vec<i32>> = vec![Vec::new()]; // no transit
    let egress = EgressTables {
        stops_for_target: vec![Vec::new(); N_DESTINATIONS],
    };
    let mut reducer =
        TravelTimeReducer::new(task, Some(vec![1.0; N_DESTINATIONS])).unwrap();
    let propagator = PerTargetPropagator::new(
        &travel_times_to_stops,
        &non_transit,
        &egress,
        task.walk_speed_mps,
        task.max_trip_duration_minutes * 60,
        task.records_times(),
    );
    propagator.propagate(&mut reducer).unwrap();
    reducer.finish().into_regional_result(task)
}

#[test]
fn tiny_street_only_job_assembles_expected_grids() {
    let job_id = format!("tiny-{}", uuid::Uuid::new_v4());
    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(LocalFileStorage::new(scratch.path()).unwrap());

    let broker = Broker::new(
        BrokerConfig {
            offline: true,
            max_workers: 4,
            test_task_redelivery: false,
        },
        storage.clone(),
        Arc::new(LogEventBus),
        Arc::new(LocalWorkerLauncher),
    );

    let template = template(&job_id);
    let job = Job::new(template.clone(), WorkerTags::default(), N_ORIGINS).unwrap();
    let assembler = MultiOriginAssembler::new(&template, N_ORIGINS).unwrap();
    broker.enqueue_regional_job(job, assembler).unwrap();

    // a worker polls and computes all four origins
    let tasks = broker.get_some_work(&WorkerCategory::new("tiny", "v1.0"), 16);
    assert_eq!(tasks.len(), N_ORIGINS);

    // results arrive out of order, one of them twice
    let mut results: Vec<_> = tasks.iter().map(compute_origin).collect();
    results.rotate_left(2);
    results.push(results[0].clone());
    for result in results {
        broker.handle_regional_work_result(result);
    }

    // the job completed and disappeared
    assert!(broker.find_job_status(&job_id).is_none());

    // every origin reaches the nine destinations in 1..=9 minutes
    let (times_header, times) = read_grid(&storage.path_for(&format!("{}_times.grid", job_id))).unwrap();
    assert_eq!(times_header.width, 3);
    assert_eq!(times_header.height, 3);
    assert_eq!(times_header.n_values_per_pixel, 1);
    assert_eq!(times.len(), N_ORIGINS * N_DESTINATIONS);
    let expected: Vec<i32> = (1..=9).collect();
    for origin in 0..N_ORIGINS {
        assert_eq!(
            &times[origin * N_DESTINATIONS..(origin + 1) * N_DESTINATIONS],
            expected.as_slice(),
            "origin {}",
            origin
        );
    }

    // all nine destinations are under the ten minute cutoff, one opportunity
    // each, so accessibility is nine at every origin
    let (_, access) = read_grid(&storage.path_for(&format!("{}_access.grid", job_id))).unwrap();
    assert_eq!(access, vec![9; N_ORIGINS]);
}

#[test]
fn duplicate_final_result_does_not_disturb_stored_bytes() {
    let job_id = format!("dup-{}", uuid::Uuid::new_v4());
    let scratch = tempfile::tempdir().unwrap();
    let storage = Arc::new(LocalFileStorage::new(scratch.path()).unwrap());
    let broker = Broker::new(
        BrokerConfig {
            offline: true,
            max_workers: 4,
            test_task_redelivery: false,
        },
        storage.clone(),
        Arc::new(LogEventBus),
        Arc::new(LocalWorkerLauncher),
    );

    let template = template(&job_id);
    let job = Job::new(template.clone(), WorkerTags::default(), 2).unwrap();
    let assembler = MultiOriginAssembler::new(&template, 2).unwrap();
    broker.enqueue_regional_job(job, assembler).unwrap();
    let tasks = broker.get_some_work(&WorkerCategory::new("tiny", "v1.0"), 16);

    let final_result = compute_origin(&tasks[1]);
    broker.handle_regional_work_result(compute_origin(&tasks[0]));
    broker.handle_regional_work_result(final_result.clone());
    let stored = std::fs::read(storage.path_for(&format!("{}_access.grid", job_id))).unwrap();

    // a straggling redelivery of the final task arrives after completion
    broker.handle_regional_work_result(final_result);
    let after = std::fs::read(storage.path_for(&format!("{}_access.grid", job_id))).unwrap();
    assert_eq!(stored, after);
}
