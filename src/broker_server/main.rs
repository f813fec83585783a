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

use actix_web::{middleware, web, App, HttpResponse, HttpServer, Responder};
use clap::Parser;
use serde::Deserialize;
use speedwell::analysis_tasks::AnalysisTask;
use speedwell::assembler::MultiOriginAssembler;
use speedwell::broker::{Broker, BrokerConfig, BrokerError};
use speedwell::categories::WorkerTags;
use speedwell::cluster_messages::{RegionalWorkResult, WorkerStatus};
use speedwell::events::LogEventBus;
use speedwell::file_storage::LocalFileStorage;
use speedwell::job::Job;
use speedwell::worker_launcher::LocalWorkerLauncher;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about = "Broker for the speedwell analysis cluster", long_about = None)]
struct Args {
    /// Listen address for worker polls and the job API
    #[arg(long, default_value = "0.0.0.0")]
    address: String,
    #[arg(long, default_value_t = 7070)]
    port: u16,

    /// Connection string of the analysis database. Persistence lives in the
    /// surrounding platform; the value is surfaced here for operators
    /// running the full stack.
    #[arg(long, default_value = "mongodb://127.0.0.1:27017")]
    database_uri: String,
    #[arg(long, default_value = "analysis")]
    database_name: String,

    /// Run without cloud workers; a local worker process serves every network
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Hard cap on the total worker fleet across all categories
    #[arg(long, default_value_t = 100)]
    max_workers: usize,

    /// Enqueue fake jobs without launching workers, for redelivery testing
    #[arg(long, default_value_t = false)]
    test_task_redelivery: bool,

    /// Directory where finished result grids are stored
    #[arg(long, default_value = "./storage")]
    storage_dir: String,
}

/// Body of a regional analysis submission: the template task plus labels.
#[derive(Deserialize)]
struct JobSubmission {
    template: AnalysisTask,
    #[serde(default)]
    tags: WorkerTags,
    /// Override for tests; production jobs keep the default.
    redelivery_timeout_ms: Option<i64>,
}

async fn poll(broker: web::Data<Broker>, status: web::Json<WorkerStatus>) -> impl Responder {
    let status = status.into_inner();
    broker.record_worker_observation(&status);
    let tasks = broker.get_some_work(&status.category(), status.max_tasks_requested);
    HttpResponse::Ok().json(tasks)
}

async fn results(broker: web::Data<Broker>, result: web::Json<RegionalWorkResult>) -> impl Responder {
    // 200 unconditionally: the worker cannot do anything useful with a
    // failure, and the broker records problems on the job itself. Assembly
    // writes to disk, so keep it off the server threads.
    let broker = broker.clone();
    let result = result.into_inner();
    let _ = web::block(move || broker.handle_regional_work_result(result)).await;
    HttpResponse::Ok().finish()
}

async fn enqueue_job(broker: web::Data<Broker>, submission: web::Json<JobSubmission>) -> impl Responder {
    let JobSubmission {
        mut template,
        tags,
        redelivery_timeout_ms,
    } = submission.into_inner();
    {
        use speedwell::analysis_tasks::TaskDetail;
        match &mut template.detail {
            TaskDetail::Regional(detail) => {
                if detail.job_id.is_empty() {
                    detail.job_id = uuid::Uuid::new_v4().to_string();
                }
            }
            TaskDetail::TravelTimeSurface { .. } => {
                return HttpResponse::BadRequest()
                    .body("regional jobs require a regional template task");
            }
        }
    }
    let n_tasks_total = template.n_targets();
    let assembler = match MultiOriginAssembler::new(&template, n_tasks_total) {
        Ok(assembler) => assembler,
        Err(failure) => {
            log::error!("could not create result assembler: {}", failure);
            return HttpResponse::InternalServerError().body(failure.to_string());
        }
    };
    let Some(mut job) = Job::new(template, tags, n_tasks_total) else {
        return HttpResponse::BadRequest().body("regional jobs require a regional template task");
    };
    if let Some(timeout_ms) = redelivery_timeout_ms {
        job = job.with_redelivery_timeout_ms(timeout_ms);
    }
    let job_id = job.job_id.clone();
    match broker.enqueue_regional_job(job, assembler) {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "job_id": job_id })),
        Err(failure @ BrokerError::DuplicateJob(_)) => {
            HttpResponse::Conflict().body(failure.to_string())
        }
    }
}

async fn job_statuses(broker: web::Data<Broker>) -> impl Responder {
    HttpResponse::Ok().json(broker.get_all_job_statuses())
}

async fn job_status(broker: web::Data<Broker>, path: web::Path<String>) -> impl Responder {
    match broker.find_job_status(&path.into_inner()) {
        Some(status) => HttpResponse::Ok().json(status),
        None => HttpResponse::NotFound().finish(),
    }
}

async fn delete_job(broker: web::Data<Broker>, path: web::Path<String>) -> impl Responder {
    if broker.delete_job(&path.into_inner()) {
        HttpResponse::Ok().finish()
    } else {
        HttpResponse::NotFound().finish()
    }
}

async fn workers(broker: web::Data<Broker>) -> impl Responder {
    HttpResponse::Ok().json(broker.worker_observations())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    log::info!(
        "broker starting; database {} at {} is managed by the surrounding platform",
        args.database_name,
        args.database_uri
    );

    let config = BrokerConfig {
        offline: args.offline,
        max_workers: args.max_workers,
        test_task_redelivery: args.test_task_redelivery,
    };
    let storage = Arc::new(LocalFileStorage::new(args.storage_dir.as_str())?);
    let broker = web::Data::new(Broker::new(
        config,
        storage,
        Arc::new(LogEventBus),
        Arc::new(LocalWorkerLauncher),
    ));

    // periodic visibility into long-running jobs
    let status_broker = broker.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            if status_broker.any_jobs_active() {
                status_broker.log_job_status();
            }
        }
    });

    log::info!("listening on {}:{}", args.address, args.port);
    let server = HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .app_data(broker.clone())
            .route("/internal/poll", web::post().to(poll))
            .route("/internal/results", web::post().to(results))
            .route("/api/jobs", web::post().to(enqueue_job))
            .route("/api/jobs", web::get().to(job_statuses))
            .route("/api/jobs/{job_id}", web::get().to(job_status))
            .route("/api/jobs/{job_id}", web::delete().to(delete_job))
            .route("/api/workers", web::get().to(workers))
    })
    .disable_signals()
    .bind((args.address.as_str(), args.port))?
    .run();

    // Shutdown hook: on ctrl-c, stop accepting polls and results. Grid temp
    // files of unfinished jobs are left behind for the OS temp cleaner;
    // workers with tasks in flight will find their results discarded when
    // the broker comes back without those jobs.
    let server_handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown requested; no longer accepting work");
            server_handle.stop(true).await;
        }
    });

    server.await?;
    Ok(())
}
