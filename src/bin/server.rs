//! REST API server for jailwatch
//!
//! Wraps one [`Orchestrator`] and keeps a bounded log of everything it publishes.
//!
//! ## Endpoints
//!
//! GET /health - Liveness probe
//! POST /api/v1/jail/prepare - Prepare a jail directory
//! POST /api/v1/executions - Launch an execution (replaces the current one)
//! GET /api/v1/executions/current - Snapshot of the current execution
//! DELETE /api/v1/executions/current - Stop the current execution
//! GET /api/v1/events?since=N - Published events with a sequence number above N

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use jailwatch::events::{channel, EventEnvelope, EventStream};
use jailwatch::isolation::{CommandJailPreparer, DirectoryJailPreparer, JailPreparer};
use jailwatch::logging::init_logger;
use jailwatch::{
    CommandResult, ExecutionRequest, Orchestrator, OrchestratorBuilder, OrchestratorConfig,
    StartOutcome,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

/// Largest number of events kept for polling clients
const EVENT_LOG_CAPACITY: usize = 10_000;
/// External jail preparation program; directories are created when unset
const ENV_JAIL_PREPARER: &str = "JAILWATCH_JAIL_PREPARER";
const ENV_BIND: &str = "JAILWATCH_BIND";

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_logger(false);

    let config = OrchestratorConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let state = web::Data::new(
        AppState::new(config, preparer_from_env())
            .map_err(|e| std::io::Error::other(e.to_string()))?,
    );

    let bind = std::env::var(ENV_BIND).unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    info!("jailwatch REST API starting on http://{}", bind);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api/v1")
                    .route("/jail/prepare", web::post().to(prepare_jail))
                    .route("/executions", web::post().to(start_execution))
                    .route("/executions/current", web::get().to(current_execution))
                    .route("/executions/current", web::delete().to(stop_execution))
                    .route("/events", web::get().to(list_events)),
            )
    })
    .bind(bind)?
    .run()
    .await
}

fn preparer_from_env() -> Arc<dyn JailPreparer> {
    match std::env::var(ENV_JAIL_PREPARER) {
        Ok(program) if !program.trim().is_empty() => {
            let mut parts = program.split_whitespace();
            let name = parts.next().unwrap_or_default().to_string();
            Arc::new(CommandJailPreparer::new(name).with_args(parts.map(String::from)))
        }
        _ => Arc::new(DirectoryJailPreparer),
    }
}

// ============ API Types ============

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareJailRequest {
    pub jail_path: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedExecution {
    pub run_id: String,
    pub pid: u32,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SequencedEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub envelope: EventEnvelope,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    fn error(message: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

// ============ Application State ============

/// Ring of published events, numbered from 1
pub struct EventLog {
    capacity: usize,
    next_seq: u64,
    entries: VecDeque<SequencedEvent>,
}

impl EventLog {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 1,
            entries: VecDeque::new(),
        }
    }

    fn push(&mut self, envelope: EventEnvelope) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(SequencedEvent {
            seq: self.next_seq,
            envelope,
        });
        self.next_seq += 1;
    }

    fn since(&self, seq: u64) -> Vec<SequencedEvent> {
        self.entries
            .iter()
            .filter(|entry| entry.seq > seq)
            .cloned()
            .collect()
    }
}

pub struct AppState {
    orchestrator: Mutex<Orchestrator>,
    events: Arc<Mutex<EventLog>>,
    preparer: Arc<dyn JailPreparer>,
}

impl AppState {
    fn new(config: OrchestratorConfig, preparer: Arc<dyn JailPreparer>) -> jailwatch::Result<Self> {
        let (sink, stream) = channel();
        let orchestrator = OrchestratorBuilder::from_config(config).build(sink)?;
        let events = Arc::new(Mutex::new(EventLog::new(EVENT_LOG_CAPACITY)));
        spawn_event_pump(stream, Arc::clone(&events))?;

        Ok(Self {
            orchestrator: Mutex::new(orchestrator),
            events,
            preparer,
        })
    }

    fn orchestrator(&self) -> MutexGuard<'_, Orchestrator> {
        self.orchestrator
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn events(&self) -> MutexGuard<'_, EventLog> {
        self.events.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Move published events into the log until the orchestrator goes away
fn spawn_event_pump(stream: EventStream, log: Arc<Mutex<EventLog>>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("event-pump".to_string())
        .spawn(move || {
            for envelope in stream {
                log.lock()
                    .unwrap_or_else(|poison| poison.into_inner())
                    .push(envelope);
            }
        })
        .map(|_| ())
}

// ============ Handlers ============

/// Health check endpoint
async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "jailwatch",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Run the jail preparer synchronously
async fn prepare_jail(req: web::Json<PrepareJailRequest>, state: web::Data<AppState>) -> HttpResponse {
    let preparer = Arc::clone(&state.preparer);
    let path = PathBuf::from(req.into_inner().jail_path);

    match web::block(move || preparer.prepare(&path)).await {
        Ok(Ok(report)) if report.is_ok() => {
            HttpResponse::Ok().json(ApiResponse::ok("Jail prepared", report))
        }
        Ok(Ok(report)) => {
            warn!("Jail preparation failed: {}", report.stderr.trim());
            HttpResponse::Ok().json(ApiResponse {
                success: false,
                message: "Jail preparation failed".to_string(),
                data: Some(report),
            })
        }
        Ok(Err(e)) => HttpResponse::BadRequest().json(ApiResponse::<()>::error(e.to_string())),
        Err(e) => HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string())),
    }
}

/// Launch an execution
async fn start_execution(
    req: web::Json<ExecutionRequest>,
    state: web::Data<AppState>,
) -> HttpResponse {
    let request = req.into_inner();
    let outcome = {
        let state = state.clone();
        web::block(move || {
            let mut orchestrator = state.orchestrator();
            orchestrator.start(request)
        })
        .await
    };

    match outcome {
        Ok(outcome) => {
            let result = CommandResult::from(&outcome);
            match outcome {
                StartOutcome::Accepted { run_id, pid } => HttpResponse::Ok().json(ApiResponse::ok(
                    result.message,
                    StartedExecution { run_id, pid },
                )),
                StartOutcome::Rejected { .. } => {
                    HttpResponse::BadRequest().json(ApiResponse::<()>::error(result.message))
                }
            }
        }
        Err(e) => HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string())),
    }
}

/// Stop the current execution; stopping nothing succeeds
async fn stop_execution(state: web::Data<AppState>) -> HttpResponse {
    let stopped = web::block(move || {
        let mut orchestrator = state.orchestrator();
        orchestrator.stop()
    })
    .await;
    match stopped {
        Ok(outcome) => HttpResponse::Ok().json(CommandResult::from(outcome)),
        Err(e) => HttpResponse::InternalServerError().json(ApiResponse::<()>::error(e.to_string())),
    }
}

/// Snapshot of the current execution
async fn current_execution(state: web::Data<AppState>) -> HttpResponse {
    let current = state.orchestrator().current();
    match current {
        Some(handle) => HttpResponse::Ok().json(ApiResponse::ok("Current execution", handle)),
        None => HttpResponse::NotFound().json(ApiResponse::<()>::error("No execution")),
    }
}

/// Buffered events after `since`
async fn list_events(query: web::Query<EventsQuery>, state: web::Data<AppState>) -> HttpResponse {
    let events = state.events().since(query.since.unwrap_or(0));
    HttpResponse::Ok().json(ApiResponse::ok(format!("{} events", events.len()), events))
}
