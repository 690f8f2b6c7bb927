use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::{
    JobInfo, JobRequest, JobResults, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskCompleteRequest, TaskCompleteResponse, TopologyPayload, WorkerHeartbeatRequest,
    WorkerHeartbeatResponse, WorkerId, WorkerMetrics, WorkerRegisterRequest,
    WorkerRegisterResponse,
};
use std::collections::HashMap;
use std::time::SystemTime;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::state::{AppState, WorkerMeta};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/jobs", post(create_job))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/topology", get(get_job_topology))
        .route("/api/v1/jobs/:id/results", get(get_job_results))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/tasks/next", post(assign_task))
        .route("/api/v1/tasks/complete", post(complete_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Compila el descriptor y genera una tarea por corrida
async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> Result<Json<JobInfo>, (StatusCode, String)> {
    let name = req.name.clone();
    match state.submit_job(req) {
        Ok(job_info) => {
            info!(
                "job {} ('{}') aceptado con {} corridas",
                job_info.id, job_info.name, job_info.total_runs
            );
            Ok(Json(job_info))
        }
        Err(e) => {
            warn!("job '{}' rechazado: {}", name, e);
            Err((StatusCode::BAD_REQUEST, e.to_string()))
        }
    }
}

// Devuelve info básica de un job
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, StatusCode> {
    let jobs = state.jobs.lock().unwrap();
    jobs.get(&id).cloned().map(Json).ok_or(StatusCode::NOT_FOUND)
}

// Grafo de dependencias que el worker recompila localmente
async fn get_job_topology(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TopologyPayload>, StatusCode> {
    let topologies = state.topologies.lock().unwrap();
    topologies
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// Reportes de las corridas ya cerradas
async fn get_job_results(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResults>, StatusCode> {
    let results = state.results.lock().unwrap();
    let Some(runs) = results.get(&id) else {
        return Err(StatusCode::NOT_FOUND);
    };

    Ok(Json(JobResults::new(id, runs.clone())))
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> Json<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();

    state.workers.lock().unwrap().insert(
        worker_id.clone(),
        WorkerMeta::new(req.hostname, req.max_concurrency),
    );

    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, req.max_concurrency
    );
    Json(WorkerRegisterResponse { worker_id })
}

// Heartbeat de worker
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> Result<Json<WorkerHeartbeatResponse>, StatusCode> {
    let mut workers = state.workers.lock().unwrap();
    let Some(meta) = workers.get_mut(&req.worker_id) else {
        return Err(StatusCode::NOT_FOUND);
    };

    meta.last_heartbeat = SystemTime::now();
    meta.last_cpu_percent = req.cpu_percent;
    meta.last_mem_bytes = req.mem_bytes;
    if meta.dead {
        info!("el worker {} volvió a dar señales de vida", req.worker_id);
        meta.dead = false;
    }
    Ok(Json(WorkerHeartbeatResponse { ok: true }))
}

// Asigna la siguiente corrida en cola (si hay)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> Json<TaskAssignmentResponse> {
    let task = state.assign_next(&req.worker_id);
    Json(TaskAssignmentResponse { task })
}

// Worker reporta que terminó una corrida
async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<TaskCompleteRequest>,
) -> Result<Json<TaskCompleteResponse>, StatusCode> {
    if let Some(report) = &req.report {
        if !report.is_clean() {
            warn!(
                "la corrida {} terminó con {} comandos fallidos, {} violaciones y {} pasos estancados",
                req.task_id,
                report.commands_failed.len(),
                report.violations.len(),
                report.stalled.len()
            );
        }
    }

    if state.complete_task(&req.task_id, req.success, req.report) {
        Ok(Json(TaskCompleteResponse { ok: true }))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn list_workers(State(state): State<AppState>) -> Json<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar corridas activas por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    for inf in state.in_flight.lock().unwrap().values() {
        *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
    }

    let workers = state.workers.lock().unwrap();
    let mut out = Vec::with_capacity(workers.len());

    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();

        let finished = meta.runs_succeeded + meta.runs_failed;
        let avg_ms = (finished > 0).then(|| meta.total_run_time_ms as f64 / finished as f64);

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            active_runs: active_by_worker.get(wid).copied().unwrap_or(0),
            runs_started: meta.runs_started,
            runs_succeeded: meta.runs_succeeded,
            runs_failed: meta.runs_failed,
            avg_run_ms: avg_ms,
            last_cpu_percent: meta.last_cpu_percent,
            last_mem_bytes: meta.last_mem_bytes,
        });
    }

    Json(out)
}
