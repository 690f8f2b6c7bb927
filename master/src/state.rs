// master/src/state.rs

use chrono::Utc;
use common::{
    descriptor, ConfigError, JobId, JobInfo, JobRequest, JobStatus, RunReport, RunResult, Task,
    TaskId, Topology, TopologyPayload, WorkerId,
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
    time::SystemTime,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<Mutex<HashMap<JobId, JobInfo>>>,
    // grafo compilado por job; los workers lo piden una vez y lo cachean
    pub topologies: Arc<Mutex<HashMap<JobId, TopologyPayload>>>,
    pub results: Arc<Mutex<HashMap<JobId, Vec<RunResult>>>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // corridas pendientes de asignar
    pub tasks_queue: Arc<Mutex<VecDeque<Task>>>,
    // corridas ya asignadas pero no completadas
    pub in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            topologies: Arc::new(Mutex::new(HashMap::new())),
            results: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            tasks_queue: Arc::new(Mutex::new(VecDeque::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Valida el descriptor, guarda la topología y encola una tarea por corrida.
    /// Un descriptor inválido no deja nada registrado.
    pub fn submit_job(&self, req: JobRequest) -> Result<JobInfo, ConfigError> {
        let graph = descriptor::load(&req.pipeline, req.cwl)?;
        let topology = Topology::from_graph(&graph)?;
        info!(
            "job '{}' compilado: {} pasos, {} splitjoins",
            req.name,
            topology.steps().len(),
            topology.splitjoins().len()
        );

        let job_id = uuid::Uuid::new_v4().to_string();
        let cwl_configuration = req.cwl.then(|| req.pipeline.clone());

        let tasks: Vec<Task> = req
            .runs
            .into_iter()
            .enumerate()
            .map(|(i, run)| Task {
                id: uuid::Uuid::new_v4().to_string(),
                job_id: job_id.clone(),
                run_id: i as i64,
                run,
            })
            .collect();

        let status = if tasks.is_empty() {
            JobStatus::Succeeded
        } else {
            JobStatus::Accepted
        };

        let job_info = JobInfo {
            id: job_id.clone(),
            name: req.name,
            status,
            cwl: req.cwl,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            total_runs: tasks.len() as u32,
            completed_runs: 0,
            failed_runs: 0,
        };

        self.topologies
            .lock()
            .unwrap()
            .insert(job_id.clone(), TopologyPayload::new(graph, cwl_configuration));
        self.results.lock().unwrap().insert(job_id.clone(), Vec::new());
        self.jobs.lock().unwrap().insert(job_id, job_info.clone());
        self.tasks_queue.lock().unwrap().extend(tasks);

        Ok(job_info)
    }

    /// Saca la siguiente corrida de la cola si el worker tiene capacidad.
    pub fn assign_next(&self, worker_id: &str) -> Option<Task> {
        let active = {
            let in_flight = self.in_flight.lock().unwrap();
            in_flight
                .values()
                .filter(|entry| entry.worker_id == worker_id)
                .count() as u32
        };

        let max_for_worker = {
            let workers = self.workers.lock().unwrap();
            match workers.get(worker_id) {
                Some(meta) if !meta.dead => meta.max_concurrency,
                Some(_) => {
                    warn!("el worker {} figura como muerto; no se le asignan corridas", worker_id);
                    return None;
                }
                None => {
                    warn!("el worker {} no está registrado; no se le asignan corridas", worker_id);
                    return None;
                }
            }
        };

        if active >= max_for_worker {
            info!(
                "worker {} pidió corrida pero ya tiene {}/{} en vuelo",
                worker_id, active, max_for_worker
            );
            return None;
        }

        let task = self.tasks_queue.lock().unwrap().pop_front()?;
        info!(
            "asignando corrida {}#{} (job={}) al worker {} ({}/{} en vuelo -> +1)",
            task.run.name, task.run_id, task.job_id, worker_id, active, max_for_worker
        );

        self.in_flight.lock().unwrap().insert(
            task.id.clone(),
            InFlight {
                task: task.clone(),
                worker_id: worker_id.to_string(),
                started_at: SystemTime::now(),
            },
        );

        {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(job) = jobs.get_mut(&task.job_id) {
                if job.status == JobStatus::Accepted {
                    job.status = JobStatus::Running;
                    job.started_at.get_or_insert_with(Utc::now);
                }
            }
        }

        if let Some(meta) = self.workers.lock().unwrap().get_mut(worker_id) {
            meta.runs_started += 1;
        }

        Some(task)
    }

    /// Cierra una corrida. Devuelve `false` si la tarea no estaba en vuelo.
    pub fn complete_task(&self, task_id: &str, success: bool, report: Option<RunReport>) -> bool {
        let Some(inflight) = self.in_flight.lock().unwrap().remove(task_id) else {
            return false;
        };
        self.record_outcome(inflight, success, report);
        true
    }

    /// Marca como fallidas las corridas en vuelo de workers muertos.
    /// No hay reintento: una corrida perdida queda fallida.
    pub fn fail_runs_of(&self, dead_workers: &HashSet<WorkerId>) -> usize {
        let lost: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let ids: Vec<TaskId> = in_flight
                .iter()
                .filter(|(_, entry)| dead_workers.contains(&entry.worker_id))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| in_flight.remove(id)).collect()
        };

        let count = lost.len();
        for inflight in lost {
            warn!(
                "la corrida {}#{} del job {} se pierde con el worker {}",
                inflight.task.run.name, inflight.task.run_id, inflight.task.job_id, inflight.worker_id
            );
            self.record_outcome(inflight, false, None);
        }
        count
    }

    fn record_outcome(&self, inflight: InFlight, success: bool, report: Option<RunReport>) {
        let InFlight {
            task,
            worker_id,
            started_at,
        } = inflight;

        let duration_ms = started_at
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        if let Some(meta) = self.workers.lock().unwrap().get_mut(&worker_id) {
            meta.total_run_time_ms += duration_ms;
            if success {
                meta.runs_succeeded += 1;
            } else {
                meta.runs_failed += 1;
            }
        }

        if let Some(runs) = self.results.lock().unwrap().get_mut(&task.job_id) {
            runs.push(RunResult {
                run_name: task.run.name.clone(),
                run_id: task.run_id,
                worker_id: Some(worker_id),
                report,
                success,
            });
        }

        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&task.job_id) else {
            return;
        };
        if success {
            job.completed_runs += 1;
        } else {
            job.failed_runs += 1;
        }

        if job.completed_runs + job.failed_runs >= job.total_runs {
            job.status = if job.failed_runs > 0 {
                JobStatus::Failed
            } else {
                JobStatus::Succeeded
            };
            job.finished_at = Some(Utc::now());
            info!(
                "job {} terminado: {:?} ({} ok, {} fallidas)",
                job.id, job.status, job.completed_runs, job.failed_runs
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub runs_started: u64,
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    pub total_run_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32) -> Self {
        Self {
            hostname,
            last_heartbeat: SystemTime::now(),
            dead: false,
            max_concurrency,
            runs_started: 0,
            runs_succeeded: 0,
            runs_failed: 0,
            total_run_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub task: Task,
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}
