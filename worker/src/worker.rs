use anyhow::{bail, Context, Result};
use common::{
    Engine, EngineConfig, JobId, RunReport, ShellRunner, Task, TaskAssignmentRequest,
    TaskAssignmentResponse, TaskCompleteRequest, TopologyPayload, WorkerHeartbeatRequest,
    WorkerRegisterRequest, WorkerRegisterResponse,
};
use reqwest::Client;
use std::{
    collections::HashMap,
    env,
    sync::{Arc, Mutex},
    time::Duration,
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{info, warn};

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;

/// Topologías ya descargadas, una por job.
type TopologyCache = Arc<Mutex<HashMap<JobId, Arc<TopologyPayload>>>>;

/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos con CPU y memoria.
/// - Pide corridas mientras tenga "slots" libres.
/// - Ejecuta cada corrida con su propio motor (hasta WORKER_CONCURRENCY a la vez).
pub async fn run() -> Result<()> {
    let base_url = master_base_url();
    let client = Client::new();

    let hostname = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let max_concurrency: u32 = env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

    // Registro de worker (enviando max_concurrency)
    let register_url = format!("{}/api/v1/workers/register", base_url);
    let WorkerRegisterResponse { worker_id } = client
        .post(&register_url)
        .json(&WorkerRegisterRequest {
            hostname,
            max_concurrency,
        })
        .send()
        .await
        .with_context(|| format!("no se pudo contactar al master en {}", base_url))?
        .error_for_status()?
        .json()
        .await?;

    info!(
        "worker {} registrado con concurrency={} contra {}",
        worker_id, max_concurrency, base_url
    );

    let sem = Arc::new(Semaphore::new(max_concurrency as usize));
    let cache: TopologyCache = Arc::new(Mutex::new(HashMap::new()));

    // System para leer CPU y memoria
    let mut sys = System::new_all();

    loop {
        // --------- Heartbeat al master con CPU/MEM ---------
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        // used_memory devuelve KB -> lo pasamos a bytes
        let mem_bytes = sys.used_memory() * 1024;

        let hb_url = format!("{}/api/v1/workers/heartbeat", base_url);
        if let Err(e) = client
            .post(&hb_url)
            .json(&WorkerHeartbeatRequest {
                worker_id: worker_id.clone(),
                cpu_percent: Some(cpu_percent),
                mem_bytes: Some(mem_bytes),
            })
            .send()
            .await
        {
            warn!("heartbeat fallido: {}", e);
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                // No hay capacidad para nuevas corridas; esperamos un poco
                sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        // Pedimos corrida al master
        let assign_url = format!("{}/api/v1/tasks/next", base_url);
        let assignment: TaskAssignmentResponse = match client
            .post(&assign_url)
            .json(&TaskAssignmentRequest {
                worker_id: worker_id.clone(),
            })
            .send()
            .await
        {
            Ok(resp) => resp.json().await?,
            Err(e) => {
                warn!("no se pudo pedir corrida al master: {}", e);
                drop(permit);
                sleep(Duration::from_secs(2)).await;
                continue;
            }
        };

        let Some(task) = assignment.task else {
            // No hay corrida: devolvemos el permiso y dormimos
            drop(permit);
            info!("worker {} pidió corrida pero no hay", worker_id);
            sleep(Duration::from_secs(2)).await;
            continue;
        };

        info!(
            "tengo la corrida {}#{} del job {}",
            task.run.name, task.run_id, task.job_id
        );

        let client = client.clone();
        let base_url = base_url.clone();
        let cache = cache.clone();

        tokio::spawn(async move {
            let (success, report) = match execute_task(&client, &base_url, &cache, &task).await {
                Ok(report) => {
                    let clean = report.is_clean();
                    if clean {
                        info!("terminé la corrida {}#{} correctamente", task.run.name, task.run_id);
                    } else {
                        warn!(
                            "la corrida {}#{} terminó con fallas: {:?}",
                            task.run.name, task.run_id, report
                        );
                    }
                    (clean, Some(report))
                }
                Err(e) => {
                    warn!("error procesando la corrida {}: {:?}", task.id, e);
                    (false, None)
                }
            };

            // Reportar al master que terminamos
            let complete_url = format!("{}/api/v1/tasks/complete", base_url);
            if let Err(e) = client
                .post(&complete_url)
                .json(&TaskCompleteRequest {
                    task_id: task.id.clone(),
                    success,
                    report,
                })
                .send()
                .await
            {
                warn!("no se pudo reportar la corrida {}: {}", task.id, e);
            }

            // Liberar el "slot" de concurrencia al terminar
            drop(permit);
        });
    }
}

/// Descarga (o reutiliza) la topología del job, arma un motor y corre el tag
/// hasta la quiescencia.
async fn execute_task(
    client: &Client,
    base_url: &str,
    cache: &TopologyCache,
    task: &Task,
) -> Result<RunReport> {
    let payload = fetch_topology(client, base_url, cache, &task.job_id).await?;

    let engine = payload.start_engine(Arc::new(ShellRunner), EngineConfig::from_env())?;
    Ok(drive_run(&engine, task).await)
}

/// Arranca el tag de la corrida, escribe sus entradas y espera la quiescencia.
/// Una entrada con etiqueta desconocida se ignora: la corrida sigue y el
/// reporte llega igual al master.
async fn drive_run(engine: &Engine, task: &Task) -> RunReport {
    engine.run(&task.run.name, task.run_id);
    for (label, value) in &task.run.inputs {
        if let Err(e) = engine.input(&task.run.name, task.run_id, label, value.as_str()) {
            warn!(
                "entrada '{}' ignorada para la corrida {}#{}: {}",
                label, task.run.name, task.run_id, e
            );
        }
    }
    engine.wait().await
}

async fn fetch_topology(
    client: &Client,
    base_url: &str,
    cache: &TopologyCache,
    job_id: &str,
) -> Result<Arc<TopologyPayload>> {
    let cached = cache.lock().unwrap().get(job_id).cloned();
    if let Some(payload) = cached {
        return Ok(payload);
    }

    let url = format!("{}/api/v1/jobs/{}/topology", base_url, job_id);
    let resp = client.get(&url).send().await?;
    if !resp.status().is_success() {
        bail!(
            "master devolvió status {} al pedir la topología del job {}",
            resp.status(),
            job_id
        );
    }

    let bytes = resp.bytes().await?;
    let payload = Arc::new(TopologyPayload::decode(&bytes)?);
    cache
        .lock()
        .unwrap()
        .insert(job_id.to_string(), payload.clone());
    info!("topología del job {} descargada ({} bytes)", job_id, bytes.len());
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{descriptor, DryRunner, RunSpec, RunTag};
    use serde_json::json;

    const ONE_STAGE: &str = r#"{
        "stages": {
            "s1": { "command": "cat {}.raw > {}.out", "in": "raw", "out": "out" }
        }
    }"#;

    #[tokio::test]
    async fn entrada_desconocida_no_impide_reportar_la_corrida() {
        let graph = descriptor::parse_pipeline(ONE_STAGE).unwrap();
        let engine = TopologyPayload::new(graph, None)
            .start_engine(Arc::new(DryRunner), EngineConfig::default())
            .unwrap();
        let task = Task {
            id: "t0".to_string(),
            job_id: "j0".to_string(),
            run_id: 0,
            run: RunSpec {
                name: "r".to_string(),
                inputs: vec![
                    ("nope".to_string(), "x".to_string()),
                    ("raw".to_string(), "v".to_string()),
                ],
            },
        };

        let report = drive_run(&engine, &task).await;

        assert!(report.is_clean());
        assert_eq!(report.commands_executed, 1);
        assert_eq!(engine.item("raw", RunTag::new("r", 0)), Some(json!("v")));
        assert_eq!(engine.item("out", RunTag::new("r", 0)), Some(json!("")));
    }
}
