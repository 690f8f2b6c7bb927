use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use common::{
    descriptor, dot, CommandRunner, DryRunner, Engine, EngineConfig, JobInfo, JobRequest,
    JobResults, RunSpec, ShellRunner, TopologyPayload, WorkerMetrics,
};
use reqwest::Client;
use std::{
    env,
    fs::{self, File},
    io::{self, BufRead, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL").unwrap_or_else(|_| "http://localhost:8080".to_string())
}

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(about = "Ejecuta un pipeline (configuración JSON o workflow CWL) una vez por cada corrida, en paralelo")]
struct Cli {
    /// Muestra cada comando y su código de salida
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PipelineArgs {
    /// Archivo de configuración del pipeline
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Nombres de corrida, o valores de entrada en modo CWL
    #[arg(value_name = "RUNS")]
    runs: Vec<String>,

    /// Interpreta CONFIG como workflow CWL
    #[arg(short, long)]
    cwl: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ejecuta el pipeline localmente
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// No ejecuta los comandos, sólo los muestra
        #[arg(short, long)]
        dry_run: bool,

        /// Escribe el grafo en formato GraphViz y termina
        #[arg(short, long, value_name = "FILE")]
        printgraph: Option<PathBuf>,

        /// Pide entradas por stdin para cada corrida
        #[arg(short, long)]
        manual: bool,
    },
    /// Envía el pipeline al master como un job distribuido
    Submit {
        #[command(flatten)]
        pipeline: PipelineArgs,

        /// Nombre del job (por defecto, el del archivo)
        #[arg(long)]
        name: Option<String>,
    },
    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Reportes por corrida de un job
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los workers registrados
    Workers,
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn read_config(path: &Path) -> Result<String> {
    let json = fs::read_to_string(path).with_context(|| {
        format!("no se puede abrir el archivo de configuración \"{}\"", path.display())
    })?;
    if json.trim().is_empty() {
        bail!("archivo de configuración vacío \"{}\"", path.display());
    }
    Ok(json)
}

/// Agrupa los argumentos en lotes, uno por corrida, ligando cada valor a
/// una entrada del workflow en orden. Sin entradas declaradas los argumentos
/// son nombres de corrida.
fn cwl_batches(input_ids: &[String], args: &[String]) -> Vec<RunSpec> {
    if input_ids.is_empty() {
        warn!(
            "el workflow no declara entradas; los argumentos se toman como nombres de corrida"
        );
        return args.iter().map(RunSpec::named).collect();
    }

    let n = input_ids.len();
    if args.len() % n != 0 {
        warn!(
            "argumentos insuficientes después del workflow: se esperaba un múltiplo de {}",
            n
        );
    }

    args.chunks_exact(n)
        .enumerate()
        .map(|(batch, values)| RunSpec {
            name: batch.to_string(),
            inputs: input_ids.iter().cloned().zip(values.iter().cloned()).collect(),
        })
        .collect()
}

fn plan_runs(json: &str, args: &PipelineArgs) -> Result<Vec<RunSpec>> {
    if args.cwl {
        let ids = descriptor::cwl_input_ids(json)?;
        Ok(cwl_batches(&ids, &args.runs))
    } else {
        Ok(args.runs.iter().map(RunSpec::named).collect())
    }
}

/// Pide pares etiqueta/valor hasta recibir una línea vacía.
fn prompt_user_input(engine: &Engine, run: &RunSpec, run_id: i64) -> Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut stdout = io::stdout();

    println!(
        "**Entradas para {}; una línea vacía termina el modo de entrada**",
        run.name
    );
    loop {
        print!("etiqueta> ");
        stdout.flush()?;
        let label = match lines.next() {
            Some(line) => line?,
            None => return Ok(()),
        };
        if label.is_empty() {
            return Ok(());
        }

        print!("valor> ");
        stdout.flush()?;
        let value = match lines.next() {
            Some(line) => line?,
            None => return Ok(()),
        };
        if let Err(e) = engine.input(&run.name, run_id, &label, value) {
            warn!("entrada ignorada: {}", e);
        }
    }
}

async fn run_local(
    pipeline: PipelineArgs,
    dry_run: bool,
    printgraph: Option<PathBuf>,
    manual: bool,
) -> Result<()> {
    let json = read_config(&pipeline.config)?;
    let graph = descriptor::load(&json, pipeline.cwl)?;

    if let Some(path) = printgraph {
        let mut out = BufWriter::new(
            File::create(&path).with_context(|| format!("no se puede crear \"{}\"", path.display()))?,
        );
        dot::write_graphviz(&graph, &mut out)?;
        out.flush()?;
        println!("Grafo GraphViz escrito en \"{}\"", path.display());
        return Ok(());
    }

    if pipeline.runs.is_empty() {
        if pipeline.cwl {
            bail!("no se especificaron argumentos CWL (u objetos de entrada)");
        }
        bail!("no se especificaron corridas");
    }

    let runs = plan_runs(&json, &pipeline)?;

    let runner: Arc<dyn CommandRunner> = if dry_run {
        Arc::new(DryRunner)
    } else {
        Arc::new(ShellRunner)
    };
    let payload = TopologyPayload::new(graph, pipeline.cwl.then(|| json.clone()));
    let engine = payload.start_engine(runner, EngineConfig::from_env())?;

    if pipeline.cwl && runs.iter().any(|r| !r.inputs.is_empty()) {
        println!("Ejecutando {} corridas en modo batch:", runs.len());
    }

    for (i, run) in runs.iter().enumerate() {
        let run_id = i as i64;
        engine.run(&run.name, run_id);

        if !run.inputs.is_empty() {
            println!(" * Lote #{}", run.name);
        }
        for (label, value) in &run.inputs {
            println!("   - \"{}\" : {}", label, value);
            if let Err(e) = engine.input(&run.name, run_id, label, value.as_str()) {
                warn!("entrada ignorada: {}", e);
            }
        }

        if manual {
            tokio::task::block_in_place(|| prompt_user_input(&engine, run, run_id))?;
        }
    }

    let report = engine.wait().await;
    info!(
        "{} comandos ejecutados, {} fallidos",
        report.commands_executed,
        report.commands_failed.len()
    );
    for stalled in &report.stalled {
        warn!(
            "paso {} [{}] quedó esperando: {}",
            stalled.step,
            stalled.tag,
            stalled.missing.join(", ")
        );
    }
    for violation in &report.violations {
        warn!("escritura repetida: {}", violation);
    }
    Ok(())
}

async fn submit(client: &Client, base_url: &str, pipeline: PipelineArgs, name: Option<String>) -> Result<()> {
    let json = read_config(&pipeline.config)?;
    if pipeline.runs.is_empty() {
        bail!("no se especificaron corridas");
    }
    let runs = plan_runs(&json, &pipeline)?;

    let name = name.unwrap_or_else(|| {
        pipeline
            .config
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pipeline".to_string())
    });

    let req = JobRequest {
        name,
        pipeline: json,
        cwl: pipeline.cwl,
        runs,
    };

    let url = format!("{}/api/v1/jobs", base_url);
    let resp = client.post(&url).json(&req).send().await?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("el master rechazó el job (status {}): {}", status, body);
    }
    let job_info: JobInfo = resp.json().await?;

    println!("Job creado:");
    println!("  id: {}", job_info.id);
    println!("  nombre: {}", job_info.name);
    println!("  estado: {:?}", job_info.status);
    println!("  corridas: {}", job_info.total_runs);
    println!("  submitted_at: {}", job_info.submitted_at);
    Ok(())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Run {
            pipeline,
            dry_run,
            printgraph,
            manual,
        } => run_local(pipeline, dry_run, printgraph, manual).await?,

        Commands::Submit { pipeline, name } => submit(&client, &base_url, pipeline, name).await?,

        Commands::Status { id } => {
            let url = format!("{}/api/v1/jobs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!("job no encontrado (status {})", resp.status());
            }
            let job: JobInfo = resp.json().await?;
            println!("Job:");
            println!("  id: {}", job.id);
            println!("  nombre: {}", job.name);
            println!("  estado: {:?}", job.status);
            println!("  cwl: {}", job.cwl);
            println!(
                "  corridas: total={}, completadas={}, fallidas={}",
                job.total_runs, job.completed_runs, job.failed_runs
            );

            // progreso calculado localmente
            let done = job.completed_runs + job.failed_runs;
            if job.total_runs > 0 {
                let pct = (done as f64 / job.total_runs as f64) * 100.0;
                println!("  progreso: {:.1}%", pct);
            } else {
                println!("  progreso: (sin corridas)");
            }

            println!("  submitted_at: {}", job.submitted_at);
            if let Some(ref started) = job.started_at {
                println!("  iniciado: {}", started);
            }
            if let Some(ref finished) = job.finished_at {
                println!("  finalizado: {}", finished);
            }
        }

        Commands::Results { id } => {
            let url = format!("{}/api/v1/jobs/{id}/results", base_url);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!("no se encontraron resultados para el job {id}");
            }
            let results: JobResults = resp.json().await?;
            println!("Resultados para job {}:", results.job_id);
            println!(
                "  total: {} comandos ejecutados, {} fallidos, {} counts inválidos",
                results.total.commands_executed,
                results.total.commands_failed.len(),
                results.total.count_failures.len()
            );
            if results.runs.is_empty() {
                println!("  (ninguna corrida terminada)");
            }
            for run in results.runs {
                let outcome = if run.success { "ok" } else { "FALLÓ" };
                println!(
                    "  - {}#{} [{}] en {}",
                    run.run_name,
                    run.run_id,
                    outcome,
                    run.worker_id.as_deref().unwrap_or("?")
                );
                let Some(report) = run.report else {
                    println!("      (sin reporte)");
                    continue;
                };
                println!(
                    "      comandos: {} ejecutados, {} fallidos",
                    report.commands_executed,
                    report.commands_failed.len()
                );
                for cmd in &report.commands_failed {
                    println!("      fallido   : {}", cmd);
                }
                for count in &report.count_failures {
                    println!("      count     : {}", count);
                }
                for stalled in &report.stalled {
                    println!(
                        "      estancado : {} [{}] espera {}",
                        stalled.step,
                        stalled.tag,
                        stalled.missing.join(", ")
                    );
                }
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if !resp.status().is_success() {
                bail!(
                    "error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
            let workers: Vec<WorkerMetrics> = resp.json().await?;
            if workers.is_empty() {
                println!("No hay workers registrados.");
            }
            for w in workers {
                println!("Worker {}", w.worker_id);
                println!("  host           : {}", w.hostname);
                println!("  dead           : {}", w.dead);
                println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
                println!(
                    "  concurrency    : max={}, activas={}",
                    w.max_concurrency, w.active_runs
                );
                println!(
                    "  corridas       : started={}, ok={}, failed={}",
                    w.runs_started, w.runs_succeeded, w.runs_failed
                );
                match w.avg_run_ms {
                    Some(avg) => println!("  avg_run_ms     : {:.1}", avg),
                    None => println!("  avg_run_ms     : (sin datos)"),
                }
                match w.last_cpu_percent {
                    Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
                    None => println!("  cpu_percent    : (sin datos)"),
                }
                match w.last_mem_bytes {
                    Some(mem) => println!("  mem_bytes      : {}", mem),
                    None => println!("  mem_bytes      : (sin datos)"),
                }
                println!();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn lotes_cwl_agrupan_por_entrada() {
        let ids = strings(&["#a", "#b"]);
        let batches = cwl_batches(&ids, &strings(&["1", "2", "3", "4", "5"]));

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].name, "0");
        assert_eq!(
            batches[1].inputs,
            vec![
                ("#a".to_string(), "3".to_string()),
                ("#b".to_string(), "4".to_string())
            ]
        );
    }

    #[test]
    fn sin_entradas_los_argumentos_son_corridas() {
        let batches = cwl_batches(&[], &strings(&["x", "y"]));
        assert_eq!(batches, vec![RunSpec::named("x"), RunSpec::named("y")]);
    }

    #[test]
    fn flags_del_subcomando_run() {
        let cli = Cli::try_parse_from([
            "pipeline", "run", "-v", "-d", "-m", "-p", "g.dot", "cfg.json", "a", "b",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run {
                pipeline,
                dry_run,
                printgraph,
                manual,
            } => {
                assert!(dry_run && manual && !pipeline.cwl);
                assert_eq!(printgraph, Some(PathBuf::from("g.dot")));
                assert_eq!(pipeline.config, PathBuf::from("cfg.json"));
                assert_eq!(pipeline.runs, strings(&["a", "b"]));
            }
            _ => panic!("se esperaba el subcomando run"),
        }
    }

    #[test]
    fn configuracion_inexistente_es_error() {
        assert!(read_config(Path::new("/no/existe/pipeline.json")).is_err());
    }
}
