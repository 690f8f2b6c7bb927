use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Paso que quedó estacionado al llegar a la quiescencia.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalledStep {
    pub step: String,
    pub tag: String,
    /// Items que nunca llegaron
    pub missing: Vec<String>,
}

/// Resumen de una ejecución hasta la quiescencia.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub commands_executed: u64,
    /// Comandos (ya instanciados) que salieron con código distinto de 0
    pub commands_failed: Vec<String>,
    pub count_failures: Vec<String>,
    /// Escrituras repetidas sobre una misma clave
    pub violations: Vec<String>,
    pub stalled: Vec<StalledStep>,
}

impl RunReport {
    /// Ninguna falla, ninguna violación y nada estancado.
    pub fn is_clean(&self) -> bool {
        self.commands_failed.is_empty()
            && self.count_failures.is_empty()
            && self.violations.is_empty()
            && self.stalled.is_empty()
    }

    pub fn merge(&mut self, other: RunReport) {
        self.commands_executed += other.commands_executed;
        self.commands_failed.extend(other.commands_failed);
        self.count_failures.extend(other.count_failures);
        self.violations.extend(other.violations);
        self.stalled.extend(other.stalled);
    }
}

/// Reporte de una corrida distribuida.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_name: String,
    pub run_id: i64,
    pub worker_id: Option<String>,
    pub report: Option<RunReport>,
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResults {
    pub job_id: JobId,
    pub runs: Vec<RunResult>,
    /// Suma de los reportes recibidos
    pub total: RunReport,
}

impl JobResults {
    pub fn new(job_id: JobId, mut runs: Vec<RunResult>) -> Self {
        runs.sort_by_key(|r| r.run_id);
        let mut total = RunReport::default();
        for report in runs.iter().filter_map(|r| r.report.clone()) {
            total.merge(report);
        }
        Self { job_id, runs, total }
    }
}
