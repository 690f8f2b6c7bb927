use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = String;

/// Una corrida del pipeline: nombre más entradas externas opcionales
/// (etiqueta de colección, valor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<(String, String)>,
}

impl RunSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,

    /// Texto del descriptor (JSON nativo o workflow CWL)
    pub pipeline: String,

    #[serde(default)]
    pub cwl: bool,

    /// Una tarea por corrida
    pub runs: Vec<RunSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Accepted,
    Running,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub cwl: bool,

    /// -------- Métricas del job --------
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_runs: u32,
    pub completed_runs: u32,
    pub failed_runs: u32,
}
