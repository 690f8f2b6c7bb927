use serde::{Deserialize, Serialize};

use crate::job::{JobId, RunSpec};

pub type TaskId = String;

/// Una corrida asignable a un worker. Los chunks de la corrida se
/// ejecutan en el mismo worker que corre su split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub job_id: JobId,
    pub run_id: i64,
    pub run: RunSpec,
}
