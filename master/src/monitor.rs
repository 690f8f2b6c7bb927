use crate::state::AppState;
use crate::{MONITOR_INTERVAL, WORKER_DEAD_TIMEOUT};
use common::WorkerId;
use std::{collections::HashSet, time::SystemTime};
use tracing::{info, warn};

pub async fn monitor_workers(state: AppState) {
    loop {
        tokio::time::sleep(MONITOR_INTERVAL).await;

        let dead_workers = mark_dead_workers(&state, SystemTime::now());
        if dead_workers.is_empty() {
            continue;
        }

        let lost = state.fail_runs_of(&dead_workers);
        if lost > 0 {
            warn!(
                "{} corridas marcadas como fallidas por {} workers muertos",
                lost,
                dead_workers.len()
            );
        }
    }
}

// Detectar workers sin heartbeat reciente
fn mark_dead_workers(state: &AppState, now: SystemTime) -> HashSet<WorkerId> {
    let mut dead_workers = HashSet::new();
    let mut workers = state.workers.lock().unwrap();
    for (id, meta) in workers.iter_mut() {
        if meta.dead {
            continue;
        }
        if let Ok(elapsed) = now.duration_since(meta.last_heartbeat) {
            if elapsed > WORKER_DEAD_TIMEOUT {
                meta.dead = true;
                info!("marcando worker {} como muerto", id);
                dead_workers.insert(id.clone());
            }
        }
    }
    dead_workers
}
