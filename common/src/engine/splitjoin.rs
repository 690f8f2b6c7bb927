//! Fan-out / fan-in dinámico de los split-join.
//!
//! Por cada (split-join, corrida):
//!   split ok -> CountPending -> count ok -> Dispatched{chunks}
//!   join ok -> JoinComplete, join con exit != 0 -> JoinFailed
//! Si el count falla la fase queda en CountPending y el join nunca corre.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{
    store::{ChunkTag, ItemKey, RunTag, Tag},
    topology::{SplitJoinId, Step},
    Engine, StepContext, Suspend,
};
use crate::command::{substitute_chunk_array, substitute_chunk_tag, substitute_run_tag};
use crate::runner::CommandOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitJoinPhase {
    CountPending,
    Dispatched { chunks: u32 },
    JoinComplete,
    JoinFailed,
}

/// Interpreta la salida del comando count.
///
/// Se toma el entero inicial (con signo opcional) y se ignora el resto, así
/// que `"3 chunks"` vale 3. Sin dígitos al inicio, con exit distinto de cero
/// o con un valor negativo el count falla. En dry-run la salida es vacía:
/// el split-join queda en `CountPending` y nada posterior al join se ejecuta.
fn parse_count(out: &CommandOutput) -> Result<u32, String> {
    if !out.success() {
        return Err(format!("exit code {} (salida: {:?})", out.exit_code, out.stdout));
    }
    let text = out.stdout.trim_start();
    let digits_from = usize::from(text.starts_with(['+', '-']));
    let digits_len = text[digits_from..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits_len == 0 {
        return Err(format!("salida no numérica: {:?}", out.stdout.trim()));
    }

    let n: i64 = text[..digits_from + digits_len]
        .parse()
        .map_err(|_| format!("cantidad de chunks fuera de rango: {:?}", out.stdout.trim()))?;
    if n < 0 {
        return Err(format!("devolvió un número negativo: {}", n));
    }
    u32::try_from(n).map_err(|_| format!("cantidad de chunks fuera de rango: {}", n))
}

fn run_tag_of(tag: &Tag) -> RunTag {
    tag.run_tag().clone()
}

impl Engine {
    pub(super) fn execute_split(
        &self,
        ctx: &mut StepContext<'_>,
        step: &Step,
        sj: SplitJoinId,
    ) -> Result<(), Suspend> {
        let tag = ctx.tag().clone();
        for c in &step.consumes {
            ctx.unsafe_get(ItemKey::new(c.as_str(), tag.clone()));
        }
        ctx.flush_gets()?;

        let run = run_tag_of(&tag);
        debug!("split {} para {}", step.name, tag);
        let command = substitute_run_tag(&step.command, &run.name);
        if !self.run_command(&command).success() {
            return Ok(());
        }

        for p in &step.produces {
            ctx.put(ItemKey::new(p.as_str(), tag.clone()), Value::String(String::new()));
        }
        self.fanout(ctx, sj, &run);
        Ok(())
    }

    /// Corre el count, crea un tag de chunk por índice y escribe los items
    /// de fan-out y la cantidad de chunks.
    fn fanout(&self, ctx: &StepContext<'_>, id: SplitJoinId, run: &RunTag) {
        let topology = self.topology();
        let sj = topology.splitjoin(id);
        self.set_phase(id, run, SplitJoinPhase::CountPending);
        info!("{}: {} realizando fanout", run.name, sj.name);

        let command = substitute_run_tag(&sj.count_command, &run.name);
        let count = match parse_count(&self.run_captured(&command)) {
            Ok(n) => n,
            Err(reason) => {
                warn!(
                    "falló el 'count' de {} para {}: {}; el join no se ejecutará",
                    sj.name, run.name, reason
                );
                self.record_count_failure(format!("{} [{}]: {}", sj.name, run.name, reason));
                return;
            }
        };

        for chunk in 0..count {
            let chunk_tag = ChunkTag {
                chunk,
                run: run.clone(),
            };
            for f in &sj.fanout {
                ctx.put(ItemKey::new(f.as_str(), chunk_tag.clone()), json!(chunk));
            }
            self.prescribe(&sj.chunk_collection(), Tag::Chunk(chunk_tag), &sj.stages);
        }
        ctx.put(ItemKey::new(sj.count_collection(), run.clone()), json!(count));
        self.set_phase(id, run, SplitJoinPhase::Dispatched { chunks: count });
        info!("{}: {} despachó {} chunks", run.name, sj.name, count);
    }

    pub(super) fn execute_join(
        &self,
        ctx: &mut StepContext<'_>,
        step: &Step,
        id: SplitJoinId,
    ) -> Result<(), Suspend> {
        let topology = self.topology();
        let sj = topology.splitjoin(id);
        let tag = ctx.tag().clone();
        let run = run_tag_of(&tag);

        let count_item = ctx.get(ItemKey::new(sj.count_collection(), run.clone()))?;
        let Some(count) = count_item.as_u64().and_then(|n| u32::try_from(n).ok()) else {
            warn!("cantidad de chunks inválida para {}: {}", sj.name, count_item);
            return Ok(());
        };

        for c in &step.consumes {
            ctx.unsafe_get(ItemKey::new(c.as_str(), tag.clone()));
        }
        for chunk in 0..count {
            for f in &sj.fanin {
                let chunk_tag = ChunkTag {
                    chunk,
                    run: run.clone(),
                };
                ctx.unsafe_get(ItemKey::new(f.as_str(), chunk_tag));
            }
        }
        ctx.flush_gets()?;

        let unrolled = substitute_chunk_array(&step.command, count);
        debug!("join {}: arreglo desenrollado: {}", sj.name, unrolled);
        let command = substitute_run_tag(&unrolled, &run.name);

        if self.run_command(&command).success() {
            for p in &step.produces {
                ctx.put(ItemKey::new(p.as_str(), tag.clone()), Value::String(String::new()));
            }
            self.set_phase(id, &run, SplitJoinPhase::JoinComplete);
        } else {
            self.set_phase(id, &run, SplitJoinPhase::JoinFailed);
        }
        Ok(())
    }

    pub(super) fn execute_chunk(
        &self,
        ctx: &mut StepContext<'_>,
        step: &Step,
        _id: SplitJoinId,
    ) -> Result<(), Suspend> {
        let tag = ctx.tag().clone();
        let Some(chunk) = tag.chunk() else {
            warn!("la etapa {} sólo admite tags de chunk, recibió {}", step.name, tag);
            return Ok(());
        };

        for c in &step.consumes {
            ctx.unsafe_get(ItemKey::new(c.as_str(), tag.clone()));
        }
        ctx.flush_gets()?;

        let run = run_tag_of(&tag);
        let command = substitute_run_tag(&substitute_chunk_tag(&step.command, chunk), &run.name);
        if self.run_command(&command).success() {
            for p in &step.produces {
                ctx.put(ItemKey::new(p.as_str(), tag.clone()), Value::String(String::new()));
            }
        }
        Ok(())
    }
}
