//! Motor de ejecución dataflow.
//!
//! Los pasos se prescriben sobre tags (corrida o chunk). Cada instancia
//! lee sus entradas con `unsafe_get`, declara el lote con `flush_gets` y,
//! si falta algo, queda estacionada en el `ItemStore` hasta que el último
//! item llegue; entonces se re-ejecuta desde el principio.

mod splitjoin;
pub mod store;
pub mod topology;

pub use splitjoin::SplitJoinPhase;
pub use store::{ChunkTag, ItemKey, ItemStore, RunTag, Tag};
pub use topology::{
    EngineBuilder, SplitJoin, SplitJoinBuilder, SplitJoinId, Step, StepId, StepInstance, StepKind,
    Topology,
};

use serde_json::{Map, Value};
use std::{
    collections::HashMap,
    env, mem,
    sync::{Arc, Mutex},
    thread,
};
use tokio::{
    runtime::Handle,
    sync::{watch, Semaphore},
};
use tracing::{debug, error, info, warn};

use crate::command::substitute_run_tag;
use crate::error::StoreError;
use crate::results::{RunReport, StalledStep};
use crate::runner::{CommandOutput, CommandRunner};
use crate::tool::{self, ToolResolver};

const RUN_TAGS: &str = "runs";

/// Configuración del motor. Se puede sobreescribir con `PIPELINE_THREADS`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Máximo de pasos ejecutándose a la vez.
    pub max_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let max_concurrency = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self { max_concurrency }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env::var("PIPELINE_THREADS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            cfg.max_concurrency = n;
        }
        cfg
    }
}

/// Señal de que el paso quedó estacionado esperando entradas.
#[derive(Debug)]
pub(crate) struct Suspend;

struct EngineInner {
    topology: Arc<Topology>,
    store: ItemStore<StepInstance>,
    runner: Arc<dyn CommandRunner>,
    resolver: Option<Arc<dyn ToolResolver>>,
    phases: Mutex<HashMap<(SplitJoinId, RunTag), SplitJoinPhase>>,
    report: Mutex<RunReport>,
    permits: Arc<Semaphore>,
    in_flight: watch::Sender<usize>,
    handle: Handle,
}

/// Instancia viva del pipeline. Clonarla es barato: todos los clones
/// comparten almacén, scheduler y topología.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Crea el motor sobre el runtime de tokio actual.
    ///
    /// # Panics
    /// Si se llama fuera de un runtime de tokio.
    pub fn new(topology: Arc<Topology>, runner: Arc<dyn CommandRunner>, config: EngineConfig) -> Self {
        let (in_flight, _) = watch::channel(0usize);
        info!(
            "motor creado: {} pasos, {} splitjoins, concurrencia {}",
            topology.steps().len(),
            topology.splitjoins().len(),
            config.max_concurrency
        );
        Self {
            inner: Arc::new(EngineInner {
                topology,
                store: ItemStore::new(),
                runner,
                resolver: None,
                phases: Mutex::new(HashMap::new()),
                report: Mutex::new(RunReport::default()),
                permits: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
                in_flight,
                handle: Handle::current(),
            }),
        }
    }

    /// Modo CWL: las etapas se resuelven con el servicio de herramientas.
    /// Debe llamarse antes de inyectar corridas.
    pub fn with_tool_resolver(self, resolver: Arc<dyn ToolResolver>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.resolver = Some(resolver);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("el motor ya está compartido; se ignora el resolver de herramientas");
                Self { inner }
            }
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Inyecta un tag de corrida: prescribe todas las etapas de nivel superior,
    /// más split y join de cada split-join.
    pub fn run(&self, run_name: &str, run_id: i64) {
        let run = RunTag::new(run_name, run_id);
        let tag = Tag::Run(run);
        if !self.inner.store.insert_tag(RUN_TAGS, tag.clone()) {
            warn!("la corrida {} ya se había inyectado; se ignora", tag);
            return;
        }
        info!("iniciando corrida {}", tag);
        for &step in self.inner.topology.run_steps() {
            self.enqueue(StepInstance {
                step,
                tag: tag.clone(),
            });
        }
    }

    /// Escribe un item externo (entrada manual o de CWL) en una colección
    /// de nivel superior, buscándola por nombre.
    pub fn input(
        &self,
        run_name: &str,
        run_id: i64,
        label: &str,
        value: impl Into<Value>,
    ) -> Result<(), StoreError> {
        if !self.inner.topology.has_collection(label) {
            error!("no existe una dependencia llamada '{}'", label);
            return Err(StoreError::UnknownCollection(label.to_string()));
        }
        let key = ItemKey::new(label, RunTag::new(run_name, run_id));
        self.put(key, value.into())
    }

    /// Lectura de un item (normalmente tras `wait`).
    pub fn item(&self, collection: &str, tag: impl Into<Tag>) -> Option<Value> {
        self.inner.store.get(&ItemKey::new(collection, tag))
    }

    /// Fase del split-join `splitjoin` para la corrida. `None` = inactivo.
    pub fn splitjoin_phase(&self, splitjoin: &str, run: &RunTag) -> Option<SplitJoinPhase> {
        let id = self.inner.topology.splitjoin_by_name(splitjoin)?;
        self.phase(id, run)
    }

    /// Espera la quiescencia y devuelve el reporte acumulado.
    pub async fn wait(&self) -> RunReport {
        let mut rx = self.inner.in_flight.subscribe();
        // el Sender vive en `inner`, así que el canal no se cierra
        let _ = rx.wait_for(|n| *n == 0).await;
        self.report()
    }

    /// Reporte al momento, incluyendo los pasos estancados.
    pub fn report(&self) -> RunReport {
        let mut report = self.inner.report.lock().unwrap().clone();
        report.stalled = self
            .inner
            .store
            .stalled()
            .into_iter()
            .map(|(instance, missing)| StalledStep {
                step: self.inner.topology.step(instance.step).name.clone(),
                tag: instance.tag.to_string(),
                missing: missing.iter().map(ItemKey::to_string).collect(),
            })
            .collect();
        report
    }

    /* ===================== scheduler ===================== */

    fn enqueue(&self, instance: StepInstance) {
        self.inner.in_flight.send_modify(|n| *n += 1);
        let engine = self.clone();
        self.inner.handle.spawn(async move {
            let permit = engine.inner.permits.clone().acquire_owned().await.ok();
            let worker = engine.clone();
            let step_name = engine.inner.topology.step(instance.step).name.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || worker.execute(instance)).await {
                warn!("panic o join error en el paso {}: {:?}", step_name, e);
            }
            drop(permit);
            engine.inner.in_flight.send_modify(|n| *n -= 1);
        });
    }

    fn execute(&self, instance: StepInstance) {
        let topology = Arc::clone(&self.inner.topology);
        let step = topology.step(instance.step);
        let mut ctx = StepContext::new(self, instance);

        let outcome = match step.kind {
            StepKind::Stage => self.execute_stage(&mut ctx, step),
            StepKind::Split(sj) => self.execute_split(&mut ctx, step, sj),
            StepKind::Join(sj) => self.execute_join(&mut ctx, step, sj),
            StepKind::Chunk(sj) => self.execute_chunk(&mut ctx, step, sj),
        };

        if outcome.is_err() {
            debug!("{} [{}] queda esperando entradas", step.name, ctx.tag());
        }
    }

    fn execute_stage(&self, ctx: &mut StepContext<'_>, step: &Step) -> Result<(), Suspend> {
        let tag = ctx.tag().clone();
        let inputs: Vec<Option<Value>> = step
            .consumes
            .iter()
            .map(|c| ctx.unsafe_get(ItemKey::new(c.as_str(), tag.clone())))
            .collect();
        ctx.flush_gets()?;

        let run_name = tag.run_tag().name.clone();
        debug!("ejecutando etapa {} para {}", step.name, tag);

        if let Some(resolver) = self.inner.resolver.clone() {
            self.execute_tool(ctx, step, resolver.as_ref(), inputs);
            return Ok(());
        }

        let command = substitute_run_tag(&step.command, &run_name);
        if self.run_command(&command).success() {
            for p in &step.produces {
                ctx.put(ItemKey::new(p.as_str(), tag.clone()), Value::String(String::new()));
            }
        }
        Ok(())
    }

    /// Etapa CWL: las entradas se ligan por puerto y las salidas se
    /// escriben en `<etapa>.<salida>`.
    fn execute_tool(
        &self,
        ctx: &mut StepContext<'_>,
        step: &Step,
        resolver: &dyn ToolResolver,
        inputs: Vec<Option<Value>>,
    ) {
        let input_map: Map<String, Value> = step
            .input_ports
            .iter()
            .cloned()
            .zip(inputs.into_iter().map(Option::unwrap_or_default))
            .collect();

        let outputs = match tool::run_tool(resolver, &step.command, input_map, |cmd| {
            self.run_command(cmd)
        }) {
            Ok(Some(outputs)) => outputs,
            Ok(None) => return,
            Err(e) => {
                warn!("falló la resolución de la herramienta {}: {}", step.name, e);
                return;
            }
        };

        for (id, value) in outputs {
            let collection = format!("{}.{}", step.name, id);
            if self.inner.topology.has_collection(&collection) {
                ctx.put(ItemKey::new(collection, ctx.tag().clone()), value);
            } else {
                warn!(
                    "salida ignorada: no existe ninguna colección llamada '{}'",
                    collection
                );
            }
        }
    }

    /* ===================== helpers ===================== */

    fn run_command(&self, command: &str) -> CommandOutput {
        self.invoke(command, false)
    }

    fn run_captured(&self, command: &str) -> CommandOutput {
        self.invoke(command, true)
    }

    fn invoke(&self, command: &str, capture: bool) -> CommandOutput {
        let out = self.inner.runner.run(command, capture);
        let mut report = self.inner.report.lock().unwrap();
        report.commands_executed += 1;
        if !out.success() {
            warn!(
                "el comando falló (exit {}), no se producen items: {}",
                out.exit_code, command
            );
            report.commands_failed.push(command.to_string());
        }
        out
    }

    fn put(&self, key: ItemKey, value: Value) -> Result<(), StoreError> {
        match self.inner.store.put(key, value) {
            Ok(ready) => {
                for instance in ready {
                    self.enqueue(instance);
                }
                Ok(())
            }
            Err(e) => {
                warn!("{}", e);
                self.inner.report.lock().unwrap().violations.push(e.to_string());
                Err(e)
            }
        }
    }

    fn phase(&self, id: SplitJoinId, run: &RunTag) -> Option<SplitJoinPhase> {
        self.inner
            .phases
            .lock()
            .unwrap()
            .get(&(id, run.clone()))
            .cloned()
    }

    fn set_phase(&self, id: SplitJoinId, run: &RunTag, phase: SplitJoinPhase) {
        self.inner
            .phases
            .lock()
            .unwrap()
            .insert((id, run.clone()), phase);
    }

    fn record_count_failure(&self, message: String) {
        self.inner.report.lock().unwrap().count_failures.push(message);
    }

    fn prescribe(&self, collection: &str, tag: Tag, steps: &[StepId]) {
        if !self.inner.store.insert_tag(collection, tag.clone()) {
            warn!("tag {} repetido en {}; se ignora", tag, collection);
            return;
        }
        for &step in steps {
            self.enqueue(StepInstance {
                step,
                tag: tag.clone(),
            });
        }
    }
}

/// Contexto de una ejecución de paso: acumula las lecturas pendientes
/// hasta `flush_gets`.
pub(crate) struct StepContext<'e> {
    engine: &'e Engine,
    instance: StepInstance,
    requested: Vec<ItemKey>,
}

impl<'e> StepContext<'e> {
    fn new(engine: &'e Engine, instance: StepInstance) -> Self {
        Self {
            engine,
            instance,
            requested: Vec::new(),
        }
    }

    fn tag(&self) -> &Tag {
        &self.instance.tag
    }

    /// Lectura no bloqueante: si falta, queda registrada como dependencia.
    fn unsafe_get(&mut self, key: ItemKey) -> Option<Value> {
        let value = self.engine.inner.store.get(&key);
        if value.is_none() {
            self.requested.push(key);
        }
        value
    }

    /// Lectura segura: si falta, el paso se suspende de inmediato.
    fn get(&mut self, key: ItemKey) -> Result<Value, Suspend> {
        if let Some(value) = self.engine.inner.store.get(&key) {
            return Ok(value);
        }
        self.requested.push(key);
        self.suspend()
    }

    /// Declara el lote de lecturas. Si alguna faltó, el paso se estaciona.
    fn flush_gets(&mut self) -> Result<(), Suspend> {
        if self.requested.is_empty() {
            Ok(())
        } else {
            self.suspend()
        }
    }

    fn suspend<T>(&mut self) -> Result<T, Suspend> {
        let missing = mem::take(&mut self.requested);
        if let Some(instance) = self.engine.inner.store.park(self.instance.clone(), missing) {
            // todo llegó entre la lectura y el park
            self.engine.enqueue(instance);
        }
        Err(Suspend)
    }

    fn put(&self, key: ItemKey, value: Value) {
        // la violación ya queda registrada en el reporte
        let _ = self.engine.put(key, value);
    }
}

#[cfg(test)]
mod tests;
