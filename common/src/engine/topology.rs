use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::compiler::{self, Names, PipelineAssembler};
use crate::error::CompileError;
use crate::graph::DependencyGraph;

use super::store::Tag;

pub type StepId = usize;
pub type SplitJoinId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Etapa de nivel superior, prescrita sobre el tag de corrida.
    Stage,
    Split(SplitJoinId),
    Join(SplitJoinId),
    /// Etapa local de un split-join, prescrita sobre tags de chunk.
    Chunk(SplitJoinId),
}

/// Paso ejecutable con sus colecciones ya resueltas por nombre.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub command: String,
    pub kind: StepKind,
    pub consumes: Vec<String>,
    pub produces: Vec<String>,
    pub input_ports: Vec<String>,
    pub output_ports: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitJoin {
    pub name: String,
    pub split: StepId,
    pub join: StepId,
    pub stages: Vec<StepId>,
    pub count_command: String,
    /// Colecciones locales (por chunk) que escribe el fanout.
    pub fanout: Vec<String>,
    /// Colecciones locales que lee el join, una vez por chunk.
    pub fanin: Vec<String>,
}

impl SplitJoin {
    pub fn count_collection(&self) -> String {
        format!("{}#count", self.name)
    }

    pub fn chunk_collection(&self) -> String {
        format!("{}#chunks", self.name)
    }
}

/// Instancia de un paso: qué paso y sobre qué tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepInstance {
    pub step: StepId,
    pub tag: Tag,
}

pub fn local_collection(splitjoin: &str, name: &str) -> String {
    format!("{}/{}", splitjoin, name)
}

/// Runtime compilado e inmutable: pasos, split-joins y colecciones.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    steps: Vec<Step>,
    splitjoins: Vec<SplitJoin>,
    run_steps: Vec<StepId>,
    collections: BTreeSet<String>,
}

impl Topology {
    /// Compila el grafo en una topología nueva.
    pub fn from_graph(graph: &DependencyGraph) -> Result<Self, CompileError> {
        let mut builder = EngineBuilder::new();
        compiler::compile(graph, &mut builder)?;
        builder.build()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id]
    }

    pub fn splitjoins(&self) -> &[SplitJoin] {
        &self.splitjoins
    }

    pub fn splitjoin(&self, id: SplitJoinId) -> &SplitJoin {
        &self.splitjoins[id]
    }

    pub fn splitjoin_by_name(&self, name: &str) -> Option<SplitJoinId> {
        self.splitjoins.iter().position(|sj| sj.name == name)
    }

    /// Pasos prescritos sobre la colección de tags de corrida.
    pub fn run_steps(&self) -> &[StepId] {
        &self.run_steps
    }

    /// Colecciones de nivel superior (indexadas por tag de corrida).
    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains(name)
    }

    fn push_step(&mut self, step: Step) -> StepId {
        self.steps.push(step);
        self.steps.len() - 1
    }

    fn register_collections(&mut self, names: &[String]) {
        self.collections.extend(names.iter().cloned());
    }
}

struct StagePart {
    command: String,
    consumes: Names,
    produces: Names,
}

/// Acumula las partes de un split-join hasta `finish_splitjoin`.
///
/// Split y join se refieren a su split-join por índice; el objeto
/// definitivo se arma de una sola vez cuando todas las partes existen.
#[derive(Default)]
pub struct SplitJoinBuilder {
    split: Option<(StagePart, Names)>,
    join: Option<(StagePart, Names)>,
    count: Option<String>,
    stages: Vec<(String, StagePart)>,
}

impl SplitJoinBuilder {
    fn build(self, name: &str, topology: &mut Topology) -> Result<SplitJoinId, CompileError> {
        let incomplete = |missing| CompileError::IncompleteSplitJoin {
            name: name.to_string(),
            missing,
        };

        let (split, fanout) = self.split.ok_or_else(|| incomplete("split"))?;
        let (join, fanin) = self.join.ok_or_else(|| incomplete("join"))?;
        let count_command = match self.count {
            Some(c) if !c.is_empty() => c,
            _ => return Err(CompileError::MissingCount(name.to_string())),
        };

        let id = topology.splitjoins.len();
        let local = |names: Names| -> Vec<String> {
            names.iter().map(|n| local_collection(name, n)).collect()
        };

        topology.register_collections(&split.consumes);
        topology.register_collections(&split.produces);
        let split_id = topology.push_step(Step {
            name: format!("{}.split", name),
            command: split.command,
            kind: StepKind::Split(id),
            consumes: split.consumes,
            produces: split.produces,
            input_ports: Vec::new(),
            output_ports: Vec::new(),
        });

        let stages = self
            .stages
            .into_iter()
            .map(|(stage_name, part)| {
                topology.push_step(Step {
                    name: format!("{}.{}", name, stage_name),
                    command: part.command,
                    kind: StepKind::Chunk(id),
                    consumes: local(part.consumes),
                    produces: local(part.produces),
                    input_ports: Vec::new(),
                    output_ports: Vec::new(),
                })
            })
            .collect();

        topology.register_collections(&join.consumes);
        topology.register_collections(&join.produces);
        let join_id = topology.push_step(Step {
            name: format!("{}.join", name),
            command: join.command,
            kind: StepKind::Join(id),
            consumes: join.consumes,
            produces: join.produces,
            input_ports: Vec::new(),
            output_ports: Vec::new(),
        });

        topology.run_steps.push(split_id);
        topology.run_steps.push(join_id);
        topology.splitjoins.push(SplitJoin {
            name: name.to_string(),
            split: split_id,
            join: join_id,
            stages,
            count_command,
            fanout: local(fanout),
            fanin: local(fanin),
        });
        Ok(id)
    }
}

/// Destino de la compilación: implementa la API de construcción y
/// produce una `Topology` inmutable.
#[derive(Default)]
pub struct EngineBuilder {
    topology: Topology,
    pending: HashMap<String, SplitJoinBuilder>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending_mut(&mut self, splitjoin: &str) -> Result<&mut SplitJoinBuilder, CompileError> {
        self.pending
            .get_mut(splitjoin)
            .ok_or_else(|| CompileError::UnknownSplitJoin(splitjoin.to_string()))
    }

    pub fn build(self) -> Result<Topology, CompileError> {
        if let Some(name) = self.pending.keys().next() {
            return Err(CompileError::IncompleteSplitJoin {
                name: name.clone(),
                missing: "finish_splitjoin",
            });
        }
        Ok(self.topology)
    }
}

impl PipelineAssembler for EngineBuilder {
    fn add_stage(
        &mut self,
        name: &str,
        command: &str,
        consumes: Names,
        produces: Names,
        input_ports: Names,
        output_ports: Names,
    ) -> Result<(), CompileError> {
        debug!("add_stage: {}", name);
        self.topology.register_collections(&consumes);
        self.topology.register_collections(&produces);
        let id = self.topology.push_step(Step {
            name: name.to_string(),
            command: command.to_string(),
            kind: StepKind::Stage,
            consumes,
            produces,
            input_ports,
            output_ports,
        });
        self.topology.run_steps.push(id);
        Ok(())
    }

    fn begin_splitjoin(&mut self, splitjoin: &str) -> Result<(), CompileError> {
        debug!("begin_splitjoin: {}", splitjoin);
        if self.pending.contains_key(splitjoin) || self.topology.splitjoin_by_name(splitjoin).is_some() {
            return Err(CompileError::DuplicateSplitJoin(splitjoin.to_string()));
        }
        self.pending
            .insert(splitjoin.to_string(), SplitJoinBuilder::default());
        Ok(())
    }

    fn splitjoin_add_split(
        &mut self,
        splitjoin: &str,
        command: &str,
        consumes: Names,
        produces: Names,
        fanout: Names,
    ) -> Result<(), CompileError> {
        let builder = self.pending_mut(splitjoin)?;
        if builder.split.is_some() {
            return Err(CompileError::DuplicatePart {
                name: splitjoin.to_string(),
                part: "split",
            });
        }
        builder.split = Some((
            StagePart {
                command: command.to_string(),
                consumes,
                produces,
            },
            fanout,
        ));
        Ok(())
    }

    fn splitjoin_add_join(
        &mut self,
        splitjoin: &str,
        command: &str,
        consumes: Names,
        produces: Names,
        fanin: Names,
    ) -> Result<(), CompileError> {
        let builder = self.pending_mut(splitjoin)?;
        if builder.join.is_some() {
            return Err(CompileError::DuplicatePart {
                name: splitjoin.to_string(),
                part: "join",
            });
        }
        builder.join = Some((
            StagePart {
                command: command.to_string(),
                consumes,
                produces,
            },
            fanin,
        ));
        Ok(())
    }

    fn splitjoin_add_count(&mut self, splitjoin: &str, command: &str) -> Result<(), CompileError> {
        let builder = self.pending_mut(splitjoin)?;
        if builder.count.is_some() {
            return Err(CompileError::DuplicatePart {
                name: splitjoin.to_string(),
                part: "count",
            });
        }
        builder.count = Some(command.to_string());
        Ok(())
    }

    fn splitjoin_add_stage(
        &mut self,
        splitjoin: &str,
        stage: &str,
        command: &str,
        consumes: Names,
        produces: Names,
    ) -> Result<(), CompileError> {
        self.pending_mut(splitjoin)?.stages.push((
            stage.to_string(),
            StagePart {
                command: command.to_string(),
                consumes,
                produces,
            },
        ));
        Ok(())
    }

    fn finish_splitjoin(&mut self, splitjoin: &str) -> Result<(), CompileError> {
        debug!("finish_splitjoin: {}", splitjoin);
        let builder = self
            .pending
            .remove(splitjoin)
            .ok_or_else(|| CompileError::UnknownSplitJoin(splitjoin.to_string()))?;
        builder.build(splitjoin, &mut self.topology)?;
        Ok(())
    }
}
