use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::CompileError;
use crate::graph::{DependencyGraph, SubgraphId, VertexId, VertexKind, ROOT_SUBGRAPH};

pub type Names = Vec<String>;

/// API de construcción que recibe el compilador.
///
/// Los split-join se construyen en modo "begin / add_* / finish": split y
/// join necesitan referirse al split-join terminado, así que el objeto
/// inmutable se crea recién en `finish_splitjoin`.
pub trait PipelineAssembler {
    fn add_stage(
        &mut self,
        name: &str,
        command: &str,
        consumes: Names,
        produces: Names,
        input_ports: Names,
        output_ports: Names,
    ) -> Result<(), CompileError>;

    fn begin_splitjoin(&mut self, splitjoin: &str) -> Result<(), CompileError>;

    fn splitjoin_add_split(
        &mut self,
        splitjoin: &str,
        command: &str,
        consumes: Names,
        produces: Names,
        fanout: Names,
    ) -> Result<(), CompileError>;

    fn splitjoin_add_join(
        &mut self,
        splitjoin: &str,
        command: &str,
        consumes: Names,
        produces: Names,
        fanin: Names,
    ) -> Result<(), CompileError>;

    fn splitjoin_add_count(&mut self, splitjoin: &str, command: &str) -> Result<(), CompileError>;

    fn splitjoin_add_stage(
        &mut self,
        splitjoin: &str,
        stage: &str,
        command: &str,
        consumes: Names,
        produces: Names,
    ) -> Result<(), CompileError>;

    fn finish_splitjoin(&mut self, splitjoin: &str) -> Result<(), CompileError>;
}

pub fn splitjoin_name(subgraph: SubgraphId) -> String {
    format!("splitjoin_{}", subgraph)
}

/// Recorre el grafo y emite las llamadas de construcción sobre `assembler`.
///
/// 1. Etapas del grafo raíz, en orden de vértices.
/// 2. Vértices de cada subgrafo (agrupados por id, en orden de aparición),
///    encerrados entre `begin_splitjoin` y `finish_splitjoin`.
pub fn compile<A: PipelineAssembler + ?Sized>(
    graph: &DependencyGraph,
    assembler: &mut A,
) -> Result<(), CompileError> {
    let mut subgraphs: BTreeMap<SubgraphId, Vec<VertexId>> = BTreeMap::new();

    for (id, vertex) in graph.vertices() {
        if vertex.subgraph != ROOT_SUBGRAPH {
            subgraphs.entry(vertex.subgraph).or_default().push(id);
            continue;
        }

        match vertex.kind {
            VertexKind::Stage => {
                debug!("compilando etapa '{}'", vertex.name);
                assembler.add_stage(
                    &vertex.name,
                    vertex.command.as_deref().unwrap_or_default(),
                    graph.consumes_names(id),
                    graph.produces_names(id),
                    graph.input_ports(id),
                    graph.output_ports(id),
                )?;
            }
            VertexKind::Count => {
                warn!("se encontró un 'count' fuera de un splitjoin; se ignora");
            }
            VertexKind::DataDependency => {}
        }
    }

    for (subgraph, members) in subgraphs {
        let name = splitjoin_name(subgraph);
        debug!("compilando {} ({} vértices)", name, members.len());
        assembler.begin_splitjoin(&name)?;

        let mut count_command: Option<&str> = None;

        for id in members {
            let vertex = graph.vertex(id);
            let command = vertex.command.as_deref().unwrap_or_default();

            match vertex.kind {
                VertexKind::Stage if vertex.name == "split" => assembler.splitjoin_add_split(
                    &name,
                    command,
                    graph.consumes_names(id),
                    graph.produces_names(id),
                    graph.fanout_names(id),
                )?,
                VertexKind::Stage if vertex.name == "join" => assembler.splitjoin_add_join(
                    &name,
                    command,
                    graph.consumes_names(id),
                    graph.produces_names(id),
                    graph.fanin_names(id),
                )?,
                VertexKind::Stage => assembler.splitjoin_add_stage(
                    &name,
                    &vertex.name,
                    command,
                    graph.consumes_names(id),
                    graph.produces_names(id),
                )?,
                VertexKind::Count => {
                    count_command = Some(command);
                    assembler.splitjoin_add_count(&name, command)?;
                }
                VertexKind::DataDependency => {}
            }
        }

        if count_command.map_or(true, str::is_empty) {
            return Err(CompileError::MissingCount(name));
        }

        assembler.finish_splitjoin(&name)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::EdgeKind;

    /// Assembler que sólo anota las llamadas recibidas.
    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl PipelineAssembler for Recorder {
        fn add_stage(
            &mut self,
            name: &str,
            command: &str,
            consumes: Names,
            produces: Names,
            _input_ports: Names,
            _output_ports: Names,
        ) -> Result<(), CompileError> {
            self.calls.push(format!(
                "stage {} [{}] {:?}->{:?}",
                name, command, consumes, produces
            ));
            Ok(())
        }

        fn begin_splitjoin(&mut self, splitjoin: &str) -> Result<(), CompileError> {
            self.calls.push(format!("begin {}", splitjoin));
            Ok(())
        }

        fn splitjoin_add_split(
            &mut self,
            splitjoin: &str,
            _command: &str,
            consumes: Names,
            _produces: Names,
            fanout: Names,
        ) -> Result<(), CompileError> {
            self.calls
                .push(format!("split {} {:?} fanout={:?}", splitjoin, consumes, fanout));
            Ok(())
        }

        fn splitjoin_add_join(
            &mut self,
            splitjoin: &str,
            _command: &str,
            _consumes: Names,
            produces: Names,
            fanin: Names,
        ) -> Result<(), CompileError> {
            self.calls
                .push(format!("join {} fanin={:?} {:?}", splitjoin, fanin, produces));
            Ok(())
        }

        fn splitjoin_add_count(&mut self, splitjoin: &str, command: &str) -> Result<(), CompileError> {
            self.calls.push(format!("count {} [{}]", splitjoin, command));
            Ok(())
        }

        fn splitjoin_add_stage(
            &mut self,
            splitjoin: &str,
            stage: &str,
            _command: &str,
            consumes: Names,
            produces: Names,
        ) -> Result<(), CompileError> {
            self.calls.push(format!(
                "sjstage {} {} {:?}->{:?}",
                splitjoin, stage, consumes, produces
            ));
            Ok(())
        }

        fn finish_splitjoin(&mut self, splitjoin: &str) -> Result<(), CompileError> {
            self.calls.push(format!("finish {}", splitjoin));
            Ok(())
        }
    }

    fn splitjoin_graph(with_count: bool) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        let prep = g.add_stage_vertex("prep", "prep {}");
        let input = g.add_or_get_data_vertex("input");
        g.connect(prep, input, EdgeKind::Produces, "");

        g.with_subgraph(|sg| {
            let split = sg.add_stage_vertex("split", "split {}");
            let input = sg.add_or_get_data_vertex("input");
            let chunk = sg.add_or_get_data_vertex("chunk");
            sg.connect(input, split, EdgeKind::Consumes, "");
            sg.connect(split, chunk, EdgeKind::FanOut, "");

            let work = sg.add_stage_vertex("work", "work ##");
            let done = sg.add_or_get_data_vertex("done");
            sg.connect(chunk, work, EdgeKind::Consumes, "");
            sg.connect(work, done, EdgeKind::Produces, "");

            let join = sg.add_stage_vertex("join", "cat @(##)");
            let merged = sg.add_or_get_data_vertex("merged");
            sg.connect(done, join, EdgeKind::FanIn, "");
            sg.connect(join, merged, EdgeKind::Produces, "");

            if with_count {
                sg.add_count_vertex("echo 4");
            }
        });
        g
    }

    #[test]
    fn compila_raiz_y_luego_splitjoin_en_secuencia() {
        let g = splitjoin_graph(true);
        let mut rec = Recorder::default();
        compile(&g, &mut rec).unwrap();

        assert_eq!(
            rec.calls,
            vec![
                "stage prep [prep {}] []->[\"input\"]",
                "begin splitjoin_1",
                "split splitjoin_1 [\"input\"] fanout=[\"chunk\"]",
                "sjstage splitjoin_1 work [\"chunk\"]->[\"done\"]",
                "join splitjoin_1 fanin=[\"done\"] [\"merged\"]",
                "count splitjoin_1 [echo 4]",
                "finish splitjoin_1",
            ]
        );
    }

    #[test]
    fn splitjoin_sin_count_es_fatal() {
        let g = splitjoin_graph(false);
        let mut rec = Recorder::default();
        let err = compile(&g, &mut rec).unwrap_err();
        assert_eq!(err, CompileError::MissingCount("splitjoin_1".to_string()));
        assert!(!rec.calls.iter().any(|c| c.starts_with("finish")));
    }

    #[test]
    fn count_con_comando_vacio_es_fatal() {
        let mut g = DependencyGraph::new();
        g.with_subgraph(|sg| {
            sg.add_stage_vertex("split", "s");
            sg.add_stage_vertex("join", "j");
            sg.add_count_vertex("");
        });
        let mut rec = Recorder::default();
        assert!(matches!(
            compile(&g, &mut rec),
            Err(CompileError::MissingCount(_))
        ));
    }
}
