use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identificador de subgrafo. `ROOT_SUBGRAPH` es el grafo principal;
/// cada split-join recibe un id positivo.
pub type SubgraphId = u32;

pub const ROOT_SUBGRAPH: SubgraphId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VertexId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexKind {
    Stage,
    DataDependency,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Produces,
    Consumes,
    FanIn,
    FanOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub kind: VertexKind,
    pub name: String,
    pub command: Option<String>,
    pub subgraph: SubgraphId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub kind: EdgeKind,
    pub from: VertexId,
    pub to: VertexId,
    /// Nombre de puerto (sólo lo usa el modo CWL).
    pub port: String,
    /// Posición entre las aristas que salen del mismo vértice.
    pub index: usize,
}

/// Grafo de dependencias: etapas y dependencias de datos unidas por
/// aristas tipadas, con un nivel de subgrafos para los split-join.
///
/// Es también el formato de cable con el que se distribuye la topología:
/// un worker remoto deserializa este grafo y recompila su propio runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencyGraph {
    vertices: Vec<Vertex>,
    edges: Vec<Edge>,
    next_subgraph: SubgraphId,

    /// (subgrafo, nombre) -> vértice de datos. Se reconstruye al deserializar.
    #[serde(skip)]
    data_index: HashMap<(SubgraphId, String), VertexId>,
}

impl PartialEq for DependencyGraph {
    fn eq(&self, other: &Self) -> bool {
        self.vertices == other.vertices && self.edges == other.edges
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle de construcción sobre el grafo raíz.
    pub fn root(&mut self) -> GraphScope<'_> {
        GraphScope {
            graph: self,
            subgraph: ROOT_SUBGRAPH,
        }
    }

    pub fn add_stage_vertex(&mut self, name: &str, command: &str) -> VertexId {
        self.root().add_stage_vertex(name, command)
    }

    pub fn add_or_get_data_vertex(&mut self, name: &str) -> VertexId {
        self.root().add_or_get_data_vertex(name)
    }

    pub fn add_count_vertex(&mut self, command: &str) -> VertexId {
        self.root().add_count_vertex(command)
    }

    pub fn connect(&mut self, from: VertexId, to: VertexId, kind: EdgeKind, port: &str) -> EdgeId {
        self.root().connect(from, to, kind, port)
    }

    pub fn with_subgraph<R>(&mut self, f: impl FnOnce(&mut GraphScope<'_>) -> R) -> R {
        self.root().with_subgraph(f)
    }

    /* ---------------- consultas ---------------- */

    pub fn vertex(&self, id: VertexId) -> &Vertex {
        &self.vertices[id.0]
    }

    pub fn vertices(&self) -> impl Iterator<Item = (VertexId, &Vertex)> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (VertexId(i), v))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn subgraph_of(&self, id: VertexId) -> SubgraphId {
        self.vertex(id).subgraph
    }

    fn in_edges(&self, v: VertexId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == v)
    }

    fn out_edges(&self, v: VertexId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == v)
    }

    fn sources_of(&self, v: VertexId, kind: EdgeKind) -> Vec<String> {
        self.in_edges(v)
            .filter(|e| e.kind == kind)
            .map(|e| self.vertex(e.from).name.clone())
            .collect()
    }

    fn targets_of(&self, v: VertexId, kind: EdgeKind) -> Vec<String> {
        self.out_edges(v)
            .filter(|e| e.kind == kind)
            .map(|e| self.vertex(e.to).name.clone())
            .collect()
    }

    pub fn consumes_names(&self, v: VertexId) -> Vec<String> {
        self.sources_of(v, EdgeKind::Consumes)
    }

    pub fn produces_names(&self, v: VertexId) -> Vec<String> {
        self.targets_of(v, EdgeKind::Produces)
    }

    pub fn fanin_names(&self, v: VertexId) -> Vec<String> {
        self.sources_of(v, EdgeKind::FanIn)
    }

    pub fn fanout_names(&self, v: VertexId) -> Vec<String> {
        self.targets_of(v, EdgeKind::FanOut)
    }

    /// Etiquetas de puerto de todas las aristas entrantes.
    pub fn input_ports(&self, v: VertexId) -> Vec<String> {
        self.in_edges(v).map(|e| e.port.clone()).collect()
    }

    pub fn output_ports(&self, v: VertexId) -> Vec<String> {
        self.out_edges(v).map(|e| e.port.clone()).collect()
    }

    /// Reconstruye el índice de dependencias por nombre (después de deserializar).
    pub fn reindex(&mut self) {
        self.data_index = self
            .vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.kind == VertexKind::DataDependency)
            .map(|(i, v)| ((v.subgraph, v.name.clone()), VertexId(i)))
            .collect();
    }

    fn push_vertex(&mut self, vertex: Vertex) -> VertexId {
        self.vertices.push(vertex);
        VertexId(self.vertices.len() - 1)
    }
}

/// Contexto de construcción: el grafo más el subgrafo activo.
///
/// El id de subgrafo viaja explícitamente en el scope; `with_subgraph`
/// crea un scope hijo y el padre queda intacto al terminar.
pub struct GraphScope<'g> {
    graph: &'g mut DependencyGraph,
    subgraph: SubgraphId,
}

impl<'g> GraphScope<'g> {
    pub fn subgraph(&self) -> SubgraphId {
        self.subgraph
    }

    /// Siempre crea un vértice nuevo: las etapas no se deduplican.
    pub fn add_stage_vertex(&mut self, name: &str, command: &str) -> VertexId {
        let subgraph = self.subgraph;
        self.graph.push_vertex(Vertex {
            kind: VertexKind::Stage,
            name: name.to_string(),
            command: Some(command.to_string()),
            subgraph,
        })
    }

    /// Crea la dependencia en la primera referencia y la memoriza por
    /// nombre dentro del subgrafo activo.
    pub fn add_or_get_data_vertex(&mut self, name: &str) -> VertexId {
        let key = (self.subgraph, name.to_string());
        if let Some(id) = self.graph.data_index.get(&key) {
            return *id;
        }

        let id = self.graph.push_vertex(Vertex {
            kind: VertexKind::DataDependency,
            name: name.to_string(),
            command: None,
            subgraph: self.subgraph,
        });
        self.graph.data_index.insert(key, id);
        id
    }

    pub fn add_count_vertex(&mut self, command: &str) -> VertexId {
        let subgraph = self.subgraph;
        self.graph.push_vertex(Vertex {
            kind: VertexKind::Count,
            name: "count".to_string(),
            command: Some(command.to_string()),
            subgraph,
        })
    }

    pub fn connect(&mut self, from: VertexId, to: VertexId, kind: EdgeKind, port: &str) -> EdgeId {
        debug_assert!(from.0 < self.graph.vertices.len());
        debug_assert!(to.0 < self.graph.vertices.len());

        let index = self.graph.edges.iter().filter(|e| e.from == from).count();
        self.graph.edges.push(Edge {
            kind,
            from,
            to,
            port: port.to_string(),
            index,
        });
        EdgeId(self.graph.edges.len() - 1)
    }

    /// Ejecuta `f` con un subgrafo nuevo (id monótono por grafo).
    /// Sólo se admite un nivel de anidamiento.
    pub fn with_subgraph<R>(&mut self, f: impl FnOnce(&mut GraphScope<'_>) -> R) -> R {
        self.graph.next_subgraph += 1;
        let mut child = GraphScope {
            subgraph: self.graph.next_subgraph,
            graph: &mut *self.graph,
        };
        f(&mut child)
    }
}
