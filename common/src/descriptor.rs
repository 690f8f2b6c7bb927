//! Carga de descriptores de pipeline hacia el grafo de dependencias.
//!
//! Dos formatos:
//! - JSON nativo: objeto `"stages"` donde cada clave es una etapa y la clave
//!   especial `"splitjoin"` (que puede repetirse) agrupa split/stages/join/count.
//! - Workflow CWL: `class: Workflow` con `steps[]`.

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::graph::{DependencyGraph, EdgeKind, GraphScope};

const STAGE_FIELDS: &[&str] = &[
    "command", "in", "out", "fanin", "fanout", "split", "join", "stages", "count",
];

/* ===================== JSON con claves repetidas ===================== */

/// Valor JSON que conserva el orden y las claves repetidas de los objetos.
#[derive(Debug, Clone, PartialEq)]
enum Node {
    Object(Vec<(String, Node)>),
    Array(Vec<Node>),
    Scalar(Value),
}

impl Node {
    fn get(&self, key: &str) -> Option<&Node> {
        match self {
            Node::Object(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            Node::Scalar(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    fn entries(&self, at: &str) -> Result<&[(String, Node)], ConfigError> {
        match self {
            Node::Object(entries) => Ok(entries),
            _ => Err(ConfigError::UnexpectedShape {
                at: at.to_string(),
                expected: "un objeto",
            }),
        }
    }
}

struct NodeVisitor;

impl<'de> Visitor<'de> for NodeVisitor {
    type Value = Node;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("un valor JSON")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Node, E> {
        Ok(Node::Scalar(Value::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Node, E> {
        Ok(Node::Scalar(Value::from(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Node, E> {
        Ok(Node::Scalar(Value::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Node, E> {
        Ok(Node::Scalar(Value::from(v)))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Node, E> {
        Ok(Node::Scalar(Value::String(v.to_owned())))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Node, E> {
        Ok(Node::Scalar(Value::String(v)))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Scalar(Value::Null))
    }

    fn visit_none<E: de::Error>(self) -> Result<Node, E> {
        Ok(Node::Scalar(Value::Null))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Node, A::Error> {
        let mut items = Vec::new();
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Node::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Node, A::Error> {
        let mut entries = Vec::new();
        while let Some((key, value)) = map.next_entry::<String, Node>()? {
            entries.push((key, value));
        }
        Ok(Node::Object(entries))
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(NodeVisitor)
    }
}

/* ===================== formato nativo ===================== */

/// Un string o un arreglo de strings.
fn dependency_names(at: &str, node: &Node) -> Result<Vec<String>, ConfigError> {
    let shape_error = || ConfigError::UnexpectedShape {
        at: at.to_string(),
        expected: "un string o un arreglo de strings",
    };
    match node {
        Node::Array(items) => items
            .iter()
            .map(|n| n.as_str().map(str::to_string).ok_or_else(shape_error))
            .collect(),
        other => other
            .as_str()
            .map(|s| vec![s.to_string()])
            .ok_or_else(shape_error),
    }
}

fn parse_stage(scope: &mut GraphScope<'_>, name: &str, node: &Node) -> Result<(), ConfigError> {
    let fields = node.entries(name)?;

    let command = match node.get("command") {
        Some(c) => c.as_str().map(str::to_string).ok_or_else(|| ConfigError::UnexpectedShape {
            at: format!("{}.command", name),
            expected: "un string",
        })?,
        None => String::new(),
    };
    if command.is_empty() {
        warn!(
            "la etapa '{}' no tiene comando asociado; se continúa con un comando vacío",
            name
        );
    }

    let vertex = scope.add_stage_vertex(name, &command);
    debug!("etapa '{}': {}", name, command);

    for (field, value) in fields {
        let at = format!("{}.{}", name, field);
        match field.as_str() {
            "in" => {
                for dep in dependency_names(&at, value)? {
                    let data = scope.add_or_get_data_vertex(&dep);
                    scope.connect(data, vertex, EdgeKind::Consumes, "");
                }
            }
            "out" => {
                for dep in dependency_names(&at, value)? {
                    let data = scope.add_or_get_data_vertex(&dep);
                    scope.connect(vertex, data, EdgeKind::Produces, "");
                }
            }
            "fanout" if name == "split" => {
                for dep in dependency_names(&at, value)? {
                    let data = scope.add_or_get_data_vertex(&dep);
                    scope.connect(vertex, data, EdgeKind::FanOut, "");
                }
            }
            "fanin" if name == "join" => {
                for dep in dependency_names(&at, value)? {
                    let data = scope.add_or_get_data_vertex(&dep);
                    scope.connect(data, vertex, EdgeKind::FanIn, "");
                }
            }
            other if STAGE_FIELDS.contains(&other) => {}
            other => warn!("entrada desconocida '{}' en la etapa '{}'", other, name),
        }
    }
    Ok(())
}

fn parse_splitjoin(scope: &mut GraphScope<'_>, node: &Node) -> Result<(), ConfigError> {
    node.entries("splitjoin")?;
    let section = |key: &'static str| node.get(key).ok_or(ConfigError::MissingSplitJoinSection(key));

    let split = section("split")?;
    let join = section("join")?;
    let count = section("count")?;
    let stages = section("stages")?.entries("splitjoin.stages")?;

    let count_command = count.as_str().ok_or_else(|| ConfigError::UnexpectedShape {
        at: "splitjoin.count".to_string(),
        expected: "un string",
    })?;

    scope.with_subgraph(|sg| -> Result<(), ConfigError> {
        debug!("splitjoin en el subgrafo {}", sg.subgraph());
        parse_stage(sg, "split", split)?;
        for (name, stage) in stages {
            parse_stage(sg, name, stage)?;
        }
        parse_stage(sg, "join", join)?;

        if count_command.is_empty() {
            warn!("el splitjoin tiene un 'count' vacío");
        }
        sg.add_count_vertex(count_command);
        Ok(())
    })
}

/// Carga un descriptor JSON nativo.
pub fn parse_pipeline(json: &str) -> Result<DependencyGraph, ConfigError> {
    let root: Node = serde_json::from_str(json)?;
    let mut graph = DependencyGraph::new();

    for (key, value) in root.entries("<raíz>")? {
        if key != "stages" {
            warn!("entrada desconocida '{}' en la raíz del descriptor", key);
            continue;
        }
        let mut scope = graph.root();
        for (name, node) in value.entries("stages")? {
            if name == "splitjoin" {
                parse_splitjoin(&mut scope, node)?;
            } else {
                parse_stage(&mut scope, name, node)?;
            }
        }
    }
    Ok(graph)
}

/* ===================== CWL ===================== */

fn required<'a>(node: &'a Value, at: &str, field: &'static str) -> Result<&'a Value, ConfigError> {
    node.get(field).ok_or_else(|| ConfigError::MissingField {
        at: at.to_string(),
        field,
    })
}

fn required_str<'a>(node: &'a Value, at: &str, field: &'static str) -> Result<&'a str, ConfigError> {
    required(node, at, field)?
        .as_str()
        .ok_or_else(|| ConfigError::UnexpectedShape {
            at: format!("{}.{}", at, field),
            expected: "un string",
        })
}

fn as_list<'a>(node: &'a Value, at: &str) -> Result<&'a [Value], ConfigError> {
    node.as_array()
        .map(Vec::as_slice)
        .ok_or_else(|| ConfigError::UnexpectedShape {
            at: at.to_string(),
            expected: "un arreglo",
        })
}

fn parse_cwl_step(graph: &mut DependencyGraph, step: &Value) -> Result<(), ConfigError> {
    let id = required_str(step, "steps[]", "id")?;
    let run = required(step, id, "run")?;
    let inputs = as_list(required(step, id, "inputs")?, &format!("{}.inputs", id))?;
    let outputs = as_list(required(step, id, "outputs")?, &format!("{}.outputs", id))?;

    debug!("paso CWL con id {}", id);
    let vertex = graph.add_stage_vertex(id, &serde_json::to_string_pretty(run)?);

    for input in inputs {
        let port = required_str(input, id, "id")?;
        let sources: Vec<&str> = match required(input, port, "source")? {
            Value::Array(list) => list.iter().filter_map(Value::as_str).collect(),
            other => vec![other.as_str().ok_or_else(|| ConfigError::UnexpectedShape {
                at: format!("{}.source", port),
                expected: "un string",
            })?],
        };
        for source in sources {
            let data = graph.add_or_get_data_vertex(source);
            graph.connect(data, vertex, EdgeKind::Consumes, port);
        }
    }

    for output in outputs {
        let port = required_str(output, id, "id")?;
        let data = graph.add_or_get_data_vertex(port);
        graph.connect(vertex, data, EdgeKind::Produces, port);
    }
    Ok(())
}

/// Carga un workflow CWL ya enlazado.
pub fn parse_cwl_workflow(json: &str) -> Result<DependencyGraph, ConfigError> {
    let root: Value = serde_json::from_str(json)?;
    if let Some(class) = root.get("class") {
        let class = class.as_str().unwrap_or_default();
        if class != "Workflow" {
            return Err(ConfigError::NotAWorkflow(class.to_string()));
        }
    }

    let mut graph = DependencyGraph::new();
    if let Some(steps) = root.get("steps") {
        for step in as_list(steps, "steps")? {
            parse_cwl_step(&mut graph, step)?;
        }
    }
    Ok(graph)
}

/// Ids del esquema `inputs` del workflow, en orden.
///
/// Sin esquema, o con una entrada sin `id`, se advierte y se devuelve vacío.
pub fn cwl_input_ids(json: &str) -> Result<Vec<String>, ConfigError> {
    let root: Value = serde_json::from_str(json)?;
    let Some(inputs) = root.get("inputs").and_then(Value::as_array) else {
        warn!("no se encontró el esquema 'inputs' en el workflow CWL");
        return Ok(Vec::new());
    };

    let mut ids = Vec::with_capacity(inputs.len());
    for input in inputs {
        match input.get("id").and_then(Value::as_str) {
            Some(id) => ids.push(id.to_string()),
            None => {
                warn!("una entrada del esquema 'inputs' no tiene el campo obligatorio 'id'");
                return Ok(Vec::new());
            }
        }
    }
    Ok(ids)
}

/// Carga según el modo elegido.
pub fn load(json: &str, cwl: bool) -> Result<DependencyGraph, ConfigError> {
    if cwl {
        parse_cwl_workflow(json)
    } else {
        parse_pipeline(json)
    }
}
