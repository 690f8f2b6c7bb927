use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::{Engine, EngineConfig, Topology};
use crate::error::WireError;
use crate::graph::DependencyGraph;
use crate::runner::CommandRunner;
use crate::tool::HttpToolResolver;

/// Lo que viaja a un worker remoto: el grafo de dependencias (no las
/// colecciones vivas) más el workflow CWL si corresponde. El receptor
/// recompila su propia `Topology`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyPayload {
    pub graph: DependencyGraph,
    #[serde(default)]
    pub cwl_configuration: Option<String>,
}

impl TopologyPayload {
    pub fn new(graph: DependencyGraph, cwl_configuration: Option<String>) -> Self {
        Self {
            graph,
            cwl_configuration,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let bytes = serde_json::to_vec(self)?;
        debug!("topología serializada: {} bytes", bytes.len());
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut payload: TopologyPayload = serde_json::from_slice(bytes)?;
        payload.graph.reindex();
        Ok(payload)
    }

    pub fn is_cwl(&self) -> bool {
        self.cwl_configuration.is_some()
    }

    pub fn compile(&self) -> Result<Topology, WireError> {
        Ok(Topology::from_graph(&self.graph)?)
    }

    /// Motor listo para recibir corridas. En modo CWL las etapas se
    /// resuelven contra `TOOL_SERVICE_URL`.
    ///
    /// Debe llamarse dentro de un runtime de tokio.
    pub fn start_engine(
        &self,
        runner: Arc<dyn CommandRunner>,
        config: EngineConfig,
    ) -> Result<Engine, WireError> {
        let engine = Engine::new(Arc::new(self.compile()?), runner, config);
        if !self.is_cwl() {
            return Ok(engine);
        }
        let resolver = HttpToolResolver::from_env()?;
        info!("modo CWL: servicio de herramientas en {}", resolver.base_url());
        Ok(engine.with_tool_resolver(Arc::new(resolver)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::parse_pipeline;

    const PIPELINE: &str = r#"{
        "stages": {
            "prep": { "command": "prep {}", "out": "input" },
            "splitjoin": {
                "split":  { "command": "split {}", "in": "input", "fanout": "chunk" },
                "count":  "echo 2",
                "stages": { "work": { "command": "work ##", "in": "chunk", "out": "done" } },
                "join":   { "command": "cat @(##)", "fanin": "done", "out": "merged" }
            }
        }
    }"#;

    #[test]
    fn payload_reconstruye_la_misma_topologia() {
        let graph = parse_pipeline(PIPELINE).unwrap();
        let original = Topology::from_graph(&graph).unwrap();

        let bytes = TopologyPayload::new(graph, None).encode().unwrap();
        let decoded = TopologyPayload::decode(&bytes).unwrap();

        assert!(!decoded.is_cwl());
        assert_eq!(decoded.compile().unwrap(), original);
    }

    #[test]
    fn payload_conserva_configuracion_cwl() {
        let payload = TopologyPayload::new(DependencyGraph::new(), Some("{}".to_string()));
        let decoded = TopologyPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
        assert!(decoded.is_cwl());
    }

    #[tokio::test]
    async fn start_engine_ejecuta_la_topologia_recibida() {
        let graph = parse_pipeline(
            r#"{ "stages": { "hola": { "command": "true", "out": "saludo" } } }"#,
        )
        .unwrap();
        let bytes = TopologyPayload::new(graph, None).encode().unwrap();
        let payload = TopologyPayload::decode(&bytes).unwrap();

        let engine = payload
            .start_engine(Arc::new(crate::runner::ShellRunner), EngineConfig::default())
            .unwrap();
        engine.run("r", 0);
        let report = engine.wait().await;

        assert!(report.is_clean());
        assert!(engine.item("saludo", crate::engine::RunTag::new("r", 0)).is_some());
    }

    #[test]
    fn bytes_invalidos_son_error() {
        assert!(matches!(
            TopologyPayload::decode(b"basura"),
            Err(WireError::Codec(_))
        ));
    }
}
