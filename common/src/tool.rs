//! Cliente del servicio que traduce una herramienta CWL a una línea de
//! comandos concreta y luego interpreta sus salidas.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{env, fs, path::PathBuf};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ToolError;
use crate::runner::CommandOutput;

const DEFAULT_TOOL_SERVICE_URL: &str = "http://localhost:5000";
const SUCCESS_STATUS: &str = "SUCCESS";

pub fn tool_service_url() -> String {
    env::var("TOOL_SERVICE_URL").unwrap_or_else(|_| DEFAULT_TOOL_SERVICE_URL.to_string())
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolRequest {
    pub tool_cfg: Value,
    pub input_map: Map<String, Value>,
    pub job_dir: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandLine {
    #[serde(default)]
    pub arguments: Vec<Value>,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub stdout: Option<String>,
}

fn redirect(stream: &Option<String>) -> Option<&str> {
    stream
        .as_deref()
        .filter(|s| !s.is_empty() && *s != "null")
}

impl CommandLine {
    /// Línea de shell: argumentos separados por espacio más las redirecciones.
    pub fn to_shell(&self) -> String {
        let mut command: String = self
            .arguments
            .iter()
            .map(|arg| match arg {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ");

        if let Some(input) = redirect(&self.stdin) {
            command.push_str(" < ");
            command.push_str(input);
        }
        if let Some(output) = redirect(&self.stdout) {
            command.push_str(" > ");
            command.push_str(output);
        }
        command
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolOutputs {
    pub status: String,
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// Intercambio pedido/respuesta con el servicio de resolución.
pub trait ToolResolver: Send + Sync {
    fn command_line(&self, request: &ToolRequest) -> Result<CommandLine, ToolError>;

    fn outputs(&self, request: &ToolRequest, exit_code: i32) -> Result<ToolOutputs, ToolError>;
}

/// Implementación HTTP. Se llama desde hilos bloqueantes, así que cada
/// pedido se resuelve con `block_on` sobre el runtime guardado.
pub struct HttpToolResolver {
    base_url: String,
    client: reqwest::Client,
    handle: Handle,
}

impl HttpToolResolver {
    pub fn new(base_url: impl Into<String>, handle: Handle) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            handle,
        }
    }

    /// Usa `TOOL_SERVICE_URL` y el runtime actual.
    pub fn from_env() -> Result<Self, ToolError> {
        Ok(Self::new(tool_service_url(), Handle::try_current()?))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post<T: DeserializeOwned>(&self, endpoint: &str, body: &Value) -> Result<T, ToolError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!("POST {}: {}", url, body);
        self.handle.block_on(async {
            let resp = self
                .client
                .post(&url)
                .json(body)
                .send()
                .await?
                .error_for_status()?;
            Ok(resp.json::<T>().await?)
        })
    }
}

impl ToolResolver for HttpToolResolver {
    fn command_line(&self, request: &ToolRequest) -> Result<CommandLine, ToolError> {
        let body = serde_json::to_value(request)?;
        self.post("get_command_line", &body)
    }

    fn outputs(&self, request: &ToolRequest, exit_code: i32) -> Result<ToolOutputs, ToolError> {
        let mut body = serde_json::to_value(request)?;
        if let Value::Object(map) = &mut body {
            map.insert("exit_code".to_string(), Value::from(exit_code));
        }
        self.post("get_outputs", &body)
    }
}

/// Directorio de trabajo limpio y único para una invocación.
pub fn scratch_dir() -> Result<PathBuf, ToolError> {
    let dir = env::temp_dir().join(Uuid::new_v4().to_string());
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Ejecuta un paso CWL completo: pide la línea de comandos, la corre con
/// `execute` y pide las salidas. Devuelve `None` si el estado no es SUCCESS.
pub fn run_tool(
    resolver: &dyn ToolResolver,
    tool_cfg: &str,
    input_map: Map<String, Value>,
    execute: impl FnOnce(&str) -> CommandOutput,
) -> Result<Option<Map<String, Value>>, ToolError> {
    let request = ToolRequest {
        tool_cfg: serde_json::from_str(tool_cfg)?,
        input_map,
        job_dir: scratch_dir()?.to_string_lossy().into_owned(),
    };

    let command = resolver.command_line(&request)?.to_shell();
    info!("comando resuelto: {}", command);
    let out = execute(&command);

    let response = resolver.outputs(&request, out.exit_code)?;
    if response.status != SUCCESS_STATUS {
        warn!(
            "la herramienta respondió '{}'; sólo se admite {}, se ignoran las salidas",
            response.status, SUCCESS_STATUS
        );
        return Ok(None);
    }
    Ok(Some(response.outputs))
}
