use thiserror::Error;

/// Errores de configuración: descriptor mal formado o partes obligatorias
/// ausentes. Son fatales antes de iniciar cualquier corrida.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("JSON inválido: {0}")]
    Json(#[from] serde_json::Error),

    #[error("se esperaba {expected} en '{at}'")]
    UnexpectedShape { at: String, expected: &'static str },

    #[error("el splitjoin requiere las secciones split, join, count y stages (falta '{0}')")]
    MissingSplitJoinSection(&'static str),

    #[error("falta el campo obligatorio '{field}' en {at}")]
    MissingField { at: String, field: &'static str },

    #[error("el workflow CWL no es de clase Workflow: '{0}'")]
    NotAWorkflow(String),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

/// Errores al compilar el grafo de dependencias hacia el engine.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error("el splitjoin '{0}' no tiene comando 'count'")]
    MissingCount(String),

    #[error("el splitjoin '{name}' está incompleto: falta {missing}")]
    IncompleteSplitJoin { name: String, missing: &'static str },

    #[error("no existe un splitjoin en construcción llamado '{0}' (falta begin_splitjoin)")]
    UnknownSplitJoin(String),

    #[error("el splitjoin '{0}' ya se había iniciado")]
    DuplicateSplitJoin(String),

    #[error("el splitjoin '{name}' declara más de un '{part}'")]
    DuplicatePart { name: String, part: &'static str },
}

/// Errores del almacén de items de asignación única.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("el item {0} ya fue escrito (asignación única)")]
    AlreadyWritten(String),

    #[error("no existe la colección '{0}'")]
    UnknownCollection(String),
}

/// Errores de intercambio con el servicio de resolución de herramientas.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("error HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("respuesta inválida del servicio: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no se pudo crear el directorio de trabajo: {0}")]
    Io(#[from] std::io::Error),

    #[error("no hay runtime de tokio activo: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// Errores al (de)serializar la topología distribuida.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload de topología inválido: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Tool(#[from] ToolError),
}
