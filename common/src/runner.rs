use std::process::{Command, Stdio};

use tracing::{info, warn};

/// Resultado de invocar un comando externo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Ejecuta comandos ya instanciados. La invocación es síncrona: ocupa sólo
/// el hilo del paso que la llama.
pub trait CommandRunner: Send + Sync {
    /// Ejecuta el comando; la salida estándar sólo se captura si `capture`.
    fn run(&self, command: &str, capture: bool) -> CommandOutput;
}

/// Ejecuta cada comando con `sh -c`.
#[derive(Debug, Default, Clone)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str, capture: bool) -> CommandOutput {
        info!("ejecutando: {}", command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        if capture {
            cmd.stdout(Stdio::piped());
        }

        let result = if capture {
            cmd.output().map(|out| CommandOutput {
                exit_code: out.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            })
        } else {
            cmd.status().map(|status| CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout: String::new(),
            })
        };

        match result {
            Ok(out) => {
                info!("exit code {} para: {}", out.exit_code, command);
                out
            }
            Err(e) => {
                warn!("no se pudo lanzar '{}': {}", command, e);
                CommandOutput {
                    exit_code: -1,
                    stdout: String::new(),
                }
            }
        }
    }
}

/// Modo dry-run: no ejecuta nada y asume éxito con salida vacía.
#[derive(Debug, Default, Clone)]
pub struct DryRunner;

impl CommandRunner for DryRunner {
    fn run(&self, command: &str, _capture: bool) -> CommandOutput {
        info!("dry-run: {}", command);
        CommandOutput {
            exit_code: 0,
            stdout: String::new(),
        }
    }
}
