pub mod command;
pub mod compiler;
pub mod descriptor;
pub mod dot;
pub mod engine;
pub mod error;
pub mod graph;
pub mod job;
pub mod results;
pub mod runner;
pub mod task;
pub mod tool;
pub mod wire;
pub mod worker;

pub use engine::{Engine, EngineConfig, RunTag, SplitJoinPhase, Topology};
pub use error::{CompileError, ConfigError, StoreError, ToolError, WireError};
pub use graph::DependencyGraph;
pub use job::*;
pub use results::*;
pub use runner::{CommandOutput, CommandRunner, DryRunner, ShellRunner};
pub use task::*;
pub use wire::TopologyPayload;
pub use worker::*;
