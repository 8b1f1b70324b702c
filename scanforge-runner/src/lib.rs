pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::runner::{ContainerRunner, LaunchSpec, RunnerError};
pub use domain::events::{LogChunk, LogSource, ProgressStage, ScanEvent, TerminalHint};
pub use domain::parser::ScanOutputParser;
pub use domain::selector::TemplateSelector;
pub use domain::target::{Target, TargetError};
pub use infrastructure::runtime::{
    ContainerHandle, ContainerRuntime, ContainerSpec, ContainerState, DockerCliRuntime,
    LogCapture, RuntimeError,
};
