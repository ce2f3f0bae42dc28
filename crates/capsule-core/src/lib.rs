pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{CapsuleError, ErrorKind, Result};
pub use event::EventBus;
pub use graph::{
    EnvSpec, Step, StepGraph, StepKind, SynthesisStyle, SynthesizeStep, ToolStep, VolumeMode,
    VolumeMount,
};
pub use types::*;
