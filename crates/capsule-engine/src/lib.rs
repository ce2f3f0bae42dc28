//! Capsule execution engine: runs a validated step graph once under
//! dependency, concurrency and deadline constraints.

pub mod aggregate;
pub mod engine;
pub mod gate;
pub mod invoker;
pub mod output;
pub mod run_log;
pub mod scheduler;
pub mod store;
pub mod synthesis;
pub mod template;
pub mod window;

pub use engine::CapsuleEngine;
pub use gate::{GateTicket, RunGate};
pub use invoker::{RetryPolicy, ToolInvoker};
pub use output::OutputTable;
pub use run_log::RunLogger;
pub use scheduler::{ScheduleReport, Scheduler};
pub use store::FileRunStore;
pub use window::ConcurrencyWindow;
