pub mod builtin;
pub mod evidence;
pub mod pointer;
pub mod registry;

pub use evidence::{EvidenceIndex, EvidenceRecord};
pub use registry::ToolRegistry;
