pub mod render_with_pointers;
pub mod retrieve_evidence;

pub use render_with_pointers::RenderWithPointersTool;
pub use retrieve_evidence::RetrieveEvidenceTool;
