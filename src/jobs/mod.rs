pub mod archive;
pub mod artifacts;
pub mod error;
pub mod layout;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod status;

// Re-export commonly used types
pub use error::PipelineError;
pub use layout::JobLayout;
pub use pipeline::{PipelineOutcome, TrainerMode};
pub use registry::JobRegistry;
pub use status::{Stage, StatusRecord};
