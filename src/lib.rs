pub mod bus;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod enrichment;
pub mod error;
pub mod fallback;
pub mod metrics;
pub mod router;
pub mod types;

pub use config::PipelineConfig;
pub use coordinator::{Pipeline, PipelineBuilder, PipelineSnapshot, PipelineState, ShutdownReport};
pub use error::{PipelineError, Result};
pub use types::{Record, RecordId, SourceType};
