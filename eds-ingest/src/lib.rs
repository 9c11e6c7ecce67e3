pub mod config;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod scheduler;
pub mod sinks;
pub mod sources;
pub mod supervisor;
pub mod transform;

pub use pipeline::{PipelineError, Service};
pub use supervisor::Supervisor;
