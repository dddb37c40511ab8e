pub mod audit;
pub mod error;
pub mod pipeline;
pub mod stages;
pub mod stream_coordinator;

pub use audit::{AuditOutcome, AuditRecord, AuditRecorder, AuditSink, FileSink, PipelineStage, StageAudit, StdoutSink};
pub use error::GatewayError;
pub use pipeline::{GatewayPipeline, HandleResult, PipelineOutcome, StreamAuditContext, StreamCompletion};
pub use stages::{PipelineContext, Stage, StageOutcome};
pub use stream_coordinator::coordinate;
