pub mod heartbeat;
pub mod model;
pub mod service;

pub use heartbeat::{HeartbeatInput, HeartbeatMonitor, ReapOptions, StallThresholds};
pub use model::{Run, RunConfig, RunDetail, RunFilter, RunStatus};
pub use service::RunService;
