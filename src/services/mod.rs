//! Services - business logic and state management
//!
//! - `ingest` - drains the inbound queue and drives registration and rules
//! - `registry` - gateway auto-registration by MAC
//! - `location` - building and floor resolution from topic segments
//! - `alert_engine` - rule evaluation, alert sessions, gateway liveness
//! - `sessionizer` - sample rollup into presence sessions and daily usage

pub mod alert_engine;
pub mod ingest;
pub mod location;
pub mod registry;
pub mod sessionizer;

// Re-export commonly used types
pub use alert_engine::{AlertEngine, EngineSettings, SweepReport};
pub use ingest::{InboundMessage, IngestOutcome, Ingestor};
pub use location::{LocationResolver, ResolvedLocation};
pub use registry::GatewayRegistry;
pub use sessionizer::{RollupReport, Sessionizer};
