pub mod benchmark;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod server;
pub mod types;

pub use benchmark::{BenchmarkReport, BenchmarkRequest};
pub use config::AppConfig;
pub use engine::{EngineSlot, GenerationEngine, SyntheticEngine};
pub use pipeline::{MetricsRecord, Pipeline, ResponseMode};
pub use server::build_router;
pub use types::{GenerationRequest, GenerationResponse};
