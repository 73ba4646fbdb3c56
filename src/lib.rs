//! Training load aggregation and adaptive periodization.
//!
//! Activities are normalized, converted to a training load, folded into
//! per-athlete acute and chronic windows, and compared against a block-based
//! plan that adapts when actual load drifts from the target.

pub mod adaptation;
pub mod aggregate;
pub mod batch;
pub mod collaborators;
pub mod config;
pub mod engine;
pub mod error;
pub mod load;
pub mod logging;
pub mod models;
pub mod normalize;
pub mod training_plan;

pub use adaptation::{AdaptationEngine, AdaptationEvent, Decision};
pub use aggregate::{LoadAggregator, LoadWindow, TrainingStatus, WindowConfig};
pub use batch::{BatchConfig, BatchProcessor, BatchSummary};
pub use collaborators::{InMemoryProfileStore, InMemorySink, PersistenceSink, ProfileStore};
pub use config::{EngineConfig, EngineSettings};
pub use engine::{IngestReport, IngestStatus, TrainingEngine};
pub use error::{EngineError, ErrorKind, Result};
pub use load::{LoadCalculator, LoadComputation};
pub use logging::{init_logging, DiagnosticReport, LogConfig};
pub use models::{Activity, AthleteId, AthleteProfile, LoadSample, MetricType, PlanPolicy};
pub use normalize::{ActivityNormalizer, RawActivity, RawSample};
pub use training_plan::{Emphasis, PeriodizationPlanner, PlanBlock, TrainingPlan};
