pub mod analysis;
pub mod auth;
pub mod batcher;
pub mod dedup;
pub mod etl;
pub mod normalizer;
pub mod query;
pub mod sink;
pub mod source;
pub mod stats;

pub use crate::domain::model::{AnalysisOutcome, Batch, Record, RunSummary};
pub use crate::domain::ports::{AnalysisBackend, LocalLog, RecordSource, RemoteSink};
pub use crate::utils::error::Result;
