pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use config::toml_config::TomlConfig;
pub use core::etl::{EtlEngine, PipelineSettings};
pub use domain::model::RunSummary;
pub use utils::error::{EtlError, Result};
