pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use config::cli::LocalStorage;
#[cfg(feature = "cli")]
pub use config::CliConfig;
pub use config::toml_config::ServiceConfig;

pub use core::{
    archive::FileArchive,
    correction::CorrectionRequest,
    gateway::{CannedGateway, OpenAiGateway},
    orchestrator::{AnalysisOrchestrator, BatchLimits},
    prompt::PromptRenderer,
    template_cache::TemplateCache,
};
pub use domain::model::{
    AnalysisItem, BatchResult, ItemResult, ItemStatus, LlmCallResult, PromptContext,
    SharedContext, Template, TemplateSourceKind,
};
pub use utils::error::{AnalysisError, Result};
