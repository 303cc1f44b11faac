pub mod archive;
pub mod correction;
pub mod gateway;
pub mod orchestrator;
pub mod prompt;
pub mod template_cache;

pub use crate::domain::ports::{LlmGateway, ResponseArchive, Storage};
pub use crate::utils::error::Result;
