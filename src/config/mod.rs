pub mod cli;
pub mod toml_config;

#[cfg(feature = "cli")]
use crate::utils::error::Result;
#[cfg(feature = "cli")]
use crate::utils::validation::{self, Validate};
#[cfg(feature = "cli")]
use clap::Parser;

#[cfg(feature = "cli")]
#[derive(Debug, Clone, Parser)]
#[command(name = "plate-scan")]
#[command(about = "Analyze food images with an LLM and print per-image results")]
pub struct CliConfig {
    /// Path to the TOML service configuration
    #[arg(short, long, default_value = "plate-scan.toml")]
    pub config: String,

    /// Image files to analyze, in result order
    #[arg(required_unless_present = "correction")]
    pub images: Vec<String>,

    /// Run the correction flow with this JSON request body instead of a batch
    #[arg(long, conflicts_with = "images")]
    pub correction: Option<String>,

    #[arg(long, default_value = "")]
    pub user_id: String,

    #[arg(long, default_value = "")]
    pub hint: String,

    #[arg(long, default_value = "")]
    pub comment: String,

    /// Extra requested fields: "fiber,sugar" or '["fiber","sugar"]'
    #[arg(long, default_value = "")]
    pub extra_params: String,

    /// Override batch.max_concurrency from the config file
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    #[arg(long, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, help = "Emit logs as JSON")]
    pub json_logs: bool,
}

#[cfg(feature = "cli")]
impl Validate for CliConfig {
    fn validate(&self) -> Result<()> {
        validation::validate_path("config", &self.config)?;

        if let Some(path) = &self.correction {
            validation::validate_path("correction", path)?;
        } else {
            for image in &self.images {
                validation::validate_path("images", image)?;
            }
        }

        if let Some(max_concurrency) = self.max_concurrency {
            validation::validate_range("max_concurrency", max_concurrency, 1, 64)?;
        }

        Ok(())
    }
}
