use clap::Parser;
use plate_scan::utils::error::ErrorSeverity;
use plate_scan::utils::{logger, validation::Validate};
use plate_scan::{
    AnalysisItem, AnalysisOrchestrator, CliConfig, CorrectionRequest, ServiceConfig,
    SharedContext, TemplateCache,
};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliConfig::parse();

    // 初始化日誌
    if cli.json_logs {
        logger::init_json_logger();
    } else {
        logger::init_cli_logger(cli.verbose);
    }

    tracing::info!("Starting plate-scan CLI");
    if cli.verbose {
        tracing::debug!("CLI config: {:?}", cli);
    }

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("🛑 Ctrl-C received, cancelling unfinished items");
            ctrl_c.cancel();
        }
    });

    match run(&cli, &shutdown).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            tracing::error!(
                "❌ plate-scan failed: {} (Category: {:?}, Severity: {:?})",
                e,
                e.category(),
                e.severity()
            );

            eprintln!("❌ {}", e.user_friendly_message());
            eprintln!("💡 建議: {}", e.recovery_suggestion());

            // 根據錯誤嚴重程度決定退出碼
            let exit_code = match e.severity() {
                ErrorSeverity::Low => 0,
                ErrorSeverity::Medium => 2,
                ErrorSeverity::High => 1,
                ErrorSeverity::Critical => 3,
            };
            if exit_code > 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
    }
}

async fn run(cli: &CliConfig, shutdown: &CancellationToken) -> plate_scan::Result<String> {
    cli.validate()?;

    let config = ServiceConfig::from_file(&cli.config)?;
    config.validate()?;

    let templates = Arc::new(TemplateCache::from_config(&config));
    let loaded = templates.load_all().await;
    tracing::info!("📚 Loaded {}/{} templates", loaded, templates.keys().count());

    let refresh_stop = shutdown.child_token();
    let refresh = if config.auto_refresh() {
        Some(Arc::clone(&templates).spawn_refresh(config.refresh_interval(), refresh_stop.clone())?)
    } else {
        None
    };

    let orchestrator = AnalysisOrchestrator::from_config(&config, templates);
    tracing::info!("🤖 Using model {}", orchestrator.model_name());

    let output = match &cli.correction {
        Some(path) => {
            let body = tokio::fs::read_to_string(path).await?;
            let request = CorrectionRequest::from_json(&body)?;
            let result = orchestrator.run_correction(&request, shutdown).await?;
            serde_json::to_string_pretty(&result)?
        }
        None => {
            let items = read_items(&cli.images).await?;
            let shared = SharedContext::from_form_fields(
                &cli.user_id,
                &cli.hint,
                &cli.comment,
                &cli.extra_params,
            )?;
            let max_concurrency = cli.max_concurrency.unwrap_or_else(|| config.max_concurrency());

            let batch = orchestrator
                .run_batch(items, &shared, max_concurrency, shutdown)
                .await?;
            tracing::info!(
                "✅ {} succeeded, {} failed (request {})",
                batch.succeeded(),
                batch.failed(),
                batch.request_id
            );
            serde_json::to_string_pretty(&batch)?
        }
    };

    refresh_stop.cancel();
    if let Some(handle) = refresh {
        if let Err(e) = handle.await {
            tracing::warn!("⚠️ Template refresh task ended abnormally: {}", e);
        }
    }

    Ok(output)
}

async fn read_items(paths: &[String]) -> plate_scan::Result<Vec<AnalysisItem>> {
    let mut items = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(path).await?;
        let mut item = AnalysisItem::new(bytes);
        if let Some(name) = Path::new(path).file_name() {
            item = item.with_file_name(name.to_string_lossy());
        }
        tracing::debug!("📷 {} -> {} ({} bytes)", path, item.item_id, item.size_bytes);
        items.push(item);
    }
    Ok(items)
}
