//! Audit worker CLI
//!
//! Builds the audit kernel from the environment, creates an audit for a URL,
//! runs the requested stages and prints the resulting snapshot as JSON.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use seo_audit::{AuditKernel, Config, OperationStatus, StageKind};
use serde_json::{json, Map, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "audit_worker")]
#[command(about = "Run SEO audit stages against a site")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the stages available with the current configuration
    Stages,

    /// Audit a URL
    Run {
        url: String,

        /// Comma-separated stages; crawl runs first, the rest concurrently
        #[arg(long, value_delimiter = ',', default_value = "crawl,links,images,headings,meta,performance,score")]
        stages: Vec<String>,

        #[arg(long, default_value = "cli")]
        owner: String,

        #[arg(long)]
        max_pages: Option<u64>,

        #[arg(long)]
        depth_limit: Option<u64>,

        /// Keyword for the serp stage
        #[arg(long)]
        keyword: Option<String>,

        /// Use the scripted browser for the crawl
        #[arg(long)]
        browser: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,seo_audit=debug,task_guard=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;
    let kernel = AuditKernel::from_config(config).await?;

    let outcome = match cli.command {
        Commands::Stages => {
            for stage in kernel.dispatcher.stages() {
                println!("{}", stage);
            }
            Ok(())
        }
        Commands::Run {
            url,
            stages,
            owner,
            max_pages,
            depth_limit,
            keyword,
            browser,
        } => {
            let stages = parse_stages(&stages)?;
            let mut crawl_args = Map::new();
            if let Some(max_pages) = max_pages {
                crawl_args.insert("maxPages".into(), json!(max_pages));
            }
            if let Some(depth_limit) = depth_limit {
                crawl_args.insert("depthLimit".into(), json!(depth_limit));
            }
            if browser {
                crawl_args.insert("mode".into(), json!("browser"));
            }
            let serp_args = keyword.map_or_else(|| json!({}), |k| json!({ "keyword": k }));

            tokio::select! {
                result = run(&kernel, &url, &owner, stages, Value::Object(crawl_args), serp_args) => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!("Interrupted, shutting down");
                    Ok(())
                }
            }
        }
    };

    kernel.shutdown(SHUTDOWN_GRACE).await;
    outcome
}

fn parse_stages(names: &[String]) -> Result<Vec<StageKind>> {
    let mut stages = Vec::new();
    for name in names.iter().map(|n| n.trim()).filter(|n| !n.is_empty()) {
        let stage: StageKind = name
            .parse()
            .with_context(|| format!("Unknown stage {:?}", name))?;
        if !stages.contains(&stage) {
            stages.push(stage);
        }
    }
    if stages.is_empty() {
        bail!("No stages requested");
    }
    Ok(stages)
}

async fn run(
    kernel: &AuditKernel,
    url: &str,
    owner: &str,
    stages: Vec<StageKind>,
    crawl_args: Value,
    serp_args: Value,
) -> Result<()> {
    let audit = kernel.repository.create_audit(url, owner).await?;
    tracing::info!(audit_id = %audit.id, url = %audit.url, "Audit started");

    if stages.contains(&StageKind::Crawl) {
        let handle = kernel
            .dispatcher
            .submit_analysis_with(owner, audit.id, StageKind::Crawl, crawl_args)
            .await?;
        report(StageKind::Crawl, &handle.wait().await);
    }

    // Score reads the other results, so it goes last
    let (last, concurrent): (Vec<StageKind>, Vec<StageKind>) = stages
        .into_iter()
        .filter(|s| *s != StageKind::Crawl)
        .partition(|s| *s == StageKind::Score);

    let mut handles = Vec::new();
    for stage in concurrent {
        let args = match stage {
            StageKind::Serp => serp_args.clone(),
            _ => json!({}),
        };
        handles.push(
            kernel
                .dispatcher
                .submit_analysis_with(owner, audit.id, stage, args)
                .await?,
        );
    }
    for (handle, status) in handles.iter().zip(join_all(handles.iter().map(|h| h.wait())).await) {
        report(handle.stage, &status);
    }

    for stage in last {
        let handle = kernel.dispatcher.submit_analysis(owner, audit.id, stage).await?;
        report(stage, &handle.wait().await);
    }

    let snapshot = kernel.dispatcher.get_audit_snapshot(audit.id).await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn report(stage: StageKind, status: &OperationStatus) {
    match status {
        OperationStatus::Succeeded { complete, .. } => {
            tracing::info!(stage = %stage, complete, "Stage finished")
        }
        OperationStatus::Failed(error) => tracing::error!(
            stage = %stage,
            error_type = %error.error_type,
            error_message = %error.error_message,
            "Stage failed"
        ),
        other => tracing::warn!(stage = %stage, status = ?other, "Stage did not finish"),
    }
}
