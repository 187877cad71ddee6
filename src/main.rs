//! VizQL Pilot CLI
//!
//! 执行一轮编排：打印阶段进度与最终回复。Ctrl+C 协作式取消本轮。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use vizql_pilot::agent::create_runtime;
use vizql_pilot::config::load_config;
use vizql_pilot::core::{SessionState, TurnRequest, TurnStatus};
use vizql_pilot::observability;
use vizql_pilot::phases::EventSink;

/// 自然语言分析问题 → VizQL 查询 → 数据摘要
#[derive(Parser)]
#[command(name = "vizql-pilot", about = "Answer an analytics question against a Tableau datasource")]
struct Cli {
    /// 用户问题
    #[arg(short, long)]
    message: String,

    /// 数据源 LUID
    #[arg(short = 'd', long = "ds")]
    datasource: String,

    /// 额外的配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 忽略字段目录缓存
    #[arg(long)]
    refresh_metadata: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    observability::init(cfg.app.log_file.as_deref());

    let locale = cfg.app.locale;
    let runtime = create_runtime(cfg).context("Failed to assemble runtime")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, cancelling turn");
            ctrl_c.cancel();
        }
    });

    let (events, mut rx) = EventSink::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = event.render(locale) {
                eprintln!("· {}", line);
            }
        }
    });

    let mut request = TurnRequest::new(cli.message, cli.datasource);
    request.refresh_metadata = cli.refresh_metadata;
    let result = runtime
        .orchestrator
        .run_turn(&request, &SessionState::new(), &events, &cancel)
        .await;
    drop(events);
    let _ = printer.await;

    println!("{}", result.reply);
    for path in &result.artifact_paths {
        eprintln!("artifact: {}", path);
    }
    if result.status == TurnStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
