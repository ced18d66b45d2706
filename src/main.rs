//! Hive 命令行入口
//!
//! 用法：`hive [--tenant <id>] [--project <id>] [--config <file>] [--auto-approve] <请求文本...>`
//! 加载配置、初始化日志、以离线能力构建运行时，执行一次请求并以 JSON 打印聚合结果。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hive::config::load_config;
use hive::gateway::AutoApproveConfirmation;
use hive::Runtime;

#[derive(Parser, Debug)]
#[command(name = "hive", version, about = "多智能体编排运行时：执行一次请求并打印聚合结果")]
struct Args {
    /// 租户标识
    #[arg(long, default_value = "local")]
    tenant: String,

    /// 项目标识（缺省为 default）
    #[arg(long)]
    project: Option<String>,

    /// 额外的 TOML 配置文件
    #[arg(long)]
    config: Option<PathBuf>,

    /// 自动批准 restricted 级动作；admin 级仍需确认口令
    #[arg(long)]
    auto_approve: bool,

    /// 请求文本
    #[arg(required = true, trailing_var_arg = true)]
    request: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let args = Args::parse();
    let request = args.request.join(" ");
    let cfg = load_config(args.config.clone()).context("Failed to load config")?;

    let mut builder = Runtime::builder(cfg);
    if args.auto_approve {
        tracing::warn!("auto-approving restricted actions; admin actions still require the phrase");
        builder = builder.confirmation(Arc::new(AutoApproveConfirmation::new()));
    }
    let runtime = builder.build().context("Failed to build runtime")?;
    let _sweepers = runtime.start_background();

    let outcome = runtime
        .submit_request(&request, &args.tenant, args.project.as_deref())
        .await
        .context("Request failed")?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    runtime.shutdown();
    if !outcome.success {
        std::process::exit(1);
    }
    Ok(())
}
