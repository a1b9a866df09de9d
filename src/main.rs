use anyhow::Context;
use clap::Parser;
use s3mirror::cli::Cli;
use s3mirror::config::{default_config_dir, AppConfig};
use s3mirror::core::{new_status, run_mirror, Endpoint};
use s3mirror::logging::{get_log_dir, init_logging};
use s3mirror::storage::{new_client, WriteOptions};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config_dir = cli.config_dir.clone().unwrap_or_else(default_config_dir);
    let config = AppConfig::load(&config_dir);

    // 进度条占用终端时日志写入文件
    let log_dir = get_log_dir(&config_dir);
    let _guard = init_logging(&config.log, Some(&log_dir), cli.debug);

    match run(&cli, &config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(config.error_exit_status.clamp(1, 255) as u8),
        Err(e) => {
            tracing::error!("镜像失败: {:#}", e);
            eprintln!("s3mirror: <ERROR> {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// 执行镜像，返回是否全部成功
async fn run(cli: &Cli, config: &AppConfig) -> anyhow::Result<bool> {
    let opts = cli.mirror_options(config)?;

    let (source_url, source_client) = new_client(config, &cli.source, &WriteOptions::default())
        .await
        .with_context(|| format!("无法初始化源 `{}`", cli.source))?;
    let (target_url, target_client) = new_client(config, &cli.target, &opts.write_options())
        .await
        .with_context(|| format!("无法初始化目标 `{}`", cli.target))?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("收到中断信号，正在停止");
                cancel.cancel();
            }
        }
    });

    let outcome = run_mirror(
        Endpoint::new(source_url.alias, source_client),
        Endpoint::new(target_url.alias, target_client),
        opts,
        new_status(cli.output()),
        cancel,
    )
    .await?;
    Ok(!outcome.err_during_mirror)
}
