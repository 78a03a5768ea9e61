//! Conductor - 智能体编排核心
//!
//! 入口：初始化日志、加载配置、装配 Runtime，从 stdin 逐行读取文本交互并打印回复。
//! Ctrl+C 取消进行中的交互并关闭；审计日志不可写时终止进程（非零退出码）。
//!
//! 交互命令：`:report` 安全报告，`:services` 服务状态，`:quit` 退出。

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use conductor::config::load_config;
use conductor::core::{run_with_graceful_shutdown, RuntimeBuilder, ShutdownManager, ShutdownReason};
use conductor::observability;
use conductor::security::TerminalConfirmation;
use conductor::InteractionEnvelope;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

const CLI_USER: &str = "local";
const CLI_SESSION: &str = "cli";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;

    let shutdown = Arc::new(ShutdownManager::new());

    // stdin 行输入：主循环与终端确认共用同一个接收端
    let (line_tx, line_rx) = mpsc::channel::<String>(16);
    let lines = Arc::new(tokio::sync::Mutex::new(line_rx));
    tokio::spawn(async move {
        let mut reader = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut builder = RuntimeBuilder::new(cfg.clone()).with_root_token(shutdown.token());
    if !cfg.app.non_interactive {
        builder = builder.with_confirmation(Arc::new(TerminalConfirmation::new(lines.clone())));
    }
    let runtime = Arc::new(builder.build().context("Failed to assemble runtime")?);

    let _event_logger = observability::spawn_event_logger(&runtime.bus);
    let checker = runtime.spawn_health_checker();

    let fatal = Arc::new(AtomicBool::new(false));

    let app = {
        let runtime = runtime.clone();
        let shutdown = shutdown.clone();
        let fatal = fatal.clone();
        let lines = lines.clone();
        async move {
            let name = runtime.config.app.name.clone().unwrap_or_else(|| "conductor".to_string());
            println!("{name} ready. Type a request, or :quit to exit.");
            loop {
                print!("> ");
                let _ = std::io::stdout().flush();

                let line = lines.lock().await.recv().await;
                let Some(line) = line else {
                    break;
                };
                let text = line.trim();
                match text {
                    "" => continue,
                    ":quit" | ":exit" => break,
                    ":report" => {
                        let report = runtime.audit.security_report();
                        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
                        continue;
                    }
                    ":services" => {
                        let snapshot = runtime.directory.snapshot();
                        println!("{}", serde_json::to_string_pretty(&snapshot).unwrap_or_default());
                        continue;
                    }
                    _ => {}
                }

                match runtime
                    .handle(InteractionEnvelope::text(text, CLI_USER, CLI_SESSION))
                    .await
                {
                    Ok(outcome) => println!("{}", outcome.response),
                    Err(e) if e.is_fatal() => {
                        tracing::error!(error = %e, "fatal error, shutting down");
                        fatal.store(true, Ordering::SeqCst);
                        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
                        break;
                    }
                    Err(e) => println!("Error: {e}"),
                }
            }
        }
    };

    run_with_graceful_shutdown(shutdown.clone(), app, move || async move {
        shutdown.shutdown(ShutdownReason::UserInitiated);
        if let Err(e) = runtime.close() {
            tracing::warn!(error = %e, "audit flush failed during shutdown");
        }
        let _ = checker.await;
    })
    .await;

    if fatal.load(Ordering::SeqCst) {
        anyhow::bail!("aborted: audit log could not be written");
    }
    Ok(())
}
