//! Helios 命令行入口
//!
//! 用法：`helios [--config PATH] [--session PATH] [goal...]`。未给出 goal 时逐行读取 stdin，每行一次运行。
//! Ctrl-C 取消当前运行；设置 session 路径时运行前恢复、运行后保存对话。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use helios::config::load_config;
use helios::core::{AgentBuilder, AgentRuntime, SessionSupervisor};
use helios::react::ReactEvent;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Helios - ReAct agent with tool orchestration and bounded conversation memory
#[derive(Parser, Debug)]
#[command(name = "helios")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (TOML), layered over config/default
    #[arg(long, env = "HELIOS_CONFIG")]
    config: Option<PathBuf>,

    /// Session snapshot restored before and saved after each run
    #[arg(long, env = "HELIOS_SESSION")]
    session: Option<PathBuf>,

    /// Goal for a single run; read goals line by line from stdin when omitted
    goal: Vec<String>,
}

impl Cli {
    fn goal(&self) -> Option<String> {
        (!self.goal.is_empty()).then(|| self.goal.join(" "))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    helios::observability::init();

    let cli = Cli::parse();
    let goal = cli.goal();
    let config = load_config(cli.config).context("Failed to load config")?;
    let session = cli.session.or_else(|| config.app.session_path.clone());

    let runtime = AgentBuilder::new(config)
        .with_system_prompt_from_file()
        .build()
        .context("Failed to build agent")?;

    let supervisor = Arc::new(SessionSupervisor::new());
    {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if !supervisor.cancel_current() {
                    supervisor.shutdown();
                    break;
                }
                tracing::warn!("run cancelled by user");
            }
        });
    }

    match goal {
        Some(goal) => run_once(&runtime, &supervisor, session.as_ref(), &goal).await?,
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if supervisor.is_shut_down() {
                    break;
                }
                let goal = line.trim();
                if goal.is_empty() {
                    continue;
                }
                run_once(&runtime, &supervisor, session.as_ref(), goal).await?;
            }
        }
    }
    Ok(())
}

/// 等待事件打印任务；任务失败只记日志，不影响本次运行的结果
async fn finish_printer(printer: tokio::task::JoinHandle<()>) {
    if let Err(e) = printer.await {
        tracing::warn!(error = %e, "event printer task failed");
    }
}

async fn run_once(
    runtime: &AgentRuntime,
    supervisor: &SessionSupervisor,
    session: Option<&PathBuf>,
    goal: &str,
) -> anyhow::Result<()> {
    let memory = match session {
        Some(path) => runtime
            .load_memory(path)
            .await
            .context("Failed to restore session")?,
        None => runtime.new_memory(),
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                ReactEvent::Thought { text } => eprintln!("Thought: {text}"),
                ReactEvent::ActionRequested { tool, args, .. } => eprintln!("Action: {tool} {args}"),
                ReactEvent::Observation { tool, preview, .. } => eprintln!("Observation [{tool}]: {preview}"),
                _ => {}
            }
        }
    });

    let report = runtime
        .controller(memory)
        .with_cancel_token(supervisor.begin_run())
        .with_event_tx(tx)
        .run(goal)
        .await;
    finish_printer(printer).await;

    if let Some(path) = session {
        report.memory.save(path).context("Failed to save session")?;
    }

    match report.outcome.answer() {
        Some(answer) => println!("{answer}"),
        None => println!("{}", serde_json::to_string(&report.outcome)?),
    }
    Ok(())
}
