//! Maestro 演示入口
//!
//! 用法：`maestro "<task>" [plan.json]`
//! 用回显智能体跑完整个计划，打印最终答案，并把运行快照写到 `runs/<run-id>.json`。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use maestro::{
    agents::{DigestSynthesizer, EchoAgent, StaticPlanner},
    config::load_config,
    core::{Collaborators, OrchestrationLoop, RunStatePersistence},
    observability,
    plan::{Plan, Step},
};

/// 未提供计划文件时使用的演示计划（不指定角色，交给分配器）
fn demo_plan(task: &str) -> Plan {
    Plan::new(
        task,
        vec![
            Step::new("浏览相关网站收集资料", format!("搜索与「{task}」相关的网站，记录关键参数")),
            Step::new("生成产品图像", "根据收集到的资料生成一张产品图片"),
            Step::new("编写 markdown 介绍文档", "整理资料与图像，输出 markdown 文档"),
        ],
    )
}

fn read_plan(path: &PathBuf) -> anyhow::Result<Plan> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read plan {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid plan json {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let mut args = std::env::args().skip(1);
    let task = args
        .next()
        .context("usage: maestro \"<task>\" [plan.json]")?;
    let plan = match args.next() {
        Some(path) => read_plan(&PathBuf::from(path))?,
        None => demo_plan(&task),
    };

    let cfg = load_config(None).context("Failed to load config")?;

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            if let Ok(line) = serde_json::to_string(&ev) {
                tracing::debug!(event = %line, "orchestrator event");
            }
        }
    });

    let collab = Collaborators {
        agents: Arc::new(EchoAgent),
        planner: Arc::new(StaticPlanner::new(plan)),
        synthesizer: Arc::new(DigestSynthesizer),
    };
    let mut run = OrchestrationLoop::new(task, cfg).with_events(event_tx);

    let result = run.run(&collab).await;
    let store = RunStatePersistence::for_run("runs", run.run_id());
    store.save(&run.snapshot()).context("Failed to save run snapshot")?;
    drop(run);
    let _ = printer.await;

    match result {
        Ok(outcome) => {
            println!("{}", outcome.answer());
            println!("\n(snapshot: {})", store.path().display());
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.user_message());
            Err(e).context("Run paused")
        }
    }
}
