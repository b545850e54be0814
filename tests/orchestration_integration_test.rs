//! 编排集成测试：通过脚本化协作方驱动完整运行

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use maestro::agents::{
    AgentDispatcher, AgentResponse, DigestSynthesizer, Dispatch, EchoAgent, ScriptedAgent, ScriptedReply,
    StaticPlanner,
};
use maestro::config::AppConfig;
use maestro::core::{
    Collaborators, OrchestrationLoop, OrchestratorError, OrchestratorEvent, RunOutcome, RunPhase,
    RunStatePersistence, SessionSupervisor, TransportError,
};
use maestro::execution::{
    ActionType, AgentAction, AgentAllocator, CompletionClassifier, CompletionKind, InstructionBuilder, Severity,
    StepStatus,
};
use maestro::plan::{AgentRole, Plan, Step};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

const BOILERPLATE: &str = "I understand you need help, could you clarify?";

fn fast_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.transport.initial_backoff_ms = 1;
    cfg.transport.max_backoff_ms = 2;
    cfg
}

/// 标题避开边界档位关键词，走默认的 5 个动作 / 300 秒
fn two_step_plan() -> Plan {
    Plan::new(
        "介绍 360 度全景相机",
        vec![
            Step::new("Collect camera specs", "Look up the vendor catalogue").with_agent(AgentRole::WebSurfer),
            Step::new("Summarize the notes", "Two short paragraphs").with_agent(AgentRole::Coder),
        ],
    )
}

fn collaborators(agent: Arc<dyn AgentDispatcher>, planner: Arc<StaticPlanner>) -> Collaborators {
    Collaborators {
        agents: agent,
        planner,
        synthesizer: Arc::new(DigestSynthesizer),
    }
}

fn drain(rx: &mut UnboundedReceiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}

/// 在指定步骤上触发取消或重新规划，其余时候报告完成
enum Interrupt {
    Cancel,
    Replan(&'static str),
}

struct InterruptingAgent {
    supervisor: SessionSupervisor,
    at_step: usize,
    interrupt: Interrupt,
    fired: AtomicBool,
}

#[async_trait]
impl AgentDispatcher for InterruptingAgent {
    async fn dispatch(&self, request: &Dispatch) -> Result<AgentResponse, TransportError> {
        if request.step_index == self.at_step && !self.fired.swap(true, Ordering::SeqCst) {
            match self.interrupt {
                Interrupt::Cancel => self.supervisor.cancel(),
                Interrupt::Replan(reason) => self.supervisor.request_replan(reason).await,
            }
            return Ok(AgentResponse::text(request.step_index, BOILERPLATE));
        }
        Ok(AgentResponse::text(
            request.step_index,
            format!("{}：found product specs", InstructionBuilder::completion_phrase(request.role)),
        ))
    }
}

#[tokio::test]
async fn test_explicit_signal_advances_step() {
    let agent = Arc::new(ScriptedAgent::new().script(
        AgentRole::WebSurfer,
        [ScriptedReply::text("✅ 当前步骤已完成: found product specs")],
    ));
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let (tx, mut rx) = unbounded_channel();
    let mut lp = OrchestrationLoop::new("介绍 360 度全景相机", fast_config()).with_events(tx);

    let outcome = lp.run(&collaborators(agent.clone(), planner)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let first = lp.tracker().get(0).unwrap();
    assert_eq!(first.status, StepStatus::Completed);
    assert_eq!(first.attempt_count, 1);
    assert_eq!(first.completion_kind, Some(CompletionKind::Normal));

    let strategies: Vec<Option<String>> = drain(&mut rx)
        .into_iter()
        .filter_map(|ev| match ev {
            OrchestratorEvent::StepCompleted { step: 1, strategy, .. } => Some(strategy),
            _ => None,
        })
        .collect();
    assert_eq!(strategies, vec![Some("explicit_signal".to_string())]);
}

#[test]
fn test_assistant_boilerplate_is_never_complete() {
    let classifier = CompletionClassifier::default();
    for attempts in [1, 5, 9] {
        let verdict = classifier.classify(AgentRole::WebSurfer, BOILERPLATE, "Collect camera specs", attempts);
        assert!(!verdict.is_complete, "attempt {attempts}");
        assert_eq!(verdict.strategy.as_str(), "definite_incomplete");
    }
}

#[tokio::test]
async fn test_tenth_attempt_forces_completion() {
    let agent = Arc::new(ScriptedAgent::new().script(
        AgentRole::WebSurfer,
        (0..11).map(|_| ScriptedReply::text(BOILERPLATE)),
    ));
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let mut lp = OrchestrationLoop::new("t", fast_config());

    let outcome = lp.run(&collaborators(agent.clone(), planner)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let first = lp.tracker().get(0).unwrap();
    assert_eq!(first.attempt_count, 10);
    assert_eq!(first.completion_kind, Some(CompletionKind::Forced));
    assert_eq!(agent.remaining(AgentRole::WebSurfer), 1);
}

#[test]
fn test_allocator_scenarios() {
    let allocator = AgentAllocator::new();
    assert_eq!(
        allocator.allocate("创建360度全景相机的产品图像", "生成相机图像"),
        AgentRole::ImageGenerator
    );
    assert_eq!(allocator.allocate("编写产品介绍", "创建产品文档"), AgentRole::Coder);
}

#[tokio::test]
async fn test_repeated_click_is_blocked_then_forced() {
    let click = || {
        ScriptedReply::Response(
            AgentResponse::text(0, BOILERPLATE).with_actions(vec![AgentAction::new(ActionType::Click, "了解更多")]),
        )
    };
    let agent = Arc::new(ScriptedAgent::new().script(AgentRole::WebSurfer, (0..5).map(|_| click())));
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let (tx, mut rx) = unbounded_channel();
    let mut lp = OrchestrationLoop::new("t", fast_config()).with_events(tx);

    lp.run(&collaborators(agent.clone(), planner)).await.unwrap();

    let events = drain(&mut rx);
    let severities: Vec<Severity> = events
        .iter()
        .filter_map(|ev| match ev {
            OrchestratorEvent::LoopSignal { step: 1, severity, .. } => Some(*severity),
            _ => None,
        })
        .collect();
    assert_eq!(
        severities,
        vec![Severity::Warn, Severity::Block, Severity::Block, Severity::ForceComplete]
    );
    assert_eq!(lp.tracker().get(0).unwrap().completion_kind, Some(CompletionKind::Boundary));
    assert_eq!(agent.remaining(AgentRole::WebSurfer), 0);

    // 被阻断后的跟进指令要求换一种方法
    let calls = agent.calls();
    assert!(calls[3].instruction.contains("换一种方法"));
}

#[tokio::test]
async fn test_stale_response_is_discarded() {
    let agent = Arc::new(ScriptedAgent::new().script(
        AgentRole::WebSurfer,
        [
            ScriptedReply::Tagged {
                step_index: 5,
                text: "✅ 当前步骤已完成".into(),
            },
            ScriptedReply::text("✅ 当前步骤已完成: specs found"),
        ],
    ));
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let (tx, mut rx) = unbounded_channel();
    let mut lp = OrchestrationLoop::new("t", fast_config()).with_events(tx);

    lp.run(&collaborators(agent, planner)).await.unwrap();

    assert_eq!(lp.tracker().get(0).unwrap().attempt_count, 1);
    let events = drain(&mut rx);
    let discarded = events
        .iter()
        .filter(|ev| matches!(ev, OrchestratorEvent::ResponseDiscarded { tagged_step: 6, current_step: 1 }))
        .count();
    assert_eq!(discarded, 1);

    // 过期回复之后同一条指令被重发一次，并在事件里标明
    let step_one: Vec<(u32, bool)> = events
        .iter()
        .filter_map(|ev| match ev {
            OrchestratorEvent::Dispatched {
                step: 1, attempt, resend, ..
            } => Some((*attempt, *resend)),
            _ => None,
        })
        .collect();
    assert_eq!(step_one, vec![(1, false), (1, true)]);
}

#[tokio::test]
async fn test_stale_budget_counts_an_empty_reply() {
    let stale = || ScriptedReply::Tagged {
        step_index: 3,
        text: "late".into(),
    };
    let agent = Arc::new(ScriptedAgent::new().script(AgentRole::WebSurfer, [stale(), stale(), stale()]));
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let mut lp = OrchestrationLoop::new("t", fast_config());

    lp.run(&collaborators(agent, planner)).await.unwrap();

    // 第三条过期回复后按空回复计一次，随后脚本用完，默认回复完成
    assert_eq!(lp.tracker().get(0).unwrap().attempt_count, 2);
    assert_eq!(lp.tracker().status(0), StepStatus::Completed);
}

#[tokio::test]
async fn test_external_replan_keeps_completed_prefix() {
    let supervisor = SessionSupervisor::new();
    let agent = Arc::new(InterruptingAgent {
        supervisor: supervisor.clone(),
        at_step: 1,
        interrupt: Interrupt::Replan("user wants a markdown report"),
        fired: AtomicBool::new(false),
    });
    let revised = Plan::new(
        "t",
        vec![Step::new("Write markdown report", "Use the collected specs").with_agent(AgentRole::Coder)],
    );
    let planner = Arc::new(StaticPlanner::new(two_step_plan()).then(revised));
    let mut lp = OrchestrationLoop::new("t", fast_config()).with_supervisor(supervisor);

    let outcome = lp.run(&collaborators(agent, planner.clone())).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(lp.replan_count(), 1);

    let titles: Vec<String> = lp.plan().unwrap().steps.iter().map(|s| s.title.clone()).collect();
    assert_eq!(titles, vec!["Collect camera specs", "Write markdown report"]);

    let calls = planner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].is_empty());
    assert_eq!(calls[1].len(), 1);
    assert_eq!(calls[1][0].title, "Collect camera specs");

    let second = lp.tracker().get(1).unwrap();
    assert_eq!(second.title, "Write markdown report");
    assert_eq!(second.attempt_count, 1);
    assert_eq!(second.status, StepStatus::Completed);
}

#[tokio::test]
async fn test_replan_limit_ends_with_best_effort() {
    let mut cfg = fast_config();
    cfg.orchestrator.max_replans = 1;
    cfg.orchestrator.replan_after_forced_steps = 1;
    cfg.orchestrator.max_attempts_per_step = 2;
    let plan = Plan::new(
        "t",
        vec![
            Step::new("Collect camera specs", "").with_agent(AgentRole::WebSurfer),
            Step::new("Collect camera prices", "").with_agent(AgentRole::WebSurfer),
            Step::new("Collect camera reviews", "").with_agent(AgentRole::WebSurfer),
        ],
    );
    let agent = Arc::new(ScriptedAgent::new().script(
        AgentRole::WebSurfer,
        (0..20).map(|_| ScriptedReply::text(BOILERPLATE)),
    ));
    let planner = Arc::new(StaticPlanner::new(plan));
    let mut lp = OrchestrationLoop::new("t", cfg);

    let outcome = lp.run(&collaborators(agent, planner)).await.unwrap();
    match &outcome {
        RunOutcome::BestEffort { reason, .. } => assert!(reason.contains("replan limit")),
        other => panic!("expected best effort, got {other:?}"),
    }
    assert_eq!(lp.phase(), RunPhase::Finalized);
    assert_eq!(lp.replan_count(), 1);
    assert_eq!(lp.tracker().status(1), StepStatus::Completed);
    assert_eq!(lp.tracker().status(2), StepStatus::Skipped);
}

#[tokio::test]
async fn test_forced_last_step_finalizes_without_replan() {
    let mut cfg = fast_config();
    cfg.orchestrator.max_attempts_per_step = 2;
    cfg.orchestrator.replan_after_forced_steps = 1;
    let plan = Plan::new(
        "t",
        vec![Step::new("Summarize the notes", "").with_agent(AgentRole::Coder)],
    );
    let agent = Arc::new(ScriptedAgent::new().script(
        AgentRole::Coder,
        [ScriptedReply::text(BOILERPLATE), ScriptedReply::text(BOILERPLATE)],
    ));
    let planner = Arc::new(StaticPlanner::new(plan));
    let mut lp = OrchestrationLoop::new("t", cfg);

    let outcome = lp.run(&collaborators(agent, planner.clone())).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(lp.tracker().get(0).unwrap().completion_kind, Some(CompletionKind::Forced));
    assert_eq!(planner.calls().len(), 1);
    assert_eq!(lp.plan().unwrap().len(), 1);
    assert_eq!(lp.replan_count(), 0);
}

#[tokio::test]
async fn test_external_replan_after_last_step_is_ignored() {
    let supervisor = SessionSupervisor::new();
    let agent = Arc::new(ScriptedAgent::new());
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let mut lp = OrchestrationLoop::new("t", fast_config()).with_supervisor(supervisor.clone());
    let collab = collaborators(agent, planner.clone());

    // 先同步推进到计划末尾，再提出重新规划
    lp.accept_plan(two_step_plan());
    for step in 0..2 {
        lp.begin_current_step(chrono::Utc::now()).unwrap();
        lp.ingest_response(&AgentResponse::text(step, "✅ step completed"), chrono::Utc::now());
    }
    assert!(lp.plan_finished());
    supervisor.request_replan("too late").await;

    let outcome = lp.run(&collab).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert!(planner.calls().is_empty());
    assert_eq!(lp.replan_count(), 0);
}

#[tokio::test]
async fn test_transport_failures_retry_then_succeed() {
    let agent = Arc::new(ScriptedAgent::new().script(
        AgentRole::WebSurfer,
        [
            ScriptedReply::Fail(TransportError::Timeout),
            ScriptedReply::Fail(TransportError::Connection("reset".into())),
            ScriptedReply::text("✅ 当前步骤已完成"),
        ],
    ));
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let (tx, mut rx) = unbounded_channel();
    let mut lp = OrchestrationLoop::new("t", fast_config()).with_events(tx);

    let outcome = lp.run(&collaborators(agent.clone(), planner)).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    let web_calls: Vec<Dispatch> = agent
        .calls()
        .into_iter()
        .filter(|d| d.role == AgentRole::WebSurfer)
        .collect();
    assert_eq!(web_calls.len(), 3);
    assert!(web_calls.iter().all(|d| d.instruction.starts_with("步骤 1/2")));

    let recoveries = drain(&mut rx)
        .into_iter()
        .filter(|ev| matches!(ev, OrchestratorEvent::TransportRecovery { .. }))
        .count();
    assert_eq!(recoveries, 2);
}

#[tokio::test]
async fn test_rejected_request_degrades_immediately() {
    let agent = Arc::new(ScriptedAgent::new().script(
        AgentRole::WebSurfer,
        [
            ScriptedReply::Fail(TransportError::Rejected("schema".into())),
            ScriptedReply::text("✅ 当前步骤已完成"),
        ],
    ));
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let mut lp = OrchestrationLoop::new("t", fast_config());

    lp.run(&collaborators(agent.clone(), planner)).await.unwrap();

    let calls = agent.calls();
    assert_eq!(calls[1].instruction, "第 1 步：Collect camera specs。Look up the vendor catalogue");
}

#[tokio::test]
async fn test_exhausted_transport_pauses_and_resumes_from_snapshot() {
    let mut cfg = fast_config();
    cfg.transport.max_retries = 0;
    let agent = Arc::new(ScriptedAgent::new().script(
        AgentRole::WebSurfer,
        [
            ScriptedReply::Fail(TransportError::Connection("refused".into())),
            ScriptedReply::Fail(TransportError::Connection("refused".into())),
        ],
    ));
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let collab = collaborators(agent, planner);
    let mut lp = OrchestrationLoop::new("t", cfg.clone());

    let err = lp.run(&collab).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::AgentUnavailable {
            role: AgentRole::WebSurfer,
            step: 1,
            ..
        }
    ));
    assert!(err.user_message().contains("运行已暂停"));
    assert_eq!(lp.phase(), RunPhase::Paused);

    let dir = tempfile::tempdir().unwrap();
    let store = RunStatePersistence::for_run(dir.path(), lp.run_id());
    store.save(&lp.snapshot()).unwrap();
    let snapshot = store.load().unwrap().unwrap();
    assert_eq!(snapshot.phase, RunPhase::Paused);
    assert_eq!(snapshot.current_step_idx, 0);

    let mut resumed = OrchestrationLoop::restore(snapshot, cfg);
    assert_eq!(resumed.run_id(), lp.run_id());
    let outcome = resumed.run(&collab).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));
    assert_eq!(resumed.phase(), RunPhase::Finalized);
    assert_eq!(resumed.current_step_idx(), 2);
}

#[tokio::test]
async fn test_cancellation_returns_partial_answer() {
    let supervisor = SessionSupervisor::new();
    let agent = Arc::new(InterruptingAgent {
        supervisor: supervisor.clone(),
        at_step: 1,
        interrupt: Interrupt::Cancel,
        fired: AtomicBool::new(false),
    });
    let planner = Arc::new(StaticPlanner::new(two_step_plan()));
    let mut lp = OrchestrationLoop::new("介绍相机", fast_config()).with_supervisor(supervisor);

    let outcome = lp.run(&collaborators(agent, planner)).await.unwrap();
    let RunOutcome::Cancelled { partial_answer } = outcome else {
        panic!("expected cancellation");
    };
    assert!(partial_answer.contains("完成了 1/2"));
    assert!(partial_answer.contains("Collect camera specs"));
    assert_eq!(lp.phase(), RunPhase::Cancelled);
    // 取消不破坏步骤状态
    assert_eq!(lp.tracker().status(0), StepStatus::Completed);
    assert_eq!(lp.tracker().status(1), StepStatus::InProgress);
    assert_eq!(lp.tracker().get(1).unwrap().attempt_count, 0);
}

#[tokio::test]
async fn test_empty_plan_finalizes_immediately() {
    let agent = Arc::new(ScriptedAgent::new());
    let planner = Arc::new(StaticPlanner::new(Plan::new("t", Vec::new())));
    let mut lp = OrchestrationLoop::new("t", fast_config());

    let outcome = lp.run(&collaborators(agent.clone(), planner)).await.unwrap();
    assert!(outcome.answer().contains("没有收集到证据"));
    assert!(agent.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_agent_name_is_reallocated() {
    let mut step = Step::new("生成相机图像", "创建360度全景相机的产品图像");
    step.agent_name = "mystery_agent".into();
    let agent = Arc::new(ScriptedAgent::new());
    let planner = Arc::new(StaticPlanner::new(Plan::new("t", vec![step])));
    let mut lp = OrchestrationLoop::new("t", fast_config());

    lp.run(&collaborators(agent.clone(), planner)).await.unwrap();

    assert_eq!(agent.calls()[0].role, AgentRole::ImageGenerator);
    assert!(lp.context().flag("image_generated"));
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let plan_for = |title: &str| Plan::new(title, vec![Step::new(title, "").with_agent(AgentRole::WebSurfer)]);
    let echo: Arc<dyn AgentDispatcher> = Arc::new(EchoAgent);
    let collab_a = collaborators(echo.clone(), Arc::new(StaticPlanner::new(plan_for("Alpha specs"))));
    let collab_b = collaborators(echo, Arc::new(StaticPlanner::new(plan_for("Beta prices"))));
    let mut run_a = OrchestrationLoop::new("alpha", fast_config());
    let mut run_b = OrchestrationLoop::new("beta", fast_config());

    let (a, b) = tokio::join!(run_a.run(&collab_a), run_b.run(&collab_b));
    assert!(a.unwrap().answer().contains("Alpha specs"));
    assert!(b.unwrap().answer().contains("Beta prices"));
    assert_ne!(run_a.run_id(), run_b.run_id());

    let text_a = run_a.context().get("web_surfer_step_1_text").unwrap().to_string();
    assert!(text_a.contains("Alpha"));
    assert!(!text_a.contains("Beta"));
}
