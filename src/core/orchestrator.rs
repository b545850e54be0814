//! 主控循环：驱动计划逐步执行
//!
//! 分两层：
//! - 同步核心（`accept_plan` / `begin_current_step` / `ingest_response` / `apply_replan`）：
//!   只做决策与状态迁移，不做 I/O，可直接单测；
//! - 异步外壳（`run`）：只在两个真正的 I/O 边界上等待（智能体派发、规划器 / 答案合成），
//!   每个挂起点之后检查取消与重新规划请求，传输失败走 RecoveryEngine。
//!
//! 每个运行独占一个实例，不与其它运行共享可变状态。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::agents::{AgentDispatcher, AgentResponse, AnswerSynthesizer, Dispatch, PlanProvider};
use crate::config::AppConfig;
use crate::core::events::OrchestratorEvent;
use crate::core::state::{RunOutcome, RunPhase, RunSnapshot};
use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine, SessionSupervisor, TransportError};
use crate::execution::loop_guard::extract_actions;
use crate::execution::{
    excerpt, AgentAllocator, CompletionClassifier, CompletionKind, CompletionStrategy, FollowUp, GlobalContext,
    GuardDecision, InstructionBuilder, LoopGuard, Severity, StepExecutionTracker, StepStatus,
};
use crate::plan::{AgentRole, Plan, Step};

/// 外部协作方
#[derive(Clone)]
pub struct Collaborators {
    pub agents: Arc<dyn AgentDispatcher>,
    pub planner: Arc<dyn PlanProvider>,
    pub synthesizer: Arc<dyn AnswerSynthesizer>,
}

/// 同步核心对一条回复的裁决
#[derive(Debug, Clone, PartialEq)]
pub enum StepDecision {
    /// 回复被丢弃，状态未变
    Discarded { reason: String },
    /// 留在当前步骤，带着新指令重新派发
    Retry(Dispatch),
    /// 当前步骤完成，进入下一步
    Advanced {
        completed_step: usize,
        kind: CompletionKind,
        strategy: Option<CompletionStrategy>,
    },
    /// 最后一个步骤完成，可以汇总
    PlanComplete {
        completed_step: usize,
        kind: CompletionKind,
        strategy: Option<CompletionStrategy>,
    },
}

/// 单步驱动结束后外壳的去向
enum StepFlow {
    Next,
    Replan(String),
    Cancelled,
}

/// 一个任务运行的编排循环
pub struct OrchestrationLoop {
    run_id: String,
    task: String,
    config: AppConfig,
    phase: RunPhase,
    plan: Option<Plan>,
    current_step_idx: usize,
    replan_count: u32,
    /// 连续被强制完成的步骤数
    forced_streak: u32,
    /// 重新规划后当前索引上的步骤需要重新开始
    restart_current: bool,
    final_answer: Option<String>,
    tracker: StepExecutionTracker,
    classifier: CompletionClassifier,
    allocator: AgentAllocator,
    loop_guard: LoopGuard,
    context: GlobalContext,
    recovery: RecoveryEngine,
    supervisor: SessionSupervisor,
    event_tx: Option<UnboundedSender<OrchestratorEvent>>,
}

impl OrchestrationLoop {
    pub fn new(task: impl Into<String>, config: AppConfig) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            task: task.into(),
            phase: RunPhase::Planning,
            plan: None,
            current_step_idx: 0,
            replan_count: 0,
            forced_streak: 0,
            restart_current: false,
            final_answer: None,
            tracker: StepExecutionTracker::new(config.boundaries.clone()),
            classifier: CompletionClassifier::new(config.classifier.clone()),
            allocator: AgentAllocator::new(),
            loop_guard: LoopGuard::new(config.loop_guard.clone(), &config.boundaries),
            context: GlobalContext::new(),
            recovery: RecoveryEngine::new(config.transport.clone()),
            supervisor: SessionSupervisor::new(),
            event_tx: None,
            config,
        }
    }

    /// 从快照恢复；暂停中的运行可直接再次 `run`
    pub fn restore(snapshot: RunSnapshot, config: AppConfig) -> Self {
        let mut this = Self::new(snapshot.task, config);
        this.run_id = snapshot.run_id;
        this.phase = snapshot.phase;
        this.plan = snapshot.plan;
        this.current_step_idx = snapshot.current_step_idx;
        this.replan_count = snapshot.replan_count;
        this.forced_streak = snapshot.forced_streak;
        this.final_answer = snapshot.final_answer;
        this.tracker = StepExecutionTracker::restore(this.config.boundaries.clone(), snapshot.steps);
        this.loop_guard.restore(snapshot.loop_guard);
        this.context = snapshot.context;
        this
    }

    pub fn with_allocator(mut self, allocator: AgentAllocator) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SessionSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<OrchestratorEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn current_step_idx(&self) -> usize {
        self.current_step_idx
    }

    pub fn replan_count(&self) -> u32 {
        self.replan_count
    }

    pub fn tracker(&self) -> &StepExecutionTracker {
        &self.tracker
    }

    pub fn context(&self) -> &GlobalContext {
        &self.context
    }

    pub fn loop_guard(&self) -> &LoopGuard {
        &self.loop_guard
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    /// 外部持有的监管句柄（取消 / 重新规划）
    pub fn supervisor(&self) -> SessionSupervisor {
        self.supervisor.clone()
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id.clone(),
            task: self.task.clone(),
            phase: self.phase,
            plan: self.plan.clone(),
            current_step_idx: self.current_step_idx,
            replan_count: self.replan_count,
            forced_streak: self.forced_streak,
            steps: self.tracker.states().clone(),
            context: self.context.clone(),
            loop_guard: self.loop_guard.state().clone(),
            final_answer: self.final_answer.clone(),
            saved_at: Utc::now(),
        }
    }

    fn emit(&self, ev: OrchestratorEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn plan_len(&self) -> usize {
        self.plan.as_ref().map(Plan::len).unwrap_or(0)
    }

    /// 步骤角色：已分配且可识别则直接用，否则交给分配器
    fn resolve_role(&self, step: &Step) -> AgentRole {
        if let Some(role) = step.assigned_role() {
            return role;
        }
        self.allocator.allocate(&step.details, &step.title)
    }

    // ---------------------------------------------------------------------
    // 同步核心
    // ---------------------------------------------------------------------

    /// 接受计划，进入执行阶段；新任务的上下文与防循环状态清空
    pub fn accept_plan(&mut self, plan: Plan) {
        info!(run = %self.run_id, steps = plan.len(), "plan accepted");
        self.emit(OrchestratorEvent::PlanAccepted { steps: plan.len() });
        self.plan = Some(plan);
        self.current_step_idx = 0;
        self.context.clear();
        self.loop_guard.reset();
        self.phase = RunPhase::Executing;
    }

    /// 准备当前步骤的派发；计划已走完时返回 None
    pub fn begin_current_step(&mut self, now: DateTime<Utc>) -> Option<Dispatch> {
        loop {
            let idx = self.current_step_idx;
            let step = self.plan.as_ref()?.step(idx)?.clone();
            let role = self.resolve_role(&step);

            if step.assigned_role().is_none() {
                let (_, rule) = self.allocator.allocate_with_rule(&step.details, &step.title);
                if !step.agent_name.trim().is_empty() {
                    warn!(step = idx + 1, agent = %step.agent_name, "unknown agent name, reallocating");
                }
                debug!(step = idx + 1, agent = %role, rule, "agent allocated");
            }

            self.tracker.initialize(idx, role.as_str(), &step.title);
            let status = self.tracker.status(idx);
            if status.is_terminal() {
                // 快照恢复时可能停在已结束的步骤上
                self.current_step_idx += 1;
                continue;
            }

            if status == StepStatus::NotStarted || self.restart_current {
                if self.restart_current {
                    self.tracker.reassign(idx, role.as_str(), &step.title);
                    self.restart_current = false;
                }
                self.tracker.mark_in_progress(idx, now);
                let boundaries = self.tracker.get(idx)?.boundaries.clone();
                self.loop_guard
                    .begin_step(idx, boundaries.max_actions, boundaries.time_limit_secs, now);
                info!(
                    step = idx + 1,
                    total = self.plan_len(),
                    agent = %role,
                    title = %step.title,
                    "step started"
                );
                self.emit(OrchestratorEvent::StepStarted {
                    step: idx + 1,
                    title: step.title.clone(),
                    agent: role,
                });
            }

            let state = self.tracker.get(idx)?;
            let total = self.plan_len();
            let instruction = if state.attempt_count == 0 {
                InstructionBuilder::initial(
                    &step,
                    idx,
                    total,
                    role,
                    state,
                    &self.context,
                    &self.loop_guard.recent_targets(5),
                )
            } else {
                InstructionBuilder::follow_up(&step, idx, total, role, state, &self.context, &FollowUp::Continue)
            };
            return Some(Dispatch {
                step_index: idx,
                role,
                instruction,
                attempt: state.attempt_count + 1,
            });
        }
    }

    /// 处理一条回复：过期拒绝 → 记一次尝试 → 防循环 / 边界 → 尝试上限 → 分类器
    pub fn ingest_response(&mut self, response: &AgentResponse, now: DateTime<Utc>) -> StepDecision {
        let idx = self.current_step_idx;
        if self.phase != RunPhase::Executing {
            return StepDecision::Discarded {
                reason: format!("run is {:?}", self.phase),
            };
        }
        if response.tagged_step_index != idx {
            warn!(
                tagged = response.tagged_step_index + 1,
                current = idx + 1,
                "discarding response tagged to another step"
            );
            self.emit(OrchestratorEvent::ResponseDiscarded {
                tagged_step: response.tagged_step_index + 1,
                current_step: idx + 1,
            });
            return StepDecision::Discarded {
                reason: format!(
                    "response tagged to step {} while step {} is current",
                    response.tagged_step_index + 1,
                    idx + 1
                ),
            };
        }
        let Some(step) = self.plan.as_ref().and_then(|p| p.step(idx)).cloned() else {
            return StepDecision::Discarded {
                reason: "no current step".to_string(),
            };
        };
        if self.tracker.status(idx) != StepStatus::InProgress {
            warn!(step = idx + 1, "response for a step that is not in progress");
            return StepDecision::Discarded {
                reason: "step is not in progress".to_string(),
            };
        }

        let role = self.resolve_role(&step);
        let attempts = self.tracker.record_attempt(idx, &response.text);

        let actions = if response.actions.is_empty() {
            extract_actions(&response.text)
        } else {
            response.actions.clone()
        };
        let mut worst = GuardDecision::none();
        for action in &actions {
            let decision = self.loop_guard.should_block(idx, action.action_type, &action.target, now);
            if decision.severity > Severity::None {
                debug!(step = idx + 1, severity = decision.severity.as_str(), reason = %decision.reason, "loop guard");
                self.emit(OrchestratorEvent::LoopSignal {
                    step: idx + 1,
                    severity: decision.severity,
                    reason: decision.reason.clone(),
                });
            }
            if decision.severity > worst.severity {
                worst = decision;
            }
        }
        if self.loop_guard.note_repetitive_text(idx, &response.text) {
            debug!(step = idx + 1, "repetitive response text");
        }
        let violations = self.tracker.boundary_violations(
            idx,
            self.loop_guard.actions_in_step(idx),
            self.loop_guard.repetition_signals(idx),
            now,
        );

        if attempts >= self.config.orchestrator.max_attempts_per_step {
            warn!(step = idx + 1, attempts, "attempt ceiling reached, forcing completion");
            return self.complete_current(response, role, CompletionKind::Forced, None, now);
        }
        if worst.severity == Severity::ForceComplete || violations.should_force_complete {
            let (kind, reason) = if violations.should_force_complete {
                (violations.completion_kind(), violations.describe())
            } else {
                (CompletionKind::Boundary, worst.reason.clone())
            };
            warn!(step = idx + 1, reason = %reason, "boundary reached, forcing completion");
            return self.complete_current(response, role, kind, None, now);
        }

        let classification = self.classifier.classify(role, &response.text, &step.title, attempts);
        debug!(
            step = idx + 1,
            attempt = attempts,
            strategy = classification.strategy.as_str(),
            confidence = classification.confidence,
            complete = classification.is_complete,
            "classified response"
        );
        if classification.is_complete {
            return self.complete_current(
                response,
                role,
                CompletionKind::Normal,
                Some(classification.strategy),
                now,
            );
        }

        let variant = match worst.severity {
            Severity::Block => FollowUp::DifferentApproach(worst.reason),
            Severity::Warn => FollowUp::WrapUp(worst.reason),
            _ => FollowUp::Continue,
        };
        let total = self.plan_len();
        let instruction = match self.tracker.get(idx) {
            Some(state) => InstructionBuilder::follow_up(&step, idx, total, role, state, &self.context, &variant),
            None => InstructionBuilder::simplified(&step, idx),
        };
        StepDecision::Retry(Dispatch {
            step_index: idx,
            role,
            instruction,
            attempt: attempts + 1,
        })
    }

    fn complete_current(
        &mut self,
        response: &AgentResponse,
        role: AgentRole,
        kind: CompletionKind,
        strategy: Option<CompletionStrategy>,
        now: DateTime<Utc>,
    ) -> StepDecision {
        let idx = self.current_step_idx;
        if !self.tracker.mark_completed(idx, &response.text, kind, now) {
            return StepDecision::Discarded {
                reason: "step already completed".to_string(),
            };
        }
        self.context.absorb(role, idx, response);
        self.forced_streak = if kind == CompletionKind::Normal {
            0
        } else {
            self.forced_streak + 1
        };
        let quality_score = self.tracker.get(idx).map(|s| s.quality_score).unwrap_or(0.0);
        self.emit(OrchestratorEvent::StepCompleted {
            step: idx + 1,
            kind,
            quality_score,
            strategy: strategy.map(|s| s.as_str().to_string()),
        });

        self.current_step_idx += 1;
        if self.current_step_idx >= self.plan_len() {
            StepDecision::PlanComplete {
                completed_step: idx,
                kind,
                strategy,
            }
        } else {
            StepDecision::Advanced {
                completed_step: idx,
                kind,
                strategy,
            }
        }
    }

    /// 内部触发的重新规划：连续强制完成的步骤过多
    /// 计划已走完时不再触发
    pub fn internal_replan_reason(&self) -> Option<String> {
        if self.plan_finished() {
            return None;
        }
        let threshold = self.config.orchestrator.replan_after_forced_steps;
        if threshold > 0 && self.forced_streak >= threshold {
            return Some(format!("{} consecutive steps were force-completed", self.forced_streak));
        }
        None
    }

    /// 当前索引已越过最后一个步骤
    pub fn plan_finished(&self) -> bool {
        self.plan.is_some() && self.current_step_idx >= self.plan_len()
    }

    pub fn replans_exhausted(&self) -> bool {
        self.replan_count >= self.config.orchestrator.max_replans
    }

    /// 保留已完成前缀，追加新步骤，从同一索引继续
    pub fn apply_replan(&mut self, new_plan: Plan, reason: &str) {
        let keep = self.current_step_idx;
        let Some(plan) = self.plan.as_mut() else {
            self.accept_plan(new_plan);
            return;
        };
        plan.splice_replan(keep, new_plan.steps);
        let total = plan.len();
        self.replan_count += 1;
        self.forced_streak = 0;
        self.restart_current = true;
        self.loop_guard.reset_steps_from(keep);
        self.phase = RunPhase::Executing;
        info!(
            reason,
            replan = self.replan_count,
            kept = keep,
            total,
            "plan revised"
        );
        self.emit(OrchestratorEvent::Replanned {
            reason: reason.to_string(),
            replan_count: self.replan_count,
            kept_steps: keep,
            total_steps: total,
        });
    }

    /// 放弃剩余步骤：当前步骤记为失败，其余记为跳过
    fn abandon_remaining(&mut self, reason: &str) {
        let Some(plan) = self.plan.clone() else {
            return;
        };
        for idx in self.current_step_idx..plan.len() {
            let step = &plan.steps[idx];
            let role = self.resolve_role(step);
            self.tracker.initialize(idx, role.as_str(), &step.title);
            if self.tracker.status(idx) == StepStatus::InProgress {
                self.tracker.mark_failed(idx, reason);
            } else {
                self.tracker.mark_skipped(idx);
            }
        }
    }

    /// 取消时的部分答案：只用已积累的证据，不再调用外部服务
    pub fn partial_answer(&self) -> String {
        let evidence = self.tracker.collected_evidence();
        let done = self
            .tracker
            .states()
            .values()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let mut out = format!(
            "任务「{}」已中止，完成了 {}/{} 个步骤。",
            self.task,
            done,
            self.plan_len()
        );
        if !evidence.is_empty() {
            out.push_str("\n已获得的结果：\n");
            out.push_str(&evidence.join("\n"));
        }
        out
    }

    fn cancel_run(&mut self) -> RunOutcome {
        info!(run = %self.run_id, step = self.current_step_idx + 1, "run cancelled");
        self.phase = RunPhase::Cancelled;
        self.emit(OrchestratorEvent::Cancelled);
        RunOutcome::Cancelled {
            partial_answer: self.partial_answer(),
        }
    }

    // ---------------------------------------------------------------------
    // 异步外壳
    // ---------------------------------------------------------------------

    async fn pause(&mut self, reason: String) {
        warn!(run = %self.run_id, reason = %reason, "run paused");
        self.phase = RunPhase::Paused;
        self.supervisor.set_paused(true).await;
        self.emit(OrchestratorEvent::Paused { reason });
    }

    /// 带恢复策略的外部调用：退避重试 → 降级一次 → 暂停。
    /// 取消时返回 Ok(None)；暂停时返回最后一次的传输错误。
    async fn call_with_recovery<T, F, Fut>(&mut self, stage: &str, mut call: F) -> Result<Option<T>, TransportError>
    where
        F: FnMut(bool) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut failures = 0u32;
        let mut degraded = false;
        loop {
            let result = call(degraded).await;
            if self.supervisor.is_cancelled() {
                return Ok(None);
            }
            let err = match result {
                Ok(value) => return Ok(Some(value)),
                Err(err) => err,
            };
            failures += 1;
            let action = self.recovery.handle(&err, failures, degraded);
            warn!(stage, failures, error = %err, action = ?action, "transport failure");
            self.emit(OrchestratorEvent::TransportRecovery {
                stage: stage.to_string(),
                action: format!("{action:?}"),
                error: err.to_string(),
            });
            match action {
                RecoveryAction::RetryAfter(delay) => {
                    let token = self.supervisor.cancel_token();
                    tokio::select! {
                        _ = token.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::Degrade => degraded = true,
                RecoveryAction::Pause(reason) => {
                    self.pause(reason).await;
                    return Err(err);
                }
            }
        }
    }

    async fn request_plan(
        &mut self,
        collab: &Collaborators,
        completed: Vec<Step>,
    ) -> Result<Option<Plan>, OrchestratorError> {
        let planner = &collab.planner;
        let task = self.task.clone();
        let timeout = Duration::from_secs(self.config.orchestrator.planner_timeout_secs);
        let previous_phase = self.phase;
        self.phase = RunPhase::Planning;
        let result = self
            .call_with_recovery("planner", move |degraded| {
                let task = task.clone();
                // 降级请求不带已完成步骤
                let completed = if degraded { Vec::new() } else { completed.clone() };
                async move {
                    tokio::time::timeout(timeout, planner.request_plan(&task, &completed))
                        .await
                        .unwrap_or(Err(TransportError::Timeout))
                }
            })
            .await;
        match result {
            Ok(plan) => {
                if self.phase == RunPhase::Planning {
                    self.phase = previous_phase;
                }
                Ok(plan)
            }
            Err(cause) => Err(OrchestratorError::PlannerUnavailable {
                cause,
                partial_evidence: self.tracker.collected_evidence(),
            }),
        }
    }

    async fn synthesize(&mut self, collab: &Collaborators) -> Result<Option<String>, OrchestratorError> {
        let synthesizer = &collab.synthesizer;
        let task = self.task.clone();
        let evidence = self.tracker.collected_evidence();
        let timeout = Duration::from_secs(self.config.orchestrator.planner_timeout_secs);
        let full = evidence.clone();
        let result = self
            .call_with_recovery("synthesis", move |degraded| {
                let task = task.clone();
                // 降级请求只带每条证据的摘录
                let evidence: Vec<String> = if degraded {
                    full.iter().map(|e| excerpt(e, 200)).collect()
                } else {
                    full.clone()
                };
                async move {
                    tokio::time::timeout(timeout, synthesizer.synthesize_final_answer(&task, &evidence))
                        .await
                        .unwrap_or(Err(TransportError::Timeout))
                }
            })
            .await;
        result.map_err(|cause| OrchestratorError::SynthesisUnavailable {
            cause,
            partial_evidence: evidence,
        })
    }

    async fn dispatch(
        &mut self,
        collab: &Collaborators,
        request: &Dispatch,
        resend: bool,
    ) -> Result<Option<AgentResponse>, OrchestratorError> {
        let agents = &collab.agents;
        let timeout = Duration::from_secs(self.config.orchestrator.agent_timeout_secs);
        let full = request.clone();
        let mut simplified = request.clone();
        if let Some(step) = self.plan.as_ref().and_then(|p| p.step(request.step_index)) {
            simplified.instruction = InstructionBuilder::simplified(step, request.step_index);
        }
        if resend {
            debug!(step = request.step_index + 1, attempt = request.attempt, "re-sending instruction after a stale reply");
        }
        self.emit(OrchestratorEvent::Dispatched {
            step: request.step_index + 1,
            agent: request.role,
            attempt: request.attempt,
            resend,
        });
        let result = self
            .call_with_recovery("agent", move |degraded| {
                let request = if degraded { simplified.clone() } else { full.clone() };
                async move {
                    match tokio::time::timeout(timeout, agents.dispatch(&request)).await {
                        Ok(result) => result,
                        Err(_) => {
                            // 超时不致命：按空回复进入判定
                            warn!(step = request.step_index + 1, "agent timed out, treating as empty reply");
                            Ok(AgentResponse::text(request.step_index, ""))
                        }
                    }
                }
            })
            .await;
        result.map_err(|cause| OrchestratorError::AgentUnavailable {
            role: request.role,
            step: request.step_index + 1,
            cause,
            partial_evidence: self.tracker.collected_evidence(),
        })
    }

    /// 驱动当前步骤直到完成、取消或被要求重新规划。
    /// 派发是一问一答的：收到过期回复后只能把同一条指令重新发一次来等待本步骤的回复。
    async fn drive_step(&mut self, collab: &Collaborators, first: Dispatch) -> Result<StepFlow, OrchestratorError> {
        let mut pending = first;
        let mut stale = 0u32;
        let mut resend = false;
        loop {
            let Some(response) = self.dispatch(collab, &pending, resend).await? else {
                return Ok(StepFlow::Cancelled);
            };
            if let Some(reason) = self.supervisor.take_replan_request().await {
                return Ok(StepFlow::Replan(reason));
            }

            let decision = match self.ingest_response(&response, Utc::now()) {
                StepDecision::Discarded { reason } => {
                    stale += 1;
                    debug!(reason = %reason, stale, "response discarded");
                    if stale < self.config.orchestrator.max_stale_responses {
                        resend = true;
                        continue;
                    }
                    // 一直收不到对应回复时按空回复推进，避免无限等待
                    stale = 0;
                    warn!(step = pending.step_index + 1, "too many stale responses, counting an empty reply");
                    self.ingest_response(&AgentResponse::text(pending.step_index, ""), Utc::now())
                }
                other => other,
            };
            resend = false;
            match decision {
                StepDecision::Retry(next) => pending = next,
                StepDecision::Discarded { .. } => return Ok(StepFlow::Next),
                StepDecision::Advanced { .. } | StepDecision::PlanComplete { .. } => return Ok(StepFlow::Next),
            }
        }
    }

    /// 重新规划；次数耗尽时以尽力而为的答案结束运行
    async fn replan(&mut self, collab: &Collaborators, reason: String) -> Result<Option<RunOutcome>, OrchestratorError> {
        if self.replans_exhausted() {
            warn!(replans = self.replan_count, reason = %reason, "replan limit reached, finishing with best effort");
            self.abandon_remaining(&reason);
            let Some(answer) = self.synthesize(collab).await? else {
                return Ok(Some(self.cancel_run()));
            };
            self.finish(answer.clone());
            return Ok(Some(RunOutcome::BestEffort {
                final_answer: answer,
                reason: format!("replan limit ({}) reached: {reason}", self.config.orchestrator.max_replans),
            }));
        }
        let completed = self.plan.as_ref().map(|p| p.prefix(self.current_step_idx)).unwrap_or_default();
        let Some(new_plan) = self.request_plan(collab, completed).await? else {
            return Ok(Some(self.cancel_run()));
        };
        self.apply_replan(new_plan, &reason);
        Ok(None)
    }

    fn finish(&mut self, answer: String) {
        info!(run = %self.run_id, "final answer ready");
        self.phase = RunPhase::Finalized;
        self.final_answer = Some(answer.clone());
        self.emit(OrchestratorEvent::FinalAnswer { text: answer });
    }

    async fn finalize(&mut self, collab: &Collaborators) -> Result<RunOutcome, OrchestratorError> {
        let Some(answer) = self.synthesize(collab).await? else {
            return Ok(self.cancel_run());
        };
        self.finish(answer.clone());
        Ok(RunOutcome::Completed { final_answer: answer })
    }

    /// 驱动整个运行：规划（如尚无计划）→ 逐步执行 → 汇总最终答案。
    /// 只有传输失败会以错误返回，此时运行处于暂停状态，可再次调用以恢复。
    pub async fn run(&mut self, collab: &Collaborators) -> Result<RunOutcome, OrchestratorError> {
        if !self.phase.is_resumable() {
            return Err(OrchestratorError::InvalidPhase(self.phase));
        }
        if self.phase == RunPhase::Paused {
            info!(run = %self.run_id, "resuming paused run");
            self.supervisor.set_paused(false).await;
            self.phase = if self.plan.is_some() {
                RunPhase::Executing
            } else {
                RunPhase::Planning
            };
        }

        if self.plan.is_none() {
            let Some(plan) = self.request_plan(collab, Vec::new()).await? else {
                return Ok(self.cancel_run());
            };
            self.accept_plan(plan);
        }
        self.phase = RunPhase::Executing;

        loop {
            if self.supervisor.is_cancelled() {
                return Ok(self.cancel_run());
            }
            // 最后一步已完成时直接汇总，不再响应重新规划
            if self.plan_finished() {
                if let Some(reason) = self.supervisor.take_replan_request().await {
                    debug!(reason = %reason, "plan already finished, ignoring replan request");
                }
                return self.finalize(collab).await;
            }
            let external = self.supervisor.take_replan_request().await;
            if let Some(reason) = external.or_else(|| self.internal_replan_reason()) {
                if let Some(outcome) = self.replan(collab, reason).await? {
                    return Ok(outcome);
                }
                continue;
            }

            let Some(dispatch) = self.begin_current_step(Utc::now()) else {
                return self.finalize(collab).await;
            };

            match self.drive_step(collab, dispatch).await? {
                StepFlow::Next => {}
                StepFlow::Cancelled => return Ok(self.cancel_run()),
                StepFlow::Replan(reason) => {
                    if let Some(outcome) = self.replan(collab, reason).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }
}
