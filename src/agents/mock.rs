//! Mock 协作方（用于测试与本地演示，无需真实智能体）
//!
//! - `ScriptedAgent`：按角色预置回复队列，记录每次派发
//! - `EchoAgent`：直接回显完成短语，演示流程能跑通
//! - `StaticPlanner`：依次返回预置计划
//! - `DigestSynthesizer`：把证据拼成摘要

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::agents::{AgentDispatcher, AgentResponse, AnswerSynthesizer, Dispatch, PlanProvider};
use crate::core::TransportError;
use crate::execution::InstructionBuilder;
use crate::plan::{AgentRole, Plan, Step};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

/// 预置回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// 针对当前派发步骤的文本回复
    Text(String),
    /// 标记为指定步骤的回复（模拟乱序 / 过期回复）
    Tagged { step_index: usize, text: String },
    /// 完整回复（步骤索引改写为当前派发的步骤）
    Response(AgentResponse),
    Fail(TransportError),
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        ScriptedReply::Text(text.into())
    }
}

/// 按角色出队的脚本化智能体；队列空时回复完成短语
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    scripts: Mutex<HashMap<AgentRole, VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<Dispatch>>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, role: AgentRole, replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        lock(&self.scripts).entry(role).or_default().extend(replies);
        self
    }

    pub fn calls(&self) -> Vec<Dispatch> {
        lock(&self.calls).clone()
    }

    pub fn remaining(&self, role: AgentRole) -> usize {
        lock(&self.scripts).get(&role).map(VecDeque::len).unwrap_or(0)
    }
}

#[async_trait]
impl AgentDispatcher for ScriptedAgent {
    async fn dispatch(&self, request: &Dispatch) -> Result<AgentResponse, TransportError> {
        lock(&self.calls).push(request.clone());
        let next = lock(&self.scripts)
            .get_mut(&request.role)
            .and_then(VecDeque::pop_front);
        match next {
            Some(ScriptedReply::Text(text)) => Ok(AgentResponse::text(request.step_index, text)),
            Some(ScriptedReply::Tagged { step_index, text }) => Ok(AgentResponse::text(step_index, text)),
            Some(ScriptedReply::Response(mut response)) => {
                response.tagged_step_index = request.step_index;
                Ok(response)
            }
            Some(ScriptedReply::Fail(err)) => Err(err),
            None => Ok(AgentResponse::text(
                request.step_index,
                format!(
                    "{}：{}",
                    InstructionBuilder::completion_phrase(request.role),
                    first_line(&request.instruction)
                ),
            )),
        }
    }
}

/// 回显智能体：每次都报告完成
#[derive(Debug, Default)]
pub struct EchoAgent;

#[async_trait]
impl AgentDispatcher for EchoAgent {
    async fn dispatch(&self, request: &Dispatch) -> Result<AgentResponse, TransportError> {
        Ok(AgentResponse::text(
            request.step_index,
            format!(
                "{}。Echo from {}: {}",
                InstructionBuilder::completion_phrase(request.role),
                request.role,
                first_line(&request.instruction)
            ),
        ))
    }
}

/// 依次返回预置计划；用完后重复最后一个成功的计划
#[derive(Debug)]
pub struct StaticPlanner {
    queue: Mutex<VecDeque<Result<Plan, TransportError>>>,
    fallback: Mutex<Plan>,
    calls: Mutex<Vec<Vec<Step>>>,
}

impl StaticPlanner {
    pub fn new(plan: Plan) -> Self {
        Self {
            queue: Mutex::new(VecDeque::from([Ok(plan.clone())])),
            fallback: Mutex::new(plan),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, plan: Plan) -> Self {
        lock(&self.queue).push_back(Ok(plan));
        self
    }

    pub fn then_fail(self, err: TransportError) -> Self {
        lock(&self.queue).push_back(Err(err));
        self
    }

    /// 每次调用收到的已完成步骤前缀
    pub fn calls(&self) -> Vec<Vec<Step>> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl PlanProvider for StaticPlanner {
    async fn request_plan(&self, _task: &str, completed_steps: &[Step]) -> Result<Plan, TransportError> {
        lock(&self.calls).push(completed_steps.to_vec());
        match lock(&self.queue).pop_front() {
            Some(Ok(plan)) => {
                *lock(&self.fallback) = plan.clone();
                Ok(plan)
            }
            Some(Err(err)) => Err(err),
            None => Ok(lock(&self.fallback).clone()),
        }
    }
}

/// 把证据逐条拼接成最终答案
#[derive(Debug, Default)]
pub struct DigestSynthesizer;

#[async_trait]
impl AnswerSynthesizer for DigestSynthesizer {
    async fn synthesize_final_answer(&self, task: &str, evidence: &[String]) -> Result<String, TransportError> {
        if evidence.is_empty() {
            return Ok(format!("任务：{task}\n（没有收集到证据）"));
        }
        Ok(format!("任务：{task}\n\n{}", evidence.join("\n")))
    }
}
