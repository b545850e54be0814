//! 外部协作方边界：智能体派发、规划器、最终答案合成
//!
//! 智能体本身不在本 crate 内实现，编排循环只通过这三个 trait 与之交互；
//! 回复统一为带标签的 `AgentResponse`，分类与上下文只读取其文本投影。

pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::TransportError;
use crate::execution::loop_guard::AgentAction;
use crate::plan::{AgentRole, Plan, Step};

pub use mock::{DigestSynthesizer, EchoAgent, ScriptedAgent, ScriptedReply, StaticPlanner};

/// 回复形态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Text,
    MultiModal,
}

/// 附件（如生成的图像）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// 智能体回复：必须带上它所响应的步骤索引
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub kind: ResponseKind,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub tagged_step_index: usize,
    /// 结构化动作；为空时编排循环会从文本中提取
    #[serde(default)]
    pub actions: Vec<AgentAction>,
}

impl AgentResponse {
    pub fn text(step_index: usize, text: impl Into<String>) -> Self {
        Self {
            kind: ResponseKind::Text,
            text: text.into(),
            attachments: Vec::new(),
            tagged_step_index: step_index,
            actions: Vec::new(),
        }
    }

    pub fn multimodal(step_index: usize, text: impl Into<String>, attachments: Vec<Attachment>) -> Self {
        Self {
            kind: ResponseKind::MultiModal,
            text: text.into(),
            attachments,
            tagged_step_index: step_index,
            actions: Vec::new(),
        }
    }

    pub fn with_actions(mut self, actions: Vec<AgentAction>) -> Self {
        self.actions = actions;
        self
    }

    /// 图像类附件
    pub fn images(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments
            .iter()
            .filter(|a| a.mime_type.starts_with("image/"))
    }
}

/// 一次派发：目标步骤、角色与（临时合成、不回写到 Step 的）指令
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub step_index: usize,
    pub role: AgentRole,
    pub instruction: String,
    /// 本步骤第几次派发（从 1 开始）
    pub attempt: u32,
}

/// 智能体派发
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn dispatch(&self, request: &Dispatch) -> Result<AgentResponse, TransportError>;
}

/// 规划器：首次规划与重新规划（附带已完成的步骤前缀）
#[async_trait]
pub trait PlanProvider: Send + Sync {
    async fn request_plan(&self, task: &str, completed_steps: &[Step]) -> Result<Plan, TransportError>;
}

/// 最终答案合成
#[async_trait]
pub trait AnswerSynthesizer: Send + Sync {
    async fn synthesize_final_answer(&self, task: &str, evidence: &[String]) -> Result<String, TransportError>;
}
