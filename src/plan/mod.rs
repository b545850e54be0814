//! 计划模型：任务 + 有序步骤
//!
//! 计划由外部规划器生成，执行期间只读；重新规划时保留已完成前缀并追加新步骤。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// 固定的智能体角色集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// 网页浏览 / 搜索
    WebSurfer,
    /// 代码执行与文档撰写（markdown / html / pdf）
    #[serde(rename = "coder_agent")]
    Coder,
    /// 图像生成
    ImageGenerator,
    /// 本地文件读取
    FileSurfer,
}

impl AgentRole {
    pub const ALL: [AgentRole; 4] = [
        AgentRole::WebSurfer,
        AgentRole::Coder,
        AgentRole::ImageGenerator,
        AgentRole::FileSurfer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::WebSurfer => "web_surfer",
            AgentRole::Coder => "coder_agent",
            AgentRole::ImageGenerator => "image_generator",
            AgentRole::FileSurfer => "file_surfer",
        }
    }

    /// 调研型角色：边界更紧，完成判定更早放宽
    pub fn is_research(&self) -> bool {
        matches!(self, AgentRole::WebSurfer | AgentRole::FileSurfer)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "web_surfer" | "websurfer" => Ok(AgentRole::WebSurfer),
            "coder_agent" | "coder" => Ok(AgentRole::Coder),
            "image_generator" => Ok(AgentRole::ImageGenerator),
            "file_surfer" | "filesurfer" => Ok(AgentRole::FileSurfer),
            other => Err(format!("unknown agent role: {other}")),
        }
    }
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub title: String,
    pub details: String,
    /// 角色名；空串表示未分配，由 AgentAllocator 决定
    #[serde(default)]
    pub agent_name: String,
}

impl Step {
    pub fn new(title: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            details: details.into(),
            agent_name: String::new(),
        }
    }

    pub fn with_agent(mut self, role: AgentRole) -> Self {
        self.agent_name = role.as_str().to_string();
        self
    }

    /// 已分配且可识别的角色；空串或未知名称返回 None
    pub fn assigned_role(&self) -> Option<AgentRole> {
        if self.agent_name.trim().is_empty() {
            return None;
        }
        self.agent_name.parse().ok()
    }
}

/// 任务计划
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub task: String,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(task: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            task: task.into(),
            steps,
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// 保留前 `keep` 个步骤（已完成前缀），丢弃其余待执行定义，再追加新步骤
    pub fn splice_replan(&mut self, keep: usize, new_steps: Vec<Step>) {
        self.steps.truncate(keep);
        self.steps.extend(new_steps);
    }

    /// 已完成前缀的拷贝，交给规划器作为上下文
    pub fn prefix(&self, upto: usize) -> Vec<Step> {
        self.steps.iter().take(upto).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip_names() {
        for role in AgentRole::ALL {
            assert_eq!(role.as_str().parse::<AgentRole>().unwrap(), role);
        }
        assert!("unknown".parse::<AgentRole>().is_err());
    }

    #[test]
    fn test_role_serde_names() {
        let json = serde_json::to_string(&AgentRole::Coder).unwrap();
        assert_eq!(json, "\"coder_agent\"");
        let role: AgentRole = serde_json::from_str("\"image_generator\"").unwrap();
        assert_eq!(role, AgentRole::ImageGenerator);
    }

    #[test]
    fn test_assigned_role() {
        assert_eq!(Step::new("a", "b").assigned_role(), None);
        let step = Step::new("a", "b").with_agent(AgentRole::FileSurfer);
        assert_eq!(step.assigned_role(), Some(AgentRole::FileSurfer));
        let mut odd = Step::new("a", "b");
        odd.agent_name = "painter".into();
        assert_eq!(odd.assigned_role(), None);
    }

    #[test]
    fn test_splice_replan_keeps_prefix() {
        let mut plan = Plan::new(
            "t",
            vec![Step::new("s1", ""), Step::new("s2", ""), Step::new("s3", "")],
        );
        plan.splice_replan(1, vec![Step::new("n1", ""), Step::new("n2", "")]);
        let titles: Vec<_> = plan.steps.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["s1", "n1", "n2"]);
    }

    #[test]
    fn test_step_json_without_agent_name() {
        let step: Step = serde_json::from_str(r#"{"title":"t","details":"d"}"#).unwrap();
        assert!(step.agent_name.is_empty());
    }
}
