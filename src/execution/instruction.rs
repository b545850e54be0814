//! 指令合成：按步骤、角色、尝试次数拼出发给智能体的指令
//!
//! 指令是临时值，不回写到 Step。

use crate::execution::context::GlobalContext;
use crate::execution::tracker::StepExecutionState;
use crate::plan::{AgentRole, Step};

/// 跟进指令的变体
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// 普通重试
    Continue,
    /// 防循环阻断后：换一种方法
    DifferentApproach(String),
    /// 接近边界：提示尽快收尾
    WrapUp(String),
}

pub struct InstructionBuilder;

impl InstructionBuilder {
    /// 分类器能识别的完成短语，按角色给出
    pub fn completion_phrase(role: AgentRole) -> &'static str {
        match role {
            AgentRole::ImageGenerator => "图像生成任务已完成",
            AgentRole::Coder => "文档创建任务已完成",
            AgentRole::WebSurfer | AgentRole::FileSurfer => "✅ 当前步骤已完成",
        }
    }

    fn role_guidance(role: AgentRole) -> &'static str {
        match role {
            AgentRole::WebSurfer => "请自主完成浏览，不要向用户提问；找到所需信息后立即停止，不要反复点击同一元素。",
            AgentRole::FileSurfer => "请读取所需文件，只摘录与本步骤相关的内容。",
            AgentRole::ImageGenerator => "请根据描述直接生成图像，不要追问细节。",
            AgentRole::Coder => "请直接产出内容并保存，说明输出文件名与格式（markdown / html / pdf）。",
        }
    }

    fn header(step: &Step, step_index: usize, total: usize) -> String {
        let mut out = format!("步骤 {}/{}：{}", step_index + 1, total, step.title);
        if !step.details.trim().is_empty() {
            out.push('\n');
            out.push_str(step.details.trim());
        }
        out
    }

    /// 步骤首次派发
    pub fn initial(
        step: &Step,
        step_index: usize,
        total: usize,
        role: AgentRole,
        state: &StepExecutionState,
        ctx: &GlobalContext,
        recent_targets: &[String],
    ) -> String {
        let mut sections = vec![Self::header(step, step_index, total), Self::role_guidance(role).to_string()];
        sections.push(format!(
            "执行边界：最多 {} 个动作，约 {} 秒。",
            state.boundaries.max_actions, state.boundaries.time_limit_secs
        ));
        if let Some(section) = ctx.section_for(role) {
            sections.push(section);
        }
        if role == AgentRole::WebSurfer && !recent_targets.is_empty() {
            sections.push(format!("已执行过的操作（避免重复）：{}", recent_targets.join("；")));
        }
        sections.push(format!(
            "完成后请在回复中写明「{}」，并附上获得的关键信息。",
            Self::completion_phrase(role)
        ));
        sections.join("\n\n")
    }

    /// 同一步骤的后续派发
    pub fn follow_up(
        step: &Step,
        step_index: usize,
        total: usize,
        role: AgentRole,
        state: &StepExecutionState,
        ctx: &GlobalContext,
        variant: &FollowUp,
    ) -> String {
        let mut sections = vec![Self::header(step, step_index, total)];
        let attempts = state.attempt_count;
        match attempts {
            0 => {}
            1 | 2 => sections.push("请高效推进，优先完成步骤的核心目标。".to_string()),
            n => sections.push(format!("已尝试 {n} 次，请基于已有信息立即收尾，不要再扩大范围。")),
        }
        match variant {
            FollowUp::Continue => {}
            FollowUp::DifferentApproach(reason) => sections.push(format!(
                "检测到重复操作（{reason}）。请换一种方法，不要再执行相同的动作。"
            )),
            FollowUp::WrapUp(reason) => sections.push(format!("接近执行边界（{reason}），请尽快给出结果。")),
        }
        let notes: Vec<&String> = state.attempt_notes.iter().rev().take(2).collect();
        if !notes.is_empty() {
            let mut block = String::from("已获得的信息（不要重复获取）：");
            for note in notes.into_iter().rev() {
                block.push_str("\n- ");
                block.push_str(note);
            }
            sections.push(block);
        }
        if let Some(section) = ctx.section_for(role) {
            sections.push(section);
        }
        sections.push(format!(
            "如果步骤已经完成，请在回复中写明「{}」。",
            Self::completion_phrase(role)
        ));
        sections.join("\n\n")
    }

    /// 降级请求：只保留标题与细节
    pub fn simplified(step: &Step, step_index: usize) -> String {
        if step.details.trim().is_empty() {
            format!("第 {} 步：{}", step_index + 1, step.title)
        } else {
            format!("第 {} 步：{}。{}", step_index + 1, step.title, step.details.trim())
        }
    }
}
