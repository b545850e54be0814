//! 全局上下文：跨步骤累积的信息（调研结果、已生成的图像 / 文档）
//!
//! 只由编排循环写入；智能体只能通过回复文本间接影响它。运行期间只增不删，新任务时清空。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::AgentResponse;
use crate::execution::excerpt;
use crate::plan::AgentRole;

/// 视为「要点」的细节词
const HIGHLIGHT_TERMS: &[&str] = &[
    "规格", "参数", "特点", "功能", "价格", "型号", "分辨率", "spec", "feature", "price", "resolution",
    "battery", "weight", "model",
];
const MAX_HIGHLIGHTS: usize = 5;

static OUTPUT_FILE: OnceLock<Option<Regex>> = OnceLock::new();

/// 回复中出现的输出文件扩展名（`intro.md`、`report.html`）；只提到格式名不算
fn output_extensions(text: &str) -> Vec<String> {
    let Some(re) = OUTPUT_FILE
        .get_or_init(|| Regex::new(r"(?i)\w[\w\-]*\.(md|markdown|html?|pdf)\b").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    re.captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_lowercase()))
        .collect()
}

/// 从调研文本中挑出含数字或细节词的片段
fn highlights(text: &str) -> Vec<String> {
    text.split(|c| matches!(c, '\n' | '。' | '；' | ';' | '!' | '！'))
        .map(str::trim)
        .filter(|seg| !seg.is_empty())
        .filter(|seg| {
            let lower = seg.to_lowercase();
            seg.chars().any(|c| c.is_ascii_digit()) || HIGHLIGHT_TERMS.iter().any(|t| lower.contains(t))
        })
        .take(MAX_HIGHLIGHTS)
        .map(|seg| excerpt(seg, 160))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalContext {
    entries: BTreeMap<String, Value>,
}

impl GlobalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.entries.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// 向列表型条目追加一项
    fn push(&mut self, key: &str, item: Value) {
        match self.entries.get_mut(key) {
            Some(Value::Array(items)) => items.push(item),
            _ => {
                self.entries.insert(key.to_string(), Value::Array(vec![item]));
            }
        }
    }

    fn research_highlights(&self) -> Vec<String> {
        self.get("research_findings")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .flat_map(|f| {
                        f.get("highlights")
                            .and_then(Value::as_array)
                            .cloned()
                            .unwrap_or_default()
                    })
                    .filter_map(|h| h.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 把一条被接受的回复折叠进上下文
    pub fn absorb(&mut self, role: AgentRole, step_index: usize, response: &AgentResponse) {
        let text = response.text.trim();
        self.insert(
            format!("{}_step_{}_text", role, step_index + 1),
            json!(excerpt(text, 1000)),
        );

        match role {
            AgentRole::WebSurfer | AgentRole::FileSurfer => {
                if text.is_empty() {
                    return;
                }
                self.push(
                    "research_findings",
                    json!({
                        "step": step_index + 1,
                        "source": role.as_str(),
                        "excerpt": excerpt(text, 500),
                        "highlights": highlights(text),
                    }),
                );
                let flag = if role == AgentRole::WebSurfer {
                    "web_research_completed"
                } else {
                    "file_research_completed"
                };
                self.insert(flag, json!(true));
            }
            AgentRole::ImageGenerator => {
                let images: Vec<Value> = response
                    .images()
                    .map(|a| json!({ "mime_type": a.mime_type, "size_bytes": a.bytes.len() }))
                    .collect();
                if images.is_empty() && text.is_empty() {
                    return;
                }
                self.insert("image_generated", json!(true));
                self.insert("generated_image_text", json!(excerpt(text, 500)));
                for image in images {
                    self.push("generated_images", image);
                }
            }
            AgentRole::Coder => {
                for ext in output_extensions(text) {
                    let flag = match ext.as_str() {
                        "md" | "markdown" => "markdown_created",
                        "htm" | "html" => "html_created",
                        _ => "pdf_created",
                    };
                    self.insert(flag, json!(true));
                }
            }
        }
    }

    /// 按角色挑选需要带进下一条指令的上下文
    pub fn section_for(&self, role: AgentRole) -> Option<String> {
        let highlights = self.research_highlights();
        let mut lines = Vec::new();
        match role {
            AgentRole::WebSurfer => {
                if self.flag("web_research_completed") && !highlights.is_empty() {
                    lines.push("此前的调研已覆盖以下要点，请聚焦尚未收集的信息：".to_string());
                    lines.extend(highlights.iter().map(|h| format!("- {h}")));
                }
            }
            AgentRole::ImageGenerator => {
                if !highlights.is_empty() {
                    lines.push("可参考的调研结果：".to_string());
                    lines.extend(highlights.iter().map(|h| format!("- {h}")));
                }
            }
            AgentRole::Coder => {
                if !highlights.is_empty() {
                    lines.push("可用的调研数据：".to_string());
                    lines.extend(highlights.iter().map(|h| format!("- {h}")));
                }
                if self.flag("image_generated") {
                    let count = self
                        .get("generated_images")
                        .and_then(Value::as_array)
                        .map(Vec::len)
                        .unwrap_or(0);
                    lines.push(format!("已有生成的图像（{count} 张附件），可在文档中引用。"));
                }
                if self.flag("markdown_created") {
                    lines.push("前序步骤已生成 Markdown 文档，可在其基础上转换格式。".to_string());
                }
                if self.flag("html_created") {
                    lines.push("前序步骤已生成 HTML 文档。".to_string());
                }
            }
            AgentRole::FileSurfer => {}
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}
