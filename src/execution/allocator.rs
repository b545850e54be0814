//! 智能体分配：步骤未指定角色时，按关键词规则表选一个
//!
//! 规则按优先级排列，首个命中生效；全部落空时回落到网页智能体，保证总能返回一个角色。

use regex::Regex;

use crate::plan::AgentRole;

/// 一组关键词：任一出现即命中；`domain_token` 为真时形如 `example.com` 的域名也算命中
#[derive(Debug, Clone)]
pub struct KeywordGroup {
    pub words: Vec<String>,
    pub domain_token: bool,
}

impl KeywordGroup {
    pub fn of(words: &[&str]) -> Self {
        Self {
            words: words.iter().map(|w| w.to_lowercase()).collect(),
            domain_token: false,
        }
    }

    pub fn or_domain(mut self) -> Self {
        self.domain_token = true;
        self
    }
}

/// 分配规则：所有关键词组都命中才算匹配（组内为「或」，组间为「与」）
#[derive(Debug, Clone)]
pub struct AllocationRule {
    pub name: String,
    pub role: AgentRole,
    pub all_of: Vec<KeywordGroup>,
}

impl AllocationRule {
    pub fn new(name: &str, role: AgentRole, all_of: Vec<KeywordGroup>) -> Self {
        Self {
            name: name.to_string(),
            role,
            all_of,
        }
    }
}

/// 默认规则表
pub fn default_rules() -> Vec<AllocationRule> {
    vec![
        // 图像动作与视觉主体同时出现才交给图像智能体，避免「编写产品介绍」被误判
        AllocationRule::new(
            "image_generation",
            AgentRole::ImageGenerator,
            vec![
                KeywordGroup::of(&[
                    "图像", "图片", "画", "生成", "绘制", "照片", "image", "picture", "draw", "generate",
                    "create", "photo", "render",
                ]),
                KeywordGroup::of(&["相机", "设备", "产品", "camera", "device", "product"]),
            ],
        ),
        AllocationRule::new(
            "web_access",
            AgentRole::WebSurfer,
            vec![KeywordGroup::of(&[
                "访问", "浏览", "搜索", "网站", "网页", "visit", "browse", "search", "website",
            ])
            .or_domain()],
        ),
        AllocationRule::new(
            "pdf_document",
            AgentRole::Coder,
            vec![
                KeywordGroup::of(&["pdf"]),
                KeywordGroup::of(&["文档", "报告", "生成", "创建", "document", "report", "generate", "create"]),
            ],
        ),
        AllocationRule::new(
            "html_format",
            AgentRole::Coder,
            vec![
                KeywordGroup::of(&["html"]),
                KeywordGroup::of(&["排版", "格式", "转换", "样式", "format", "convert", "styling", "layout"]),
            ],
        ),
        AllocationRule::new(
            "document",
            AgentRole::Coder,
            vec![KeywordGroup::of(&[
                "文档", "介绍", "总结", "摘要", "报告", "markdown", ".md", "document", "introduction",
                "summary", "report",
            ])],
        ),
        AllocationRule::new(
            "file_read",
            AgentRole::FileSurfer,
            vec![KeywordGroup::of(&["文件", "读取", "查看", "打开", "file", "read", "open"])],
        ),
        AllocationRule::new(
            "code",
            AgentRole::Coder,
            vec![KeywordGroup::of(&[
                "代码", "编程", "脚本", "计算", "code", "script", "programming", "python",
            ])],
        ),
        AllocationRule::new(
            "creation",
            AgentRole::Coder,
            vec![KeywordGroup::of(&[
                "生成", "创建", "制作", "编写", "generate", "create", "make", "write",
            ])],
        ),
    ]
}

/// 规则驱动的角色分配器
#[derive(Debug, Clone)]
pub struct AgentAllocator {
    rules: Vec<AllocationRule>,
    fallback: AgentRole,
    domain_token: Option<Regex>,
}

impl AgentAllocator {
    pub fn new() -> Self {
        Self::with_rules(default_rules(), AgentRole::WebSurfer)
    }

    pub fn with_rules(rules: Vec<AllocationRule>, fallback: AgentRole) -> Self {
        let domain_token = Regex::new(
            r"(?i)\b(?:https?://)?(?:[a-z0-9-]+\.)+(?:com|cn|net|org|io|ai|dev|co)\b",
        )
        .ok();
        Self {
            rules,
            fallback,
            domain_token,
        }
    }

    fn group_matches(&self, group: &KeywordGroup, text: &str) -> bool {
        group.words.iter().any(|w| text.contains(w.as_str()))
            || (group.domain_token
                && self
                    .domain_token
                    .as_ref()
                    .map(|re| re.is_match(text))
                    .unwrap_or(false))
    }

    /// 返回角色与命中的规则名（未命中任何规则时为 "default"）
    pub fn allocate_with_rule(&self, instruction_text: &str, step_title: &str) -> (AgentRole, &str) {
        let text = format!("{step_title} {instruction_text}").to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.all_of.iter().all(|g| self.group_matches(g, &text)))
            .map(|rule| (rule.role, rule.name.as_str()))
            .unwrap_or((self.fallback, "default"))
    }

    pub fn allocate(&self, instruction_text: &str, step_title: &str) -> AgentRole {
        self.allocate_with_rule(instruction_text, step_title).0
    }
}

impl Default for AgentAllocator {
    fn default() -> Self {
        Self::new()
    }
}
