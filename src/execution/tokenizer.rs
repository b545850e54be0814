//! 分词模块
//!
//! 提供中英文混合分词能力，用于步骤标题与回复之间的词汇重叠打分。
//! 使用 jieba-rs 进行中文分词，英文按空格分词。

use std::collections::HashSet;
use std::sync::OnceLock;

use jieba_rs::Jieba;

/// 全局 Jieba 实例（延迟初始化）
static JIEBA: OnceLock<Jieba> = OnceLock::new();

fn get_jieba() -> &'static Jieba {
    JIEBA.get_or_init(Jieba::new)
}

/// 不参与重叠计算的虚词
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "of", "to", "an", "in", "on", "at", "by", "from", "into", "的",
    "了", "和", "与", "并", "在",
];

/// 判断字符是否为 CJK（中日韩）字符
fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Unified Ideographs Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}'     // Katakana
    )
}

/// 判断文本是否包含 CJK 字符
pub fn contains_cjk(text: &str) -> bool {
    text.chars().any(is_cjk)
}

fn keep_token(token: &str) -> bool {
    if !token.chars().any(char::is_alphanumeric) || STOPWORDS.contains(&token) {
        return false;
    }
    token.len() > 1 || token.chars().next().map(is_cjk).unwrap_or(false)
}

/// 智能分词：根据文本内容自动选择分词策略
/// - 包含 CJK 字符时使用 jieba 分词
/// - 纯英文时使用空格分词（去掉首尾标点）
pub fn tokenize(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    if contains_cjk(text) {
        // 搜索引擎模式，更细粒度
        get_jieba()
            .cut_for_search(text, true)
            .into_iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| keep_token(s))
            .collect()
    } else {
        text.split_whitespace()
            .map(|s| {
                s.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_lowercase()
            })
            .filter(|s| keep_token(s))
            .collect()
    }
}

/// 分词并去重
pub fn tokenize_to_set(text: &str) -> HashSet<String> {
    tokenize(text).into_iter().collect()
}

/// 标题中有多少个（去重后的）词出现在回复里
pub fn title_overlap(title: &str, text: &str) -> usize {
    let lower = text.to_lowercase();
    tokenize_to_set(title)
        .iter()
        .filter(|token| lower.contains(token.as_str()))
        .count()
}
