//! Token 预算控制
//!
//! 上下文预算（LLM 单次请求上限）、高水位线（触发摘要压缩）与受保护的最近消息数。

use crate::memory::Message;

/// 每条消息的固定开销（角色、分隔符等）
pub(crate) const MESSAGE_OVERHEAD: usize = 4;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 单条消息：正文 + 结构化载荷 + 固定开销
    pub fn estimate_message(msg: &Message) -> usize {
        let payload = msg
            .tool_payload
            .as_ref()
            .and_then(|p| serde_json::to_string(p).ok())
            .map(|s| Self::estimate(&s))
            .unwrap_or(0);
        Self::estimate(&msg.content) + payload + MESSAGE_OVERHEAD
    }

    /// 将文本截断到指定 token 数（保留开头部分）
    pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
        let estimated = Self::estimate(text);
        if estimated <= max_tokens {
            return text.to_string();
        }

        // 按比例截断，留 10% 余量
        let ratio = max_tokens as f64 / estimated as f64;
        let target_chars = (text.chars().count() as f64 * ratio * 0.9) as usize;
        let truncated: String = text.chars().take(target_chars).collect();

        format!("{}...", truncated.trim_end())
    }
}

/// 记忆预算配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudget {
    /// 上下文总预算：任何 MemoryManager 操作完成后不得超过
    pub context_budget: usize,
    /// 高水位线：估算值超过它时触发摘要
    pub high_water_mark: usize,
    /// 永不被摘要掉的最近原始消息数
    pub keep_recent: usize,
}

impl TokenBudget {
    pub fn new(context_budget: usize, high_water_mark: usize, keep_recent: usize) -> Self {
        Self {
            context_budget,
            high_water_mark: high_water_mark.min(context_budget),
            keep_recent,
        }
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(8000, 6000, 6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_estimator_english() {
        let text = "Hello, world! This is a test.";
        let tokens = TokenEstimator::estimate(text);
        assert!(tokens > 0);
        assert!(tokens < text.len());
    }

    #[test]
    fn test_token_estimator_chinese() {
        let tokens = TokenEstimator::estimate("你好世界，这是一个测试。");
        assert!(tokens >= 8);
    }

    #[test]
    fn test_message_estimate_includes_overhead() {
        let msg = Message::user("a".repeat(40));
        assert_eq!(TokenEstimator::estimate_message(&msg), 10 + MESSAGE_OVERHEAD);
    }

    #[test]
    fn test_truncate_to_tokens() {
        let text = "word ".repeat(200);
        let truncated = TokenEstimator::truncate_to_tokens(&text, 50);
        assert!(TokenEstimator::estimate(&truncated) <= 50);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_high_water_mark_clamped_to_budget() {
        let budget = TokenBudget::new(100, 500, 2);
        assert_eq!(budget.high_water_mark, 100);
    }
}
