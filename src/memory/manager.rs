//! Memory Manager：在上下文预算内维护对话
//!
//! 追加消息时更新 token 估算；超过高水位线时把「系统提示之后、最近 N 条之前」的连续区间
//! 交给 LLM 摘要，替换为一条摘要消息。系统提示与最近 N 条原始消息永远逐字保留。

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::llm::LlmTransport;
use crate::memory::token_budget::MESSAGE_OVERHEAD;
use crate::memory::{
    Conversation, Message, PersistenceError, Role, Snapshot, TokenBudget, TokenEstimator,
};

/// 摘要前缀（同时用于识别摘要消息的可读部分）
const SUMMARY_PREFIX: &str = "Summary of earlier conversation:";
/// 摘要截断后低于该 token 数时直接丢弃摘要
const MIN_SUMMARY_TOKENS: usize = 8;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Context budget unreachable: {estimate} tokens remain after compaction (budget {budget})")]
    BudgetUnreachable { estimate: usize, budget: usize },
}

/// 一次压缩的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// 未超过高水位线，或没有可压缩的区间
    Skipped,
    /// LLM 摘要替换了 `replaced` 条消息
    Summarized {
        replaced: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
    /// 摘要不可用（无摘要器或调用失败），以剪枝说明替换
    Pruned {
        replaced: usize,
        tokens_before: usize,
        tokens_after: usize,
    },
}

/// 对话记忆管理器：独占 Conversation，一个实例只服务一次运行
pub struct MemoryManager {
    conversation: Conversation,
    budget: TokenBudget,
    summarizer: Option<Arc<dyn LlmTransport>>,
    iteration: u64,
    token_estimate: usize,
}

impl MemoryManager {
    pub fn new(budget: TokenBudget) -> Self {
        Self {
            conversation: Conversation::new(),
            budget,
            summarizer: None,
            iteration: 0,
            token_estimate: 0,
        }
    }

    /// 设置摘要能力（与推理共用同一 LLM 传输，但走 summarize 接口）
    pub fn with_summarizer(mut self, summarizer: Arc<dyn LlmTransport>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// 追加消息；估算超过高水位线时立即压缩。
    /// 压缩后仍超出上下文预算时撤回这条消息并报错，对话保持在预算内
    pub async fn append(&mut self, msg: Message) -> Result<CompactionOutcome, MemoryError> {
        self.token_estimate += msg.token_count();
        self.conversation.push(msg);
        match self.compact_if_needed().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // keep_recent 为 0 时新消息可能已并入摘要，此时没有可撤回的原始消息
                let len = self.conversation.len();
                if self.conversation.messages().last().is_some_and(|m| !m.is_summary()) {
                    self.conversation.splice(len - 1, len, None);
                }
                self.recompute();
                tracing::warn!(error = %e, "message rejected, context budget unreachable");
                Err(e)
            }
        }
    }

    /// 供下一次推理使用的上下文：系统提示 -> 摘要（若有）-> 最近原始消息
    pub fn context_for_next_step(&self) -> Vec<Message> {
        let messages = self.conversation.messages();
        let mut context: Vec<Message> = messages
            .iter()
            .filter(|m| m.is_system_prompt())
            .cloned()
            .collect();
        context.extend(messages.iter().filter(|m| m.is_summary()).cloned());
        context.extend(
            messages
                .iter()
                .filter(|m| !m.is_system_prompt() && !m.is_summary())
                .cloned(),
        );
        context
    }

    /// 幂等：低于高水位线时为 no-op
    pub async fn compact_if_needed(&mut self) -> Result<CompactionOutcome, MemoryError> {
        if self.token_estimate <= self.budget.high_water_mark {
            return Ok(CompactionOutcome::Skipped);
        }
        self.compact().await
    }

    /// 强制压缩（LLM 报告上下文窗口溢出时使用）
    pub async fn summarize_now(&mut self) -> Result<CompactionOutcome, MemoryError> {
        self.compact().await
    }

    async fn compact(&mut self) -> Result<CompactionOutcome, MemoryError> {
        let tokens_before = self.token_estimate;
        let (start, end) = self.compactable_range();
        let run = &self.conversation.messages()[start..end];
        if !run.iter().any(|m| !m.is_summary()) {
            self.enforce_budget()?;
            return Ok(CompactionOutcome::Skipped);
        }

        let replaced = run.len();
        let (summary, summarized) = self.condense(run).await;
        self.conversation.splice(start, end, Some(summary));
        self.recompute();
        self.fit_summary(self.summary_allowance());
        self.enforce_budget()?;

        tracing::info!(
            replaced,
            tokens_before,
            tokens_after = self.token_estimate,
            summarized,
            "memory compacted"
        );
        let tokens_after = self.token_estimate;
        Ok(if summarized {
            CompactionOutcome::Summarized {
                replaced,
                tokens_before,
                tokens_after,
            }
        } else {
            CompactionOutcome::Pruned {
                replaced,
                tokens_before,
                tokens_after,
            }
        })
    }

    /// 可压缩区间：开头的系统提示之后、最近 keep_recent 条之前
    fn compactable_range(&self) -> (usize, usize) {
        let messages = self.conversation.messages();
        let start = messages
            .iter()
            .take_while(|m| m.is_system_prompt())
            .count();
        let end = messages
            .len()
            .saturating_sub(self.budget.keep_recent)
            .max(start);
        (start, end)
    }

    /// 请求摘要；失败或未配置摘要器时退化为剪枝说明
    async fn condense(&self, run: &[Message]) -> (Message, bool) {
        if let Some(summarizer) = &self.summarizer {
            match summarizer.summarize(run).await {
                Ok(text) if !text.trim().is_empty() => {
                    return (
                        Message::summary(format!("{}\n{}", SUMMARY_PREFIX, text.trim())),
                        true,
                    );
                }
                Ok(_) => tracing::warn!("summarizer returned empty text, pruning instead"),
                Err(e) => tracing::warn!(error = %e, "summarization failed, pruning instead"),
            }
        }
        let raw = run.iter().filter(|m| !m.is_summary()).count();
        (
            Message::summary(format!(
                "{} {} earlier messages were pruned.",
                SUMMARY_PREFIX, raw
            )),
            false,
        )
    }

    /// 摘要可占用的 token 数：高水位线以下剩余空间的一半，另一半留给后续追加；
    /// 其余消息本身已越过高水位线时以上下文预算为界
    fn summary_allowance(&self) -> usize {
        let others = self.token_estimate - self.summary_tokens();
        if others < self.budget.high_water_mark {
            let room = self.budget.high_water_mark - others;
            if room / 2 >= MIN_SUMMARY_TOKENS {
                room / 2
            } else {
                room
            }
        } else {
            self.budget.context_budget.saturating_sub(others)
        }
    }

    fn summary_tokens(&self) -> usize {
        self.conversation
            .messages()
            .iter()
            .find(|m| m.is_summary())
            .map_or(0, Message::token_count)
    }

    /// 把摘要截断到 max_tokens 以内；放不下 MIN_SUMMARY_TOKENS 时丢弃摘要
    fn fit_summary(&mut self, max_tokens: usize) {
        let Some(idx) = self
            .conversation
            .messages()
            .iter()
            .position(Message::is_summary)
        else {
            return;
        };
        let summary = &self.conversation.messages()[idx];
        if summary.token_count() <= max_tokens {
            return;
        }
        let replacement = if max_tokens >= MIN_SUMMARY_TOKENS {
            // 截断会追加省略号，多预留一个 token
            let text = TokenEstimator::truncate_to_tokens(
                &summary.content,
                max_tokens.saturating_sub(MESSAGE_OVERHEAD + 1),
            );
            Some(Message::summary(text)).filter(|m| m.token_count() <= max_tokens)
        } else {
            None
        };
        self.conversation.splice(idx, idx + 1, replacement);
        self.recompute();
    }

    /// 保证不超过上下文预算：先截断或丢弃摘要，仍不够则报错
    fn enforce_budget(&mut self) -> Result<(), MemoryError> {
        if self.token_estimate <= self.budget.context_budget {
            return Ok(());
        }
        let others = self.token_estimate - self.summary_tokens();
        self.fit_summary(self.budget.context_budget.saturating_sub(others));
        if self.token_estimate > self.budget.context_budget {
            return Err(self.budget_error());
        }
        Ok(())
    }

    fn budget_error(&self) -> MemoryError {
        MemoryError::BudgetUnreachable {
            estimate: self.token_estimate,
            budget: self.budget.context_budget,
        }
    }

    fn recompute(&mut self) {
        self.token_estimate = self.conversation.token_estimate();
    }

    /// 显式剪枝：只保留系统提示与最近 keep_recent 条，返回删除条数
    pub fn truncate(&mut self, keep_recent: usize) -> usize {
        let messages = self.conversation.messages();
        let non_system = messages.iter().filter(|m| !m.is_system_prompt()).count();
        let mut to_drop = non_system.saturating_sub(keep_recent);
        let dropped = to_drop;
        self.conversation.retain(|m| {
            if m.is_system_prompt() || to_drop == 0 {
                true
            } else {
                to_drop -= 1;
                false
            }
        });
        self.recompute();
        dropped
    }

    /// 清空对话；keep_system 时保留系统提示
    pub fn clear(&mut self, keep_system: bool) {
        if keep_system {
            self.conversation.retain(Message::is_system_prompt);
        } else {
            self.conversation.clear();
        }
        self.recompute();
    }

    pub fn has_system_prompt(&self) -> bool {
        self.conversation
            .messages()
            .first()
            .is_some_and(Message::is_system_prompt)
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.messages()
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// (role, content) 形式的历史
    pub fn history(&self) -> Vec<(Role, String)> {
        self.conversation
            .messages()
            .iter()
            .map(|m| (m.role, m.content.clone()))
            .collect()
    }

    pub fn message_count(&self) -> usize {
        self.conversation.len()
    }

    pub fn token_estimate(&self) -> usize {
        self.token_estimate
    }

    pub fn budget(&self) -> TokenBudget {
        self.budget
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn advance_iteration(&mut self) -> u64 {
        self.iteration += 1;
        self.iteration
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.conversation.clone(), self.iteration)
    }

    /// 以快照替换当前状态，随后按本实例的预算压缩；预算无法满足时回滚到恢复前的状态
    pub async fn restore(&mut self, snapshot: Snapshot) -> Result<CompactionOutcome, MemoryError> {
        let previous_conversation = std::mem::replace(&mut self.conversation, snapshot.conversation);
        let previous_iteration = std::mem::replace(&mut self.iteration, snapshot.iteration);
        self.recompute();
        match self.compact_if_needed().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.conversation = previous_conversation;
                self.iteration = previous_iteration;
                self.recompute();
                Err(e)
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        self.snapshot().save(path)
    }

    /// 从文件恢复；失败时当前状态保持不变
    pub async fn load(&mut self, path: impl AsRef<Path>) -> Result<CompactionOutcome, PersistenceError> {
        let snapshot = Snapshot::load(path)?;
        Ok(self.restore(snapshot).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(budget: TokenBudget) -> MemoryManager {
        MemoryManager::new(budget)
    }

    #[tokio::test]
    async fn test_append_below_mark_is_noop() {
        let mut memory = manager(TokenBudget::new(1000, 800, 2));
        let outcome = memory.append(Message::user("hello")).await.unwrap();
        assert_eq!(outcome, CompactionOutcome::Skipped);
        assert_eq!(memory.message_count(), 1);
    }

    #[tokio::test]
    async fn test_prunes_without_summarizer() {
        let mut memory = manager(TokenBudget::new(200, 120, 2));
        memory.append(Message::system("sys")).await.unwrap();
        for i in 0..10 {
            memory
                .append(Message::user(format!("{i} {}", "x".repeat(80))))
                .await
                .unwrap();
        }
        assert!(memory.token_estimate() <= 200);
        assert!(memory.messages()[0].is_system_prompt());
        assert!(memory.messages()[1].is_summary());
        assert!(memory.messages()[1].content.contains("pruned"));
    }

    #[tokio::test]
    async fn test_truncate_keeps_system_and_recent() {
        let mut memory = manager(TokenBudget::new(10_000, 9_000, 2));
        memory.append(Message::system("sys")).await.unwrap();
        for i in 0..5 {
            memory.append(Message::user(format!("m{i}"))).await.unwrap();
        }
        assert_eq!(memory.truncate(2), 3);
        let contents: Vec<_> = memory.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_clear_keep_system() {
        let mut memory = manager(TokenBudget::default());
        memory.append(Message::system("sys")).await.unwrap();
        memory.append(Message::user("hi")).await.unwrap();
        memory.clear(true);
        assert_eq!(memory.message_count(), 1);
        memory.clear(false);
        assert_eq!(memory.message_count(), 0);
        assert_eq!(memory.token_estimate(), 0);
    }

    #[tokio::test]
    async fn test_oversized_recent_window_is_reported() {
        let mut memory = manager(TokenBudget::new(50, 40, 4));
        let err = memory.append(Message::user("y".repeat(400))).await.unwrap_err();
        assert!(matches!(err, MemoryError::BudgetUnreachable { budget: 50, .. }));
    }

    #[tokio::test]
    async fn test_rejected_message_is_rolled_back() {
        let mut memory = manager(TokenBudget::new(50, 40, 4));
        memory.append(Message::user("short")).await.unwrap();
        let before = memory.messages().to_vec();

        assert!(memory.append(Message::user("y".repeat(400))).await.is_err());
        assert_eq!(memory.messages(), &before[..]);
        assert!(memory.token_estimate() <= 50);
    }

    #[tokio::test]
    async fn test_summary_is_clamped_below_high_water_mark() {
        let mut memory = manager(TokenBudget::new(1000, 200, 1));
        memory.append(Message::system("sys")).await.unwrap();
        memory.conversation.push(Message::summary("z".repeat(2000)));
        memory.conversation.push(Message::user("recent"));
        memory.recompute();

        memory.fit_summary(memory.summary_allowance());
        assert!(memory.token_estimate() <= 200);
        assert!(memory.messages()[1].is_summary());
        assert!(memory.messages()[1].content.ends_with("..."));
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_current_state() {
        let mut big = manager(TokenBudget::default());
        for _ in 0..5 {
            big.append(Message::user("w".repeat(400))).await.unwrap();
        }
        let snapshot = big.snapshot();

        let mut memory = manager(TokenBudget::new(60, 50, 4));
        memory.append(Message::user("keep me")).await.unwrap();
        assert!(memory.restore(snapshot).await.is_err());
        assert_eq!(memory.message_count(), 1);
        assert_eq!(memory.messages()[0].content, "keep me");
    }
}
