//! ReAct 主循环（Agent Controller）
//!
//! 显式状态机：Start → Reasoning → Acting → Observing → (Reasoning | Done | Failed)。
//! Reasoning 阶段向 LLM 要下一步，解析失败带纠正提示重试，瞬时错误退避重试；Acting 把本步全部 Action
//! 作为一个批次交给编排器；Observing 把 Observation 写回记忆并追加轨迹。
//! 可选 event_tx：向前端推送 Thinking / ThoughtDelta / Thought / ActionRequested / Observation / Finished 等事件；
//! 设置后推理走流式接口。LLM 请求、退避等待与记忆压缩都与取消令牌竞争。

use std::sync::Arc;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, AgentState, RecoveryAction, RecoveryEngine, RunOutcome};
use crate::llm::LlmError;
use crate::memory::{CompactionOutcome, MemoryManager, Message};
use crate::react::events::send_event;
use crate::react::{parse_llm_output, IterationRecord, Planner, PlannerOutput, ReactEvent, ReasoningTrace};
use crate::tools::{Action, RetryPolicy, ToolOrchestrator};

/// 控制器配置
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// 最多执行多少轮 Acting
    pub max_iterations: usize,
    /// 同一推理步内解析失败后的重试次数
    pub max_parse_retries: u32,
    /// 瞬时 LLM 错误的重试策略
    pub llm_retry: RetryPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_parse_retries: 2,
            llm_retry: RetryPolicy::default(),
        }
    }
}

/// 一次运行的结果：终态 + 完整轨迹 + 交还的记忆（供保存会话）
pub struct RunReport {
    pub outcome: RunOutcome,
    pub trace: ReasoningTrace,
    pub memory: MemoryManager,
}

/// Agent 控制器：一次运行一个实例，run 消耗自身，到达终态后不可复用
pub struct AgentController {
    planner: Arc<Planner>,
    orchestrator: Arc<ToolOrchestrator>,
    memory: MemoryManager,
    config: ControllerConfig,
    recovery: RecoveryEngine,
    cancel_token: CancellationToken,
    event_tx: Option<UnboundedSender<ReactEvent>>,
    state: AgentState,
    trace: ReasoningTrace,
}

/// 同一推理步内各类失败的连续次数
#[derive(Default)]
struct FailureCounts {
    parse: u32,
    llm: u32,
    overflow: u32,
}

impl FailureCounts {
    fn record(&mut self, err: &AgentError) -> u32 {
        let counter = match err {
            AgentError::Parse(_) => &mut self.parse,
            AgentError::Llm(LlmError::ContextWindowExceeded) => &mut self.overflow,
            _ => &mut self.llm,
        };
        *counter += 1;
        *counter
    }
}

impl AgentController {
    pub fn new(
        planner: Arc<Planner>,
        orchestrator: Arc<ToolOrchestrator>,
        memory: MemoryManager,
        config: ControllerConfig,
    ) -> Self {
        let recovery = RecoveryEngine::new(config.max_parse_retries, config.llm_retry);
        Self {
            planner,
            orchestrator,
            memory,
            config,
            recovery,
            cancel_token: CancellationToken::new(),
            event_tx: None,
            state: AgentState::Start,
            trace: ReasoningTrace::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn with_event_tx(mut self, tx: UnboundedSender<ReactEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    /// 执行到终态
    pub async fn run(mut self, goal: &str) -> RunReport {
        let (init_prompt, init_completion, _) = self.planner.token_usage();

        let outcome = match self.drive(goal).await {
            Ok(answer) => {
                self.transition(AgentState::Done);
                RunOutcome::Done { answer }
            }
            Err(e) => {
                self.transition(AgentState::Failed);
                let reason = e.failure_reason();
                tracing::warn!(%reason, error = %e, "run failed");
                RunOutcome::failed(reason, e.to_string())
            }
        };

        let (prompt, completion, _) = self.planner.token_usage();
        tracing::info!(
            iterations = self.trace.len(),
            prompt_tokens = prompt.saturating_sub(init_prompt),
            completion_tokens = completion.saturating_sub(init_completion),
            done = outcome.is_done(),
            "run finished"
        );
        send_event(&self.event_tx, ReactEvent::Finished { outcome: outcome.clone() });

        RunReport {
            outcome,
            trace: self.trace,
            memory: self.memory,
        }
    }

    fn transition(&mut self, next: AgentState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    async fn drive(&mut self, goal: &str) -> Result<String, AgentError> {
        // Start：补 system prompt（恢复的会话已有则保留），写入目标，本次运行的轮数从 0 计
        if !self.memory.messages().iter().any(Message::is_system_prompt) {
            self.remember(Message::system(self.planner.system_prompt())).await?;
        }
        self.remember(Message::user(goal)).await?;
        let mut iteration = 0usize;

        loop {
            self.transition(AgentState::Reasoning);
            send_event(
                &self.event_tx,
                ReactEvent::StepUpdate {
                    step: iteration + 1,
                    max_steps: self.config.max_iterations,
                },
            );

            let (thought, requests) = match self.reason().await? {
                PlannerOutput::FinalAnswer { thought, answer } => {
                    send_event(&self.event_tx, ReactEvent::Thought { text: thought.clone() });
                    self.remember(Message::assistant(thought)).await?;
                    return Ok(answer);
                }
                PlannerOutput::Act { thought, actions } => (thought, actions),
            };
            send_event(&self.event_tx, ReactEvent::Thought { text: thought.clone() });

            // 调用 ID 一律由控制器分配，保证运行内唯一
            let actions: Vec<Action> = requests
                .into_iter()
                .map(|r| Action::new(r.tool, r.args))
                .collect();
            for action in &actions {
                send_event(
                    &self.event_tx,
                    ReactEvent::ActionRequested {
                        id: action.id.clone(),
                        tool: action.tool.clone(),
                        args: action.args.clone(),
                    },
                );
            }
            self.remember(Message::assistant_with_actions(thought.clone(), actions.clone()))
                .await?;

            // Acting
            self.transition(AgentState::Acting);
            let batch_token = self.cancel_token.child_token();
            let observations = self
                .orchestrator
                .execute_batch(&actions, &batch_token)
                .await?;

            // Observing
            self.transition(AgentState::Observing);
            for obs in &observations {
                send_event(&self.event_tx, ReactEvent::observation(obs));
                self.remember(Message::observation(obs)).await?;
            }
            iteration += 1;
            self.memory.advance_iteration();
            let record = IterationRecord {
                index: iteration,
                thought,
                actions,
                observations,
            };
            send_event(
                &self.event_tx,
                ReactEvent::IterationCompleted {
                    record: record.clone(),
                },
            );
            self.trace.push(record);

            if self.cancel_token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            if iteration >= self.config.max_iterations {
                return Err(AgentError::IterationLimit(self.config.max_iterations));
            }
        }
    }

    /// Reasoning：请求 LLM 并解析，按 RecoveryEngine 的建议重试或放弃
    async fn reason(&mut self) -> Result<PlannerOutput, AgentError> {
        let mut failures = FailureCounts::default();
        let mut hint: Option<String> = None;

        loop {
            if self.cancel_token.is_cancelled() {
                return Err(AgentError::Cancelled);
            }
            send_event(&self.event_tx, ReactEvent::Thinking);
            let context = self.memory.context_for_next_step();

            let reply = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => return Err(AgentError::Cancelled),
                reply = self.request_reply(&context, hint.as_deref()) => reply,
            };

            let err = match reply {
                Ok(text) => match parse_llm_output(&text) {
                    Ok(output) => return Ok(output),
                    Err(e) => {
                        tracing::warn!(error = %e, "unparseable LLM reply");
                        AgentError::Parse(e)
                    }
                },
                Err(e) => AgentError::Llm(e),
            };

            let attempt = failures.record(&err);
            let action = self.recovery.handle(&err, attempt);
            send_event(
                &self.event_tx,
                ReactEvent::Recovery {
                    action: action.name().to_string(),
                    detail: err.to_string(),
                },
            );

            match action {
                RecoveryAction::RetryWithPrompt(prompt) => hint = Some(prompt),
                RecoveryAction::Retry(delay) => {
                    tracing::warn!(attempt, ?delay, error = %err, "retrying LLM call");
                    tokio::select! {
                        biased;
                        _ = self.cancel_token.cancelled() => return Err(AgentError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::SummarizeAndPrune => {
                    let outcome = tokio::select! {
                        biased;
                        _ = self.cancel_token.cancelled() => return Err(AgentError::Cancelled),
                        outcome = self.memory.summarize_now() => outcome?,
                    };
                    self.report_compaction(&outcome);
                }
                RecoveryAction::Abort(_) => return Err(err),
            }
        }
    }

    /// 有事件订阅者时走流式接口，增量以 ThoughtDelta 推送
    async fn request_reply(&self, context: &[Message], hint: Option<&str>) -> Result<String, LlmError> {
        if self.event_tx.is_none() {
            return self.planner.reason(context, hint).await;
        }
        let (delta_tx, mut delta_rx) = unbounded_channel();
        let forward = async {
            while let Some(text) = delta_rx.recv().await {
                send_event(&self.event_tx, ReactEvent::ThoughtDelta { text });
            }
        };
        let (reply, ()) = tokio::join!(
            self.planner.reason_streaming(context, hint, delta_tx),
            forward
        );
        reply
    }

    /// 写入记忆；发生压缩时推送事件。压缩中的摘要请求同样响应取消
    async fn remember(&mut self, message: Message) -> Result<(), AgentError> {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => return Err(AgentError::Cancelled),
            outcome = self.memory.append(message) => outcome?,
        };
        self.report_compaction(&outcome);
        Ok(())
    }

    fn report_compaction(&self, outcome: &CompactionOutcome) {
        let (replaced, tokens_before, tokens_after, pruned) = match *outcome {
            CompactionOutcome::Skipped => return,
            CompactionOutcome::Summarized {
                replaced,
                tokens_before,
                tokens_after,
            } => (replaced, tokens_before, tokens_after, false),
            CompactionOutcome::Pruned {
                replaced,
                tokens_before,
                tokens_after,
            } => (replaced, tokens_before, tokens_after, true),
        };
        tracing::info!(replaced, tokens_before, tokens_after, pruned, "memory compacted");
        send_event(
            &self.event_tx,
            ReactEvent::MemorySummarized {
                replaced,
                tokens_before,
                tokens_after,
                pruned,
            },
        );
    }
}
