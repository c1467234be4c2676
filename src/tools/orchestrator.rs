//! 工具编排器
//!
//! 一次推理步骤的 Action 批次：校验（未知工具 / 参数非法直接产出失败 Observation）-> 批次依赖图分层 ->
//! 每层内并发安全的调用并行执行（Semaphore 限流），并发不安全的调用独占执行 ->
//! 每个调用施加超时、可重试失败按指数退避重试。每次调用输出结构化审计日志（JSON）。
//!
//! 保证：每个 Action 恰好对应一个 Observation，按请求顺序返回；只有契约违规（批次内依赖成环、
//! 调用 ID 重复）才让整个批次失败。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::tools::graph::{BatchGraph, BatchNode};
use crate::tools::{
    Action, ErrorKind, InvocationId, Observation, RegisteredTool, RetryPolicy, ToolContext,
    ToolError, ToolRegistry,
};

/// 审计日志中参数预览的最大字符数
const ARGS_PREVIEW_CHARS: usize = 200;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("Cyclic batch-local dependency between tools: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),

    #[error("Duplicate invocation id in batch: {0}")]
    DuplicateInvocation(InvocationId),
}

/// 编排器配置：最大并发调用数、默认超时与默认重试策略
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_concurrency: usize,
    pub default_timeout: Duration,
    pub default_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout: Duration::from_secs(30),
            default_retry: RetryPolicy::default(),
        }
    }
}

/// 工具编排器：持有只读注册表；可被多次运行共享
pub struct ToolOrchestrator {
    registry: Arc<ToolRegistry>,
    config: OrchestratorConfig,
    permits: Arc<Semaphore>,
    /// 并发安全调用持读锁，并发不安全调用持写锁：后者在途时没有任何其他调用
    isolation: Arc<RwLock<()>>,
}

impl ToolOrchestrator {
    pub fn new(registry: Arc<ToolRegistry>, config: OrchestratorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            registry,
            config,
            permits,
            isolation: Arc::new(RwLock::new(())),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// 执行一个批次，返回与 actions 同序的 Observation
    pub async fn execute_batch(
        &self,
        actions: &[Action],
        cancel: &CancellationToken,
    ) -> Result<Vec<Observation>, OrchestrationError> {
        let mut seen = HashSet::new();
        for action in actions {
            if !seen.insert(&action.id) {
                return Err(OrchestrationError::DuplicateInvocation(action.id.clone()));
            }
        }

        // 校验：未知工具与非法参数直接得到 Observation，不参与执行
        let mut done: Vec<Option<Observation>> = vec![None; actions.len()];
        let mut resolved: Vec<Option<&RegisteredTool>> = vec![None; actions.len()];
        for (idx, action) in actions.iter().enumerate() {
            match self.registry.get(&action.tool) {
                None => {
                    tracing::warn!(tool = %action.tool, id = %action.id, "unknown tool requested");
                    done[idx] = Some(Observation::failure(
                        action,
                        ErrorKind::UnknownTool,
                        format!(
                            "Tool '{}' is not registered. Available tools: {}",
                            action.tool,
                            self.registry.tool_names().join(", ")
                        ),
                        0,
                        0,
                    ));
                }
                Some(tool) => match tool.contract().input_schema.validate(&action.args) {
                    Ok(()) => resolved[idx] = Some(tool),
                    Err(reason) => {
                        tracing::warn!(tool = %action.tool, id = %action.id, %reason, "invalid tool input");
                        done[idx] = Some(Observation::failure(
                            action,
                            ErrorKind::InvalidInput,
                            reason,
                            0,
                            0,
                        ));
                    }
                },
            }
        }

        let nodes: Vec<BatchNode<'_>> = actions
            .iter()
            .zip(&resolved)
            .map(|(action, tool)| BatchNode {
                tool: action.tool.as_str(),
                dependencies: tool
                    .map(|t| t.contract().dependencies.iter().map(String::as_str).collect())
                    .unwrap_or_default(),
            })
            .collect();
        let graph = BatchGraph::new(&nodes);
        let waves = graph.waves().map_err(|stuck| {
            let mut names: Vec<String> = stuck.iter().map(|&i| actions[i].tool.clone()).collect();
            names.sort();
            names.dedup();
            OrchestrationError::CyclicDependency(names)
        })?;

        for wave in waves {
            let pending: Vec<usize> = wave.into_iter().filter(|&i| done[i].is_none()).collect();
            if pending.is_empty() {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }

            let (parallel, isolated): (Vec<usize>, Vec<usize>) = pending
                .into_iter()
                .partition(|&i| resolved[i].is_some_and(|t| t.contract().concurrency_safe));

            // 并发安全：同层一起跑
            let futures = parallel.iter().filter_map(|&i| {
                let upstream = upstream_observations(&graph, &done, i);
                resolved[i].map(|tool| self.invoke(&actions[i], tool, upstream, cancel))
            });
            let results = join_all(futures).await;
            for (i, obs) in parallel.iter().zip(results) {
                done[*i] = Some(obs);
            }

            // 并发不安全：逐个独占执行
            for i in isolated {
                let Some(tool) = resolved[i] else { continue };
                let upstream = upstream_observations(&graph, &done, i);
                let obs = self.invoke(&actions[i], tool, upstream, cancel).await;
                done[i] = Some(obs);
            }
        }

        // 取消后尚未执行的调用统一记为 cancelled
        Ok(actions
            .iter()
            .zip(done)
            .map(|(action, obs)| {
                obs.unwrap_or_else(|| {
                    Observation::failure(action, ErrorKind::Cancelled, "batch cancelled", 0, 0)
                })
            })
            .collect())
    }

    /// 单次调用：隔离闸门 + 限流许可 + 超时 + 重试
    async fn invoke(
        &self,
        action: &Action,
        tool: &RegisteredTool,
        upstream: Vec<Observation>,
        cancel: &CancellationToken,
    ) -> Observation {
        let contract = tool.contract();
        let timeout_dur = contract.timeout.unwrap_or(self.config.default_timeout);
        let policy = contract.retry.unwrap_or(self.config.default_retry);
        let start = Instant::now();
        let elapsed_ms = |start: Instant| start.elapsed().as_millis() as u64;

        let gate = async {
            if contract.concurrency_safe {
                let shared = self.isolation.read().await;
                let permit = self.permits.acquire().await;
                (Some(shared), None, permit.ok())
            } else {
                (None, Some(self.isolation.write().await), None)
            }
        };
        let _guards = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return self.audit(action, Observation::failure(
                    action, ErrorKind::Cancelled, "cancelled before start", 0, elapsed_ms(start),
                ));
            }
            guards = gate => guards,
        };

        let args = match &action.args {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };
        let mut attempt = 0;
        let observation = loop {
            attempt += 1;
            let ctx = ToolContext {
                invocation_id: action.id.clone(),
                attempt,
                upstream: upstream.clone(),
            };
            let call = timeout(timeout_dur, tool.handler().invoke(args.clone(), ctx));
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break Observation::failure(
                        action, ErrorKind::Cancelled, "invocation cancelled", attempt, elapsed_ms(start),
                    );
                }
                r = call => r,
            };

            match result {
                Ok(Ok(output)) => {
                    break Observation::success(action, output, attempt, elapsed_ms(start));
                }
                Ok(Err(ToolError::Fatal(msg))) => {
                    break Observation::failure(action, ErrorKind::ToolFailed, msg, attempt, elapsed_ms(start));
                }
                Ok(Err(ToolError::Retryable(msg))) => {
                    if !policy.should_retry(attempt) {
                        break Observation::failure(
                            action,
                            ErrorKind::ToolFailed,
                            format!("{msg} (gave up after {attempt} attempts)"),
                            attempt,
                            elapsed_ms(start),
                        );
                    }
                    let delay = policy.delay_for(attempt);
                    tracing::debug!(tool = %action.tool, id = %action.id, attempt, ?delay, error = %msg, "retrying tool");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            break Observation::failure(
                                action, ErrorKind::Cancelled, "cancelled during retry backoff", attempt, elapsed_ms(start),
                            );
                        }
                        _ = sleep(delay) => {}
                    }
                }
                Err(_) => {
                    break Observation::failure(
                        action,
                        ErrorKind::Timeout,
                        format!("'{}' did not finish within {:?}", action.tool, timeout_dur),
                        attempt,
                        elapsed_ms(start),
                    );
                }
            }
        };

        self.audit(action, observation)
    }

    fn audit(&self, action: &Action, observation: Observation) -> Observation {
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": action.tool,
            "id": action.id,
            "ok": observation.is_success(),
            "outcome": observation.error_kind().map_or("ok", |k| k.as_str()),
            "attempts": observation.attempts,
            "duration_ms": observation.duration_ms,
            "args_preview": args_preview(&action.args),
        });
        tracing::info!(audit = %audit, "tool");
        observation
    }
}

/// 已完成的上游调用的 Observation（上游失败同样传递给下游）
fn upstream_observations(
    graph: &BatchGraph,
    done: &[Option<Observation>],
    node: usize,
) -> Vec<Observation> {
    graph
        .upstream(node)
        .iter()
        .filter_map(|&u| done[u].clone())
        .collect()
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.chars().count() > ARGS_PREVIEW_CHARS {
        format!("{}...", s.chars().take(ARGS_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}
