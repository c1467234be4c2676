//! ReAct 过程事件：用于实时展示思考、工具调用、观察与终态

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::RunOutcome;
use crate::react::IterationRecord;
use crate::tools::{InvocationId, Observation};

/// Observation 预览最大字符数
const PREVIEW_CHARS: usize = 200;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// ReAct 步数更新（当前第几步）
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用 LLM 思考
    Thinking,
    /// 流式推理的增量文本（按到达顺序拼接即为完整回复）
    ThoughtDelta { text: String },
    /// LLM 的推理内容
    Thought { text: String },
    /// 请求调用工具
    ActionRequested {
        id: InvocationId,
        tool: String,
        args: Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        id: InvocationId,
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 一轮完成
    IterationCompleted { record: IterationRecord },
    /// 记忆压缩
    MemorySummarized {
        replaced: usize,
        tokens_before: usize,
        tokens_after: usize,
        pruned: bool,
    },
    /// 错误恢复动作（RetryWithPrompt / Retry / SummarizeAndPrune / Abort）
    Recovery { action: String, detail: String },
    /// 终态
    Finished { outcome: RunOutcome },
}

impl ReactEvent {
    pub(crate) fn observation(obs: &Observation) -> Self {
        let content = obs.to_message_content();
        let preview = if content.chars().count() > PREVIEW_CHARS {
            format!("{}...", content.chars().take(PREVIEW_CHARS).collect::<String>())
        } else {
            content
        };
        ReactEvent::Observation {
            id: obs.invocation_id.clone(),
            tool: obs.tool.clone(),
            ok: obs.is_success(),
            preview,
        }
    }
}

pub(crate) fn send_event(tx: &Option<UnboundedSender<ReactEvent>>, ev: ReactEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
