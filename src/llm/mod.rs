//! LLM 层：传输抽象与实现（OpenAI 兼容 / Mock）以及重试装饰器

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use mock::MockTransport;
pub use openai::{OpenAiSettings, OpenAiTransport, TokenUsage};
pub use retry::RetryingTransport;
pub use traits::{render_transcript, LlmError, LlmTransport, SUMMARY_INSTRUCTION};
