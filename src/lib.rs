//! Helios - ReAct 推理智能体
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误与恢复、状态机类型、运行取消、组件装配
//! - **llm**: LLM 传输抽象与实现（OpenAI 兼容 / Mock / 重试装饰）
//! - **memory**: 对话、Token 预算、摘要压缩与快照持久化
//! - **react**: Planner（提示词与解析）、推理轨迹、ReAct 主循环（Agent Controller）
//! - **tools**: 工具契约、注册表、批次依赖图与并发编排器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{AgentBuilder, AgentError, AgentRuntime, FailureReason, RunFailure, RunOutcome};
pub use memory::{MemoryManager, Message, Role};
pub use react::{AgentController, IterationRecord, RunReport};
pub use tools::{Action, Observation, Tool, ToolContract, ToolOrchestrator, ToolRegistry};
