//! 工具注册表
//!
//! 所有工具实现 Tool trait（contract / invoke），注册时捕获一份只读的 ToolContract；
//! 启动后注册表包进 Arc，在编排器与各次运行间只读共享。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::tools::{InputSchema, RetryPolicy, ToolContext, ToolError, ToolOutput, ToolParameter};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Tool '{0}' is already registered")]
    DuplicateTool(String),

    #[error("Tool '{0}' is not registered")]
    NotRegistered(String),

    #[error("Invalid contract for tool '{tool}': {reason}")]
    InvalidContract { tool: String, reason: String },
}

/// 工具契约：名称、参数 Schema、批次内依赖、并发安全标记、默认超时与重试策略
#[derive(Clone, Debug)]
pub struct ToolContract {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    /// 同一批次内需先完成的工具名（仅用于批次内排序）
    pub dependencies: BTreeSet<String>,
    pub concurrency_safe: bool,
    /// None 时使用编排器默认值
    pub timeout: Option<Duration>,
    /// None 时使用编排器默认值
    pub retry: Option<RetryPolicy>,
}

impl ToolContract {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: InputSchema::new(),
            dependencies: BTreeSet::new(),
            concurrency_safe: true,
            timeout: None,
            retry: None,
        }
    }

    pub fn parameter(mut self, parameter: ToolParameter) -> Self {
        self.input_schema = self.input_schema.param(parameter);
        self
    }

    pub fn depends_on(mut self, tool: impl Into<String>) -> Self {
        self.dependencies.insert(tool.into());
        self
    }

    /// 标记为并发不安全：执行时不允许任何其他调用同时在途
    pub fn concurrency_unsafe(mut self) -> Self {
        self.concurrency_safe = false;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    fn check(&self) -> Result<(), RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidContract {
            tool: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.dependencies.contains(&self.name) {
            return Err(invalid("a tool cannot depend on itself"));
        }
        Ok(())
    }

    /// OpenAI function calling 格式
    pub fn to_openai_format(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema.to_json_schema(),
            }
        })
    }
}

/// 工具 trait：声明契约，异步执行（参数为已校验的 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn contract(&self) -> ToolContract;

    async fn invoke(&self, input: Value, ctx: ToolContext) -> Result<ToolOutput, ToolError>;
}

/// 注册项：注册时固定下来的契约 + 处理器
#[derive(Clone)]
pub struct RegisteredTool {
    contract: Arc<ToolContract>,
    handler: Arc<dyn Tool>,
}

impl RegisteredTool {
    pub fn contract(&self) -> &ToolContract {
        &self.contract
    }

    pub fn handler(&self) -> &Arc<dyn Tool> {
        &self.handler
    }
}

/// 工具注册表：按名称存储，名称唯一
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let contract = tool.contract();
        contract.check()?;
        if self.tools.contains_key(&contract.name) {
            return Err(RegistryError::DuplicateTool(contract.name));
        }
        tracing::debug!(tool = %contract.name, deps = ?contract.dependencies, "tool registered");
        self.tools.insert(
            contract.name.clone(),
            RegisteredTool {
                contract: Arc::new(contract),
                handler: tool,
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<(), RegistryError> {
        self.tools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RegistryError::NotRegistered(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 按名称排序，保证提示词稳定
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contracts(&self) -> Vec<ToolContract> {
        let mut contracts: Vec<ToolContract> =
            self.tools.values().map(|t| t.contract().clone()).collect();
        contracts.sort_by(|a, b| a.name.cmp(&b.name));
        contracts
    }

    /// OpenAI function calling 格式的全部 schema
    pub fn schemas(&self) -> Vec<Value> {
        self.contracts().iter().map(ToolContract::to_openai_format).collect()
    }

    /// 供 system prompt 使用的工具目录
    pub fn catalogue(&self) -> String {
        self.contracts()
            .iter()
            .map(|c| {
                let params = serde_json::to_string(&c.input_schema.to_json_schema())
                    .unwrap_or_else(|_| "{}".to_string());
                let mut line = format!("- {}: {}\n  parameters: {}", c.name, c.description, params);
                if !c.dependencies.is_empty() {
                    let deps: Vec<&str> = c.dependencies.iter().map(String::as_str).collect();
                    line.push_str(&format!("\n  runs after (same step): {}", deps.join(", ")));
                }
                line
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
