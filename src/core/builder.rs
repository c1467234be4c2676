//! Agent 构建器：统一的 Agent 初始化逻辑
//!
//! 从 AppConfig 装配工具注册表、LLM 传输、编排器与 Planner，得到可在多次运行间共享的 AgentRuntime；
//! 每次运行再由 runtime 创建独立的 MemoryManager 与 AgentController。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{LlmTransport, MockTransport, OpenAiSettings, OpenAiTransport, RetryingTransport};
use crate::memory::MemoryManager;
use crate::react::{AgentController, Planner, RunReport, DEFAULT_SYSTEM_PROMPT};
use crate::tools::{register_builtin_tools, Tool, ToolOrchestrator, ToolRegistry};

/// 按配置创建 LLM 传输；openai 缺少 OPENAI_API_KEY 时回退到 Mock
pub fn create_transport_from_config(config: &AppConfig) -> Result<Arc<dyn LlmTransport>, AgentError> {
    match config.llm.provider.to_lowercase().as_str() {
        "mock" => Ok(Arc::new(MockTransport::new())),
        "openai" => {
            let settings = OpenAiSettings {
                model: config.llm.model.clone(),
                base_url: config.llm.base_url.clone(),
                max_tokens: config.llm.max_tokens,
                temperature: config.llm.temperature,
                request_timeout: std::time::Duration::from_secs(config.llm.request_timeout_secs),
            };
            match OpenAiTransport::from_env(settings) {
                Some(transport) => {
                    tracing::info!(model = %config.llm.model, "using OpenAI-compatible transport");
                    Ok(Arc::new(transport))
                }
                None => {
                    tracing::warn!("OPENAI_API_KEY not set, falling back to mock transport");
                    Ok(Arc::new(MockTransport::new()))
                }
            }
        }
        other => Err(AgentError::Config(format!("unknown llm provider '{other}'"))),
    }
}

/// Agent 构建器：统一配置和初始化 Agent 的各个组件
pub struct AgentBuilder {
    config: AppConfig,
    system_prompt: Option<String>,
    transport: Option<Arc<dyn LlmTransport>>,
    tools: Vec<Arc<dyn Tool>>,
    builtin_tools: bool,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            system_prompt: None,
            transport: None,
            tools: Vec::new(),
            builtin_tools: true,
        }
    }

    /// 设置系统提示词
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// 从文件加载系统提示词：app.system_prompt_path，其次 config/prompts/system.md；都没有时用内置提示
    pub fn with_system_prompt_from_file(mut self) -> Self {
        let configured = self.config.app.system_prompt_path.clone();
        self.system_prompt = configured
            .into_iter()
            .chain(["config/prompts/system.md", "../config/prompts/system.md"].map(PathBuf::from))
            .find_map(|p| std::fs::read_to_string(p).ok())
            .filter(|s| !s.trim().is_empty());
        self
    }

    /// 指定 LLM 传输（测试或自定义后端），否则按配置创建
    pub fn with_transport(mut self, transport: Arc<dyn LlmTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// 不注册内置的 echo / calculator / datetime
    pub fn without_builtin_tools(mut self) -> Self {
        self.builtin_tools = false;
        self
    }

    /// 构建工具注册表（内置工具 + 额外注册的工具）
    pub fn build_tool_registry(&self) -> Result<ToolRegistry, AgentError> {
        let mut registry = ToolRegistry::new();
        if self.builtin_tools {
            register_builtin_tools(&mut registry)?;
        }
        for tool in &self.tools {
            registry.register_arc(Arc::clone(tool))?;
        }
        Ok(registry)
    }

    pub fn build(self) -> Result<AgentRuntime, AgentError> {
        let registry = Arc::new(self.build_tool_registry()?);
        let transport = match self.transport {
            Some(t) => t,
            None => create_transport_from_config(&self.config)?,
        };
        let base_prompt = self.system_prompt.as_deref().unwrap_or(DEFAULT_SYSTEM_PROMPT);
        let planner = Arc::new(Planner::new(Arc::clone(&transport), base_prompt, &registry));
        let orchestrator = Arc::new(ToolOrchestrator::new(
            Arc::clone(&registry),
            self.config.tools.orchestrator_config(),
        ));
        tracing::info!(tools = ?registry.tool_names(), "agent runtime ready");

        Ok(AgentRuntime {
            config: self.config,
            registry,
            transport,
            planner,
            orchestrator,
        })
    }
}

/// 组装好的运行时：注册表、传输、Planner 与编排器只读共享，可服务多次（或并发的）运行
pub struct AgentRuntime {
    config: AppConfig,
    registry: Arc<ToolRegistry>,
    transport: Arc<dyn LlmTransport>,
    planner: Arc<Planner>,
    orchestrator: Arc<ToolOrchestrator>,
}

impl AgentRuntime {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn LlmTransport> {
        &self.transport
    }

    pub fn planner(&self) -> &Arc<Planner> {
        &self.planner
    }

    pub fn orchestrator(&self) -> &Arc<ToolOrchestrator> {
        &self.orchestrator
    }

    /// 新的记忆：摘要走带重试的同一传输
    pub fn new_memory(&self) -> MemoryManager {
        let summarizer = RetryingTransport::new(
            Arc::clone(&self.transport),
            self.config.agent.llm_retry.policy(),
        );
        MemoryManager::new(self.config.memory.token_budget()).with_summarizer(Arc::new(summarizer))
    }

    /// 从快照恢复记忆（按当前预算压缩）；文件不存在时返回空记忆
    pub async fn load_memory(&self, path: &Path) -> Result<MemoryManager, AgentError> {
        let mut memory = self.new_memory();
        if path.exists() {
            let outcome = memory.load(path).await?;
            tracing::info!(
                path = %path.display(),
                messages = memory.message_count(),
                ?outcome,
                "session restored"
            );
        }
        Ok(memory)
    }

    pub fn controller(&self, memory: MemoryManager) -> AgentController {
        AgentController::new(
            Arc::clone(&self.planner),
            Arc::clone(&self.orchestrator),
            memory,
            self.config.agent.controller_config(),
        )
    }

    /// 便捷入口：以给定记忆与取消令牌执行一次运行
    pub async fn run(&self, goal: &str, memory: MemoryManager, cancel: CancellationToken) -> RunReport {
        self.controller(memory).with_cancel_token(cancel).run(goal).await
    }
}
