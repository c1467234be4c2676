//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HELIOS__*` 覆盖（双下划线表示嵌套，如 `HELIOS__LLM__PROVIDER=mock`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::memory::TokenBudget;
use crate::react::ControllerConfig;
use crate::tools::{OrchestratorConfig, RetryPolicy};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
}

/// [app] 段：应用名、system prompt 文件、会话快照路径
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 未设置时依次尝试 config/prompts/system.md 与内置提示
    pub system_prompt_path: Option<PathBuf>,
    /// 设置后每次运行前恢复、运行后保存对话
    pub session_path: Option<PathBuf>,
}

/// [llm] 段：后端选择与请求参数
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / mock；openai 且未设置 OPENAI_API_KEY 时回退到 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// 重试参数（毫秒）
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// [agent] 段：循环上限与解析重试
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_max_parse_retries")]
    pub max_parse_retries: u32,
    #[serde(default)]
    pub llm_retry: RetrySection,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_parse_retries: default_max_parse_retries(),
            llm_retry: RetrySection::default(),
        }
    }
}

fn default_max_iterations() -> usize {
    10
}

fn default_max_parse_retries() -> u32 {
    2
}

impl AgentSection {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            max_iterations: self.max_iterations.max(1),
            max_parse_retries: self.max_parse_retries,
            llm_retry: self.llm_retry.policy(),
        }
    }
}

/// [tools] 段：默认超时、并发上限、默认重试
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub retry: RetrySection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_tool_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            retry: RetrySection::default(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    4
}

impl ToolsSection {
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrency: self.max_concurrency.max(1),
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            default_retry: self.retry.policy(),
        }
    }
}

/// [memory] 段：上下文预算（token）
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_context_budget")]
    pub context_budget: usize,
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark: usize,
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            context_budget: default_context_budget(),
            high_water_mark: default_high_water_mark(),
            keep_recent: default_keep_recent(),
        }
    }
}

fn default_context_budget() -> usize {
    8000
}

fn default_high_water_mark() -> usize {
    6000
}

fn default_keep_recent() -> usize {
    6
}

impl MemorySection {
    pub fn token_budget(&self) -> TokenBudget {
        TokenBudget::new(self.context_budget, self.high_water_mark, self.keep_recent)
    }
}

/// 从 config 目录加载配置，环境变量 HELIOS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（可覆盖前面的键；显式指定的文件必须存在）
/// 3. 最后叠加环境变量 HELIOS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{name}.toml")).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HELIOS")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.agent.max_iterations, 10);
        assert_eq!(config.agent.max_parse_retries, 2);
        assert_eq!(config.tools.max_concurrency, 4);
        assert_eq!(config.memory.token_budget().high_water_mark, 6000);
        assert_eq!(config.llm.provider, "openai");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("helios.toml");
        std::fs::write(
            &path,
            "[llm]\nprovider = \"mock\"\n\n[agent]\nmax_iterations = 3\n\n[tools.retry]\nmax_attempts = 5\n",
        )
        .unwrap();
        let config = load_config(Some(path)).unwrap();
        assert_eq!(config.llm.provider, "mock");
        assert_eq!(config.agent.max_iterations, 3);
        assert_eq!(config.tools.retry.max_attempts, 5);
        assert_eq!(config.tools.retry.base_delay_ms, 200);
        assert_eq!(config.memory.keep_recent, 6);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/helios.toml"))).is_err());
    }
}
