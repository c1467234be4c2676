pub mod calculator;
pub mod datetime;
pub mod echo;
pub mod graph;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod types;

pub use calculator::CalculatorTool;
pub use datetime::DateTimeTool;
pub use echo::EchoTool;
pub use graph::{BatchGraph, BatchNode};
pub use orchestrator::{OrchestrationError, OrchestratorConfig, ToolOrchestrator};
pub use registry::{RegisteredTool, RegistryError, Tool, ToolContract, ToolRegistry};
pub use retry::RetryPolicy;
pub use schema::{reasoning_format_schema_json, InputSchema, ParamType, ToolParameter};
pub use types::{
    Action, ErrorKind, InvocationId, Observation, Outcome, ToolContext, ToolError, ToolOutput,
};

/// 内置工具集合（echo / calculator / datetime）
pub fn register_builtin_tools(registry: &mut ToolRegistry) -> Result<(), RegistryError> {
    registry.register(EchoTool)?;
    registry.register(CalculatorTool)?;
    registry.register(DateTimeTool)?;
    Ok(())
}
