//! 认知层：Planner（提示与解析）、推理轨迹、过程事件、ReAct 主循环

pub mod events;
pub mod loop_;
pub mod planner;
pub mod trace;

pub use events::ReactEvent;
pub use loop_::{AgentController, ControllerConfig, RunReport};
pub use planner::{
    build_system_prompt, parse_llm_output, ActionRequest, ParseError, Planner, PlannerOutput,
    DEFAULT_SYSTEM_PROMPT,
};
pub use trace::{IterationRecord, ReasoningTrace};
