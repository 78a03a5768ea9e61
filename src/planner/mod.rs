//! 计划生成适配器：把 PromptContext 变成经过校验的 Plan

pub mod generator;
pub mod parser;
pub mod plan;
pub mod schema;

pub use generator::{PlanError, PlanGenerator, PlanReply, PlanRequest, PlanService, ScriptedPlanService, ServicePlanService};
pub use parser::{parse_plan, MAX_STEPS};
pub use plan::{Plan, ToolCall};
pub use schema::{plan_schema_json, PlanWire, StepWire};
