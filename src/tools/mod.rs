//! 工具层：注册表、参数 schema、步骤引用模板、内置目录与执行器

pub mod catalogue;
pub mod executor;
pub mod registry;
pub mod result;
pub mod schema;
pub mod template;

pub use catalogue::builtin_tools;
pub use executor::{ExecutionContext, ToolExecutor};
pub use registry::{ServiceAction, ToolDescriptor, ToolHandler, ToolRegistry, ToolSpec};
pub use result::{ToolResult, ToolStatus};
pub use schema::{ArgSchema, ArgSpec, ArgType};
