//! Conductor - 智能体编排核心
//!
//! 把一次用户交互变成经过校验的动作计划，在显式权限控制下对一组网络服务执行，
//! 再把结果折叠成自然语言回复；下游任何服务出问题时都可观测、可恢复。
//!
//! 模块划分：
//! - **audit**: 只追加的审计日志（JSON Lines / 内存）、用户统计与安全报告
//! - **bus**: 感知总线（有界订阅邮箱、背压策略、事件历史）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **context**: 会话窗口、知识检索、提示上下文组装
//! - **core**: 错误与恢复、交互状态机、会话监管、优雅关闭、运行时装配
//! - **dispatcher**: 交互信封、启发式降级、回复生成、状态机驱动
//! - **planner**: 计划线格式、严格解析与一次修复
//! - **security**: 风险等级、拒绝规则、权限闸门、确认通道、授权
//! - **services**: 服务目录、熔断、重试、健康检查
//! - **tools**: 工具注册表、参数 schema、步骤引用、执行器

pub mod audit;
pub mod bus;
pub mod config;
pub mod context;
pub mod core;
pub mod dispatcher;
pub mod observability;
pub mod planner;
pub mod security;
pub mod services;
pub mod tools;

pub use crate::core::{OrchestratorError, Runtime, RuntimeBuilder};
pub use crate::dispatcher::{InteractionEnvelope, InteractionOutcome, Source};
