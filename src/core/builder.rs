//! 运行时构建器：从 AppConfig 一次性装配所有组件
//!
//! Runtime 是显式的上下文对象，持有服务目录、审计、总线、权限闸门、工具注册表、
//! 上下文组装、计划生成、执行器与 Dispatcher；没有全局单例。
//! 各协作方（传输层、确认通道、计划服务、知识检索、审计 sink、回复生成）都可替换，便于测试。

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, AuditSink, JsonlFileSink, MemorySink};
use crate::bus::PerceptionBus;
use crate::config::AppConfig;
use crate::context::{ContextAssembler, InMemoryRetriever, KnowledgeRetriever, ServiceRetriever};
use crate::core::{OrchestratorError, SessionSupervisor};
use crate::dispatcher::{Dispatcher, InteractionEnvelope, InteractionOutcome, Responder, TemplateResponder};
use crate::planner::{PlanGenerator, PlanService, ServicePlanService};
use crate::security::{
    AutoConfirm, ConfirmationChannel, DenyConfirm, DenyPolicy, GrantStore, PermissionGate,
};
use crate::services::{HealthChecker, HttpTransport, ServiceDirectory, ServiceTransport};
use crate::tools::{builtin_tools, ToolExecutor, ToolRegistry};

/// 装配完成的编排核心
pub struct Runtime {
    pub config: AppConfig,
    pub directory: Arc<ServiceDirectory>,
    pub audit: Arc<AuditLog>,
    pub bus: PerceptionBus,
    pub grants: Arc<GrantStore>,
    pub gate: Arc<PermissionGate>,
    pub sessions: Arc<SessionSupervisor>,
    pub registry: Arc<ToolRegistry>,
    pub assembler: Arc<ContextAssembler>,
    pub generator: Arc<PlanGenerator>,
    pub executor: Arc<ToolExecutor>,
    pub dispatcher: Arc<Dispatcher>,
    root: CancellationToken,
}

impl Runtime {
    pub async fn handle(&self, envelope: InteractionEnvelope) -> Result<InteractionOutcome, OrchestratorError> {
        self.dispatcher.handle(envelope).await
    }

    /// 启动后台健康检查，随根令牌取消而停止
    pub fn spawn_health_checker(&self) -> JoinHandle<()> {
        let services = &self.config.services;
        HealthChecker::new(
            self.directory.clone(),
            services.health_interval(),
            services.health_timeout(),
        )
        .spawn(self.root.child_token())
    }

    /// 关闭：取消所有会话、关闭总线、落盘审计
    pub fn close(&self) -> Result<(), OrchestratorError> {
        self.sessions.cancel_all();
        self.bus.close();
        self.audit.flush()
    }
}

pub struct RuntimeBuilder {
    config: AppConfig,
    transport: Option<Arc<dyn ServiceTransport>>,
    confirmation: Option<Arc<dyn ConfirmationChannel>>,
    plan_service: Option<Arc<dyn PlanService>>,
    retriever: Option<Arc<dyn KnowledgeRetriever>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    responder: Option<Arc<dyn Responder>>,
    root: CancellationToken,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            transport: None,
            confirmation: None,
            plan_service: None,
            retriever: None,
            audit_sink: None,
            responder: None,
            root: CancellationToken::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn ServiceTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_confirmation(mut self, channel: Arc<dyn ConfirmationChannel>) -> Self {
        self.confirmation = Some(channel);
        self
    }

    pub fn with_plan_service(mut self, service: Arc<dyn PlanService>) -> Self {
        self.plan_service = Some(service);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn KnowledgeRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    /// 进程级根令牌（通常来自 ShutdownManager）
    pub fn with_root_token(mut self, root: CancellationToken) -> Self {
        self.root = root;
        self
    }

    fn build_audit(&self) -> Result<Arc<AuditLog>, OrchestratorError> {
        let capacity = self.config.audit.recent_capacity;
        let sink: Arc<dyn AuditSink> = match (&self.audit_sink, &self.config.audit.path) {
            (Some(sink), _) => sink.clone(),
            (None, Some(path)) => {
                let sink = JsonlFileSink::open(path).map_err(|e| {
                    OrchestratorError::AuditUnwritable(format!("{}: {e}", path.display()))
                })?;
                tracing::info!(path = %path.display(), "audit log opened");
                Arc::new(sink)
            }
            (None, None) => {
                tracing::warn!("no audit path configured, audit entries are kept in memory only");
                Arc::new(MemorySink::new())
            }
        };
        Ok(Arc::new(AuditLog::new(sink, capacity)))
    }

    pub fn build(self) -> Result<Runtime, OrchestratorError> {
        let cfg = &self.config;

        let transport = self
            .transport
            .clone()
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let directory = Arc::new(ServiceDirectory::from_config(&cfg.services, transport));
        let audit = self.build_audit()?;
        let bus = PerceptionBus::from_config(&cfg.bus);
        let grants = Arc::new(GrantStore::new());

        let policy = DenyPolicy::from_config(&cfg.permissions)
            .map_err(|e| OrchestratorError::Config(format!("invalid deny rule: {e}")))?;
        let confirmation: Arc<dyn ConfirmationChannel> = match &self.confirmation {
            Some(channel) => channel.clone(),
            None if cfg.app.non_interactive => Arc::new(AutoConfirm),
            None => Arc::new(DenyConfirm),
        };
        let gate = Arc::new(PermissionGate::new(
            policy,
            audit.clone(),
            confirmation,
            grants.clone(),
            cfg.permissions.confirmation_timeout(),
        ));

        let retriever: Arc<dyn KnowledgeRetriever> = match (&self.retriever, &cfg.context.knowledge_service) {
            (Some(r), _) => r.clone(),
            (None, Some(service)) if directory.contains(service) => Arc::new(ServiceRetriever::new(
                directory.clone(),
                service.clone(),
                cfg.context.retrieval_timeout(),
            )),
            _ => Arc::new(InMemoryRetriever::default()),
        };

        let registry = Arc::new(builtin_tools(&directory, retriever.clone()));
        let sessions = Arc::new(
            SessionSupervisor::with_root(cfg.app.max_context_turns, self.root.clone())
                .with_idle_timeout(cfg.app.session_idle_timeout()),
        );
        let assembler = Arc::new(ContextAssembler::new(
            retriever,
            audit.clone(),
            grants.clone(),
            registry.clone(),
            &cfg.context,
        ));

        let plan_service: Arc<dyn PlanService> = match &self.plan_service {
            Some(s) => s.clone(),
            None => Arc::new(ServicePlanService::new(
                directory.clone(),
                cfg.planner.service.clone(),
                cfg.planner.timeout(),
            )),
        };
        let generator = Arc::new(PlanGenerator::new(
            plan_service,
            registry.clone(),
            cfg.planner.timeout(),
            cfg.planner.max_steps,
        ));

        let executor = Arc::new(ToolExecutor::new(
            registry.clone(),
            gate.clone(),
            audit.clone(),
            bus.clone(),
            cfg.services.default_timeout(),
        ));

        let responder: Arc<dyn Responder> = self
            .responder
            .clone()
            .unwrap_or_else(|| Arc::new(TemplateResponder::new()));

        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            assembler.clone(),
            generator.clone(),
            executor.clone(),
            responder,
            bus.clone(),
        ));

        tracing::info!(
            tools = registry.len(),
            services = ?directory.service_names(),
            "runtime assembled"
        );

        Ok(Runtime {
            config: self.config,
            directory,
            audit,
            bus,
            grants,
            gate,
            sessions,
            registry,
            assembler,
            generator,
            executor,
            dispatcher,
            root: self.root,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_build_with_file_audit() {
        let dir = tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.audit.path = Some(dir.path().join("audit").join("audit.jsonl"));
        let rt = RuntimeBuilder::new(cfg).build().unwrap();
        assert_eq!(rt.registry.len(), 11);
        assert!(rt.directory.contains("system_executor"));
        assert!(dir.path().join("audit").exists());
    }

    #[tokio::test]
    async fn test_close_cancels_sessions_and_bus() {
        let mut cfg = AppConfig::default();
        cfg.audit.path = None;
        let rt = RuntimeBuilder::new(cfg).build().unwrap();
        let mut sub = rt.bus.subscribe("watcher", crate::bus::EventFilter::all());
        let token = rt.sessions.session("s1").interaction_token();
        rt.close().unwrap();
        assert!(token.is_cancelled());
        assert!(sub.recv().await.is_none());
    }
}
