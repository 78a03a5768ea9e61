//! 服务目录：命名远端端点、熔断、重试与后台健康检查

pub mod breaker;
pub mod directory;
pub mod health;
pub mod transport;

pub use breaker::{CircuitBreaker, CircuitState, Permit};
pub use directory::{RetryPolicy, ServiceDirectory, ServiceEndpoint};
pub use health::HealthChecker;
pub use transport::{HttpTransport, ServiceTransport, TransportError};
