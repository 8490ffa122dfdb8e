//! Fault-tolerance registry: maps logical service names to resilience
//! policies and dispatches stage calls through them.
//!
//! The policy is a sum type with exactly one payload per variant, so a
//! mismatched strategy/config pair cannot be constructed. Unknown or
//! disabled services pass straight through; the registry never blocks a
//! call it has no policy for.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::{Job, StageFn, StageOutput};
use crate::errors::DubflowError;
use crate::resilience::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::resilience::bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics};
use crate::resilience::retry::{RetryConfig, RetryExecutor};

/// The resilience policy configured for one service.
#[derive(Clone)]
pub enum ServicePolicy {
    /// No shielding: the first failure propagates.
    FailFast,
    /// Retry with backoff.
    Retry(RetryConfig),
    /// Circuit breaker.
    CircuitBreaker(CircuitBreakerConfig),
    /// Concurrency-bounded bulkhead.
    Bulkhead(BulkheadConfig),
    /// On failure, invoke this fallback with the same job and return its
    /// result instead.
    Fallback(StageFn),
}

impl ServicePolicy {
    /// A short name for the strategy kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FailFast => "fail_fast",
            Self::Retry(_) => "retry",
            Self::CircuitBreaker(_) => "circuit_breaker",
            Self::Bulkhead(_) => "bulkhead",
            Self::Fallback(_) => "fallback",
        }
    }
}

impl std::fmt::Debug for ServicePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ServicePolicy").field(&self.kind()).finish()
    }
}

/// Read-only per-service metrics.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    /// The service name.
    pub service: String,
    /// The strategy kind.
    pub strategy: &'static str,
    /// Whether the policy is currently applied.
    pub enabled: bool,
    /// Breaker metrics, for circuit-breaker services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerMetrics>,
    /// Bulkhead metrics, for bulkhead services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadMetrics>,
}

enum Strategy {
    FailFast,
    Retry(RetryExecutor),
    CircuitBreaker(CircuitBreaker),
    Bulkhead(Bulkhead),
    Fallback(StageFn),
}

struct ServiceEntry {
    kind: &'static str,
    strategy: Strategy,
    enabled: AtomicBool,
}

/// Registry of per-service resilience policies.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a policy for a service, replacing any previous one.
    ///
    /// The backing primitive is constructed here, once, so its state
    /// (breaker window, bulkhead counters) lives as long as the entry.
    pub fn register(&self, service: impl Into<String>, policy: ServicePolicy) {
        let service = service.into();
        let kind = policy.kind();
        let strategy = match policy {
            ServicePolicy::FailFast => Strategy::FailFast,
            ServicePolicy::Retry(config) => Strategy::Retry(RetryExecutor::new(config)),
            ServicePolicy::CircuitBreaker(config) => {
                Strategy::CircuitBreaker(CircuitBreaker::new(service.clone(), config))
            }
            ServicePolicy::Bulkhead(config) => {
                Strategy::Bulkhead(Bulkhead::new(service.clone(), config))
            }
            ServicePolicy::Fallback(fallback) => Strategy::Fallback(fallback),
        };

        let entry = Arc::new(ServiceEntry {
            kind,
            strategy,
            enabled: AtomicBool::new(true),
        });

        tracing::info!(service = %service, strategy = kind, "registered resilience policy");
        self.services.write().insert(service, entry);
    }

    /// Enables or disables a service's policy.
    ///
    /// Takes effect on the next `execute` call; in-flight calls are not
    /// affected. Returns false if the service is unknown.
    pub fn set_enabled(&self, service: &str, enabled: bool) -> bool {
        let services = self.services.read();
        match services.get(service) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::SeqCst);
                tracing::info!(service, enabled, "resilience policy toggled");
                true
            }
            None => false,
        }
    }

    /// Runs a stage function for `job` through the service's policy.
    ///
    /// Unregistered or disabled services execute the function directly.
    ///
    /// # Errors
    ///
    /// Returns admission refusals from the configured primitive, or the
    /// stage function's own error (unwrapped).
    pub async fn execute(
        &self,
        service: &str,
        func: &StageFn,
        job: &Job,
    ) -> Result<StageOutput, DubflowError> {
        let entry = self.services.read().get(service).cloned();

        let Some(entry) = entry else {
            tracing::debug!(service, "no resilience policy registered, executing directly");
            return func(job.clone()).await;
        };

        if !entry.enabled.load(Ordering::SeqCst) {
            tracing::debug!(service, "resilience policy disabled, executing directly");
            return func(job.clone()).await;
        }

        match &entry.strategy {
            Strategy::FailFast => func(job.clone()).await,
            Strategy::Retry(executor) => {
                let job = job.clone();
                executor.execute(|| func(job.clone())).await
            }
            Strategy::CircuitBreaker(breaker) => breaker.call(|| func(job.clone())).await,
            Strategy::Bulkhead(bulkhead) => bulkhead.execute(func(job.clone())).await,
            Strategy::Fallback(fallback) => match func(job.clone()).await {
                Ok(output) => Ok(output),
                Err(err) => {
                    tracing::info!(
                        service,
                        error = %err,
                        "primary call failed, invoking fallback"
                    );
                    fallback(job.clone()).await
                }
            },
        }
    }

    /// Returns metrics for one registered service.
    #[must_use]
    pub fn service_metrics(&self, service: &str) -> Option<ServiceMetrics> {
        let entry = self.services.read().get(service).cloned()?;

        let (circuit_breaker, bulkhead) = match &entry.strategy {
            Strategy::CircuitBreaker(breaker) => (Some(breaker.metrics()), None),
            Strategy::Bulkhead(bh) => (None, Some(bh.metrics())),
            _ => (None, None),
        };

        Some(ServiceMetrics {
            service: service.to_string(),
            strategy: entry.kind,
            enabled: entry.enabled.load(Ordering::SeqCst),
            circuit_breaker,
            bulkhead,
        })
    }

    /// Returns metrics for every registered service.
    #[must_use]
    pub fn all_metrics(&self) -> HashMap<String, ServiceMetrics> {
        let names: Vec<String> = self.services.read().keys().cloned().collect();
        names
            .into_iter()
            .filter_map(|name| self.service_metrics(&name).map(|m| (name, m)))
            .collect()
    }

    /// Returns the registered service names.
    #[must_use]
    pub fn registered_services(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.registered_services())
            .finish()
    }
}
