//! Integration hub: adapters by name, every call bounded by a deadline and a
//! cancellation token

use super::adapter::{IntegrationAdapter, IntegrationError};
use futures::FutureExt;
use mimir_core::{MimirError, Result};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct IntegrationHub {
    adapters: RwLock<BTreeMap<String, Arc<dyn IntegrationAdapter>>>,
}

impl IntegrationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Conflict` if an adapter of the same name is registered
    pub fn register(&self, adapter: Arc<dyn IntegrationAdapter>) -> Result<()> {
        let name = adapter.name().to_string();
        let mut adapters = self.adapters.write().unwrap_or_else(PoisonError::into_inner);
        if adapters.contains_key(&name) {
            return Err(MimirError::conflict("integration", name));
        }
        adapters.insert(name.clone(), adapter);
        tracing::info!(integration = %name, "integration registered");
        Ok(())
    }

    /// Install `adapter`, returning the one it displaced
    pub fn replace(&self, adapter: Arc<dyn IntegrationAdapter>) -> Option<Arc<dyn IntegrationAdapter>> {
        let name = adapter.name().to_string();
        let previous = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), adapter);
        tracing::info!(integration = %name, replaced = previous.is_some(), "integration installed");
        previous
    }

    pub fn unregister(&self, name: &str) -> Result<Arc<dyn IntegrationAdapter>> {
        let removed = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .ok_or_else(|| MimirError::not_found("integration", name))?;
        tracing::info!(integration = name, "integration unregistered");
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IntegrationAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Registered and reporting ready. A panicking readiness check counts as unavailable.
    pub fn is_available(&self, name: &str) -> bool {
        let Some(adapter) = self.get(name) else {
            return false;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| adapter.is_available())) {
            Ok(available) => available,
            Err(_) => {
                tracing::warn!(integration = name, "availability check panicked");
                false
            }
        }
    }

    pub async fn call(
        &self,
        name: &str,
        operation: &str,
        args: &serde_json::Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let adapter = self.get(name).ok_or_else(|| MimirError::Integration {
            integration: name.to_string(),
            message: "not registered".to_string(),
        })?;
        if !self.is_available(name) {
            return Err(MimirError::Integration {
                integration: name.to_string(),
                message: IntegrationError::Unavailable(name.to_string()).to_string(),
            });
        }

        let started = Instant::now();
        let invocation = AssertUnwindSafe(adapter.invoke(operation, args)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(integration = name, operation, "integration call cancelled");
                return Err(MimirError::Cancelled {
                    stage: format!("integration {}", name),
                });
            }
            res = tokio::time::timeout(timeout, invocation) => res,
        };
        tracing::debug!(
            integration = name,
            operation,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "integration call finished"
        );

        match outcome {
            Err(_) => Err(MimirError::Timeout {
                integration: name.to_string(),
                after_ms: timeout.as_millis() as u64,
            }),
            Ok(Err(_)) => Err(MimirError::Integration {
                integration: name.to_string(),
                message: "adapter panicked".to_string(),
            }),
            Ok(Ok(result)) => result.map_err(|e| classify(name, e)),
        }
    }
}

fn classify(name: &str, err: IntegrationError) -> MimirError {
    match err {
        IntegrationError::Timeout { after_ms } => MimirError::Timeout {
            integration: name.to_string(),
            after_ms,
        },
        IntegrationError::Cancelled => MimirError::Cancelled {
            stage: format!("integration {}", name),
        },
        other => MimirError::Integration {
            integration: name.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl IntegrationAdapter for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn invoke(
            &self,
            operation: &str,
            args: &serde_json::Value,
        ) -> std::result::Result<serde_json::Value, IntegrationError> {
            match operation {
                "echo" => Ok(args.clone()),
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!(null))
                }
                _ => Err(IntegrationError::Upstream(format!("unknown op {}", operation))),
            }
        }
    }

    struct Flaky;

    #[async_trait]
    impl IntegrationAdapter for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn is_available(&self) -> bool {
            panic!("credential store exploded")
        }

        async fn invoke(
            &self,
            _operation: &str,
            _args: &serde_json::Value,
        ) -> std::result::Result<serde_json::Value, IntegrationError> {
            Ok(json!({}))
        }
    }

    fn hub() -> IntegrationHub {
        let hub = IntegrationHub::new();
        hub.register(Arc::new(Echo)).unwrap();
        hub.register(Arc::new(Flaky)).unwrap();
        hub
    }

    #[tokio::test]
    async fn test_call_ok_and_upstream_error() {
        let hub = hub();
        let cancel = CancellationToken::new();
        let out = hub
            .call("echo", "echo", &json!({"ip": "8.8.8.8"}), Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert_eq!(out["ip"], "8.8.8.8");

        let err = hub
            .call("echo", "nope", &json!({}), Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MimirError::Integration { .. }));
    }

    #[tokio::test]
    async fn test_timeout_and_cancel() {
        let hub = hub();
        let cancel = CancellationToken::new();
        let err = hub
            .call("echo", "sleep", &json!({}), Duration::from_millis(20), &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            MimirError::Timeout {
                integration: "echo".into(),
                after_ms: 20
            }
        );

        cancel.cancel();
        let err = hub
            .call("echo", "sleep", &json!({}), Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MimirError::Cancelled { .. }));
    }

    #[test]
    fn test_panicking_availability_is_unavailable() {
        let hub = hub();
        assert!(hub.is_available("echo"));
        assert!(!hub.is_available("flaky"));
        assert!(!hub.is_available("missing"));
        assert!(matches!(
            hub.register(Arc::new(Echo)),
            Err(MimirError::Conflict { .. })
        ));
        assert_eq!(hub.names(), vec!["echo", "flaky"]);
    }
}
