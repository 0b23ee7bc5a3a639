use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use super::lock;
use crate::service::gateways::{GatewayError, GatewayErrorKind};

#[derive(Debug, Default)]
struct Inner {
    failures: HashMap<String, Vec<GatewayErrorKind>>,
    calls: HashMap<String, usize>,
}

/// Counts gateway calls by operation name and fails them on demand.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    inner: Arc<Mutex<Inner>>,
}

impl FaultInjector {
    /// Fail the next `times` calls of `operation` with `kind`.
    pub fn fail(&self, operation: &str, kind: GatewayErrorKind, times: usize) {
        lock(&self.inner)
            .failures
            .entry(operation.to_string())
            .or_default()
            .extend(std::iter::repeat_n(kind, times));
    }

    pub fn clear(&self) {
        lock(&self.inner).failures.clear();
    }

    #[must_use]
    pub fn calls(&self, operation: &str) -> usize {
        lock(&self.inner).calls.get(operation).copied().unwrap_or(0)
    }

    pub(super) fn check(&self, operation: &str) -> Result<(), GatewayError> {
        let mut inner = lock(&self.inner);
        *inner.calls.entry(operation.to_string()).or_default() += 1;
        match inner.failures.get_mut(operation) {
            Some(pending) if !pending.is_empty() => {
                let kind = pending.remove(0);
                Err(GatewayError::new(
                    kind,
                    format!("Injected failure of `{operation}`"),
                ))
            }
            _ => Ok(()),
        }
    }
}
