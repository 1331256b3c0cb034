//! Admission gate in front of metadata mutations.
//!
//! Every subscription-store operation acquires a token from a bounded bucket
//! before running and returns it on every exit path. When the bucket is
//! saturated the gate rejects synchronously with
//! [`DriftmqError::Overloaded`] instead of queuing; callers that must
//! eventually succeed retry with a fixed backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{DriftmqError, Result};

/// Bounded-concurrency token bucket.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    backoff: Duration,
}

/// A held admission token. Dropping it releases the token, which covers
/// success and failure paths alike.
#[derive(Debug)]
pub struct AdmissionToken {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(size: usize, backoff: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            backoff,
        }
    }

    /// Acquire a token without waiting. Saturation returns `Overloaded`.
    pub fn try_token(&self) -> Result<AdmissionToken> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(AdmissionToken { _permit: permit }),
            Err(_) => Err(DriftmqError::Overloaded),
        }
    }

    /// Acquire a token, retrying with the configured backoff until one is
    /// available. Used by callers that must eventually succeed, such as the
    /// clean-session delete during registration.
    pub async fn token_retrying(&self) -> AdmissionToken {
        loop {
            match self.try_token() {
                Ok(token) => return token,
                Err(_) => tokio::time::sleep(self.backoff).await,
            }
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Number of currently available tokens.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_released_on_drop() {
        let gate = AdmissionGate::new(1, Duration::from_millis(100));
        {
            let _token = gate.try_token().unwrap();
            assert_eq!(gate.available(), 0);
        }
        assert_eq!(gate.available(), 1);
    }

    #[test]
    fn test_saturation_rejects_synchronously() {
        let gate = AdmissionGate::new(2, Duration::from_millis(100));
        let _a = gate.try_token().unwrap();
        let _b = gate.try_token().unwrap();
        assert!(matches!(
            gate.try_token(),
            Err(DriftmqError::Overloaded)
        ));
    }

    #[tokio::test]
    async fn test_token_retrying_acquires_after_release() {
        let gate = AdmissionGate::new(1, Duration::from_millis(10));
        let token = gate.try_token().unwrap();

        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move {
            let _token = gate2.token_retrying().await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(token);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
