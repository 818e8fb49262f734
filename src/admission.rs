//! Request Admission
//!
//! Every RPC passes through [`RequestAdmission::run`] before its handler
//! executes. Two independent gates apply:
//!
//! - an in-flight limiter that rejects new requests outright once the
//!   configured ceiling is reached, and
//! - a single exclusive section that serializes handlers, since the LVM
//!   tools misbehave when driven concurrently.
//!
//! Waiting for the exclusive section is bound by the caller's
//! [`RequestContext`]: cancellation or an expired deadline releases the
//! caller without ever entering the handler.
//!
//! The limiter is consulted before the exclusive section is awaited, so a
//! request over the ceiling is refused immediately instead of queueing.

use crate::error::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// =============================================================================
// Request Context
// =============================================================================

/// Caller-side cancellation and deadline of one request
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Token that cancels this request when triggered
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails if the request has already ended
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Error::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Resolves with the reason once the request ends
    async fn done(&self) -> Error {
        let expiry = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Error::Cancelled,
            _ = expiry => Error::DeadlineExceeded,
        }
    }
}

// =============================================================================
// Admission
// =============================================================================

/// Configuration for request admission
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Ceiling on concurrently admitted requests, 0 disables the limit
    pub max_in_flight: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { max_in_flight: 10 }
    }
}

pub struct RequestAdmission {
    exclusive: Semaphore,
    in_flight: Option<Arc<Semaphore>>,
    config: AdmissionConfig,
}

impl RequestAdmission {
    pub fn new(config: AdmissionConfig) -> Self {
        let in_flight = (config.max_in_flight > 0)
            .then(|| Arc::new(Semaphore::new(config.max_in_flight)));
        Self {
            exclusive: Semaphore::new(1),
            in_flight,
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Requests currently holding an in-flight slot
    pub fn in_flight(&self) -> usize {
        match &self.in_flight {
            Some(limit) => self.config.max_in_flight - limit.available_permits(),
            None => 0,
        }
    }

    /// Run a handler once both gates admit the request
    pub async fn run<T, F, Fut>(&self, ctx: &RequestContext, handler: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _slot = match &self.in_flight {
            Some(limit) => Some(
                limit
                    .clone()
                    .try_acquire_owned()
                    .map_err(|_| Error::TooManyRequests)?,
            ),
            None => None,
        };
        ctx.check()?;

        let _section = tokio::select! {
            biased;
            reason = ctx.done() => {
                debug!("Request ended while waiting for admission: {}", reason);
                return Err(reason);
            }
            permit = self.exclusive.acquire() => permit.map_err(Error::internal)?,
        };
        // Acquisition may have raced with cancellation.
        ctx.check()?;

        handler().await
    }
}

impl Default for RequestAdmission {
    fn default() -> Self {
        Self::new(AdmissionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    /// Spawn a request that holds the exclusive section until released
    async fn hold(admission: &Arc<RequestAdmission>) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<()>>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let admission = admission.clone();
        let handle = tokio::spawn(async move {
            admission
                .run(&RequestContext::new(), || async move {
                    let _ = entered_tx.send(());
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
        });
        entered_rx.await.unwrap();
        (release_tx, handle)
    }

    #[tokio::test]
    async fn test_handlers_do_not_overlap() {
        let admission = Arc::new(RequestAdmission::default());
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let admission = admission.clone();
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            handles.push(tokio::spawn(async move {
                admission
                    .run(&RequestContext::new(), || async move {
                        if inside.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.store(false, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_never_runs() {
        let admission = Arc::new(RequestAdmission::default());
        let (release, holder) = hold(&admission).await;

        let ctx = RequestContext::new();
        let token = ctx.cancellation_token();
        let ran = Arc::new(AtomicBool::new(false));
        let waiter = {
            let admission = admission.clone();
            let ran = ran.clone();
            tokio::spawn(async move {
                admission
                    .run(&ctx, || async move {
                        ran.store(true, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert_matches!(waiter.await.unwrap(), Err(Error::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_deadline_expires_while_waiting() {
        let admission = Arc::new(RequestAdmission::default());
        let (release, holder) = hold(&admission).await;

        let ctx = RequestContext::with_timeout(Duration::from_millis(20));
        let result = admission.run(&ctx, || async { Ok(()) }).await;
        assert_matches!(result, Err(Error::DeadlineExceeded));

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        admission
            .run(&RequestContext::new(), || async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ended_context_is_rejected_up_front() {
        let admission = RequestAdmission::default();
        let ctx = RequestContext::new();
        ctx.cancel();
        let result = admission.run(&ctx, || async { Ok(()) }).await;
        assert_matches!(result, Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_in_flight_limit_rejects_without_queueing() {
        let admission = Arc::new(RequestAdmission::new(AdmissionConfig { max_in_flight: 1 }));
        let (release, holder) = hold(&admission).await;
        assert_eq!(admission.in_flight(), 1);

        let result = admission.run(&RequestContext::new(), || async { Ok(()) }).await;
        assert_matches!(result, Err(Error::TooManyRequests));

        release.send(()).unwrap();
        holder.await.unwrap().unwrap();
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unlimited_admission() {
        let admission = RequestAdmission::new(AdmissionConfig { max_in_flight: 0 });
        let value = admission
            .run(&RequestContext::new(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(admission.in_flight(), 0);
    }
}
