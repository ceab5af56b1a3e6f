//! Bounded readiness polling: wait, try to load the backend UI, back off and
//! retry, and fall back to the bundled error page once the budget runs out.

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{ReadinessPolicy, ZOOM_FACTOR};
use crate::error::ShellError;

/// The display side of a window, as seen by the poller.
#[async_trait]
pub trait LoadSurface: Send + Sync {
    /// Load the backend UI at `url`. Errors mean the backend is not reachable yet.
    async fn load_backend(&self, url: &str) -> Result<(), ShellError>;
    fn load_fallback(&self) -> Result<(), ShellError>;
    fn set_zoom(&self, factor: f64) -> Result<(), ShellError>;
    fn show(&self) -> Result<(), ShellError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReadinessState {
    AwaitingDelay,
    Attempting { attempt: u32 },
    Ready,
    FailedFallback,
    Cancelled,
}

impl ReadinessState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReadinessState::Ready | ReadinessState::FailedFallback | ReadinessState::Cancelled
        )
    }
}

/// Drives one polling sequence to a terminal state, reporting every
/// transition through `on_state`.
///
/// Attempts run strictly one after another. Cancelling `cancel` stops the
/// sequence at the next delay or in-flight attempt without touching the
/// surface again.
pub async fn run_readiness<S, F>(
    surface: &S,
    url: &str,
    policy: &ReadinessPolicy,
    cancel: &CancellationToken,
    mut on_state: F,
) -> ReadinessState
where
    S: LoadSurface + ?Sized,
    F: FnMut(ReadinessState) + Send,
{
    log::debug!(
        "[Readiness] Polling {} (up to {} attempts, {:?} before fallback)",
        url,
        policy.max_attempts(),
        policy.worst_case_wait()
    );
    on_state(ReadinessState::AwaitingDelay);
    if !sleep_unless_cancelled(policy.initial_delay, cancel).await {
        on_state(ReadinessState::Cancelled);
        return ReadinessState::Cancelled;
    }

    let mut remaining = policy.retry_budget;
    let mut attempt = 1;
    loop {
        on_state(ReadinessState::Attempting { attempt });
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                on_state(ReadinessState::Cancelled);
                return ReadinessState::Cancelled;
            }
            result = surface.load_backend(url) => result,
        };

        match result {
            Ok(()) => {
                log::info!("[Readiness] Backend loaded on attempt {}", attempt);
                if let Err(e) = surface.set_zoom(ZOOM_FACTOR) {
                    log::warn!("[Readiness] Failed to set zoom: {}", e);
                }
                if let Err(e) = surface.show() {
                    log::warn!("[Readiness] Failed to show window: {}", e);
                }
                on_state(ReadinessState::Ready);
                return ReadinessState::Ready;
            }
            Err(e) if remaining > 0 => {
                log::debug!(
                    "[Readiness] Attempt {} failed ({}); {} retries left",
                    attempt,
                    e,
                    remaining
                );
                remaining -= 1;
                attempt += 1;
                on_state(ReadinessState::AwaitingDelay);
                if !sleep_unless_cancelled(policy.backoff, cancel).await {
                    on_state(ReadinessState::Cancelled);
                    return ReadinessState::Cancelled;
                }
            }
            Err(e) => {
                log::warn!(
                    "[Readiness] Backend still unreachable after {} attempts ({}); showing fallback page",
                    attempt,
                    e
                );
                if let Err(e) = surface.load_fallback() {
                    log::error!("[Readiness] Failed to load fallback page: {}", e);
                }
                if let Err(e) = surface.show() {
                    log::warn!("[Readiness] Failed to show window: {}", e);
                }
                on_state(ReadinessState::FailedFallback);
                return ReadinessState::FailedFallback;
            }
        }
    }
}

/// Returns false if `cancel` fired before `duration` elapsed.
async fn sleep_unless_cancelled(duration: std::time::Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::LoadSurface;
    use crate::error::ShellError;

    #[derive(Debug, Clone, PartialEq)]
    pub enum SurfaceEvent {
        LoadBackend { at: Instant },
        Fallback,
        Zoom(f64),
        Show,
    }

    /// Surface whose backend becomes reachable on a given attempt.
    pub struct FakeSurface {
        pub reachable_on: Option<u32>,
        pub events: Arc<Mutex<Vec<SurfaceEvent>>>,
        pub journal: Option<Arc<Mutex<Vec<String>>>>,
        pub fail_fallback: bool,
    }

    impl FakeSurface {
        pub fn new(reachable_on: Option<u32>) -> Self {
            Self {
                reachable_on,
                events: Arc::new(Mutex::new(Vec::new())),
                journal: None,
                fail_fallback: false,
            }
        }

        pub fn events(&self) -> Vec<SurfaceEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn attempts(&self) -> Vec<Instant> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    SurfaceEvent::LoadBackend { at } => Some(at),
                    _ => None,
                })
                .collect()
        }

        pub fn count(&self, wanted: &SurfaceEvent) -> usize {
            self.events().iter().filter(|e| *e == wanted).count()
        }
    }

    #[async_trait]
    impl LoadSurface for FakeSurface {
        async fn load_backend(&self, url: &str) -> Result<(), ShellError> {
            let attempt = {
                let mut events = self.events.lock().unwrap();
                events.push(SurfaceEvent::LoadBackend { at: Instant::now() });
                events
                    .iter()
                    .filter(|e| matches!(e, SurfaceEvent::LoadBackend { .. }))
                    .count() as u32
            };
            if let Some(journal) = &self.journal {
                journal.lock().unwrap().push("load".to_string());
            }
            match self.reachable_on {
                Some(k) if attempt >= k => Ok(()),
                _ => Err(ShellError::Unreachable {
                    url: url.to_string(),
                    reason: "connection refused".to_string(),
                }),
            }
        }

        fn load_fallback(&self) -> Result<(), ShellError> {
            self.events.lock().unwrap().push(SurfaceEvent::Fallback);
            if self.fail_fallback {
                return Err(ShellError::Task("fallback page missing".to_string()));
            }
            Ok(())
        }

        fn set_zoom(&self, factor: f64) -> Result<(), ShellError> {
            self.events.lock().unwrap().push(SurfaceEvent::Zoom(factor));
            Ok(())
        }

        fn show(&self) -> Result<(), ShellError> {
            self.events.lock().unwrap().push(SurfaceEvent::Show);
            Ok(())
        }
    }
}
