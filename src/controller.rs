use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backend::{StartOutcome, StopOutcome, Supervisor};
use crate::config::{ShellConfig, WindowSpec, WINDOW_LABEL_PREFIX};
use crate::error::ShellError;
use crate::readiness::{run_readiness, LoadSurface, ReadinessState};

/// What the controller needs from the windowing runtime.
pub trait ShellHost: Send + Sync + 'static {
    type Surface: LoadSurface + 'static;

    /// Create a hidden window with the given label.
    fn create_window(&self, label: &str, spec: &WindowSpec) -> Result<Arc<Self::Surface>, ShellError>;

    /// Run `task` without blocking the event loop.
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

struct WindowSlot<T> {
    label: String,
    surface: Arc<T>,
    polling: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShellStatus {
    pub backend_running: bool,
    pub readiness: ReadinessState,
    pub window: Option<String>,
    pub shutting_down: bool,
}

/// Owns the backend process and the single app window for the lifetime of
/// the application.
pub struct ShellController<S: Supervisor, H: ShellHost> {
    supervisor: S,
    host: H,
    config: ShellConfig,
    window: Mutex<Option<WindowSlot<H::Surface>>>,
    readiness: Arc<Mutex<ReadinessState>>,
    windows_created: AtomicU32,
    shutting_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: Supervisor, H: ShellHost> ShellController<S, H> {
    pub fn new(supervisor: S, host: H, config: ShellConfig) -> Self {
        Self {
            supervisor,
            host,
            config,
            window: Mutex::new(None),
            readiness: Arc::new(Mutex::new(ReadinessState::AwaitingDelay)),
            windows_created: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Launch the backend, then open the window and begin readiness polling.
    /// Returns the window label.
    ///
    /// A backend that fails to launch is only logged; it shows up as a
    /// readiness failure.
    pub fn start(&self) -> Result<String, ShellError> {
        match self.supervisor.start() {
            Ok(outcome) => log::info!("[Shell] Backend start: {:?}", outcome),
            Err(e) => log::error!("[Shell] Backend failed to launch: {}", e),
        }
        self.open_window()
    }

    /// Forget the window with `label` and cancel its pending load attempts.
    /// Returns false if `label` is not the current window.
    pub fn on_window_closed(&self, label: &str) -> bool {
        let slot = {
            let mut guard = lock(&self.window);
            if guard.as_ref().is_some_and(|slot| slot.label == label) {
                guard.take()
            } else {
                None
            }
        };
        let Some(slot) = slot else {
            return false;
        };
        slot.polling.cancel();
        {
            let mut readiness = lock(&self.readiness);
            if !readiness.is_terminal() {
                *readiness = ReadinessState::Cancelled;
            }
        }
        log::info!("[Shell] Window {} closed", slot.label);
        true
    }

    /// Recreate the window if none is open. Returns the new label, if any.
    pub fn on_activate(&self) -> Result<Option<String>, ShellError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if lock(&self.window).is_some() {
            return Ok(None);
        }
        self.open_window().map(Some)
    }

    /// Relaunch the backend if it has exited and poll the current window again.
    pub fn retry(&self) -> Result<(), ShellError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ShellError::ShuttingDown);
        }
        match self.supervisor.start() {
            Ok(StartOutcome::Spawned { pid }) => log::info!("[Shell] Backend relaunched (pid {})", pid),
            Ok(StartOutcome::AlreadyRunning) => {}
            Err(e) => log::error!("[Shell] Backend failed to relaunch: {}", e),
        }

        let mut guard = lock(&self.window);
        let slot = guard.as_mut().ok_or(ShellError::NoWindow)?;
        slot.polling.cancel();
        slot.polling = CancellationToken::new();
        log::info!("[Shell] Retrying backend connection for {}", slot.label);
        self.spawn_polling(slot);
        Ok(())
    }

    /// Stop polling and shut the backend down. Only the first call reaches
    /// the supervisor.
    pub fn stop(&self) -> StopOutcome {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return StopOutcome::AlreadyStopped;
        }
        if let Some(slot) = lock(&self.window).as_ref() {
            slot.polling.cancel();
        }
        let outcome = self.supervisor.stop();
        log::info!("[Shell] Backend shutdown: {:?}", outcome);
        outcome
    }

    pub fn status(&self) -> ShellStatus {
        ShellStatus {
            backend_running: self.supervisor.is_running(),
            readiness: *lock(&self.readiness),
            window: lock(&self.window).as_ref().map(|slot| slot.label.clone()),
            shutting_down: self.shutting_down.load(Ordering::SeqCst),
        }
    }

    fn open_window(&self) -> Result<String, ShellError> {
        // Held across creation so two callers can never both see an empty slot.
        let mut guard = lock(&self.window);
        if let Some(slot) = guard.as_ref() {
            return Ok(slot.label.clone());
        }

        // Each window gets a fresh label; the runtime may still be tearing
        // down the previous one.
        let n = self.windows_created.fetch_add(1, Ordering::SeqCst) + 1;
        let label = format!("{}-{}", WINDOW_LABEL_PREFIX, n);
        let surface = self.host.create_window(&label, &self.config.window)?;

        let slot = WindowSlot {
            label: label.clone(),
            surface,
            polling: CancellationToken::new(),
        };
        self.spawn_polling(&slot);
        *guard = Some(slot);
        Ok(label)
    }

    fn spawn_polling(&self, slot: &WindowSlot<H::Surface>) {
        let surface = slot.surface.clone();
        let cancel = slot.polling.clone();
        let label = slot.label.clone();
        let url = self.config.backend_url.clone();
        let policy = self.config.readiness;
        let readiness = self.readiness.clone();

        self.host.spawn(Box::pin(async move {
            let end = run_readiness(surface.as_ref(), &url, &policy, &cancel, |state| {
                if !cancel.is_cancelled() {
                    *lock(&readiness) = state;
                }
            })
            .await;
            debug_assert!(end.is_terminal());
            log::info!("[Readiness] {} finished: {:?}", label, end);
        }));
    }
}
