use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tauri::window::Color;
use tauri::{AppHandle, Url, WebviewUrl, WebviewWindow, WebviewWindowBuilder};

use crate::config::{WindowSpec, FALLBACK_PAGE, PLACEHOLDER_PAGE};
use crate::controller::ShellHost;
use crate::error::ShellError;
use crate::readiness::LoadSurface;

const HEALTH_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

// WebView2 drops its default flags when custom ones are given, so they are repeated here.
#[cfg(windows)]
const WEBVIEW2_ARGS: &str =
    "--disable-features=msWebOOUI,msPdfOOUI,msSmartScreenProtection --force-device-scale-factor=1";

/// HTTP-level check that something is answering at the backend URL.
#[derive(Clone)]
pub struct HealthCheck {
    agent: ureq::Agent,
}

impl HealthCheck {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(HEALTH_CONNECT_TIMEOUT)
            .timeout(HEALTH_TIMEOUT)
            .build();
        Self { agent }
    }

    /// Returns the response status. Any HTTP response counts as reachable,
    /// error statuses included; only transport failures are errors.
    pub fn check(&self, url: &str) -> Result<u16, ShellError> {
        match self.agent.get(url).call() {
            Ok(resp) => Ok(resp.status()),
            Err(ureq::Error::Status(code, _)) => Ok(code),
            Err(ureq::Error::Transport(t)) => Err(ShellError::Unreachable {
                url: url.to_string(),
                reason: t.to_string(),
            }),
        }
    }
}

/// URL of a page bundled with the app, as served by Tauri's asset protocol.
pub fn app_asset_url(page: &str) -> Result<Url, ShellError> {
    let base = if cfg!(any(windows, target_os = "android")) {
        "http://tauri.localhost/"
    } else {
        "tauri://localhost/"
    };
    Ok(Url::parse(base)?.join(page)?)
}

pub struct WebviewSurface {
    window: WebviewWindow,
    health: HealthCheck,
}

#[async_trait]
impl LoadSurface for WebviewSurface {
    async fn load_backend(&self, url: &str) -> Result<(), ShellError> {
        let target: Url = url.parse()?;
        let health = self.health.clone();
        let health_url = url.to_string();
        let status = tokio::task::spawn_blocking(move || health.check(&health_url))
            .await
            .map_err(|e| ShellError::Task(e.to_string()))??;
        log::debug!("[Readiness] {} answered with HTTP {}", url, status);
        self.window.navigate(target)?;
        Ok(())
    }

    fn load_fallback(&self) -> Result<(), ShellError> {
        self.window.navigate(app_asset_url(FALLBACK_PAGE)?)?;
        Ok(())
    }

    fn set_zoom(&self, factor: f64) -> Result<(), ShellError> {
        self.window.set_zoom(factor)?;
        Ok(())
    }

    fn show(&self) -> Result<(), ShellError> {
        self.window.show()?;
        let _ = self.window.set_focus();
        Ok(())
    }
}

pub struct TauriHost {
    app: AppHandle,
}

impl TauriHost {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl ShellHost for TauriHost {
    type Surface = WebviewSurface;

    fn create_window(&self, label: &str, spec: &WindowSpec) -> Result<Arc<WebviewSurface>, ShellError> {
        let (r, g, b) = spec.background;
        let builder = WebviewWindowBuilder::new(&self.app, label, WebviewUrl::App(PLACEHOLDER_PAGE.into()))
            .title(&spec.title)
            .inner_size(spec.width, spec.height)
            .min_inner_size(spec.min_width, spec.min_height)
            .background_color(Color(r, g, b, 255))
            .decorations(spec.decorations)
            .visible(false);
        // WebKit on macOS and Linux has no device-scale-factor switch, so only
        // WebView2 gets one.
        #[cfg(windows)]
        let builder = builder.additional_browser_args(WEBVIEW2_ARGS);

        let window = builder.build()?;
        log::info!("[Shell] Created window {}", label);
        Ok(Arc::new(WebviewSurface {
            window,
            health: HealthCheck::new(),
        }))
    }

    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tauri::async_runtime::spawn(task);
    }
}
