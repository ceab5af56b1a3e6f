use std::path::PathBuf;
use std::time::Duration;

pub const BACKEND_URL: &str = "http://localhost:5000";
pub const BACKEND_SCRIPT: &str = "server.py";
/// Interpreters tried in order; the second only when the first is not installed.
pub const BACKEND_INTERPRETERS: [&str; 2] = ["python3", "python"];

pub const INITIAL_LOAD_DELAY: Duration = Duration::from_millis(1500);
pub const RETRY_BACKOFF: Duration = Duration::from_millis(800);
pub const RETRY_BUDGET: u32 = 10;
pub const BACKEND_STOP_GRACE: Duration = Duration::from_secs(5);

/// Zoom applied to the backend UI once it loads. Same on every platform and
/// kept out of `ShellConfig`.
pub const ZOOM_FACTOR: f64 = 1.5;

pub const FALLBACK_PAGE: &str = "error.html";
pub const PLACEHOLDER_PAGE: &str = "index.html";
pub const WINDOW_LABEL_PREFIX: &str = "main";

#[derive(Debug, Clone)]
pub struct BackendCommand {
    pub programs: Vec<String>,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl BackendCommand {
    /// `python3 server.py` run from `app_root`.
    pub fn python_server(app_root: PathBuf) -> Self {
        Self {
            programs: BACKEND_INTERPRETERS.iter().map(|p| p.to_string()).collect(),
            args: vec![BACKEND_SCRIPT.to_string()],
            cwd: app_root,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    pub backoff: Duration,
    pub retry_budget: u32,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: INITIAL_LOAD_DELAY,
            backoff: RETRY_BACKOFF,
            retry_budget: RETRY_BUDGET,
        }
    }
}

impl ReadinessPolicy {
    /// Longest time polling can take before falling back, ignoring the time
    /// spent inside the load attempts themselves.
    pub fn worst_case_wait(&self) -> Duration {
        self.initial_delay + self.backoff * self.retry_budget
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_budget + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowSpec {
    pub title: String,
    pub width: f64,
    pub height: f64,
    pub min_width: f64,
    pub min_height: f64,
    pub background: (u8, u8, u8),
    pub decorations: bool,
}

impl Default for WindowSpec {
    fn default() -> Self {
        Self {
            title: "Calcium — AI Pentesting Assistant".to_string(),
            width: 1400.0,
            height: 900.0,
            min_width: 900.0,
            min_height: 600.0,
            background: (0x1a, 0x1a, 0x2e),
            decorations: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub backend_url: String,
    pub readiness: ReadinessPolicy,
    pub window: WindowSpec,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            backend_url: BACKEND_URL.to_string(),
            readiness: ReadinessPolicy::default(),
            window: WindowSpec::default(),
        }
    }
}
