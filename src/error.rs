use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("failed to launch backend `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend launch has no interpreter configured")]
    NoInterpreter,

    #[error("shell is shutting down")]
    ShuttingDown,

    #[error("backend unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Tauri(#[from] tauri::Error),

    #[error("no window is open")]
    NoWindow,

    #[error("background task failed: {0}")]
    Task(String),
}
