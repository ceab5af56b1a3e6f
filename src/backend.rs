use std::io::{BufRead, BufReader, ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tauri::{AppHandle, Manager, Runtime};

use crate::config::{BackendCommand, BACKEND_SCRIPT, BACKEND_STOP_GRACE};
use crate::error::ShellError;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Longer output runs without a newline are forwarded in pieces of this size.
const MAX_FORWARDED_LINE: usize = 64 * 1024;

/// Owns the lifecycle of the backend process.
pub trait Supervisor: Send + Sync {
    fn start(&self) -> Result<StartOutcome, ShellError>;
    /// Best-effort and at most once; later calls report `AlreadyStopped`.
    fn stop(&self) -> StopOutcome;
    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Spawned { pid: u32 },
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    AlreadyExited,
    Terminated,
    Killed,
    AlreadyStopped,
}

pub struct BackendProcess {
    command: BackendCommand,
    grace: Duration,
    process: Mutex<Option<Child>>,
    stopping: AtomicBool,
}

impl BackendProcess {
    pub fn new(command: BackendCommand) -> Self {
        Self::with_grace(command, BACKEND_STOP_GRACE)
    }

    pub fn with_grace(command: BackendCommand, grace: Duration) -> Self {
        Self {
            command,
            grace,
            process: Mutex::new(None),
            stopping: AtomicBool::new(false),
        }
    }

    fn spawn(&self) -> Result<Child, ShellError> {
        let mut last_error = None;
        for program in &self.command.programs {
            let mut cmd = Command::new(program);
            cmd.args(&self.command.args);
            cmd.current_dir(&self.command.cwd);
            cmd.stdin(Stdio::null());
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
            match cmd.spawn() {
                Ok(mut child) => {
                    log::info!(
                        "[Backend] Launched {} {} in {} (pid {})",
                        program,
                        self.command.args.join(" "),
                        self.command.cwd.display(),
                        child.id()
                    );
                    attach_forwarders(&mut child);
                    return Ok(child);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    log::debug!("[Backend] {} not available: {}", program, e);
                    last_error = Some(ShellError::Spawn {
                        program: program.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    return Err(ShellError::Spawn {
                        program: program.clone(),
                        source: e,
                    });
                }
            }
        }
        Err(last_error.unwrap_or(ShellError::NoInterpreter))
    }
}

impl Supervisor for BackendProcess {
    fn start(&self) -> Result<StartOutcome, ShellError> {
        let mut guard = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        if self.stopping.load(Ordering::SeqCst) {
            return Err(ShellError::ShuttingDown);
        }
        if let Some(child) = guard.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::warn!("[Backend] Previous process exited with {}; relaunching", status);
                }
                Ok(None) => return Ok(StartOutcome::AlreadyRunning),
                Err(e) => {
                    log::warn!("[Backend] Could not query process state: {}", e);
                    return Ok(StartOutcome::AlreadyRunning);
                }
            }
        }

        let child = self.spawn()?;
        let pid = child.id();
        *guard = Some(child);
        Ok(StartOutcome::Spawned { pid })
    }

    fn stop(&self) -> StopOutcome {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return StopOutcome::AlreadyStopped;
        }
        let taken = self.process.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut child) = taken else {
            return StopOutcome::NotRunning;
        };

        if let Ok(Some(status)) = child.try_wait() {
            log::info!("[Backend] Process had already exited with {}", status);
            return StopOutcome::AlreadyExited;
        }

        request_termination(&mut child);
        if let Some(status) = wait_with_timeout(&mut child, self.grace) {
            log::info!("[Backend] Stopped backend process ({})", status);
            return StopOutcome::Terminated;
        }

        log::warn!(
            "[Backend] Process did not exit within {:?}; killing it",
            self.grace
        );
        let _ = child.kill();
        let _ = child.wait();
        StopOutcome::Killed
    }

    fn is_running(&self) -> bool {
        let mut guard = self.process.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_mut()
            .map(|child| matches!(child.try_wait(), Ok(None)))
            .unwrap_or(false)
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) {
    let pid = child.id() as libc::pid_t;
    // SAFETY: `pid` is our own child and has not been reaped yet, so it cannot
    // have been recycled for another process.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) {
    let _ = child.kill();
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() >= deadline => return None,
            Ok(None) => std::thread::sleep(STOP_POLL_INTERVAL),
            Err(_) => return None,
        }
    }
}

fn attach_forwarders(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        spawn_forwarder("backend-stdout", stdout, |line| log::info!("[Backend] {}", line));
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_forwarder("backend-stderr", stderr, |line| {
            log::error!("[Backend error] {}", line)
        });
    }
}

fn spawn_forwarder<R: Read + Send + 'static>(name: &str, reader: R, emit: fn(&str)) {
    let spawned = std::thread::Builder::new()
        .name(name.into())
        .spawn(move || {
            forward_lines(reader, MAX_FORWARDED_LINE, emit);
        });
    if let Err(e) = spawned {
        log::warn!("[Backend] Could not start {} forwarder: {}", name, e);
    }
}

/// Passes each line of `reader` to `emit` without its line terminator until EOF.
/// Lines longer than `max_line` bytes are split. Returns the number of pieces
/// forwarded.
fn forward_lines<R: Read>(reader: R, max_line: usize, mut emit: impl FnMut(&str)) -> usize {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forwarded = 0;
    loop {
        buf.clear();
        match (&mut reader).take(max_line as u64).read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                emit(line.trim_end_matches(|c| c == '\n' || c == '\r'));
                forwarded += 1;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    forwarded
}

/// Directory the backend runs from: the first candidate holding the backend
/// script, otherwise the bundle's resource directory.
pub fn resolve_app_root<R: Runtime>(app: &AppHandle<R>) -> PathBuf {
    let resource_dir = app.path().resource_dir().ok();
    let cwd = std::env::current_dir().ok();

    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(cwd) = &cwd {
        candidates.push(cwd.clone());
        if let Some(parent) = cwd.parent() {
            candidates.push(parent.to_path_buf());
        }
    }
    if let Some(resource_dir) = &resource_dir {
        candidates.push(resource_dir.clone());
        // Tauri bundles `../server.py` as `_up_/server.py`
        candidates.push(resource_dir.join("_up_"));
    }

    match find_app_root(&candidates) {
        Some(root) => root,
        None => {
            log::warn!(
                "[Backend] {} not found in any of {:?}",
                BACKEND_SCRIPT,
                candidates
            );
            resource_dir
                .or(cwd)
                .unwrap_or_else(|| PathBuf::from("."))
        }
    }
}

fn find_app_root(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|dir| dir.join(BACKEND_SCRIPT).is_file())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn forward_lines_strips_terminators_and_keeps_content() {
        let input = Cursor::new(b" * Running on http://127.0.0.1:5000\r\nGET / 200\n\npartial".to_vec());
        let mut lines = Vec::new();
        let count = forward_lines(input, MAX_FORWARDED_LINE, |line| lines.push(line.to_string()));
        assert_eq!(count, 4);
        assert_eq!(
            lines,
            vec![" * Running on http://127.0.0.1:5000", "GET / 200", "", "partial"]
        );
    }

    #[test]
    fn forward_lines_replaces_invalid_utf8() {
        let input = Cursor::new(vec![b'o', b'k', 0xff, b'\n']);
        let mut lines = Vec::new();
        forward_lines(input, MAX_FORWARDED_LINE, |line| lines.push(line.to_string()));
        assert_eq!(lines, vec!["ok\u{fffd}"]);
    }

    #[test]
    fn forward_lines_splits_output_without_newlines() {
        let input = Cursor::new(b"abcdefgh\nij\n".to_vec());
        let mut lines = Vec::new();
        let count = forward_lines(input, 3, |line| lines.push(line.to_string()));
        assert_eq!(count, 4);
        assert_eq!(lines, vec!["abc", "def", "gh", "ij"]);
    }

    #[test]
    fn forward_lines_bounds_memory_for_endless_line() {
        let input = Cursor::new(vec![b'x'; 10 * 1024]);
        let mut longest = 0;
        let count = forward_lines(input, 1024, |line| longest = longest.max(line.len()));
        assert_eq!(count, 10);
        assert_eq!(longest, 1024);
    }

    #[test]
    fn find_app_root_picks_first_dir_with_script() {
        let empty = tempfile::tempdir().unwrap();
        let with_script = tempfile::tempdir().unwrap();
        std::fs::write(with_script.path().join(BACKEND_SCRIPT), "print('hi')").unwrap();

        let candidates = vec![
            empty.path().to_path_buf(),
            with_script.path().to_path_buf(),
        ];
        assert_eq!(
            find_app_root(&candidates),
            Some(with_script.path().to_path_buf())
        );
        assert_eq!(find_app_root(&candidates[..1]), None);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let backend = BackendProcess::new(BackendCommand {
            programs: vec!["true".into()],
            args: vec![],
            cwd: std::env::temp_dir(),
        });
        assert_eq!(backend.stop(), StopOutcome::NotRunning);
        assert!(!backend.is_running());
    }

    #[test]
    fn start_reports_missing_interpreters() {
        let backend = BackendProcess::new(BackendCommand {
            programs: vec!["calcium-no-such-python-3f9a".into()],
            args: vec![BACKEND_SCRIPT.into()],
            cwd: std::env::temp_dir(),
        });
        let err = backend.start().unwrap_err();
        assert!(matches!(err, ShellError::Spawn { ref program, .. } if program == "calcium-no-such-python-3f9a"));
        assert!(!backend.is_running());
    }

    #[test]
    fn start_with_no_interpreters_fails() {
        let backend = BackendProcess::new(BackendCommand {
            programs: vec![],
            args: vec![],
            cwd: std::env::temp_dir(),
        });
        assert!(matches!(backend.start(), Err(ShellError::NoInterpreter)));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn shell(script: &str) -> BackendCommand {
            BackendCommand {
                programs: vec!["sh".into()],
                args: vec!["-c".into(), script.into()],
                cwd: std::env::temp_dir(),
            }
        }

        #[test]
        fn falls_back_to_next_interpreter() {
            let backend = BackendProcess::new(BackendCommand {
                programs: vec!["calcium-no-such-python-3f9a".into(), "sh".into()],
                args: vec!["-c".into(), "sleep 30".into()],
                cwd: std::env::temp_dir(),
            });
            assert!(matches!(backend.start(), Ok(StartOutcome::Spawned { .. })));
            assert!(backend.is_running());
            assert_eq!(backend.stop(), StopOutcome::Terminated);
        }

        #[test]
        fn second_start_reuses_running_process() {
            let backend = BackendProcess::new(shell("sleep 30"));
            assert!(matches!(backend.start(), Ok(StartOutcome::Spawned { .. })));
            assert_eq!(backend.start().unwrap(), StartOutcome::AlreadyRunning);
            backend.stop();
        }

        #[test]
        fn stop_terminates_once() {
            let backend = BackendProcess::new(shell("sleep 30"));
            backend.start().unwrap();
            assert_eq!(backend.stop(), StopOutcome::Terminated);
            assert_eq!(backend.stop(), StopOutcome::AlreadyStopped);
            assert_eq!(backend.stop(), StopOutcome::AlreadyStopped);
            assert!(!backend.is_running());
        }

        #[test]
        fn start_after_stop_is_refused() {
            let backend = BackendProcess::new(shell("sleep 30"));
            backend.stop();
            assert!(matches!(backend.start(), Err(ShellError::ShuttingDown)));
        }

        #[test]
        fn stop_escalates_when_sigterm_is_ignored() {
            let backend = BackendProcess::with_grace(
                shell("trap '' TERM; exec sleep 30"),
                Duration::from_millis(300),
            );
            backend.start().unwrap();
            // Give the shell time to install the trap before it execs.
            std::thread::sleep(Duration::from_millis(200));
            assert_eq!(backend.stop(), StopOutcome::Killed);
        }

        #[test]
        fn stop_after_backend_exited_does_not_signal() {
            let backend = BackendProcess::new(shell("exit 3"));
            backend.start().unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while backend.is_running() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            assert_eq!(backend.stop(), StopOutcome::AlreadyExited);
        }

        #[test]
        fn start_relaunches_after_exit() {
            let backend = BackendProcess::new(shell("exit 0"));
            let first = backend.start().unwrap();
            let deadline = Instant::now() + Duration::from_secs(5);
            while backend.is_running() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
            let second = backend.start().unwrap();
            assert!(matches!(second, StartOutcome::Spawned { .. }));
            assert_ne!(first, second);
        }
    }
}
