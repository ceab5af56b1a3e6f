// Commands reachable from the bundled pages (placeholder and fallback).
// Backend-served content is remote and has no IPC capability.

use tauri::State;

use crate::controller::ShellStatus;
use crate::AppShell;

#[tauri::command]
pub fn shell_status(shell: State<'_, AppShell>) -> ShellStatus {
    shell.status()
}

#[tauri::command]
pub fn retry_connection(shell: State<'_, AppShell>) -> Result<(), String> {
    shell.retry().map_err(|e| e.to_string())
}
