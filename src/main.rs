// Prevents additional console window on Windows in release, DO NOT REMOVE!!
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod backend;
mod commands;
mod config;
mod controller;
mod error;
mod readiness;
mod window;

use tauri::{Manager, RunEvent, WindowEvent};
use tauri_plugin_log::{Target, TargetKind};

use backend::BackendProcess;
use config::{BackendCommand, ShellConfig};
use controller::ShellController;
use window::TauriHost;

pub(crate) type AppShell = ShellController<BackendProcess, TauriHost>;

fn main() {
    tauri::Builder::default()
        .plugin(
            tauri_plugin_log::Builder::new()
                .targets([
                    Target::new(TargetKind::Stdout),
                    Target::new(TargetKind::LogDir { file_name: None }),
                ])
                .max_file_size(5_000_000) // 5 MB per log file
                .rotation_strategy(tauri_plugin_log::RotationStrategy::KeepOne)
                .level(if cfg!(debug_assertions) {
                    log::LevelFilter::Debug
                } else {
                    log::LevelFilter::Info
                })
                .build(),
        )
        .enable_macos_default_menu(false)
        .setup(|app| {
            log::info!("[Shell] Calcium is starting...");
            let app_root = backend::resolve_app_root(app.handle());
            let shell: AppShell = ShellController::new(
                BackendProcess::new(BackendCommand::python_server(app_root)),
                TauriHost::new(app.handle().clone()),
                ShellConfig::default(),
            );
            app.manage(shell);
            app.state::<AppShell>().start()?;
            Ok(())
        })
        .on_window_event(|window, event| {
            if let WindowEvent::Destroyed = event {
                if let Some(shell) = window.try_state::<AppShell>() {
                    shell.on_window_closed(window.label());
                }
            }
        })
        .invoke_handler(tauri::generate_handler![
            commands::shell_status,
            commands::retry_connection
        ])
        .build(tauri::generate_context!())
        .expect("error while building tauri application")
        .run(|app, event| match event {
            // Fires once the last window is gone; the app quits right after.
            RunEvent::ExitRequested { .. } | RunEvent::Exit => {
                if let Some(shell) = app.try_state::<AppShell>() {
                    shell.stop();
                }
            }
            #[cfg(target_os = "macos")]
            RunEvent::Reopen {
                has_visible_windows: false,
                ..
            } => {
                if let Some(shell) = app.try_state::<AppShell>() {
                    if let Err(e) = shell.on_activate() {
                        log::error!("[Shell] Failed to recreate window: {}", e);
                    }
                }
            }
            _ => {}
        });
}
