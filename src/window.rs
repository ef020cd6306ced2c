use std::process::Command;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use xcap::Window;

use crate::capture::Rect;

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("window backend: {0}")]
    Backend(#[from] xcap::XCapError),

    #[error("failed to run {command}: {source}")]
    FocusCommand {
        command: &'static str,
        source: std::io::Error,
    },

    #[error("{command} exited with {status}")]
    FocusRejected { command: &'static str, status: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameWindow {
    pub title: String,
    pub pid: u32,
    pub app_name: String,
    pub bounds: Rect,
}

pub trait WindowLocator: Send + Sync {
    /// `None` when no window matches; enumeration failures also read as absent.
    fn find_game_window(&self) -> Option<GameWindow>;
    fn focus(&self, window: &GameWindow) -> Result<(), WindowError>;
}

/// Finds the game client by window title substring and raises it with the
/// platform's scripting tool.
pub struct XcapWindowLocator {
    title: String,
    settle: Duration,
}

impl XcapWindowLocator {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            settle: Duration::from_millis(150),
        }
    }

    fn describe(window: &Window) -> Result<GameWindow, WindowError> {
        Ok(GameWindow {
            title: window.title()?,
            pid: window.pid()?,
            app_name: window.app_name().unwrap_or_default(),
            bounds: Rect {
                x: window.x()?,
                y: window.y()?,
                width: window.width()?,
                height: window.height()?,
            },
        })
    }
}

impl WindowLocator for XcapWindowLocator {
    fn find_game_window(&self) -> Option<GameWindow> {
        let windows = match Window::all() {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("failed to enumerate windows: {e}");
                return None;
            }
        };

        let found = windows
            .iter()
            .filter(|w| !w.is_minimized().unwrap_or(false))
            .find(|w| w.title().is_ok_and(|t| t.contains(&self.title)))?;

        match Self::describe(found) {
            Ok(window) => Some(window),
            Err(e) => {
                tracing::warn!("found '{}' but could not read its geometry: {e}", self.title);
                None
            }
        }
    }

    fn focus(&self, window: &GameWindow) -> Result<(), WindowError> {
        activate(window)?;
        std::thread::sleep(self.settle);
        Ok(())
    }
}

fn run(command: &'static str, args: &[&str]) -> Result<(), WindowError> {
    let status = Command::new(command)
        .args(args)
        .status()
        .map_err(|source| WindowError::FocusCommand { command, source })?;
    if status.success() {
        Ok(())
    } else {
        Err(WindowError::FocusRejected {
            command,
            status: status.to_string(),
        })
    }
}

#[cfg(target_os = "macos")]
fn activate(window: &GameWindow) -> Result<(), WindowError> {
    let by_pid = format!(
        "tell application \"System Events\" to set frontmost of (first process whose unix id is {}) to true",
        window.pid
    );
    if run("osascript", &["-e", &by_pid]).is_ok() {
        return Ok(());
    }
    let by_name = format!("tell application \"{}\" to activate", window.app_name);
    run("osascript", &["-e", &by_name])
}

#[cfg(target_os = "windows")]
fn activate(window: &GameWindow) -> Result<(), WindowError> {
    let script = format!(
        "(New-Object -ComObject WScript.Shell).AppActivate({}) | Out-Null",
        window.pid
    );
    run("powershell", &["-NoProfile", "-Command", &script])
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn activate(window: &GameWindow) -> Result<(), WindowError> {
    let pid = window.pid.to_string();
    if run("xdotool", &["search", "--pid", &pid, "windowactivate"]).is_ok() {
        return Ok(());
    }
    run(
        "xdotool",
        &["search", "--name", &window.title, "windowactivate"],
    )
}
