use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use enigo::{Button, Coordinate, Direction, Enigo, Mouse, Settings};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::capture::ScreenPoint;
use crate::window::WindowLocator;

/// Maximum random offset (pixels, per axis) added to every click.
pub const CLICK_JITTER: i32 = 5;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("could not open input connection: {0}")]
    Connect(#[from] enigo::NewConError),

    #[error("input injection failed: {0}")]
    Inject(#[from] enigo::InputError),
}

pub trait InputDevice: Send + Sync {
    fn move_cursor(&self, x: i32, y: i32) -> Result<(), InputError>;
    fn click_left(&self, x: i32, y: i32) -> Result<(), InputError>;
}

/// Synthetic mouse input. A fresh connection is opened per call, so the
/// device itself holds no platform handle.
pub struct EnigoInput {
    settle: Duration,
}

impl Default for EnigoInput {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(60),
        }
    }
}

impl EnigoInput {
    fn connect() -> Result<Enigo, InputError> {
        Ok(Enigo::new(&Settings::default())?)
    }
}

impl InputDevice for EnigoInput {
    fn move_cursor(&self, x: i32, y: i32) -> Result<(), InputError> {
        Self::connect()?.move_mouse(x, y, Coordinate::Abs)?;
        Ok(())
    }

    fn click_left(&self, x: i32, y: i32) -> Result<(), InputError> {
        let mut enigo = Self::connect()?;
        enigo.move_mouse(x, y, Coordinate::Abs)?;
        // Let the cursor land before pressing.
        thread::sleep(self.settle);
        enigo.button(Button::Left, Direction::Click)?;
        Ok(())
    }
}

/// Turns a screen point into one physical click: optional best-effort focus
/// of the game window, jitter, move, click.
pub struct ActionExecutor {
    input: Arc<dyn InputDevice>,
    window: Arc<dyn WindowLocator>,
    jitter: i32,
    rng: Mutex<StdRng>,
}

impl ActionExecutor {
    pub fn new(input: Arc<dyn InputDevice>, window: Arc<dyn WindowLocator>) -> Self {
        Self {
            input,
            window,
            jitter: CLICK_JITTER,
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_jitter(mut self, jitter: i32, seed: u64) -> Self {
        self.jitter = jitter.abs();
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Returns the point actually clicked.
    pub fn click(&self, point: ScreenPoint, focus: bool) -> Result<ScreenPoint, InputError> {
        if focus {
            self.focus_game();
        }

        let target = self.jittered(point);
        self.input.move_cursor(target.x, target.y)?;
        self.input.click_left(target.x, target.y)?;
        tracing::debug!(
            "clicked ({}, {}) for requested ({}, {})",
            target.x,
            target.y,
            point.x,
            point.y
        );
        Ok(target)
    }

    fn jittered(&self, point: ScreenPoint) -> ScreenPoint {
        if self.jitter == 0 {
            return point;
        }
        let j = self.jitter;
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ScreenPoint {
            x: point.x + rng.random_range(-j..=j),
            y: point.y + rng.random_range(-j..=j),
        }
    }

    fn focus_game(&self) {
        let Some(window) = self.window.find_game_window() else {
            tracing::warn!("game window not found, clicking without focus");
            return;
        };
        if let Err(e) = self.window.focus(&window) {
            tracing::warn!("could not focus '{}': {e}", window.title);
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::capture::Rect;
    use crate::window::{GameWindow, WindowError};

    #[derive(Default)]
    pub struct RecordingInput {
        pub clicks: Mutex<Vec<ScreenPoint>>,
        pub moves: AtomicUsize,
    }

    impl RecordingInput {
        pub fn clicks(&self) -> Vec<ScreenPoint> {
            self.clicks.lock().unwrap().clone()
        }
    }

    impl InputDevice for RecordingInput {
        fn move_cursor(&self, _x: i32, _y: i32) -> Result<(), InputError> {
            self.moves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn click_left(&self, x: i32, y: i32) -> Result<(), InputError> {
            self.clicks.lock().unwrap().push(ScreenPoint { x, y });
            Ok(())
        }
    }

    /// Window double: `bounds` of `None` means no game window.
    #[derive(Default)]
    pub struct FakeWindow {
        pub bounds: Option<Rect>,
        pub fail_focus: bool,
        pub focus_calls: AtomicUsize,
    }

    impl WindowLocator for FakeWindow {
        fn find_game_window(&self) -> Option<GameWindow> {
            self.bounds.map(|bounds| GameWindow {
                title: "AFK Journey".into(),
                pid: 42,
                app_name: "afk".into(),
                bounds,
            })
        }

        fn focus(&self, _window: &GameWindow) -> Result<(), WindowError> {
            self.focus_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_focus {
                Err(WindowError::FocusRejected {
                    command: "fake",
                    status: "1".into(),
                })
            } else {
                Ok(())
            }
        }
    }
}
