use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use thiserror::Error;

use crate::assets::{AssetError, AssetStore};
use crate::capture::{
    CaptureError, Frame, MonitorInfo, ScreenCapture, ScreenOffset, ScreenPoint, monitor_for_point,
};
use crate::detector::{Detector, MatchCandidate};
use crate::input::ActionExecutor;
use crate::window::WindowLocator;

/// `min_x`/`min_y` value that accepts every candidate.
pub const UNFILTERED: i32 = i32::MIN;

#[derive(Debug, Error)]
pub enum InteractionError {
    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// The operations a battle script needs from the screen.
pub trait Interaction: Send + Sync {
    /// One capture, one detection, at most one click. Candidates whose
    /// frame-space center is left of `min_x` or above `min_y` are ignored.
    fn detect_and_click(&self, template: &str, min_x: i32, min_y: i32, focus: bool) -> bool;

    /// Like `detect_and_click` without clicking; returns the screen position.
    fn locate_on_screen(&self, template: &str) -> Option<ScreenPoint>;

    fn click_at(&self, point: ScreenPoint, focus: bool) -> bool;
}

#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub template: String,
    pub monitor: usize,
    pub offset: ScreenOffset,
    pub frame_size: (u32, u32),
    pub candidates: Vec<MatchCandidate>,
}

impl Detection {
    fn first_beyond(&self, min_x: i32, min_y: i32) -> Option<&MatchCandidate> {
        self.candidates
            .iter()
            .find(|c| c.x >= min_x && c.y >= min_y)
    }
}

/// Capture of the monitor hosting the game window, feeding the detector and
/// the action executor.
pub struct ScreenInteractor {
    capture: Arc<dyn ScreenCapture>,
    window: Arc<dyn WindowLocator>,
    executor: ActionExecutor,
    assets: Arc<AssetStore>,
    detector: Detector,
    threshold: f32,
    debug_captures: Option<PathBuf>,
    capture_seq: AtomicU64,
}

impl ScreenInteractor {
    pub fn new(
        capture: Arc<dyn ScreenCapture>,
        window: Arc<dyn WindowLocator>,
        executor: ActionExecutor,
        assets: Arc<AssetStore>,
        threshold: f32,
    ) -> Self {
        Self {
            capture,
            window,
            executor,
            assets,
            detector: Detector::default(),
            threshold,
            debug_captures: None,
            capture_seq: AtomicU64::new(0),
        }
    }

    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_debug_captures(mut self, dir: Option<PathBuf>) -> Self {
        self.debug_captures = dir;
        self
    }

    pub fn assets(&self) -> &Arc<AssetStore> {
        &self.assets
    }

    /// Monitor containing the game window's center; primary (or first) when
    /// the window is not found or monitors cannot be listed.
    fn game_monitor(&self) -> usize {
        let center = self.window.find_game_window().map(|w| w.bounds.center());
        if center.is_none() {
            tracing::debug!("game window not found, using primary monitor");
        }
        match self.capture.monitors() {
            Ok(monitors) => monitor_for_point(&monitors, center).unwrap_or(0),
            Err(e) => {
                tracing::warn!("could not list monitors, using monitor 0: {e}");
                0
            }
        }
    }

    pub fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
        self.capture.monitors()
    }

    pub fn capture_game_monitor(&self) -> Result<Frame, CaptureError> {
        self.capture.capture_monitor(self.game_monitor())
    }

    /// Loads the template, captures one frame and runs the detector on it.
    pub fn detect(&self, template: &str) -> Result<Detection, InteractionError> {
        let tpl = self.assets.load(template)?;
        let frame = self.capture_game_monitor()?;
        self.save_debug_capture(&frame, template);

        let candidates = self.detector.locate(frame.image(), &tpl.image, self.threshold);
        Ok(Detection {
            template: template.to_string(),
            monitor: frame.monitor(),
            offset: frame.offset(),
            frame_size: frame.image().dimensions(),
            candidates,
        })
    }

    fn save_debug_capture(&self, frame: &Frame, template: &str) {
        let Some(dir) = &self.debug_captures else {
            return;
        };
        let seq = self.capture_seq.fetch_add(1, Ordering::Relaxed);
        let stem = Path::new(template)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("frame");
        let path = dir.join(format!("{seq:05}_{stem}.png"));
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!("failed to create {}: {e}", dir.display());
            return;
        }
        match frame.image().save(&path) {
            Ok(()) => tracing::debug!("saved capture {}", path.display()),
            Err(e) => tracing::warn!("failed to save capture {}: {e}", path.display()),
        }
    }
}

impl Interaction for ScreenInteractor {
    fn detect_and_click(&self, template: &str, min_x: i32, min_y: i32, focus: bool) -> bool {
        let detection = match self.detect(template) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("{template}: {e}");
                return false;
            }
        };
        let Some(hit) = detection.first_beyond(min_x, min_y) else {
            tracing::debug!(
                "{template}: not found ({} candidates before filtering)",
                detection.candidates.len()
            );
            return false;
        };
        let point = detection.offset.apply(hit.x, hit.y);
        tracing::info!("{template}: clicking ({}, {})", point.x, point.y);
        self.click_at(point, focus)
    }

    fn locate_on_screen(&self, template: &str) -> Option<ScreenPoint> {
        match self.detect(template) {
            Ok(d) => d
                .first_beyond(UNFILTERED, UNFILTERED)
                .map(|c| d.offset.apply(c.x, c.y)),
            Err(e) => {
                tracing::warn!("{template}: {e}");
                None
            }
        }
    }

    fn click_at(&self, point: ScreenPoint, focus: bool) -> bool {
        match self.executor.click(point, focus) {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!("click at ({}, {}) failed: {e}", point.x, point.y);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use image::GrayImage;

    use super::*;
    use crate::capture::{MonitorInfo, Rect};

    /// Serves the same frame for every monitor and records requested indices.
    pub struct FakeCapture {
        pub frame: GrayImage,
        pub monitors: Vec<MonitorInfo>,
        pub requested: Mutex<Vec<usize>>,
        pub captures: AtomicUsize,
    }

    impl FakeCapture {
        pub fn new(frame: GrayImage) -> Self {
            let monitor = |index: usize, x: i32| MonitorInfo {
                index,
                name: format!("m{index}"),
                bounds: Rect {
                    x,
                    y: 0,
                    width: 1920,
                    height: 1080,
                },
                primary: index == 0,
            };
            Self {
                frame,
                monitors: vec![monitor(0, 0), monitor(1, 1920)],
                requested: Mutex::new(Vec::new()),
                captures: AtomicUsize::new(0),
            }
        }
    }

    impl ScreenCapture for FakeCapture {
        fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
            Ok(self.monitors.clone())
        }

        fn capture_monitor(&self, index: usize) -> Result<Frame, CaptureError> {
            let info = self
                .monitors
                .get(index)
                .ok_or(CaptureError::MonitorOutOfRange {
                    index,
                    available: self.monitors.len(),
                })?;
            self.requested.lock().unwrap().push(index);
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(Frame::new(
                self.frame.clone(),
                ScreenOffset {
                    dx: info.bounds.x,
                    dy: info.bounds.y,
                },
                index,
            ))
        }
    }
}
