use image::{DynamicImage, GrayImage};
use serde::Serialize;
use thiserror::Error;
use xcap::Monitor;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("monitor index {index} out of range ({available} available)")]
    MonitorOutOfRange { index: usize, available: usize },

    #[error("no monitors detected")]
    NoMonitors,

    #[error("capture backend: {0}")]
    Backend(#[from] xcap::XCapError),
}

/// Absolute desktop coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScreenPoint {
    pub x: i32,
    pub y: i32,
}

/// Translation from frame pixels to desktop coordinates (the monitor origin).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScreenOffset {
    pub dx: i32,
    pub dy: i32,
}

impl ScreenOffset {
    pub fn apply(self, x: i32, y: i32) -> ScreenPoint {
        ScreenPoint {
            x: x + self.dx,
            y: y + self.dy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn center(&self) -> ScreenPoint {
        ScreenPoint {
            x: self.x + (self.width / 2) as i32,
            y: self.y + (self.height / 2) as i32,
        }
    }

    /// Half-open: the right and bottom edges belong to the neighbour.
    pub fn contains(&self, p: ScreenPoint) -> bool {
        p.x >= self.x
            && p.y >= self.y
            && (p.x as i64) < self.x as i64 + self.width as i64
            && (p.y as i64) < self.y as i64 + self.height as i64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorInfo {
    pub index: usize,
    pub name: String,
    pub bounds: Rect,
    pub primary: bool,
}

/// One grayscale capture of a monitor. Owned by whoever requested it.
#[derive(Debug, Clone)]
pub struct Frame {
    image: GrayImage,
    offset: ScreenOffset,
    monitor: usize,
}

impl Frame {
    pub fn new(image: GrayImage, offset: ScreenOffset, monitor: usize) -> Self {
        Self {
            image,
            offset,
            monitor,
        }
    }

    pub fn image(&self) -> &GrayImage {
        &self.image
    }

    pub fn offset(&self) -> ScreenOffset {
        self.offset
    }

    pub fn monitor(&self) -> usize {
        self.monitor
    }
}

pub trait ScreenCapture: Send + Sync {
    fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError>;
    fn capture_monitor(&self, index: usize) -> Result<Frame, CaptureError>;
}

/// Index of the monitor containing `point`; otherwise the primary monitor,
/// otherwise the first one.
pub fn monitor_for_point(monitors: &[MonitorInfo], point: Option<ScreenPoint>) -> Option<usize> {
    point
        .and_then(|p| monitors.iter().find(|m| m.bounds.contains(p)))
        .or_else(|| monitors.iter().find(|m| m.primary))
        .or_else(|| monitors.first())
        .map(|m| m.index)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct XcapCapture;

fn describe(index: usize, monitor: &Monitor) -> Result<MonitorInfo, CaptureError> {
    Ok(MonitorInfo {
        index,
        name: monitor.name().unwrap_or_else(|_| format!("monitor-{index}")),
        bounds: Rect {
            x: monitor.x()?,
            y: monitor.y()?,
            width: monitor.width()?,
            height: monitor.height()?,
        },
        primary: monitor.is_primary().unwrap_or(false),
    })
}

impl ScreenCapture for XcapCapture {
    fn monitors(&self) -> Result<Vec<MonitorInfo>, CaptureError> {
        Monitor::all()?
            .iter()
            .enumerate()
            .map(|(i, m)| describe(i, m))
            .collect()
    }

    fn capture_monitor(&self, index: usize) -> Result<Frame, CaptureError> {
        let monitors = Monitor::all()?;
        if monitors.is_empty() {
            return Err(CaptureError::NoMonitors);
        }
        let available = monitors.len();
        let monitor = monitors
            .get(index)
            .ok_or(CaptureError::MonitorOutOfRange { index, available })?;

        let rgba = monitor.capture_image()?;
        let offset = ScreenOffset {
            dx: monitor.x()?,
            dy: monitor.y()?,
        };
        tracing::debug!(
            "captured monitor {index} ({}x{}) at offset ({}, {})",
            rgba.width(),
            rgba.height(),
            offset.dx,
            offset.dy
        );
        Ok(Frame::new(
            DynamicImage::ImageRgba8(rgba).to_luma8(),
            offset,
            index,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(index: usize, x: i32, primary: bool) -> MonitorInfo {
        MonitorInfo {
            index,
            name: format!("m{index}"),
            bounds: Rect {
                x,
                y: 0,
                width: 1920,
                height: 1080,
            },
            primary,
        }
    }

    #[test]
    fn test_rect_center_and_contains() {
        let r = Rect {
            x: -1920,
            y: 0,
            width: 1920,
            height: 1080,
        };
        assert_eq!(r.center(), ScreenPoint { x: -960, y: 540 });
        assert!(r.contains(ScreenPoint { x: -1920, y: 0 }));
        assert!(!r.contains(ScreenPoint { x: 0, y: 0 }));
    }

    #[test]
    fn test_monitor_containing_window_center() {
        let monitors = [monitor(0, 0, true), monitor(1, 1920, false)];
        let p = ScreenPoint { x: 2500, y: 400 };
        assert_eq!(monitor_for_point(&monitors, Some(p)), Some(1));
    }

    #[test]
    fn test_monitor_falls_back_to_primary_then_first() {
        let monitors = [monitor(0, 0, false), monitor(1, 1920, true)];
        assert_eq!(monitor_for_point(&monitors, None), Some(1));
        let offscreen = ScreenPoint { x: -5000, y: 0 };
        assert_eq!(monitor_for_point(&monitors, Some(offscreen)), Some(1));

        let no_primary = [monitor(0, 0, false), monitor(1, 1920, false)];
        assert_eq!(monitor_for_point(&no_primary, None), Some(0));
        assert_eq!(monitor_for_point(&[], None), None);
    }

    #[test]
    fn test_frame_offset_applies_monitor_origin() {
        let frame = Frame::new(
            GrayImage::new(4, 4),
            ScreenOffset { dx: 1920, dy: -200 },
            1,
        );
        assert_eq!(frame.offset().apply(10, 20), ScreenPoint { x: 1930, y: -180 });
        assert_eq!(frame.monitor(), 1);
    }

    #[test]
    fn test_out_of_range_message() {
        let err = CaptureError::MonitorOutOfRange {
            index: 3,
            available: 2,
        };
        assert_eq!(err.to_string(), "monitor index 3 out of range (2 available)");
    }
}
