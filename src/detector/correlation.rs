use std::borrow::Cow;

use image::imageops::{self, FilterType};
use image::{GrayImage, ImageBuffer, Luma};
use imageproc::integral_image::{integral_image, integral_squared_image, sum_image_pixels};
use imageproc::template_matching::{MatchTemplateMethod, match_template_parallel};

use super::{MatchCandidate, MatchStrategy, StrategyKind};

/// Minimum zero-mean correlation for an unverified match.
pub const CORRELATION_THRESHOLD: f32 = 0.7;

const MIN_SCALE: f32 = 0.5;
const MAX_SCALE: f32 = 2.0;
const SCALE_STEPS: usize = 16;
const MIN_TEMPLATE_SIDE: u32 = 10;
/// Windows flatter than this (per-pixel variance) score zero.
const MIN_WINDOW_VARIANCE: f64 = 1.0;

pub fn scales() -> impl Iterator<Item = f32> {
    let step = (MAX_SCALE - MIN_SCALE) / (SCALE_STEPS - 1) as f32;
    (0..SCALE_STEPS).map(move |i| MIN_SCALE + i as f32 * step)
}

/// Short side of each scaled template during the coarse pass.
const COARSE_TEMPLATE_SIDE: f32 = 16.0;

/// Multi-scale zero-mean normalized cross-correlation. Each scale is searched
/// coarse-to-fine: frame and template shrunk by a shared factor, then the
/// best coarse hit re-scored at full resolution in a small window. Keeps the
/// single best location across all scales.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrelationMatcher;

#[derive(Debug, Clone, Copy)]
struct Best {
    score: f32,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
}

/// Full-resolution top-left guess from the coarse pass, with the search
/// radius needed to absorb its rounding.
#[derive(Debug, Clone, Copy)]
struct CoarseHit {
    x: u32,
    y: u32,
    margin: u32,
}

impl MatchStrategy for CorrelationMatcher {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Correlation
    }

    fn attempt(
        &self,
        frame: &GrayImage,
        template: &GrayImage,
        threshold: f32,
    ) -> Vec<MatchCandidate> {
        let accept = threshold.max(CORRELATION_THRESHOLD);
        let mut best: Option<Best> = None;

        for scale in scales() {
            let width = (template.width() as f32 * scale).round() as u32;
            let height = (template.height() as f32 * scale).round() as u32;
            if width < MIN_TEMPLATE_SIDE || height < MIN_TEMPLATE_SIDE {
                continue;
            }
            if width > frame.width() || height > frame.height() {
                continue;
            }
            let scaled: Cow<GrayImage> = if (width, height) == template.dimensions() {
                Cow::Borrowed(template)
            } else {
                Cow::Owned(imageops::resize(template, width, height, FilterType::Triangle))
            };

            let Some(hit) = coarse_search(frame, &scaled) else {
                continue;
            };
            if let Some(found) = refine(frame, &scaled, hit)
                && best.is_none_or(|b| found.score > b.score)
            {
                best = Some(found);
            }
        }

        let Some(best) = best else {
            tracing::debug!("correlation: no usable scale");
            return Vec::new();
        };
        tracing::debug!(
            "correlation: best score {:.3} at ({}, {}) size {}x{}",
            best.score,
            best.x,
            best.y,
            best.width,
            best.height
        );
        if best.score < accept {
            return Vec::new();
        }

        vec![MatchCandidate {
            x: (best.x as f32 + best.width as f32 / 2.0).round() as i32,
            y: (best.y as f32 + best.height as f32 / 2.0).round() as i32,
            score: best.score,
            strategy: StrategyKind::Correlation,
        }]
    }
}

/// Shrinks frame and template so the template's short side is about
/// `COARSE_TEMPLATE_SIDE`, and returns the best position in frame pixels.
fn coarse_search(frame: &GrayImage, template: &GrayImage) -> Option<CoarseHit> {
    let (tw, th) = template.dimensions();
    let factor = (tw.min(th) as f32 / COARSE_TEMPLATE_SIDE).max(1.0);
    if factor <= 1.0 {
        let sums = WindowSums::new(frame);
        let hit = best_zero_mean(frame, &sums, template)?;
        return Some(CoarseHit {
            x: hit.x,
            y: hit.y,
            margin: 0,
        });
    }

    let fw = ((frame.width() as f32 / factor).round() as u32).max(1);
    let fh = ((frame.height() as f32 / factor).round() as u32).max(1);
    let sw = ((tw as f32 / factor).round() as u32).max(1);
    let sh = ((th as f32 / factor).round() as u32).max(1);
    if sw > fw || sh > fh {
        return None;
    }
    let small_frame = imageops::resize(frame, fw, fh, FilterType::Triangle);
    let small_template = imageops::resize(template, sw, sh, FilterType::Triangle);
    let sums = WindowSums::new(&small_frame);
    let hit = best_zero_mean(&small_frame, &sums, &small_template)?;

    let sx = frame.width() as f32 / fw as f32;
    let sy = frame.height() as f32 / fh as f32;
    Some(CoarseHit {
        x: (hit.x as f32 * sx).round() as u32,
        y: (hit.y as f32 * sy).round() as u32,
        margin: 2 * sx.max(sy).ceil() as u32 + 2,
    })
}

/// Full-resolution search restricted to `margin` pixels around the coarse hit.
fn refine(frame: &GrayImage, template: &GrayImage, hit: CoarseHit) -> Option<Best> {
    let (tw, th) = template.dimensions();
    let x0 = hit.x.saturating_sub(hit.margin);
    let y0 = hit.y.saturating_sub(hit.margin);
    let x1 = (hit.x + tw + hit.margin).min(frame.width());
    let y1 = (hit.y + th + hit.margin).min(frame.height());
    if x1.saturating_sub(x0) < tw || y1.saturating_sub(y0) < th {
        return None;
    }

    let window = imageops::crop_imm(frame, x0, y0, x1 - x0, y1 - y0).to_image();
    let sums = WindowSums::new(&window);
    let found = best_zero_mean(&window, &sums, template)?;
    Some(Best {
        x: found.x + x0,
        y: found.y + y0,
        ..found
    })
}

struct WindowSums {
    sum: ImageBuffer<Luma<u64>, Vec<u64>>,
    squared: ImageBuffer<Luma<u64>, Vec<u64>>,
}

impl WindowSums {
    fn new(image: &GrayImage) -> Self {
        Self {
            sum: integral_image::<_, u64>(image),
            squared: integral_squared_image::<_, u64>(image),
        }
    }

    fn window(&self, x: u32, y: u32, width: u32, height: u32) -> (f64, f64) {
        let (right, bottom) = (x + width - 1, y + height - 1);
        (
            sum_image_pixels(&self.sum, x, y, right, bottom)[0] as f64,
            sum_image_pixels(&self.squared, x, y, right, bottom)[0] as f64,
        )
    }
}

/// Raw cross-correlation from imageproc, re-centred with window sums:
/// `(Σ I·T − n·μI·μT) / (n·σI·σT)`.
fn best_zero_mean(frame: &GrayImage, sums: &WindowSums, template: &GrayImage) -> Option<Best> {
    let (tw, th) = template.dimensions();
    let n = (tw * th) as f64;
    let (t_sum, t_sq) = template.pixels().fold((0.0f64, 0.0f64), |(s, q), p| {
        let v = p.0[0] as f64;
        (s + v, q + v * v)
    });
    let t_var = t_sq - t_sum * t_sum / n;
    if t_var < n * MIN_WINDOW_VARIANCE {
        return None;
    }

    let ccorr = match_template_parallel(frame, template, MatchTemplateMethod::CrossCorrelation);
    let mut best: Option<Best> = None;
    for (x, y, raw) in ccorr.enumerate_pixels() {
        let (i_sum, i_sq) = sums.window(x, y, tw, th);
        let i_var = i_sq - i_sum * i_sum / n;
        let score = if i_var < n * MIN_WINDOW_VARIANCE {
            0.0
        } else {
            ((raw.0[0] as f64 - i_sum * t_sum / n) / (i_var * t_var).sqrt()) as f32
        };
        if best.is_none_or(|b| score > b.score) {
            best = Some(Best {
                score,
                x,
                y,
                width: tw,
                height: th,
            });
        }
    }
    best
}
