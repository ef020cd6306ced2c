//! Keypoint-based matching: FAST corners over an image pyramid, described
//! either by oriented gradient histograms or by steered binary intensity
//! tests, then ratio-tested and geometrically verified.

use std::collections::HashSet;
use std::f32::consts::{SQRT_2, TAU};

use image::GrayImage;
use image::imageops::{self, FilterType};
use imageproc::binary_descriptors::BinaryDescriptor;
use imageproc::corners::{Corner, corners_fast9};
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::Projection;
use imageproc::gradients::{horizontal_sobel, vertical_sobel};
use imageproc::point::Point;
use imageproc::suppress::local_maxima;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::geometry::{self, Correspondence};
use super::{MatchCandidate, MatchStrategy, StrategyKind};

const FAST_THRESHOLD: u8 = 20;
const SUPPRESSION_RADIUS: u32 = 2;
const MAX_KEYPOINTS_PER_LEVEL: usize = 500;
const MAX_LEVELS: usize = 6;
const MIN_LEVEL_SIDE: u32 = 16;

/// Either image producing fewer keypoints than this skips the strategy.
const MIN_KEYPOINTS: usize = 4;
/// Minimum accepted matches for a normal-sized template.
const MIN_MATCH_COUNT: usize = 10;
/// Templates below this area (px²) get a relaxed ratio test and match floor.
const SMALL_TEMPLATE_AREA: u32 = 10_000;

/// Ratio-test bound and minimum match count for a template of `area` px².
fn acceptance(threshold: f32, area: u32) -> (f32, usize) {
    if area < SMALL_TEMPLATE_AREA {
        let relaxed = (threshold + 0.1).min(0.75).max(threshold);
        (relaxed, (MIN_MATCH_COUNT / 2).max(4))
    } else {
        (threshold, MIN_MATCH_COUNT)
    }
}

/// A described keypoint; `point` is in full-resolution image coordinates.
#[derive(Debug, Clone)]
pub struct Feature<D> {
    pub point: (f32, f32),
    pub descriptor: D,
}

pub trait DescriptorExtractor: Send + Sync {
    type Descriptor: Send + Sync;

    fn extract(&self, image: &GrayImage) -> Vec<Feature<Self::Descriptor>>;
    fn distance(&self, a: &Self::Descriptor, b: &Self::Descriptor) -> f32;
}

struct Level {
    image: GrayImage,
    scale_x: f32,
    scale_y: f32,
}

impl Level {
    fn to_base(&self, x: u32, y: u32) -> (f32, f32) {
        (
            (x as f32 + 0.5) * self.scale_x - 0.5,
            (y as f32 + 0.5) * self.scale_y - 0.5,
        )
    }
}

fn pyramid(image: &GrayImage) -> Vec<Level> {
    let (w0, h0) = image.dimensions();
    let mut levels = vec![Level {
        image: image.clone(),
        scale_x: 1.0,
        scale_y: 1.0,
    }];
    for k in 1..MAX_LEVELS {
        let factor = SQRT_2.powi(k as i32);
        let w = (w0 as f32 / factor).round() as u32;
        let h = (h0 as f32 / factor).round() as u32;
        if w.min(h) < MIN_LEVEL_SIDE {
            break;
        }
        levels.push(Level {
            image: imageops::resize(image, w, h, FilterType::Triangle),
            scale_x: w0 as f32 / w as f32,
            scale_y: h0 as f32 / h as f32,
        });
    }
    levels
}

fn detect_corners(image: &GrayImage) -> Vec<Corner> {
    let corners = corners_fast9(image, FAST_THRESHOLD);
    let mut kept = local_maxima(&corners, SUPPRESSION_RADIUS);
    kept.sort_by(|a, b| b.score.total_cmp(&a.score));
    kept.truncate(MAX_KEYPOINTS_PER_LEVEL);
    kept
}

// Gradient histogram descriptor

const ORIENTATION_BINS: usize = 36;
const ORIENTATION_RADIUS: i32 = 6;
const ORIENTATION_SIGMA: f32 = 3.0;
const ORIENTATION_PEAK_RATIO: f32 = 0.8;
const DESCRIPTOR_HALF_WIDTH: i32 = 8;
const DESCRIPTOR_CELLS: usize = 4;
const DESCRIPTOR_BINS: usize = 8;
const DESCRIPTOR_CLAMP: f32 = 0.2;

/// 128-float descriptor: a 4x4 grid of 8-bin orientation histograms over a
/// 16x16 window rotated to the keypoint's dominant gradient direction.
#[derive(Debug, Default, Clone, Copy)]
pub struct GradientExtractor;

impl DescriptorExtractor for GradientExtractor {
    type Descriptor = Vec<f32>;

    fn extract(&self, image: &GrayImage) -> Vec<Feature<Vec<f32>>> {
        let mut features = Vec::new();
        for level in pyramid(image) {
            let field = GradientField::new(&level.image);
            for corner in detect_corners(&level.image) {
                for angle in field.dominant_orientations(corner.x, corner.y) {
                    if let Some(descriptor) =
                        field.describe(corner.x as f32, corner.y as f32, angle)
                    {
                        features.push(Feature {
                            point: level.to_base(corner.x, corner.y),
                            descriptor,
                        });
                    }
                }
            }
        }
        features
    }

    fn distance(&self, a: &Vec<f32>, b: &Vec<f32>) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt()
    }
}

struct GradientField {
    width: u32,
    height: u32,
    magnitude: Vec<f32>,
    angle: Vec<f32>,
}

impl GradientField {
    fn new(image: &GrayImage) -> Self {
        let gx = horizontal_sobel(image);
        let gy = vertical_sobel(image);
        let (magnitude, angle) = gx
            .pixels()
            .zip(gy.pixels())
            .map(|(x, y)| {
                let (dx, dy) = (x.0[0] as f32, y.0[0] as f32);
                (dx.hypot(dy), dy.atan2(dx).rem_euclid(TAU))
            })
            .unzip();
        Self {
            width: image.width(),
            height: image.height(),
            magnitude,
            angle,
        }
    }

    fn at(&self, x: i32, y: i32) -> (f32, f32) {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        let i = y * self.width as usize + x;
        (self.magnitude[i], self.angle[i])
    }

    /// Peaks of a smoothed 36-bin orientation histogram; secondary peaks
    /// within 80% of the strongest yield their own keypoints.
    fn dominant_orientations(&self, x: u32, y: u32) -> Vec<f32> {
        let mut hist = [0.0f32; ORIENTATION_BINS];
        let r2 = ORIENTATION_RADIUS * ORIENTATION_RADIUS;
        for dy in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
            for dx in -ORIENTATION_RADIUS..=ORIENTATION_RADIUS {
                let d2 = dx * dx + dy * dy;
                if d2 > r2 {
                    continue;
                }
                let (mag, angle) = self.at(x as i32 + dx, y as i32 + dy);
                let weight = (-(d2 as f32) / (2.0 * ORIENTATION_SIGMA * ORIENTATION_SIGMA)).exp();
                let bin = (angle / TAU * ORIENTATION_BINS as f32) as usize % ORIENTATION_BINS;
                hist[bin] += mag * weight;
            }
        }

        let n = ORIENTATION_BINS;
        let smoothed: [f32; ORIENTATION_BINS] = std::array::from_fn(|i| {
            (hist[(i + n - 1) % n] + 2.0 * hist[i] + hist[(i + 1) % n]) / 4.0
        });
        let peak = smoothed.iter().copied().fold(0.0f32, f32::max);
        if peak <= f32::EPSILON {
            return Vec::new();
        }

        (0..n)
            .filter_map(|i| {
                let (l, c, r) = (smoothed[(i + n - 1) % n], smoothed[i], smoothed[(i + 1) % n]);
                if c < ORIENTATION_PEAK_RATIO * peak || c <= l || c < r {
                    return None;
                }
                let denom = l - 2.0 * c + r;
                let offset = if denom.abs() > f32::EPSILON {
                    0.5 * (l - r) / denom
                } else {
                    0.0
                };
                Some(((i as f32 + 0.5 + offset) * TAU / n as f32).rem_euclid(TAU))
            })
            .collect()
    }

    fn describe(&self, x: f32, y: f32, angle: f32) -> Option<Vec<f32>> {
        let (sin, cos) = angle.sin_cos();
        let half = DESCRIPTOR_HALF_WIDTH;
        let cell_size = (2 * half) as usize / DESCRIPTOR_CELLS;
        let sigma = half as f32;
        let mut descriptor = vec![0.0f32; DESCRIPTOR_CELLS * DESCRIPTOR_CELLS * DESCRIPTOR_BINS];

        for j in -half..half {
            for i in -half..half {
                let (u, v) = (i as f32 + 0.5, j as f32 + 0.5);
                let sx = x + u * cos - v * sin;
                let sy = y + u * sin + v * cos;
                let (mag, grad_angle) = self.at(sx.round() as i32, sy.round() as i32);
                if mag == 0.0 {
                    continue;
                }
                let weight = mag * (-(u * u + v * v) / (2.0 * sigma * sigma)).exp();
                let rel = (grad_angle - angle).rem_euclid(TAU) / TAU * DESCRIPTOR_BINS as f32;
                let b0 = rel.floor() as usize % DESCRIPTOR_BINS;
                let b1 = (b0 + 1) % DESCRIPTOR_BINS;
                let frac = rel - rel.floor();

                let cell = ((j + half) as usize / cell_size) * DESCRIPTOR_CELLS
                    + (i + half) as usize / cell_size;
                descriptor[cell * DESCRIPTOR_BINS + b0] += weight * (1.0 - frac);
                descriptor[cell * DESCRIPTOR_BINS + b1] += weight * frac;
            }
        }

        normalize(&mut descriptor)?;
        for v in descriptor.iter_mut() {
            *v = v.min(DESCRIPTOR_CLAMP);
        }
        normalize(&mut descriptor)?;
        Some(descriptor)
    }
}

fn normalize(v: &mut [f32]) -> Option<()> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm < 1e-6 {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Some(())
}

// Steered binary descriptor

const BINARY_TESTS: usize = 256;
const PATCH_RADIUS: i32 = 12;
const PATCH_BLUR_SIGMA: f32 = 2.0;
const TEST_PAIR_SEED: u64 = 0x6272_6965_665f_7031;

/// 256 intensity comparisons on a blurred patch, rotated by the patch's
/// intensity-centroid angle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryFeature {
    bits: [u128; 2],
    position: Point<u32>,
}

impl BinaryFeature {
    fn bit(&self, index: u32) -> bool {
        let word = self.bits[(index / 128) as usize];
        (word >> (index % 128)) & 1 == 1
    }
}

impl BinaryDescriptor for BinaryFeature {
    fn get_size(&self) -> u32 {
        BINARY_TESTS as u32
    }

    fn hamming_distance(&self, other: &Self) -> u32 {
        self.bits
            .iter()
            .zip(&other.bits)
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    fn get_bit_subset(&self, bits: &[u32]) -> u128 {
        bits.iter()
            .enumerate()
            .filter(|&(_, &b)| self.bit(b))
            .fold(0u128, |acc, (i, _)| acc | (1u128 << i))
    }

    fn position(&self) -> Point<u32> {
        self.position
    }
}

pub struct BinaryExtractor {
    pairs: Vec<[(f32, f32); 2]>,
}

impl Default for BinaryExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl BinaryExtractor {
    pub fn new() -> Self {
        let mut rng = StdRng::seed_from_u64(TEST_PAIR_SEED);
        let pairs = (0..BINARY_TESTS)
            .map(|_| [patch_point(&mut rng), patch_point(&mut rng)])
            .collect();
        Self { pairs }
    }

    fn describe(&self, blurred: &GrayImage, x: u32, y: u32) -> BinaryFeature {
        let angle = centroid_angle(blurred, x, y);
        let (sin, cos) = angle.sin_cos();
        let sample = |(u, v): (f32, f32)| {
            let sx = x as f32 + u * cos - v * sin;
            let sy = y as f32 + u * sin + v * cos;
            pixel_clamped(blurred, sx.round() as i32, sy.round() as i32)
        };

        let mut bits = [0u128; 2];
        for (i, [p, q]) in self.pairs.iter().enumerate() {
            if sample(*p) < sample(*q) {
                bits[i / 128] |= 1u128 << (i % 128);
            }
        }
        BinaryFeature {
            bits,
            position: Point::new(x, y),
        }
    }
}

impl DescriptorExtractor for BinaryExtractor {
    type Descriptor = BinaryFeature;

    fn extract(&self, image: &GrayImage) -> Vec<Feature<BinaryFeature>> {
        let mut features = Vec::new();
        for level in pyramid(image) {
            let blurred = gaussian_blur_f32(&level.image, PATCH_BLUR_SIGMA);
            for corner in detect_corners(&level.image) {
                features.push(Feature {
                    point: level.to_base(corner.x, corner.y),
                    descriptor: self.describe(&blurred, corner.x, corner.y),
                });
            }
        }
        features
    }

    fn distance(&self, a: &BinaryFeature, b: &BinaryFeature) -> f32 {
        a.hamming_distance(b) as f32
    }
}

fn patch_point(rng: &mut StdRng) -> (f32, f32) {
    loop {
        let x = rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS);
        let y = rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS);
        if x * x + y * y <= PATCH_RADIUS * PATCH_RADIUS {
            return (x as f32, y as f32);
        }
    }
}

fn pixel_clamped(image: &GrayImage, x: i32, y: i32) -> u8 {
    let x = x.clamp(0, image.width() as i32 - 1) as u32;
    let y = y.clamp(0, image.height() as i32 - 1) as u32;
    image.get_pixel(x, y).0[0]
}

fn centroid_angle(image: &GrayImage, x: u32, y: u32) -> f32 {
    let (mut m10, mut m01) = (0.0f32, 0.0f32);
    let r2 = PATCH_RADIUS * PATCH_RADIUS;
    for dy in -PATCH_RADIUS..=PATCH_RADIUS {
        for dx in -PATCH_RADIUS..=PATCH_RADIUS {
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let value = pixel_clamped(image, x as i32 + dx, y as i32 + dy) as f32;
            m10 += dx as f32 * value;
            m01 += dy as f32 * value;
        }
    }
    m01.atan2(m10)
}

// Matching

/// Nearest/second-nearest ratio test. Accepted pairs are then made one-to-one
/// in pixel space: features sharing a keypoint (one per orientation peak)
/// would otherwise count the same evidence several times. Closest pairs win.
fn ratio_test<E: DescriptorExtractor>(
    extractor: &E,
    template: &[Feature<E::Descriptor>],
    frame: &[Feature<E::Descriptor>],
    ratio: f32,
) -> Vec<Correspondence> {
    let mut accepted: Vec<(usize, usize, f32)> = Vec::new();
    for (ti, tf) in template.iter().enumerate() {
        let mut best: Option<(usize, f32)> = None;
        let mut second = f32::INFINITY;
        for (fi, ff) in frame.iter().enumerate() {
            let d = extractor.distance(&tf.descriptor, &ff.descriptor);
            match best {
                Some((_, bd)) if d >= bd => second = second.min(d),
                _ => {
                    if let Some((_, bd)) = best {
                        second = bd;
                    }
                    best = Some((fi, d));
                }
            }
        }
        if let Some((fi, d)) = best
            && second.is_finite()
            && d < ratio * second
        {
            accepted.push((ti, fi, d));
        }
    }

    accepted.sort_by(|a, b| a.2.total_cmp(&b.2));
    let mut used_template: HashSet<(i32, i32)> = HashSet::new();
    let mut used_frame: HashSet<(i32, i32)> = HashSet::new();
    let mut pairs = Vec::with_capacity(accepted.len());
    for (ti, fi, _) in accepted {
        let (t, f) = (template[ti].point, frame[fi].point);
        let (tk, fk) = (pixel_key(t), pixel_key(f));
        if used_template.contains(&tk) || used_frame.contains(&fk) {
            continue;
        }
        used_template.insert(tk);
        used_frame.insert(fk);
        pairs.push(Correspondence {
            template: t,
            frame: f,
        });
    }
    pairs
}

fn pixel_key((x, y): (f32, f32)) -> (i32, i32) {
    (x.round() as i32, y.round() as i32)
}

/// Share of template pixels that must land inside the frame for the
/// alignment check to be meaningful.
const MIN_ALIGNED_COVERAGE: f64 = 0.9;

/// Zero-mean correlation between the template and the frame sampled through
/// `projection` (template pixel to frame pixel). `None` when too much of the
/// template maps outside the frame.
fn aligned_correlation(
    frame: &GrayImage,
    template: &GrayImage,
    projection: &Projection,
) -> Option<f32> {
    let (mut n, mut st, mut sf, mut stt, mut sff, mut stf) = (0.0f64, 0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y, p) in template.enumerate_pixels() {
        let (fx, fy) = *projection * (x as f32, y as f32);
        let Some(v) = sample_bilinear(frame, fx, fy) else {
            continue;
        };
        let t = p.0[0] as f64;
        let v = v as f64;
        n += 1.0;
        st += t;
        sf += v;
        stt += t * t;
        sff += v * v;
        stf += t * v;
    }

    let total = (template.width() * template.height()) as f64;
    if n < total * MIN_ALIGNED_COVERAGE {
        return None;
    }
    let var_t = stt - st * st / n;
    let var_f = sff - sf * sf / n;
    if var_t < n || var_f < n {
        return Some(0.0);
    }
    Some(((stf - st * sf / n) / (var_t * var_f).sqrt()) as f32)
}

fn sample_bilinear(image: &GrayImage, x: f32, y: f32) -> Option<f32> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    if !(x >= 0.0 && y >= 0.0 && x <= (w - 1) as f32 && y <= (h - 1) as f32) {
        return None;
    }
    let (x0, y0) = (x.floor() as u32, y.floor() as u32);
    let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
    let (ax, ay) = (x - x0 as f32, y - y0 as f32);
    let px = |x, y| image.get_pixel(x, y).0[0] as f32;
    let top = px(x0, y0) * (1.0 - ax) + px(x1, y0) * ax;
    let bottom = px(x0, y1) * (1.0 - ax) + px(x1, y1) * ax;
    Some(top * (1.0 - ay) + bottom * ay)
}

/// Feature detection, ratio-test matching and geometric verification with a
/// pluggable descriptor.
pub struct FeatureMatcher<E> {
    extractor: E,
    kind: StrategyKind,
}

impl<E: DescriptorExtractor> FeatureMatcher<E> {
    pub fn new(extractor: E, kind: StrategyKind) -> Self {
        Self { extractor, kind }
    }
}

impl<E: DescriptorExtractor> MatchStrategy for FeatureMatcher<E> {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    fn attempt(
        &self,
        frame: &GrayImage,
        template: &GrayImage,
        threshold: f32,
    ) -> Vec<MatchCandidate> {
        let kind = self.kind;
        let template_features = self.extractor.extract(template);
        let frame_features = self.extractor.extract(frame);
        if template_features.len() < MIN_KEYPOINTS || frame_features.len() < MIN_KEYPOINTS {
            tracing::debug!(
                "{kind:?}: too few keypoints (template={}, frame={})",
                template_features.len(),
                frame_features.len()
            );
            return Vec::new();
        }

        let area = template.width() * template.height();
        let (ratio, min_matches) = acceptance(threshold, area);
        let pairs = ratio_test(&self.extractor, &template_features, &frame_features, ratio);
        if pairs.len() < min_matches {
            tracing::debug!(
                "{kind:?}: {} good matches, need {min_matches} (ratio {ratio:.2})",
                pairs.len()
            );
            return Vec::new();
        }

        let Some(verified) = geometry::estimate(&pairs) else {
            tracing::debug!("{kind:?}: transform estimation failed for {} matches", pairs.len());
            return Vec::new();
        };
        let inlier_ratio = verified.inliers as f32 / pairs.len() as f32;
        let required = geometry::required_inlier_ratio(pairs.len());
        tracing::debug!(
            "{kind:?}: {:?} fit, {}/{} inliers ({inlier_ratio:.2}, need {required:.2})",
            verified.model,
            verified.inliers,
            pairs.len()
        );
        if inlier_ratio < required {
            return Vec::new();
        }

        // The fit must also agree with the pixels it claims to align.
        let alignment = aligned_correlation(frame, template, &verified.projection);
        tracing::debug!("{kind:?}: aligned correlation {alignment:?}");
        if alignment.is_none_or(|a| a < threshold) {
            return Vec::new();
        }

        let (cx, cy) = verified.project_center(template.width(), template.height());
        if !cx.is_finite() || !cy.is_finite() {
            return Vec::new();
        }
        vec![MatchCandidate {
            x: cx.round() as i32,
            y: cy.round() as i32,
            score: inlier_ratio,
            strategy: kind,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::fixtures::{block_template, paste, quiet_frame};

    #[test]
    fn test_acceptance_relaxes_for_small_templates() {
        let (ratio, min) = acceptance(0.65, 64 * 64);
        assert!((ratio - 0.75).abs() < 1e-6);
        assert_eq!(min, 5);

        let (ratio, min) = acceptance(0.65, 120 * 120);
        assert!((ratio - 0.65).abs() < 1e-6);
        assert_eq!(min, MIN_MATCH_COUNT);

        // Relaxation never tightens a loose threshold.
        let (ratio, _) = acceptance(0.8, 50 * 50);
        assert!((ratio - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_pyramid_levels_shrink_and_stop() {
        let levels = pyramid(&GrayImage::new(64, 64));
        assert_eq!(levels[0].image.dimensions(), (64, 64));
        assert_eq!(levels[1].image.dimensions(), (45, 45));
        assert_eq!(levels[2].image.dimensions(), (32, 32));
        assert!(levels.iter().all(|l| l.image.width() >= MIN_LEVEL_SIDE));
        assert!(levels.len() <= MAX_LEVELS);
    }

    #[test]
    fn test_flat_image_has_no_features() {
        let flat = GrayImage::from_pixel(80, 80, image::Luma([128]));
        assert!(GradientExtractor.extract(&flat).is_empty());
        assert!(BinaryExtractor::new().extract(&flat).is_empty());
    }

    #[test]
    fn test_binary_descriptor_bits() {
        let a = BinaryFeature {
            bits: [0b1011, 1],
            position: Point::new(3, 4),
        };
        let b = BinaryFeature {
            bits: [0b0001, 0],
            position: Point::new(0, 0),
        };
        assert_eq!(a.get_size(), 256);
        assert_eq!(a.hamming_distance(&b), 3);
        assert_eq!(a.get_bit_subset(&[0, 2, 3, 128]), 0b1101);
        assert_eq!(a.position(), Point::new(3, 4));
    }

    #[test]
    fn test_ratio_test_drops_ambiguous_and_duplicate_matches() {
        let feature = |x: f32, d: Vec<f32>| Feature {
            point: (x, 0.0),
            descriptor: d,
        };
        let template = vec![
            feature(0.0, vec![1.0, 0.0]),
            feature(1.0, vec![0.0, 1.0]),
            feature(2.0, vec![0.0, 0.98]),
        ];
        let frame = vec![
            feature(10.0, vec![1.0, 0.0]),
            feature(11.0, vec![0.0, 1.0]),
            feature(12.0, vec![-1.0, 0.0]),
        ];
        let pairs = ratio_test(&GradientExtractor, &template, &frame, 0.75);
        // Template features 1 and 2 both pick frame keypoint 11; only the
        // closer one survives.
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].frame, (10.0, 0.0));
        assert_eq!(pairs[1].template, (1.0, 0.0));
    }

    #[test]
    fn test_ratio_test_counts_shared_keypoints_once() {
        let feature = |p: (f32, f32), d: Vec<f32>| Feature {
            point: p,
            descriptor: d,
        };
        // Two orientation peaks at each keypoint.
        let template = vec![
            feature((5.0, 5.0), vec![1.0, 0.0]),
            feature((5.0, 5.0), vec![0.0, 1.0]),
        ];
        let frame = vec![
            feature((50.2, 49.9), vec![1.0, 0.0]),
            feature((50.2, 49.9), vec![0.0, 1.0]),
            feature((90.0, 90.0), vec![-1.0, -1.0]),
        ];
        let pairs = ratio_test(&GradientExtractor, &template, &frame, 0.75);
        assert_eq!(pairs.len(), 1, "{pairs:?}");
        assert_eq!(pairs[0].template, (5.0, 5.0));
    }

    #[test]
    fn test_aligned_correlation_rejects_misplaced_fit() {
        let template = block_template(13, 40);
        let mut frame = quiet_frame(200, 160, 3);
        paste(&mut frame, &template, 70, 50);

        let exact = aligned_correlation(&frame, &template, &Projection::translate(70.0, 50.0));
        assert!(exact.is_some_and(|a| a > 0.99), "exact {exact:?}");

        let off = aligned_correlation(&frame, &template, &Projection::translate(20.0, 100.0));
        assert!(off.is_some_and(|a| a < 0.3), "misplaced {off:?}");

        let outside = aligned_correlation(&frame, &template, &Projection::translate(180.0, 0.0));
        assert_eq!(outside, None);
    }

    #[test]
    fn test_gradient_features_never_misplace_small_scaled_icon() {
        let template = block_template(32, 32);
        let matcher = FeatureMatcher::new(GradientExtractor, StrategyKind::GradientFeatures);
        for scale in [1.4, 1.6, 2.0] {
            let resized = crate::detector::fixtures::scaled(&template, scale);
            let mut frame = quiet_frame(400, 300, 17);
            paste(&mut frame, &resized, 50, 40);
            let cx = (50 + resized.width() / 2) as i32;
            let cy = (40 + resized.height() / 2) as i32;
            for c in matcher.attempt(&frame, &template, 0.65) {
                assert!(
                    (c.x - cx).abs() <= 5 && (c.y - cy).abs() <= 5,
                    "scale {scale}: candidate at ({}, {}), true center ({cx}, {cy})",
                    c.x,
                    c.y
                );
            }
        }
    }

    #[test]
    fn test_gradient_features_locate_exact_paste() {
        let template = block_template(7, 64);
        let mut frame = quiet_frame(320, 240, 1);
        paste(&mut frame, &template, 150, 90);
        let matcher = FeatureMatcher::new(GradientExtractor, StrategyKind::GradientFeatures);
        let found = matcher.attempt(&frame, &template, 0.65);
        assert_eq!(found.len(), 1, "expected one candidate");
        let c = found[0];
        assert!(
            (c.x - 182).abs() <= 3 && (c.y - 122).abs() <= 3,
            "candidate at ({}, {})",
            c.x,
            c.y
        );
    }

    #[test]
    fn test_binary_features_locate_exact_paste() {
        let template = block_template(11, 96);
        let mut frame = quiet_frame(320, 240, 2);
        paste(&mut frame, &template, 60, 70);
        let matcher = FeatureMatcher::new(BinaryExtractor::new(), StrategyKind::BinaryFeatures);
        let found = matcher.attempt(&frame, &template, 0.65);
        assert_eq!(found.len(), 1, "expected one candidate");
        let c = found[0];
        assert!(
            (c.x - 108).abs() <= 3 && (c.y - 118).abs() <= 3,
            "candidate at ({}, {})",
            c.x,
            c.y
        );
    }
}
