//! Robust transform fitting between template and frame keypoints.

use imageproc::geometric_transformations::Projection;
use rand::SeedableRng;
use rand::rngs::StdRng;

const RANSAC_ITERATIONS: usize = 500;
/// Maximum reprojection distance (pixels) for a pair to count as an inlier.
const REPROJECTION_THRESHOLD: f32 = 3.0;
const RANSAC_SEED: u64 = 0x0061_6662_6a72_6e79;

/// Fewer accepted matches than this fall back to an affine model.
pub const HOMOGRAPHY_MIN_MATCHES: usize = 8;

/// One accepted descriptor match, as template-space and frame-space points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub template: (f32, f32),
    pub frame: (f32, f32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformModel {
    Affine,
    Homography,
}

impl TransformModel {
    pub fn for_match_count(matches: usize) -> Self {
        if matches < HOMOGRAPHY_MIN_MATCHES {
            TransformModel::Affine
        } else {
            TransformModel::Homography
        }
    }

    fn sample_size(self) -> usize {
        match self {
            TransformModel::Affine => 3,
            TransformModel::Homography => 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Verified {
    pub projection: Projection,
    pub model: TransformModel,
    pub inliers: usize,
}

impl Verified {
    /// Maps the template's four corners through the transform and returns
    /// their centroid.
    pub fn project_center(&self, width: u32, height: u32) -> (f32, f32) {
        let (w, h) = (width as f32, height as f32);
        let corners = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
        let (sx, sy) = corners.iter().fold((0.0, 0.0), |(ax, ay), &c| {
            let (x, y) = self.projection * c;
            (ax + x, ay + y)
        });
        (sx / 4.0, sy / 4.0)
    }
}

/// Minimum inlier ratio for a given accepted match count. Tightens through the
/// middle band where a handful of outliers can still fake a consistent fit.
pub fn required_inlier_ratio(matches: usize) -> f32 {
    match matches {
        0..=7 => 0.60,
        8..=14 => 0.70,
        15..=19 => 0.65,
        _ => 0.60,
    }
}

/// RANSAC over minimal samples followed by a least-squares refit on the
/// inlier set. Sampling is seeded so identical inputs give identical output.
pub fn estimate(pairs: &[Correspondence]) -> Option<Verified> {
    let model = TransformModel::for_match_count(pairs.len());
    let sample_size = model.sample_size();
    if pairs.len() < sample_size {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(RANSAC_SEED);
    let mut best: Option<(Projection, usize)> = None;
    let mut sample = Vec::with_capacity(sample_size);

    for _ in 0..RANSAC_ITERATIONS {
        sample.clear();
        sample.extend(
            rand::seq::index::sample(&mut rng, pairs.len(), sample_size)
                .iter()
                .map(|i| pairs[i]),
        );
        let Some(projection) = fit(model, &sample) else {
            continue;
        };
        let inliers = count_inliers(&projection, pairs);
        if best.is_none_or(|(_, n)| inliers > n) {
            best = Some((projection, inliers));
            if inliers == pairs.len() {
                break;
            }
        }
    }

    let (mut projection, mut inliers) = best?;
    // A minimal sample always fits itself.
    if inliers <= sample_size {
        return None;
    }

    let inlier_set: Vec<Correspondence> = pairs
        .iter()
        .filter(|c| is_inlier(&projection, c))
        .copied()
        .collect();
    if inlier_set.len() > sample_size
        && let Some(refined) = fit(model, &inlier_set)
    {
        let refined_inliers = count_inliers(&refined, pairs);
        if refined_inliers >= inliers {
            projection = refined;
            inliers = refined_inliers;
        }
    }

    Some(Verified {
        projection,
        model,
        inliers,
    })
}

fn is_inlier(projection: &Projection, c: &Correspondence) -> bool {
    let (x, y) = *projection * c.template;
    let (dx, dy) = (x - c.frame.0, y - c.frame.1);
    let dist_sq = dx * dx + dy * dy;
    dist_sq.is_finite() && dist_sq <= REPROJECTION_THRESHOLD * REPROJECTION_THRESHOLD
}

fn count_inliers(projection: &Projection, pairs: &[Correspondence]) -> usize {
    pairs.iter().filter(|c| is_inlier(projection, c)).count()
}

fn fit(model: TransformModel, pairs: &[Correspondence]) -> Option<Projection> {
    match model {
        TransformModel::Affine => fit_affine(pairs),
        TransformModel::Homography if pairs.len() == 4 => fit_homography_minimal(pairs),
        TransformModel::Homography => fit_homography(pairs),
    }
}

fn fit_homography_minimal(pairs: &[Correspondence]) -> Option<Projection> {
    let src: Vec<(f32, f32)> = pairs.iter().map(|c| c.template).collect();
    let dst: Vec<(f32, f32)> = pairs.iter().map(|c| c.frame).collect();
    if has_collinear_triple(&src) || has_collinear_triple(&dst) {
        return None;
    }
    Projection::from_control_points(
        [src[0], src[1], src[2], src[3]],
        [dst[0], dst[1], dst[2], dst[3]],
    )
}

fn has_collinear_triple(points: &[(f32, f32)]) -> bool {
    let n = points.len();
    for i in 0..n {
        for j in (i + 1)..n {
            for k in (j + 1)..n {
                let (a, b, c) = (points[i], points[j], points[k]);
                let area = (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0);
                if area.abs() < 1.0 {
                    return true;
                }
            }
        }
    }
    false
}

/// Least-squares affine fit; exact when given three non-collinear pairs.
fn fit_affine(pairs: &[Correspondence]) -> Option<Projection> {
    let mut ata = [0.0f64; 9];
    let mut atu = [0.0f64; 3];
    let mut atv = [0.0f64; 3];
    for c in pairs {
        let row = [c.template.0 as f64, c.template.1 as f64, 1.0];
        for r in 0..3 {
            for k in 0..3 {
                ata[r * 3 + k] += row[r] * row[k];
            }
            atu[r] += row[r] * c.frame.0 as f64;
            atv[r] += row[r] * c.frame.1 as f64;
        }
    }
    let top = solve(&mut ata.clone(), &mut atu, 3)?;
    let bottom = solve(&mut ata, &mut atv, 3)?;
    Projection::from_matrix([
        top[0] as f32,
        top[1] as f32,
        top[2] as f32,
        bottom[0] as f32,
        bottom[1] as f32,
        bottom[2] as f32,
        0.0,
        0.0,
        1.0,
    ])
}

/// Normalised direct linear transform with `h33 = 1`, solved through the
/// normal equations.
fn fit_homography(pairs: &[Correspondence]) -> Option<Projection> {
    let src: Vec<(f64, f64)> = pairs
        .iter()
        .map(|c| (c.template.0 as f64, c.template.1 as f64))
        .collect();
    let dst: Vec<(f64, f64)> = pairs
        .iter()
        .map(|c| (c.frame.0 as f64, c.frame.1 as f64))
        .collect();
    let ts = normalizer(&src)?;
    let td = normalizer(&dst)?;

    let mut ata = [0.0f64; 64];
    let mut atb = [0.0f64; 8];
    for (s, d) in src.iter().zip(&dst) {
        let (x, y) = apply(&ts, *s);
        let (u, v) = apply(&td, *d);
        let rows = [
            ([x, y, 1.0, 0.0, 0.0, 0.0, -x * u, -y * u], u),
            ([0.0, 0.0, 0.0, x, y, 1.0, -x * v, -y * v], v),
        ];
        for (row, b) in rows {
            for r in 0..8 {
                for k in 0..8 {
                    ata[r * 8 + k] += row[r] * row[k];
                }
                atb[r] += row[r] * b;
            }
        }
    }
    let h = solve(&mut ata, &mut atb, 8)?;
    let hn = [h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0];

    let td_inv = invert_similarity(&td);
    let full = mul3(&mul3(&td_inv, &hn), &ts);
    if full[8].abs() < 1e-12 {
        return None;
    }
    let mut out = [0.0f32; 9];
    for (o, v) in out.iter_mut().zip(full) {
        *o = (v / full[8]) as f32;
    }
    if out.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Projection::from_matrix(out)
}

/// Similarity that moves the centroid to the origin and scales the mean
/// distance to sqrt(2).
fn normalizer(points: &[(f64, f64)]) -> Option<[f64; 9]> {
    let n = points.len() as f64;
    let (cx, cy) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), p| (ax + p.0, ay + p.1));
    let (cx, cy) = (cx / n, cy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-9 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some([s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0])
}

fn invert_similarity(t: &[f64; 9]) -> [f64; 9] {
    let s = t[0];
    [1.0 / s, 0.0, -t[2] / s, 0.0, 1.0 / s, -t[5] / s, 0.0, 0.0, 1.0]
}

fn apply(t: &[f64; 9], p: (f64, f64)) -> (f64, f64) {
    (t[0] * p.0 + t[2], t[4] * p.1 + t[5])
}

fn mul3(a: &[f64; 9], b: &[f64; 9]) -> [f64; 9] {
    let mut out = [0.0; 9];
    for r in 0..3 {
        for c in 0..3 {
            out[r * 3 + c] = (0..3).map(|k| a[r * 3 + k] * b[k * 3 + c]).sum();
        }
    }
    out
}

/// Gaussian elimination with partial pivoting on a row-major `n x n` system.
fn solve(a: &mut [f64], b: &mut [f64], n: usize) -> Option<Vec<f64>> {
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| {
            a[i * n + col]
                .abs()
                .total_cmp(&a[j * n + col].abs())
        })?;
        if a[pivot * n + col].abs() < 1e-10 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap(col * n + k, pivot * n + k);
            }
            b.swap(col, pivot);
        }
        for row in (col + 1)..n {
            let factor = a[row * n + col] / a[col * n + col];
            for k in col..n {
                a[row * n + k] -= factor * a[col * n + k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = ((row + 1)..n).map(|k| a[row * n + k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row * n + row];
    }
    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs_from(points: &[(f32, f32)], map: impl Fn((f32, f32)) -> (f32, f32)) -> Vec<Correspondence> {
        points
            .iter()
            .map(|&p| Correspondence {
                template: p,
                frame: map(p),
            })
            .collect()
    }

    const GRID: [(f32, f32); 12] = [
        (2.0, 3.0),
        (30.0, 4.0),
        (15.0, 18.0),
        (5.0, 33.0),
        (36.0, 35.0),
        (22.0, 9.0),
        (11.0, 27.0),
        (28.0, 22.0),
        (8.0, 12.0),
        (33.0, 14.0),
        (19.0, 31.0),
        (25.0, 2.0),
    ];

    #[test]
    fn test_inlier_ratio_bands() {
        assert_eq!(required_inlier_ratio(5), 0.60);
        assert_eq!(required_inlier_ratio(8), 0.70);
        assert_eq!(required_inlier_ratio(14), 0.70);
        assert_eq!(required_inlier_ratio(15), 0.65);
        assert_eq!(required_inlier_ratio(19), 0.65);
        assert_eq!(required_inlier_ratio(20), 0.60);
    }

    #[test]
    fn test_affine_chosen_below_eight_matches() {
        let pairs = pairs_from(&GRID[..6], |(x, y)| (x + 100.0, y + 50.0));
        let verified = estimate(&pairs).unwrap();
        assert_eq!(verified.model, TransformModel::Affine);
        assert_eq!(verified.inliers, 6);
        let (cx, cy) = verified.project_center(40, 40);
        assert!((cx - 120.0).abs() < 0.5, "cx={cx}");
        assert!((cy - 70.0).abs() < 0.5, "cy={cy}");
    }

    #[test]
    fn test_homography_recovers_scaled_translation() {
        let pairs = pairs_from(&GRID, |(x, y)| (1.5 * x + 40.0, 1.5 * y + 20.0));
        let verified = estimate(&pairs).unwrap();
        assert_eq!(verified.model, TransformModel::Homography);
        assert_eq!(verified.inliers, GRID.len());
        let (cx, cy) = verified.project_center(40, 40);
        assert!((cx - 70.0).abs() < 0.5, "cx={cx}");
        assert!((cy - 50.0).abs() < 0.5, "cy={cy}");
    }

    #[test]
    fn test_outliers_are_rejected() {
        let mut pairs = pairs_from(&GRID, |(x, y)| (x + 10.0, y + 10.0));
        pairs[0].frame = (200.0, 5.0);
        pairs[5].frame = (3.0, 170.0);
        let verified = estimate(&pairs).unwrap();
        assert_eq!(verified.inliers, GRID.len() - 2);
    }

    #[test]
    fn test_collinear_points_do_not_fit() {
        let line: Vec<(f32, f32)> = (0..5).map(|i| (i as f32 * 4.0, i as f32 * 4.0)).collect();
        let pairs = pairs_from(&line, |(x, y)| (x + 1.0, y + 1.0));
        assert!(estimate(&pairs).is_none());
    }

    #[test]
    fn test_unsupported_minimal_fit_fails() {
        // Five pairs with no common transform: any three fit exactly, nothing else agrees.
        let pairs = vec![
            Correspondence { template: (0.0, 0.0), frame: (50.0, 9.0) },
            Correspondence { template: (20.0, 0.0), frame: (3.0, 80.0) },
            Correspondence { template: (0.0, 20.0), frame: (90.0, 60.0) },
            Correspondence { template: (20.0, 20.0), frame: (10.0, 10.0) },
            Correspondence { template: (10.0, 30.0), frame: (140.0, 120.0) },
        ];
        assert!(estimate(&pairs).is_none());
    }

    #[test]
    fn test_too_few_pairs() {
        let pairs = pairs_from(&GRID[..2], |p| p);
        assert!(estimate(&pairs).is_none());
    }

    #[test]
    fn test_no_scale_sanity_bound() {
        // A 6x blow-up is still accepted; no scale or aspect bound is applied.
        let pairs = pairs_from(&GRID, |(x, y)| (6.0 * x, 0.5 * y));
        let verified = estimate(&pairs).unwrap();
        assert_eq!(verified.inliers, GRID.len());
    }
}
