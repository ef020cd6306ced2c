//! Template location in captured frames.
//!
//! A [`Detector`] runs an ordered cascade of [`MatchStrategy`] implementations
//! and returns the first non-empty result. Scores are strategy-specific and
//! are not comparable across strategies.

mod correlation;
mod features;
mod geometry;

use image::GrayImage;
use serde::Serialize;

pub use correlation::{CORRELATION_THRESHOLD, CorrelationMatcher};
pub use features::{BinaryExtractor, DescriptorExtractor, FeatureMatcher, GradientExtractor};

/// Base acceptance threshold for the feature-based strategies.
pub const DEFAULT_THRESHOLD: f32 = 0.65;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    GradientFeatures,
    BinaryFeatures,
    Correlation,
}

/// Estimated center of a template occurrence, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub x: i32,
    pub y: i32,
    /// Inlier ratio for feature strategies, correlation for the fallback.
    pub score: f32,
    pub strategy: StrategyKind,
}

pub trait MatchStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Candidates in discovery order; empty when the template is not found.
    fn attempt(
        &self,
        frame: &GrayImage,
        template: &GrayImage,
        threshold: f32,
    ) -> Vec<MatchCandidate>;
}

pub struct Detector {
    strategies: Vec<Box<dyn MatchStrategy>>,
}

impl Default for Detector {
    /// Gradient features, then binary features, then multi-scale correlation.
    fn default() -> Self {
        Self::with_strategies(vec![
            Box::new(FeatureMatcher::new(
                GradientExtractor,
                StrategyKind::GradientFeatures,
            )),
            Box::new(FeatureMatcher::new(
                BinaryExtractor::new(),
                StrategyKind::BinaryFeatures,
            )),
            Box::new(CorrelationMatcher),
        ])
    }
}

impl Detector {
    pub fn with_strategies(strategies: Vec<Box<dyn MatchStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategies(&self) -> impl Iterator<Item = StrategyKind> + '_ {
        self.strategies.iter().map(|s| s.kind())
    }

    pub fn locate(
        &self,
        frame: &GrayImage,
        template: &GrayImage,
        threshold: f32,
    ) -> Vec<MatchCandidate> {
        for strategy in &self.strategies {
            let found = strategy.attempt(frame, template, threshold);
            if let Some(first) = found.first() {
                tracing::info!(
                    "{:?} matched {}x{} template at ({}, {}) score={:.3}",
                    strategy.kind(),
                    template.width(),
                    template.height(),
                    first.x,
                    first.y,
                    first.score
                );
                return found;
            }
        }
        tracing::debug!(
            "no strategy matched {}x{} template",
            template.width(),
            template.height()
        );
        Vec::new()
    }
}
