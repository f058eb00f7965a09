//! Drift-detection decision policies
//!
//! A drift detector produces one distance score per evaluation window; a
//! decision policy turns the score into a "drift detected" boolean.
//!
//! ```
//! use trueno_select::drift::{DecisionPolicy, DynamicDecisionPolicy};
//!
//! let mut policy = DynamicDecisionPolicy::new(3, 0.5).unwrap();
//! assert!(policy.evaluate_decision(0.4)); // no history yet
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Turns a distance score into a drift decision
pub trait DecisionPolicy: Send {
    /// Decide whether `score` signals drift; may update internal state
    fn evaluate_decision(&mut self, score: f64) -> bool;
}

/// Drift when the score exceeds a fixed threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdDecisionPolicy {
    threshold: f64,
}

impl ThresholdDecisionPolicy {
    /// Create a policy with a fixed threshold
    #[must_use]
    pub const fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// The configured threshold
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl DecisionPolicy for ThresholdDecisionPolicy {
    fn evaluate_decision(&mut self, score: f64) -> bool {
        score > self.threshold
    }
}

/// Drift when the score exceeds a percentile of recently observed scores.
///
/// The percentile is computed over the window *before* the new score is
/// recorded, using linear interpolation between closest ranks. An empty
/// window always reports drift.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicDecisionPolicy {
    window_size: usize,
    percentile: f64,
    score_observations: VecDeque<f64>,
}

impl DynamicDecisionPolicy {
    /// Create a policy over the last `window_size` scores
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` if `window_size` is zero or
    /// `percentile` is outside `[0, 1]`
    pub fn new(window_size: usize, percentile: f64) -> Result<Self> {
        if window_size == 0 {
            return Err(Error::InvalidConfiguration(
                "window_size must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&percentile) {
            return Err(Error::InvalidConfiguration(format!(
                "percentile must be in [0, 1], got {percentile}"
            )));
        }
        Ok(Self {
            window_size,
            percentile,
            score_observations: VecDeque::with_capacity(window_size),
        })
    }

    /// Create a policy seeded with prior observations (oldest first).
    ///
    /// Only the newest `window_size` observations are kept.
    ///
    /// # Errors
    /// Same as [`DynamicDecisionPolicy::new`]
    pub fn with_observations(
        window_size: usize,
        percentile: f64,
        observations: impl IntoIterator<Item = f64>,
    ) -> Result<Self> {
        let mut policy = Self::new(window_size, percentile)?;
        for score in observations {
            policy.record(score);
        }
        Ok(policy)
    }

    /// Observed scores, oldest first
    #[must_use]
    pub const fn score_observations(&self) -> &VecDeque<f64> {
        &self.score_observations
    }

    fn record(&mut self, score: f64) {
        self.score_observations.push_back(score);
        while self.score_observations.len() > self.window_size {
            self.score_observations.pop_front();
        }
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn current_percentile(&self) -> Option<f64> {
        let mut sorted: Vec<f64> = self.score_observations.iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let rank = self.percentile * (sorted.len() - 1) as f64;
        let lower = rank.floor() as usize;
        let upper = rank.ceil() as usize;
        let fraction = rank - rank.floor();
        Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
    }
}

impl DecisionPolicy for DynamicDecisionPolicy {
    fn evaluate_decision(&mut self, score: f64) -> bool {
        let decision = self.current_percentile().map_or(true, |p| score > p);
        self.record(score);
        decision
    }
}

/// Serializable policy description
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum DecisionPolicyConfig {
    /// [`ThresholdDecisionPolicy`]
    Threshold {
        /// Fixed threshold
        threshold: f64,
    },
    /// [`DynamicDecisionPolicy`]
    Dynamic {
        /// Number of retained scores
        window_size: usize,
        /// Percentile in `[0, 1]`
        percentile: f64,
    },
}

impl DecisionPolicyConfig {
    /// Instantiate the described policy
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` for out-of-range parameters
    pub fn build(&self) -> Result<Box<dyn DecisionPolicy>> {
        Ok(match *self {
            Self::Threshold { threshold } => Box::new(ThresholdDecisionPolicy::new(threshold)),
            Self::Dynamic {
                window_size,
                percentile,
            } => Box::new(DynamicDecisionPolicy::new(window_size, percentile)?),
        })
    }
}
