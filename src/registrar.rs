//! Rigid intensity-based registration.
//!
//! [`GradientDescentRegistrar`] optimises the six parameters of a
//! [`RigidTransform`] over a coarse-to-fine pyramid. At every level both
//! volumes are smoothed (sigma in physical units) and shrunk, a random
//! subset of fixed voxels is drawn, and the metric between the fixed
//! samples and the moving volume seen through the transform is minimised
//! with finite-difference gradient descent.

use crate::enums::Interpolation;
use crate::interpolator::Interpolator;
use crate::pipeline::{Deadline, TimedOut};
use crate::transform::RigidTransform;
use crate::volume::{Geometry, Volume};

use ndarray::{Array3, Axis, Zip, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Samples per level never drop below this, whatever the sampling fraction
const MIN_SAMPLES: usize = 512;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// Mutual information from a joint histogram, moving intensities spread
    /// over neighbouring bins with a linear Parzen window.
    MattesMutualInformation { histogram_bins: usize },
    MeanSquares,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub metric: SimilarityMetric,
    /// Fraction of fixed voxels sampled at each level, in `(0, 1]`
    pub sampling_fraction: f64,
    pub sampling_seed: u64,
    pub interpolation: Interpolation,
    pub learning_rate: f64,
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
    pub convergence_window: usize,
    pub shrink_factors: Vec<usize>,
    /// Physical units, one per shrink factor
    pub smoothing_sigmas: Vec<f64>,
    /// Report running out of iterations on the finest level as a failure
    pub require_convergence: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            metric: SimilarityMetric::MattesMutualInformation {
                histogram_bins: 100,
            },
            sampling_fraction: 0.01,
            sampling_seed: 0,
            interpolation: Interpolation::Linear,
            learning_rate: 1.0,
            max_iterations: 200,
            convergence_tolerance: 1e-6,
            convergence_window: 10,
            shrink_factors: vec![4, 2, 1],
            smoothing_sigmas: vec![2.0, 1.0, 0.0],
            require_convergence: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed registration config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid registration config: {0}")]
    Invalid(String),
}

impl RegistrationConfig {
    /// Load a config from JSON; missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.shrink_factors.is_empty() {
            return invalid("at least one resolution level is required");
        }
        if self.shrink_factors.len() != self.smoothing_sigmas.len() {
            return invalid("shrink_factors and smoothing_sigmas must have the same length");
        }
        if self.shrink_factors.contains(&0) {
            return invalid("shrink factors must be at least 1");
        }
        if self.smoothing_sigmas.iter().any(|s| !(*s >= 0.0)) {
            return invalid("smoothing sigmas must be non-negative");
        }
        if !(self.sampling_fraction > 0.0 && self.sampling_fraction <= 1.0) {
            return invalid("sampling_fraction must be in (0, 1]");
        }
        if !(self.learning_rate > 0.0) {
            return invalid("learning_rate must be positive");
        }
        if self.convergence_window == 0 {
            return invalid("convergence_window must be at least 1");
        }
        if let SimilarityMetric::MattesMutualInformation { histogram_bins } = self.metric {
            if histogram_bins < 2 {
                return invalid("histogram_bins must be at least 2");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("Optimizer did not converge within {iterations} iterations (metric {metric})")]
    NonConvergence { iterations: usize, metric: f64 },

    #[error("Only {valid} of {total} sample points fall inside the moving volume")]
    InsufficientOverlap { valid: usize, total: usize },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Timeout(#[from] TimedOut),
}

pub trait Registrar: Send + Sync {
    /// Find the transform mapping fixed-space points onto the matching
    /// moving-space points, starting from `initial`.
    fn align(
        &self,
        fixed: &Volume,
        moving: &Volume,
        initial: &RigidTransform,
        config: &RegistrationConfig,
        deadline: &Deadline,
    ) -> Result<RigidTransform, RegistrationError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct GradientDescentRegistrar;

impl Registrar for GradientDescentRegistrar {
    fn align(
        &self,
        fixed: &Volume,
        moving: &Volume,
        initial: &RigidTransform,
        config: &RegistrationConfig,
        deadline: &Deadline,
    ) -> Result<RigidTransform, RegistrationError> {
        config.validate()?;
        let radius = Self::radius(fixed);
        let mut transform = *initial;
        let levels = config.shrink_factors.iter().zip(&config.smoothing_sigmas);
        let last_level = config.shrink_factors.len().saturating_sub(1);

        for (level, (&shrink, &sigma)) in levels.enumerate() {
            deadline.check()?;
            let fixed_level = Level::new(fixed, shrink, sigma);
            let moving_level = Level::new(moving, shrink, sigma);

            let mut rng = StdRng::seed_from_u64(config.sampling_seed.wrapping_add(level as u64));
            let evaluator = MetricEvaluator::new(&fixed_level, &moving_level, config, &mut rng);
            log::debug!(
                "Level {level}: shrink {shrink}, sigma {sigma}, {} samples",
                evaluator.samples.len()
            );

            let outcome =
                Self::optimize(&evaluator, transform, config, &fixed_level, radius, deadline)?;
            transform = outcome.transform;
            log::debug!(
                "Level {level}: metric {:.6} after {} iterations{}",
                outcome.value,
                outcome.iterations,
                if outcome.converged { " (converged)" } else { "" }
            );

            if level == last_level && !outcome.converged && config.require_convergence {
                return Err(RegistrationError::NonConvergence {
                    iterations: outcome.iterations,
                    metric: outcome.value,
                });
            }
        }

        Ok(transform)
    }
}

struct Optimized {
    transform: RigidTransform,
    value: f64,
    iterations: usize,
    converged: bool,
}

impl GradientDescentRegistrar {
    /// Largest distance from the centre of `volume` to one of its corners;
    /// turns an angle into the physical shift it causes at the edge.
    fn radius(volume: &Volume) -> f64 {
        let center = volume.center();
        let [nx, ny, nz] = volume.size().map(|n| (n as f64 - 1.0).max(0.0));
        let mut radius: f64 = 0.0;
        for corner in [
            [0.0, 0.0, 0.0],
            [nx, 0.0, 0.0],
            [0.0, ny, 0.0],
            [0.0, 0.0, nz],
            [nx, ny, 0.0],
            [nx, 0.0, nz],
            [0.0, ny, nz],
            [nx, ny, nz],
        ] {
            let p = volume.geometry.index_to_physical(corner);
            let distance = ((p[0] - center[0]).powi(2)
                + (p[1] - center[1]).powi(2)
                + (p[2] - center[2]).powi(2))
            .sqrt();
            radius = radius.max(distance);
        }
        radius.max(1.0)
    }

    fn optimize(
        evaluator: &MetricEvaluator<'_>,
        start: RigidTransform,
        config: &RegistrationConfig,
        fixed_level: &Level,
        radius: f64,
        deadline: &Deadline,
    ) -> Result<Optimized, RegistrationError> {
        // Rotations are scaled so one unit moves the volume edge as far as
        // one unit of translation does
        let scales = [radius * radius, radius * radius, radius * radius, 1.0, 1.0, 1.0];
        let max_step = fixed_level.min_spacing();
        let delta = 0.25 * max_step;

        let mut params = start.parameters();
        let mut value = evaluator.evaluate(&start)?;
        if !value.is_finite() {
            return Err(RegistrationError::NonConvergence {
                iterations: 0,
                metric: value,
            });
        }

        let mut learning_rate: Option<f64> = None;
        let mut history: VecDeque<f64> = VecDeque::with_capacity(config.convergence_window + 1);
        let mut converged = false;
        let mut iterations = 0;

        while iterations < config.max_iterations {
            deadline.check()?;
            iterations += 1;

            let gradient = Self::gradient(evaluator, &start, &params, value, delta, radius)?;
            let step: Vec<f64> = gradient.iter().zip(scales).map(|(g, s)| g / s).collect();
            let shift = (step[..3].iter().map(|r| (r * radius).powi(2)).sum::<f64>()
                + step[3..].iter().map(|t| t.powi(2)).sum::<f64>())
            .sqrt();
            if shift == 0.0 || !shift.is_finite() {
                converged = true;
                break;
            }

            // First step moves the volume by at most one voxel
            let rate = *learning_rate.get_or_insert(config.learning_rate * max_step / shift);
            let mut candidate = params;
            for (p, s) in candidate.iter_mut().zip(&step) {
                *p -= rate * s;
            }

            match evaluator.evaluate(&start.with_parameters(&candidate)) {
                Ok(candidate_value) if candidate_value < value => {
                    params = candidate;
                    value = candidate_value;
                }
                Ok(_) | Err(RegistrationError::InsufficientOverlap { .. }) => {
                    learning_rate = Some(rate / 2.0);
                }
                Err(err) => return Err(err),
            }

            history.push_back(value);
            if history.len() > config.convergence_window {
                history.pop_front();
            }
            if history.len() == config.convergence_window {
                let (low, high) = history
                    .iter()
                    .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                        (lo.min(v), hi.max(v))
                    });
                let magnitude = low.abs().max(high.abs()).max(f64::EPSILON);
                if (high - low) / magnitude <= config.convergence_tolerance {
                    converged = true;
                    break;
                }
            }
            log::trace!("Iteration {iterations}: metric {value:.6}, rate {rate:.3e}");
        }

        Ok(Optimized {
            transform: start.with_parameters(&params),
            value,
            iterations,
            converged,
        })
    }

    /// Central differences; a probe that leaves the moving volume falls
    /// back to a one-sided difference against the current value.
    fn gradient(
        evaluator: &MetricEvaluator<'_>,
        base: &RigidTransform,
        params: &[f64; RigidTransform::PARAMETERS],
        value: f64,
        delta: f64,
        radius: f64,
    ) -> Result<[f64; RigidTransform::PARAMETERS], RegistrationError> {
        let probe = |offset: f64, i: usize| -> Result<Option<f64>, RegistrationError> {
            let mut shifted = *params;
            shifted[i] += offset;
            match evaluator.evaluate(&base.with_parameters(&shifted)) {
                Ok(v) => Ok(Some(v)),
                Err(RegistrationError::InsufficientOverlap { .. }) => Ok(None),
                Err(err) => Err(err),
            }
        };

        let mut gradient = [0.0; RigidTransform::PARAMETERS];
        for (i, g) in gradient.iter_mut().enumerate() {
            let h = if i < 3 { delta / radius } else { delta };
            *g = match (probe(h, i)?, probe(-h, i)?) {
                (Some(plus), Some(minus)) => (plus - minus) / (2.0 * h),
                (Some(plus), None) => (plus - value) / h,
                (None, Some(minus)) => (value - minus) / h,
                (None, None) => 0.0,
            };
        }
        Ok(gradient)
    }
}

/// One pyramid level of a volume
struct Level {
    data: Array3<f32>,
    geometry: Geometry,
}

impl Level {
    fn new(volume: &Volume, shrink: usize, sigma: f64) -> Self {
        let geometry = &volume.geometry;
        let data = if sigma > 0.0 {
            // Volume data is (z, y, x), spacing is (x, y, z)
            let sigmas = [
                sigma / geometry.spacing[2],
                sigma / geometry.spacing[1],
                sigma / geometry.spacing[0],
            ];
            gaussian_smooth(volume.data(), sigmas)
        } else {
            volume.data().clone()
        };

        let step = shrink.max(1) as isize;
        let data = data.slice(s![..;step, ..;step, ..;step]).to_owned();
        let factor = shrink.max(1) as f64;
        let spacing = geometry.spacing.map(|s| s * factor);

        Self {
            data,
            geometry: Geometry {
                spacing,
                ..geometry.clone()
            },
        }
    }

    fn min_spacing(&self) -> f64 {
        self.geometry
            .spacing
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min)
    }

    fn range(&self) -> (f32, f32) {
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }
}

/// Separable Gaussian blur with per-axis sigmas in voxels, `(z, y, x)`.
fn gaussian_smooth(data: &Array3<f32>, sigmas: [f64; 3]) -> Array3<f32> {
    let mut current = data.clone();
    for (axis, &sigma) in sigmas.iter().enumerate() {
        if !(sigma > 0.0) || current.len_of(Axis(axis)) < 2 {
            continue;
        }
        let kernel = gaussian_kernel(sigma);
        let radius = (kernel.len() / 2) as isize;
        let mut smoothed = Array3::<f32>::zeros(current.raw_dim());

        Zip::from(current.lanes(Axis(axis)))
            .and(smoothed.lanes_mut(Axis(axis)))
            .par_for_each(|src, mut dst| {
                let last = src.len() as isize - 1;
                for (i, out) in dst.iter_mut().enumerate() {
                    *out = kernel
                        .iter()
                        .enumerate()
                        .map(|(k, w)| {
                            let j = (i as isize + k as isize - radius).clamp(0, last);
                            w * src[j as usize]
                        })
                        .sum();
                }
            });
        current = smoothed;
    }
    current
}

fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|x| (-(x * x) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let total: f64 = weights.iter().sum();
    weights.iter().map(|w| (w / total) as f32).collect()
}

struct Sample {
    point: [f64; 3],
    value: f32,
}

struct MetricEvaluator<'a> {
    samples: Vec<Sample>,
    moving: &'a Level,
    metric: SimilarityMetric,
    interpolation: Interpolation,
    fixed_range: (f32, f32),
    moving_range: (f32, f32),
}

impl<'a> MetricEvaluator<'a> {
    fn new(
        fixed: &Level,
        moving: &'a Level,
        config: &RegistrationConfig,
        rng: &mut StdRng,
    ) -> Self {
        let total = fixed.data.len();
        let fraction = config
            .sampling_fraction
            .max(MIN_SAMPLES as f64 / total.max(1) as f64)
            .min(1.0);

        let samples = fixed
            .data
            .indexed_iter()
            .filter(|_| fraction >= 1.0 || rng.r#gen::<f64>() < fraction)
            .map(|((z, y, x), &value)| Sample {
                point: fixed
                    .geometry
                    .index_to_physical([x as f64, y as f64, z as f64]),
                value,
            })
            .collect();

        Self {
            samples,
            moving,
            metric: config.metric.clone(),
            interpolation: config.interpolation,
            fixed_range: fixed.range(),
            moving_range: moving.range(),
        }
    }

    /// Metric value for `transform`, lower is better
    fn evaluate(&self, transform: &RigidTransform) -> Result<f64, RegistrationError> {
        let rotation = transform.matrix();
        let pairs: Vec<(f32, f32)> = self
            .samples
            .par_iter()
            .filter_map(|sample| {
                let mapped = RigidTransform::apply_with(
                    &rotation,
                    transform.center,
                    transform.translation,
                    sample.point,
                );
                let index = self.moving.geometry.physical_to_index(mapped);
                Interpolator::sample(&self.moving.data, index, self.interpolation)
                    .map(|moving| (sample.value, moving))
            })
            .collect();

        let total = self.samples.len();
        if pairs.is_empty() || pairs.len() * 4 < total {
            return Err(RegistrationError::InsufficientOverlap {
                valid: pairs.len(),
                total,
            });
        }

        Ok(match self.metric {
            SimilarityMetric::MeanSquares => {
                pairs
                    .iter()
                    .map(|&(f, m)| ((f - m) as f64).powi(2))
                    .sum::<f64>()
                    / pairs.len() as f64
            }
            SimilarityMetric::MattesMutualInformation { histogram_bins } => {
                -self.mutual_information(&pairs, histogram_bins)
            }
        })
    }

    fn mutual_information(&self, pairs: &[(f32, f32)], bins: usize) -> f64 {
        let position = |value: f32, (low, high): (f32, f32)| -> f64 {
            if high > low {
                let top = (bins - 1) as f64;
                (((value - low) / (high - low)) as f64 * top).clamp(0.0, top)
            } else {
                0.0
            }
        };

        let mut joint = vec![0.0f64; bins * bins];
        for &(f, m) in pairs {
            let row = position(f, self.fixed_range).round() as usize;
            let u = position(m, self.moving_range);
            let low = u.floor() as usize;
            let high = (low + 1).min(bins - 1);
            let weight = u - low as f64;
            joint[row * bins + low] += 1.0 - weight;
            joint[row * bins + high] += weight;
        }

        let total = pairs.len() as f64;
        let mut fixed_marginal = vec![0.0f64; bins];
        let mut moving_marginal = vec![0.0f64; bins];
        for row in 0..bins {
            for col in 0..bins {
                let p = joint[row * bins + col] / total;
                fixed_marginal[row] += p;
                moving_marginal[col] += p;
            }
        }

        let mut mi = 0.0;
        for row in 0..bins {
            for col in 0..bins {
                let p = joint[row * bins + col] / total;
                if p > 0.0 {
                    mi += p * (p / (fixed_marginal[row] * moving_marginal[col])).ln();
                }
            }
        }
        mi
    }
}
