//! Foreground detection on single slices.

use ndarray::{Array2, ArrayView2};
use std::collections::VecDeque;

pub trait Thresholder: Send + Sync {
    /// Intensity separating background from foreground in `slice`.
    ///
    /// Never called with a constant slice.
    fn compute_threshold(&self, slice: ArrayView2<'_, f32>) -> f32;
}

/// Li's iterative minimum cross-entropy threshold.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiThresholder;

impl Thresholder for LiThresholder {
    fn compute_threshold(&self, slice: ArrayView2<'_, f32>) -> f32 {
        let values: Vec<f64> = slice
            .iter()
            .filter(|v| v.is_finite())
            .map(|&v| v as f64)
            .collect();
        if values.is_empty() {
            return f32::NAN;
        }

        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let tolerance = Self::tolerance(&values);

        // Work on values shifted to start at zero so the logarithms are defined
        let shifted: Vec<f64> = values.iter().map(|v| v - min).collect();
        let mut next = shifted.iter().sum::<f64>() / shifted.len() as f64;
        let mut current = -2.0 * tolerance;

        while (next - current).abs() > tolerance {
            current = next;
            let (mut fore_sum, mut fore_count) = (0.0, 0usize);
            let (mut back_sum, mut back_count) = (0.0, 0usize);
            for &v in &shifted {
                if v > current {
                    fore_sum += v;
                    fore_count += 1;
                } else {
                    back_sum += v;
                    back_count += 1;
                }
            }
            if fore_count == 0 || back_count == 0 {
                break;
            }

            let mean_fore = fore_sum / fore_count as f64;
            let mean_back = back_sum / back_count as f64;
            if mean_back == 0.0 {
                break;
            }
            next = (mean_back - mean_fore) / (mean_back.ln() - mean_fore.ln());
            if !next.is_finite() {
                next = current;
                break;
            }
        }

        (next + min) as f32
    }
}

impl LiThresholder {
    /// Half the smallest gap between two distinct intensities.
    fn tolerance(values: &[f64]) -> f64 {
        let mut sorted = values.to_vec();
        sorted.sort_unstable_by(f64::total_cmp);
        sorted.dedup();
        let smallest_step = sorted
            .windows(2)
            .map(|w| w[1] - w[0])
            .fold(f64::INFINITY, f64::min);
        if smallest_step.is_finite() {
            smallest_step / 2.0
        } else {
            0.5
        }
    }
}

/// Turn background pixels that cannot reach the slice border through
/// 4-connected background into foreground.
pub fn fill_holes(foreground: ArrayView2<'_, bool>) -> Array2<bool> {
    let (height, width) = foreground.dim();
    let mut outside = Array2::from_elem((height, width), false);
    let mut queue = VecDeque::new();

    let seed = |y: usize,
                x: usize,
                outside: &mut Array2<bool>,
                queue: &mut VecDeque<(usize, usize)>| {
        if !foreground[[y, x]] && !outside[[y, x]] {
            outside[[y, x]] = true;
            queue.push_back((y, x));
        }
    };

    for x in 0..width {
        seed(0, x, &mut outside, &mut queue);
        seed(height - 1, x, &mut outside, &mut queue);
    }
    for y in 0..height {
        seed(y, 0, &mut outside, &mut queue);
        seed(y, width - 1, &mut outside, &mut queue);
    }

    while let Some((y, x)) = queue.pop_front() {
        if y > 0 {
            seed(y - 1, x, &mut outside, &mut queue);
        }
        if y + 1 < height {
            seed(y + 1, x, &mut outside, &mut queue);
        }
        if x > 0 {
            seed(y, x - 1, &mut outside, &mut queue);
        }
        if x + 1 < width {
            seed(y, x + 1, &mut outside, &mut queue);
        }
    }

    outside.mapv(|reachable| !reachable)
}
