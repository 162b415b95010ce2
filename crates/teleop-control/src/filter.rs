//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Safety-constrained target filtering and differential IK."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Per-axis temporal smoothing of operator targets.

use std::f64::consts::PI;

use nalgebra::Vector3;
use teleop_common::FilterConfig;

/// Smallest time step used when consecutive samples share a timestamp.
pub const MIN_DT: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct AxisMemory {
    prev: f64,
    prev_dx: f64,
}

/// Filter memory. Empty until the first sample seeds it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterState {
    axes: Option<[AxisMemory; 3]>,
    prev_t: f64,
}

impl FilterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every previous sample.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_seeded(&self) -> bool {
        self.axes.is_some()
    }

    /// Last filtered position, if any sample has been seen.
    pub fn last_output(&self) -> Option<Vector3<f64>> {
        self.axes
            .map(|axes| Vector3::new(axes[0].prev, axes[1].prev, axes[2].prev))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TemporalFilter {
    OneEuro {
        min_cutoff: f64,
        beta: f64,
        d_cutoff: f64,
    },
    Lowpass {
        alpha: f64,
    },
    Passthrough,
}

fn smoothing_factor(dt: f64, cutoff: f64) -> f64 {
    let r = 2.0 * PI * cutoff * dt;
    r / (r + 1.0)
}

impl TemporalFilter {
    pub fn from_config(config: &FilterConfig) -> Self {
        match *config {
            FilterConfig::OneEuro {
                min_cutoff,
                beta,
                d_cutoff,
            } => TemporalFilter::OneEuro {
                min_cutoff,
                beta,
                d_cutoff,
            },
            FilterConfig::Lowpass { alpha } => TemporalFilter::Lowpass { alpha },
            FilterConfig::None => TemporalFilter::Passthrough,
        }
    }

    /// Filter `raw` sampled at `t_s` seconds, updating `state`.
    ///
    /// The first sample after a reset is returned unchanged.
    pub fn apply(&self, state: &mut FilterState, raw: Vector3<f64>, t_s: f64) -> Vector3<f64> {
        let Some(mut axes) = state.axes else {
            state.axes = Some([
                AxisMemory { prev: raw.x, prev_dx: 0.0 },
                AxisMemory { prev: raw.y, prev_dx: 0.0 },
                AxisMemory { prev: raw.z, prev_dx: 0.0 },
            ]);
            state.prev_t = t_s;
            return raw;
        };

        let dt = (t_s - state.prev_t).max(MIN_DT);
        let mut out = Vector3::zeros();
        for (axis, memory) in axes.iter_mut().enumerate() {
            let x = raw[axis];
            out[axis] = match *self {
                TemporalFilter::OneEuro {
                    min_cutoff,
                    beta,
                    d_cutoff,
                } => {
                    let dx = (x - memory.prev) / dt;
                    let a_d = smoothing_factor(dt, d_cutoff);
                    let dx_hat = a_d * dx + (1.0 - a_d) * memory.prev_dx;
                    let cutoff = min_cutoff + beta * dx_hat.abs();
                    let a = smoothing_factor(dt, cutoff);
                    memory.prev_dx = dx_hat;
                    a * x + (1.0 - a) * memory.prev
                }
                TemporalFilter::Lowpass { alpha } => alpha * x + (1.0 - alpha) * memory.prev,
                TemporalFilter::Passthrough => x,
            };
            memory.prev = out[axis];
        }
        state.axes = Some(axes);
        state.prev_t = t_s;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_euro() -> TemporalFilter {
        TemporalFilter::OneEuro {
            min_cutoff: 1.0,
            beta: 0.0,
            d_cutoff: 1.0,
        }
    }

    #[test]
    fn first_sample_passes_through_and_seeds() {
        let mut state = FilterState::new();
        let raw = Vector3::new(0.4, -0.1, 1.2);
        assert_eq!(one_euro().apply(&mut state, raw, 10.0), raw);
        assert_eq!(state.last_output(), Some(raw));
    }

    #[test]
    fn one_euro_lags_a_step_and_converges() {
        let filter = one_euro();
        let mut state = FilterState::new();
        filter.apply(&mut state, Vector3::zeros(), 0.0);
        let target = Vector3::new(1.0, 0.0, 0.0);
        let first = filter.apply(&mut state, target, 1.0 / 60.0);
        assert!(first.x > 0.0 && first.x < 1.0);
        let mut last = first;
        for tick in 2..600 {
            last = filter.apply(&mut state, target, tick as f64 / 60.0);
        }
        assert!((last.x - 1.0).abs() < 1e-6);
    }

    #[test]
    fn speed_coefficient_reduces_lag() {
        let slow = one_euro();
        let fast = TemporalFilter::OneEuro {
            min_cutoff: 1.0,
            beta: 5.0,
            d_cutoff: 1.0,
        };
        let mut a = FilterState::new();
        let mut b = FilterState::new();
        slow.apply(&mut a, Vector3::zeros(), 0.0);
        fast.apply(&mut b, Vector3::zeros(), 0.0);
        let step = Vector3::new(0.5, 0.0, 0.0);
        let slow_out = slow.apply(&mut a, step, 0.02);
        let fast_out = fast.apply(&mut b, step, 0.02);
        assert!(fast_out.x > slow_out.x);
    }

    #[test]
    fn lowpass_blends_with_previous_output() {
        let filter = TemporalFilter::Lowpass { alpha: 0.25 };
        let mut state = FilterState::new();
        filter.apply(&mut state, Vector3::zeros(), 0.0);
        let out = filter.apply(&mut state, Vector3::new(4.0, 8.0, -4.0), 0.1);
        assert_eq!(out, Vector3::new(1.0, 2.0, -1.0));
    }

    #[test]
    fn reset_clears_memory() {
        let filter = TemporalFilter::Lowpass { alpha: 0.1 };
        let mut state = FilterState::new();
        filter.apply(&mut state, Vector3::zeros(), 0.0);
        state.reset();
        assert!(!state.is_seeded());
        let raw = Vector3::new(3.0, 3.0, 3.0);
        assert_eq!(filter.apply(&mut state, raw, 0.5), raw);
    }

    #[test]
    fn repeated_timestamps_stay_finite() {
        let filter = one_euro();
        let mut state = FilterState::new();
        filter.apply(&mut state, Vector3::zeros(), 1.0);
        let out = filter.apply(&mut state, Vector3::new(1.0, 1.0, 1.0), 1.0);
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
