//! Simulation periods and adaptive time stepping.
//!
//! The [`TimeStepController`] owns all state that changes between time steps
//! but not within one: the active period, the step size,
//! the simulated time and the split of the well rate over the well links.

use serde::{Deserialize, Serialize};

use crate::{assembly::WellTarget, config::TimeStepConfig};

/// Rates below this magnitude count as zero when redistributing.
const RATE_TOLERANCE: f64 = 1e-10;

/// How the well is driven during a period.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WellControl {
    /// Total volumetric rate; positive produces, negative injects.
    Rate(f64),
    /// Bottom-hole pressure.
    Bhp(f64),
}

/// A time interval with a constant well control.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Period {
    /// Time at which the period ends.
    /// Each period starts where the previous one ended, the first at time 0.
    pub end: f64,
    /// The control in effect.
    pub control: WellControl,
}

/// Error in time stepping.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ControlError {
    /// A step failed at the smallest allowed step size.
    #[error("Step of {step:e} failed at t = {time} in period {period} and cannot be reduced further")]
    StepSizeExhausted {
        /// Index of the active period.
        period: usize,
        /// Time the step started from.
        time: f64,
        /// Size of the failed step.
        step: f64,
    },
    /// The periods or step size limits are unusable.
    #[error("Invalid schedule: {reason}")]
    InvalidSchedule {
        /// What is wrong.
        reason: String,
    },
}

/// Period state machine and step size heuristic.
#[derive(Clone, Debug)]
pub struct TimeStepController {
    config: TimeStepConfig,
    periods: Vec<Period>,
    link_lengths: Vec<f64>,
    period: usize,
    time: f64,
    ht: f64,
    link_rates: Vec<f64>,
    /// Total rate the current link split adds up to, `None` outside rate periods.
    split_rate: Option<f64>,
}

impl TimeStepController {
    /// Create a controller at time 0 in the first period.
    ///
    /// `link_lengths` are the face lengths of the well links,
    /// used to split a rate over them.
    pub fn new(
        config: TimeStepConfig,
        periods: Vec<Period>,
        link_lengths: Vec<f64>,
    ) -> Result<Self, ControlError> {
        let invalid = |reason: &str| ControlError::InvalidSchedule {
            reason: reason.to_string(),
        };
        if periods.is_empty() {
            return Err(invalid("no periods"));
        }
        let mut start = 0.0;
        for p in &periods {
            if !(p.end > start) || !p.end.is_finite() {
                return Err(invalid("period end times must be finite and increasing"));
            }
            start = p.end;
        }
        if !(config.ht_min > 0.0 && config.ht_min <= config.ht_max) {
            return Err(invalid("step size limits must satisfy 0 < ht_min <= ht_max"));
        }
        if !(config.growth_factor >= 1.0) {
            return Err(invalid("growth factor must be at least 1"));
        }

        let mut ctl = Self {
            ht: config.ht_min,
            config,
            periods,
            link_rates: vec![0.0; link_lengths.len()],
            link_lengths,
            period: 0,
            time: 0.0,
            split_rate: None,
        };
        ctl.enter_period(0);
        Ok(ctl)
    }

    /// Step size limits and adaptation parameters.
    #[inline]
    pub fn config(&self) -> &TimeStepConfig {
        &self.config
    }

    /// All periods in order.
    #[inline]
    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    /// Index of the active period.
    #[inline]
    pub fn period_index(&self) -> usize {
        self.period
    }

    /// The active period.
    #[inline]
    pub fn period(&self) -> &Period {
        &self.periods[self.period]
    }

    /// Current simulated time.
    #[inline]
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Current step size, always within `[ht_min, ht_max]`.
    #[inline]
    pub fn ht(&self) -> f64 {
        self.ht
    }

    /// Rate assigned to each well link.
    /// All zero in pressure-controlled periods.
    #[inline]
    pub fn link_rates(&self) -> &[f64] {
        &self.link_rates
    }

    /// Whether the end of the last period has been reached.
    pub fn is_finished(&self) -> bool {
        self.period == self.periods.len() - 1 && self.time >= self.period().end
    }

    /// The well control for the assembler.
    pub fn well_target(&self) -> WellTarget<'_> {
        match self.period().control {
            WellControl::Rate(_) => WellTarget::Rate {
                link_rates: &self.link_rates,
            },
            WellControl::Bhp(pressure) => WellTarget::Bhp { pressure },
        }
    }

    /// Size of the next step: the current step size,
    /// shortened so as not to pass the end of the period.
    pub fn next_step(&self) -> f64 {
        self.ht.min(self.period().end - self.time).max(0.0)
    }

    /// Advance time by a step that converged in `iterations` Newton iterations,
    /// then adapt the step size or move on to the next period.
    pub fn on_converged(&mut self, step: f64, iterations: usize) {
        let end = self.period().end;
        let tol = 1e-12 * end.abs().max(1.0);
        if self.time + step >= end - tol {
            self.time = end;
        } else {
            self.time += step;
        }

        if self.time >= end && self.period + 1 < self.periods.len() {
            self.enter_period(self.period + 1);
            return;
        }

        let factor = self.config.growth_factor;
        if iterations < self.config.iteration_threshold {
            self.ht *= factor;
        } else if iterations > self.config.iteration_threshold {
            self.ht /= factor;
        }
        self.ht = self.ht.clamp(self.config.ht_min, self.config.ht_max);
    }

    /// Halve the step size after a failed step of size `step`.
    /// Fails if the step was already as small as allowed.
    pub fn on_failure(&mut self, step: f64) -> Result<(), ControlError> {
        if step <= self.config.ht_min * (1.0 + 1e-12) {
            return Err(ControlError::StepSizeExhausted {
                period: self.period,
                time: self.time,
                step,
            });
        }
        self.ht = (0.5 * step).max(self.config.ht_min);
        log::warn!(
            "Step of {step:e} failed at t = {}, retrying with {:e}",
            self.time,
            self.ht
        );
        Ok(())
    }

    fn enter_period(&mut self, period: usize) {
        self.period = period;
        self.ht = self.config.ht_min;
        match self.periods[period].control {
            WellControl::Rate(rate) => {
                match self.split_rate {
                    Some(old) if old.abs() > RATE_TOLERANCE => {
                        let scale = rate / old;
                        for q in &mut self.link_rates {
                            *q *= scale;
                        }
                    }
                    _ => {
                        let total: f64 = self.link_lengths.iter().sum();
                        for (q, len) in self.link_rates.iter_mut().zip(&self.link_lengths) {
                            *q = if total > 0.0 { rate * len / total } else { 0.0 };
                        }
                    }
                }
                self.split_rate = Some(rate);
            }
            WellControl::Bhp(_) => {
                self.link_rates.iter_mut().for_each(|q| *q = 0.0);
                self.split_rate = None;
            }
        }
        log::info!(
            "Entering period {period} at t = {}: {:?}",
            self.time,
            self.periods[period].control
        );
    }
}
