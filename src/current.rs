//! Current calibration.
//!
//! The converter does not see the current through the probe resistor directly. The input
//! network adds an offset voltage `Voff` and an internal series resistance `RI`, so for a probe
//! resistor `R` in series with the fixed network resistance (60 ohm on the chip) the input
//! current `I` relates to the reading by
//! $$
//!     I = \frac{(R + 60 + R_I)(m \cdot \mathrm{adc} + b) + V_\mathrm{off}}{R + 60}
//! $$
//! where `m * adc + b` is the corrected current. All four parameters are fitted jointly. Which
//! samples count as outliers depends on the correction, and the correction depends on the fit.
//!
//! The canonical fit ([`FitMode::TwoPass`]) proceeds as follows:
//!
//! 1. Drop saturated and incomplete samples.
//! 2. Correct the currents with the seed `Voff` and `RI`, and seed `(m, b)` with a straight line.
//! 3. Cut at a loose residual and fit all four parameters.
//! 4. Correct again with the pass-1 result, cut at a tight residual and fit again.
//!
//! [`FitMode::SinglePass`] stops after a filtered straight line with `Voff` and `RI` held at
//! their seeds.

use std::collections::BTreeSet;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::config::{CurrentFitConfig, FitMode};
use crate::dataset::RawCurrentSample;
use crate::diagnostics::{CurrentResidual, PassDiagnostics, ResidualSummary};
use crate::key::CurrentKey;
use crate::math::{least_squares_line, LinearFit};
use crate::minimisation::Problem;
use crate::store::CurrentRecord;
use crate::{Error, Result};

/// Number of parameters of the nonlinear model
const NUM_PARAMS: usize = 4;

/// Parameters of the current model
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentParams {
    /// Corrected current per ADC count, in amp
    pub m: f64,
    /// Corrected current at zero counts, in amp
    pub b: f64,
    /// Injected offset, in volt
    pub v_off: f64,
    /// Internal series resistance, in ohm
    pub r_i: f64,
}

impl CurrentParams {
    /// ADC reading expected for a corrected current
    #[must_use]
    pub fn predicted_adc(&self, corrected_current: f64) -> f64 {
        (corrected_current - self.b) / self.m
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.m.is_finite() && self.b.is_finite() && self.v_off.is_finite() && self.r_i.is_finite()
    }

    fn with_line(self, line: &LinearFit) -> Self {
        Self {
            m: line.slope,
            b: line.intercept,
            ..self
        }
    }
}

/// The fixed part of the input network
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResistorNetwork {
    /// Resistance in series with every probe resistor, in ohm
    pub series_resistance: f64,
}

impl Default for ResistorNetwork {
    fn default() -> Self {
        Self {
            series_resistance: 60.0,
        }
    }
}

impl From<&CurrentFitConfig> for ResistorNetwork {
    fn from(config: &CurrentFitConfig) -> Self {
        Self {
            series_resistance: config.network_resistance,
        }
    }
}

impl ResistorNetwork {
    /// Probe resistor plus the series resistance
    #[must_use]
    pub fn load(&self, resistor_value: f64) -> f64 {
        resistor_value + self.series_resistance
    }

    /// Input current that makes the converter read `adc` with `resistor_value` ohm fitted
    #[must_use]
    pub fn predicted_current(
        &self,
        params: &CurrentParams,
        adc: f64,
        resistor_value: f64,
    ) -> f64 {
        let load = self.load(resistor_value);
        (load + params.r_i).mul_add(params.m.mul_add(adc, params.b), params.v_off) / load
    }

    /// Corrected current for a measured input current; the inverse of
    /// [`ResistorNetwork::predicted_current`] up to the affine law
    #[must_use]
    pub fn corrected_current(
        &self,
        params: &CurrentParams,
        input_current: f64,
        resistor_value: f64,
    ) -> f64 {
        let load = self.load(resistor_value);
        input_current.mul_add(load, -params.v_off) / (load + params.r_i)
    }
}

/// Outcome of fitting one partition
#[derive(Clone, Debug, PartialEq)]
pub struct CurrentFit {
    pub record: CurrentRecord,
    /// One entry per pass that ran, in order
    pub passes: Vec<PassDiagnostics>,
}

/// Fit the current calibration of one partition.
///
/// # Errors
/// Returns [`Error::EmptyFilteredData`] when saturation exclusion or a residual cut leaves no
/// samples, and [`Error::FitConvergence`] when the partition cannot determine the parameters or
/// the solver fails. Both only concern this partition.
pub fn fit_current_partition(
    key: &CurrentKey,
    samples: &[RawCurrentSample],
    config: &CurrentFitConfig,
) -> Result<CurrentFit> {
    CurrentFitter::new(key, config).fit(samples)
}

struct CurrentFitter<'a> {
    key: &'a CurrentKey,
    config: &'a CurrentFitConfig,
    network: ResistorNetwork,
}

impl<'a> CurrentFitter<'a> {
    fn new(key: &'a CurrentKey, config: &'a CurrentFitConfig) -> Self {
        Self {
            key,
            config,
            network: ResistorNetwork::from(config),
        }
    }

    fn fit(&self, samples: &[RawCurrentSample]) -> Result<CurrentFit> {
        let usable = self.exclude_saturated(samples)?;

        let fixed = CurrentParams {
            m: f64::NAN,
            b: f64::NAN,
            v_off: self.config.seed_v_off,
            r_i: self.config.seed_r_i,
        };
        let seed = fixed.with_line(&self.corrected_line(&usable, &fixed)?);
        tracing::debug!(key = %self.key, m = seed.m, b = seed.b, "seeded current fit");

        match self.config.mode {
            FitMode::TwoPass => self.fit_two_pass(&usable, seed),
            FitMode::SinglePass => self.fit_single_pass(&usable, seed),
        }
    }

    fn fit_two_pass(
        &self,
        usable: &[RawCurrentSample],
        seed: CurrentParams,
    ) -> Result<CurrentFit> {
        let loose = self.within(
            usable,
            &seed,
            self.config.loose_threshold,
            "loose residual cut",
        )?;
        let (first, first_pass) = self.minimise(&loose, &seed)?;
        tracing::debug!(
            key = %self.key,
            samples = first_pass.samples_used,
            rms = first_pass.rms_residual_current,
            m = first.m,
            b = first.b,
            v_off = first.v_off,
            r_i = first.r_i,
            "first nonlinear pass"
        );

        let tight = self.within(
            usable,
            &first,
            self.config.tight_threshold,
            "tight residual cut",
        )?;
        let (params, second_pass) = self.minimise(&tight, &first)?;
        tracing::debug!(
            key = %self.key,
            samples = second_pass.samples_used,
            rms = second_pass.rms_residual_current,
            m = params.m,
            b = params.b,
            v_off = params.v_off,
            r_i = params.r_i,
            "second nonlinear pass"
        );

        Ok(CurrentFit {
            record: self.record(&params),
            passes: vec![first_pass, second_pass],
        })
    }

    fn fit_single_pass(
        &self,
        usable: &[RawCurrentSample],
        seed: CurrentParams,
    ) -> Result<CurrentFit> {
        let kept = self.within(
            usable,
            &seed,
            self.config.single_pass_threshold,
            "residual cut",
        )?;
        let params = seed.with_line(&self.corrected_line(&kept, &seed)?);

        Ok(CurrentFit {
            record: self.record(&params),
            passes: vec![self.pass_diagnostics(&kept, &params, 0)],
        })
    }

    fn exclude_saturated(&self, samples: &[RawCurrentSample]) -> Result<Vec<RawCurrentSample>> {
        let ceiling = self
            .config
            .saturation
            .ceiling_for(self.key.op_amp_gain);
        let usable = samples
            .iter()
            .filter(|sample| sample.is_complete() && sample.input_current < ceiling)
            .cloned()
            .collect::<Vec<_>>();
        if usable.is_empty() {
            return Err(self.empty("saturation exclusion"));
        }
        Ok(usable)
    }

    /// Straight line of the corrected current against ADC counts, with `Voff` and `RI` from
    /// `params`
    fn corrected_line(
        &self,
        samples: &[RawCurrentSample],
        params: &CurrentParams,
    ) -> Result<LinearFit> {
        let adc: Array1<f64> = samples.iter().map(|s| s.adc_value).collect();
        let corrected: Array1<f64> = samples
            .iter()
            .map(|s| {
                self.network
                    .corrected_current(params, s.input_current, s.resistor_value)
            })
            .collect();
        least_squares_line(adc.view(), corrected.view()).ok_or_else(|| Error::FitConvergence {
            key: self.key.to_string(),
            reason: "ADC values do not vary, the line is undetermined".into(),
        })
    }

    /// Samples whose ADC residual under `params` is below `threshold` counts
    fn within(
        &self,
        samples: &[RawCurrentSample],
        params: &CurrentParams,
        threshold: f64,
        stage: &'static str,
    ) -> Result<Vec<RawCurrentSample>> {
        let kept = samples
            .iter()
            .filter(|sample| {
                CurrentResidual::new(sample, params, &self.network)
                    .residual
                    .abs()
                    < threshold
            })
            .cloned()
            .collect::<Vec<_>>();
        if kept.is_empty() {
            return Err(self.empty(stage));
        }
        Ok(kept)
    }

    fn minimise(
        &self,
        samples: &[RawCurrentSample],
        seed: &CurrentParams,
    ) -> Result<(CurrentParams, PassDiagnostics)> {
        self.check_determined(samples)?;

        let adc = samples.iter().map(|s| s.adc_value).collect::<Vec<_>>();
        let resistor = samples.iter().map(|s| s.resistor_value).collect::<Vec<_>>();
        let current = samples.iter().map(|s| s.input_current).collect::<Vec<_>>();

        let problem = Problem::build(&adc, &resistor, &current, &self.network, seed)
            .ok_or_else(|| self.not_converged("all input currents are zero"))?;
        let solution = problem
            .solve(seed, self.config.max_iters, self.config.tolerance)
            .map_err(|e| self.not_converged(&e.to_string()))?;

        let diagnostics = self.pass_diagnostics(samples, &solution.params, solution.iterations);
        Ok((solution.params, diagnostics))
    }

    /// A partition determines all four parameters only with enough samples spread over at
    /// least two probe resistors; with a single resistor `b`, `Voff` and `RI` are degenerate.
    fn check_determined(&self, samples: &[RawCurrentSample]) -> Result<()> {
        if samples.len() < NUM_PARAMS {
            return Err(self.not_converged(&format!(
                "{} samples cannot determine {NUM_PARAMS} parameters",
                samples.len()
            )));
        }
        let resistors = samples
            .iter()
            .map(|s| s.resistor_value.to_bits())
            .collect::<BTreeSet<_>>();
        if resistors.len() < 2 {
            return Err(self.not_converged("all samples use the same probe resistor"));
        }
        Ok(())
    }

    fn pass_diagnostics(
        &self,
        samples: &[RawCurrentSample],
        params: &CurrentParams,
        iterations: u64,
    ) -> PassDiagnostics {
        let summary = ResidualSummary::from_residuals(
            samples
                .iter()
                .map(|s| CurrentResidual::new(s, params, &self.network).current_residual),
        );
        PassDiagnostics {
            samples_used: summary.count,
            rms_residual_current: summary.rms,
            iterations,
        }
    }

    fn record(&self, params: &CurrentParams) -> CurrentRecord {
        CurrentRecord {
            key: self.key.clone(),
            m: params.m,
            b: params.b,
            v_off: params.v_off,
            r_i: params.r_i,
        }
    }

    fn empty(&self, stage: &'static str) -> Error {
        Error::EmptyFilteredData {
            key: self.key.to_string(),
            stage,
        }
    }

    fn not_converged(&self, reason: &str) -> Error {
        Error::FitConvergence {
            key: self.key.to_string(),
            reason: reason.to_owned(),
        }
    }
}
