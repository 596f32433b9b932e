//! Per-sample residuals of fitted calibrations.
//!
//! Nothing here renders anything. The vectors are what a plotting front end needs to draw a
//! fit against its data, and the fitters use the same residual definitions to reject outliers.

use serde::Serialize;

use crate::current::{CurrentParams, ResistorNetwork};
use crate::dataset::{RawCurrentSample, RawVoltageSample};
use crate::math::{rms, LinearFit};
use crate::store::{CurrentRecord, VoltageRecord};

/// A voltage sample compared against a calibration line
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct VoltageResidual {
    pub input_voltage: f64,
    pub adc_value: f64,
    /// ADC count the line expects for `input_voltage`
    pub predicted_adc: f64,
    /// `adc_value - predicted_adc`
    pub residual: f64,
}

impl VoltageResidual {
    /// Residual of `sample` against `voltage = line.slope * adc + line.intercept`
    #[must_use]
    pub fn new(sample: &RawVoltageSample, line: &LinearFit) -> Self {
        let predicted_adc = line.invert(sample.input_voltage);
        Self {
            input_voltage: sample.input_voltage,
            adc_value: sample.adc_value,
            predicted_adc,
            residual: sample.adc_value - predicted_adc,
        }
    }
}

/// A current sample compared against a current calibration
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CurrentResidual {
    /// Measured input current mapped through the network correction
    pub corrected_input_current: f64,
    pub adc_value: f64,
    pub predicted_adc: f64,
    /// `adc_value - predicted_adc`
    pub residual: f64,
    /// Measured minus modelled input current, in amp
    pub current_residual: f64,
}

impl CurrentResidual {
    #[must_use]
    pub fn new(
        sample: &RawCurrentSample,
        params: &CurrentParams,
        network: &ResistorNetwork,
    ) -> Self {
        let corrected_input_current =
            network.corrected_current(params, sample.input_current, sample.resistor_value);
        let predicted_adc = params.predicted_adc(corrected_input_current);
        let current_residual = sample.input_current
            - network.predicted_current(params, sample.adc_value, sample.resistor_value);
        Self {
            corrected_input_current,
            adc_value: sample.adc_value,
            predicted_adc,
            residual: sample.adc_value - predicted_adc,
            current_residual,
        }
    }
}

#[must_use]
pub fn voltage_residuals(
    record: &VoltageRecord,
    samples: &[RawVoltageSample],
) -> Vec<VoltageResidual> {
    let line = LinearFit {
        slope: record.m,
        intercept: record.b,
    };
    samples
        .iter()
        .map(|sample| VoltageResidual::new(sample, &line))
        .collect()
}

/// Residuals of the complete samples; incomplete readings have nothing to compare
#[must_use]
pub fn current_residuals(
    record: &CurrentRecord,
    network: &ResistorNetwork,
    samples: &[RawCurrentSample],
) -> Vec<CurrentResidual> {
    let params = record.params();
    samples
        .iter()
        .filter(|sample| sample.is_complete())
        .map(|sample| CurrentResidual::new(sample, &params, network))
        .collect()
}

/// Spread of a set of residuals
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct ResidualSummary {
    pub count: usize,
    pub rms: f64,
    pub max_abs: f64,
}

impl ResidualSummary {
    #[must_use]
    pub fn from_residuals(residuals: impl IntoIterator<Item = f64>) -> Self {
        let residuals = residuals.into_iter().collect::<Vec<_>>();
        Self {
            count: residuals.len(),
            rms: rms(&residuals),
            max_abs: residuals.iter().fold(0.0, |acc: f64, r| acc.max(r.abs())),
        }
    }
}

/// How one pass of the current fit went
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PassDiagnostics {
    /// Samples that survived the residual cut and entered the fit
    pub samples_used: usize,
    /// RMS of measured minus modelled input current over those samples, in amp
    pub rms_residual_current: f64,
    /// Solver iterations, zero for a linear pass
    pub iterations: u64,
}

#[cfg(test)]
mod tests {
    use crate::current::ResistorNetwork;
    use crate::dataset::{RawCurrentSample, RawVoltageSample};
    use crate::key::{CurrentKey, VoltageKey};
    use crate::store::{CurrentRecord, VoltageRecord};

    use super::{current_residuals, voltage_residuals, ResidualSummary};

    fn sample(input_voltage: f64, adc_value: f64) -> RawVoltageSample {
        RawVoltageSample {
            device: "AMAC01".into(),
            channel: "CH0_L".into(),
            bandgap_control: 10,
            ramp_gain: 3,
            input_voltage,
            adc_value,
        }
    }

    #[test]
    fn voltage_residuals_are_measured_in_counts() {
        let record = VoltageRecord {
            key: VoltageKey {
                device: "AMAC01".into(),
                channel: "CH0_L".into(),
                bandgap_control: 10,
                ramp_gain: 3,
            },
            m: 1e-3,
            b: 0.01,
        };
        let residuals = voltage_residuals(&record, &[sample(0.11, 100.0), sample(0.21, 230.0)]);

        approx::assert_relative_eq!(residuals[0].predicted_adc, 100.0, max_relative = 1e-12);
        approx::assert_abs_diff_eq!(residuals[0].residual, 0.0, epsilon = 1e-9);
        approx::assert_relative_eq!(residuals[1].residual, 30.0, max_relative = 1e-9);
    }

    #[test]
    fn summary_reports_rms_and_extreme() {
        let summary = ResidualSummary::from_residuals([1.0, -1.0, 1.0, -1.0]);
        assert_eq!(summary.count, 4);
        approx::assert_relative_eq!(summary.rms, 1.0);
        approx::assert_relative_eq!(summary.max_abs, 1.0);

        let summary = ResidualSummary::from_residuals([0.5, -4.0]);
        approx::assert_relative_eq!(summary.max_abs, 4.0);
        assert_eq!(ResidualSummary::from_residuals(std::iter::empty()).count, 0);
    }

    #[test]
    fn current_residuals_skip_incomplete_readings() {
        let key = CurrentKey {
            device: "AMAC01".into(),
            channel: "CH1_R".into(),
            bandgap_control: 10,
            ramp_gain: 3,
            op_amp_gain: 4,
        };
        let record = CurrentRecord {
            key: key.clone(),
            m: 2e-6,
            b: 1e-6,
            v_off: -0.1,
            r_i: 50.0,
        };
        let network = ResistorNetwork::default();
        let sample = |resistor_value: f64, adc_value: f64, shift: f64| RawCurrentSample {
            device: key.device.clone(),
            channel: key.channel.clone(),
            bandgap_control: key.bandgap_control,
            ramp_gain: key.ramp_gain,
            op_amp_gain: key.op_amp_gain,
            resistor_value,
            input_current: record.predicted_current(&network, adc_value, resistor_value),
            adc_value: adc_value + shift,
        };
        let mut gap = sample(1_000.0, 100.0, 0.0);
        gap.input_current = f64::NAN;

        let residuals = current_residuals(
            &record,
            &network,
            &[sample(1_000.0, 400.0, 0.0), gap, sample(4_700.0, 250.0, 12.0)],
        );

        assert_eq!(residuals.len(), 2);
        approx::assert_abs_diff_eq!(residuals[0].residual, 0.0, epsilon = 1e-6);
        approx::assert_relative_eq!(
            residuals[0].corrected_input_current,
            record.m.mul_add(400.0, record.b),
            max_relative = 1e-12
        );
        approx::assert_relative_eq!(residuals[1].residual, 12.0, max_relative = 1e-6);
        assert!(residuals[1].current_residual.abs() > 0.0);
    }
}
