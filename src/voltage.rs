//! Voltage calibration: a straight line `voltage = m * adc + b` with outlier rejection.
//!
//! The initial line is fitted on the samples below the ramp-gain dependent window, where the
//! converter is known to be linear. Every sample of the partition, including those above the
//! window, is then judged by its distance in ADC counts from that line, and the calibration is
//! refitted on the survivors. Outliers are excluded, never down-weighted.

use ndarray::Array1;

use crate::config::VoltageFitConfig;
use crate::dataset::RawVoltageSample;
use crate::diagnostics::VoltageResidual;
use crate::key::VoltageKey;
use crate::math::{least_squares_line, theil_sen_line, LinearFit};
use crate::store::VoltageRecord;
use crate::{Error, Result};

/// Fit the voltage calibration of one partition.
///
/// # Errors
/// Returns [`Error::EmptyFilteredData`] when no sample lies inside the fit window or survives
/// the residual cut, and [`Error::FitConvergence`] when the ADC values do not vary.
///
/// # Examples
///
/// ```
/// use adc_calib::config::VoltageFitConfig;
/// use adc_calib::dataset::RawVoltageSample;
/// use adc_calib::voltage::fit_voltage_partition;
///
/// let samples = [(0.1, 100.), (0.2, 200.), (0.3, 300.), (0.4, 400.), (0.9, 9999.)]
///     .into_iter()
///     .map(|(input_voltage, adc_value)| RawVoltageSample {
///         device: "AMAC01".into(),
///         channel: "CH0_L".into(),
///         bandgap_control: 10,
///         ramp_gain: 3,
///         input_voltage,
///         adc_value,
///     })
///     .collect::<Vec<_>>();
///
/// let record =
///     fit_voltage_partition(&samples[0].key(), &samples, &VoltageFitConfig::default()).unwrap();
/// approx::assert_relative_eq!(record.m, 1e-3, max_relative = 1e-9);
/// approx::assert_abs_diff_eq!(record.b, 0.0, epsilon = 1e-9);
/// ```
pub fn fit_voltage_partition(
    key: &VoltageKey,
    samples: &[RawVoltageSample],
    config: &VoltageFitConfig,
) -> Result<VoltageRecord> {
    let window = config.fit_window_max(key.ramp_gain);
    let in_range = samples
        .iter()
        .filter(|s| s.input_voltage < window)
        .cloned()
        .collect::<Vec<_>>();
    if in_range.is_empty() {
        return Err(Error::EmptyFilteredData {
            key: key.to_string(),
            stage: "range restriction",
        });
    }

    let initial = initial_line(key, &in_range, config.residual_threshold)?;

    let kept = samples
        .iter()
        .filter(|s| VoltageResidual::new(s, &initial).residual.abs() < config.residual_threshold)
        .cloned()
        .collect::<Vec<_>>();
    if kept.is_empty() {
        return Err(Error::EmptyFilteredData {
            key: key.to_string(),
            stage: "outlier rejection",
        });
    }

    let line = line_through(key, &kept)?;
    tracing::debug!(
        key = %key,
        samples = samples.len(),
        kept = kept.len(),
        m = line.slope,
        b = line.intercept,
        "voltage fit"
    );
    Ok(VoltageRecord {
        key: key.clone(),
        m: line.slope,
        b: line.intercept,
    })
}

/// Least-squares line through the in-range samples, unless a high-leverage point has captured
/// it: if fewer than half of the samples it was fitted on lie within `threshold` counts, the
/// Theil-Sen line is used instead.
fn initial_line(
    key: &VoltageKey,
    in_range: &[RawVoltageSample],
    threshold: f64,
) -> Result<LinearFit> {
    let ordinary = line_through(key, in_range)?;
    let within = in_range
        .iter()
        .filter(|s| VoltageResidual::new(s, &ordinary).residual.abs() < threshold)
        .count();
    if 2 * within >= in_range.len() {
        return Ok(ordinary);
    }

    let (adc, voltage) = columns(in_range);
    match theil_sen_line(adc.view(), voltage.view()) {
        Some(robust) => {
            tracing::debug!(
                key = %key,
                within,
                samples = in_range.len(),
                "least-squares seed dominated by outliers, using Theil-Sen"
            );
            Ok(robust)
        }
        None => Ok(ordinary),
    }
}

fn line_through(key: &VoltageKey, samples: &[RawVoltageSample]) -> Result<LinearFit> {
    let (adc, voltage) = columns(samples);
    least_squares_line(adc.view(), voltage.view()).ok_or_else(|| Error::FitConvergence {
        key: key.to_string(),
        reason: "ADC values do not vary, the line is undetermined".into(),
    })
}

fn columns(samples: &[RawVoltageSample]) -> (Array1<f64>, Array1<f64>) {
    (
        samples.iter().map(|s| s.adc_value).collect(),
        samples.iter().map(|s| s.input_voltage).collect(),
    )
}
