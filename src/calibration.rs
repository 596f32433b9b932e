//! Calibration runs: partition a sweep, fit every partition, collect the results.
//!
//! Partitions are independent, so they are fitted in parallel. A partition whose fit fails is
//! logged and listed in [`CalibrationRun::skipped`]; it never aborts the run. Only a run that
//! produces no calibration at all is an error.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use rayon::prelude::*;

use crate::config::{CurrentFitConfig, FitConfig, VoltageFitConfig};
use crate::current::{fit_current_partition, CurrentFit};
use crate::dataset::{self, RawCurrentSample, RawVoltageSample};
use crate::diagnostics::{voltage_residuals, PassDiagnostics, ResidualSummary};
use crate::key::partition_by;
use crate::store::{CalibrationStore, CurrentRecord, Record, VoltageRecord};
use crate::voltage::fit_voltage_partition;
use crate::{Error, Result};

/// Optional configuration file in a calibration directory
pub const CONFIG_FILE: &str = "calibration.toml";
/// Tabulated voltage sweep in a calibration directory
pub const VOLTAGE_SAMPLES_FILE: &str = "voltage.csv";
/// Tabulated current sweep in a calibration directory
pub const CURRENT_SAMPLES_FILE: &str = "current.csv";
pub const VOLTAGE_TABLE_FILE: &str = "voltage_calibration.csv";
pub const CURRENT_TABLE_FILE: &str = "current_calibration.csv";

/// A partition that produced no calibration
#[derive(Debug)]
pub struct SkippedPartition<K> {
    pub key: K,
    pub error: Error,
}

/// Everything a run produced
#[derive(Debug)]
pub struct CalibrationRun<R: Record, D> {
    pub store: CalibrationStore<R>,
    /// Per-key fit diagnostics, for the keys in `store`
    pub diagnostics: BTreeMap<R::Key, D>,
    /// Failed partitions in key order
    pub skipped: Vec<SkippedPartition<R::Key>>,
}

/// Voltage runs report the residual spread of each partition against its final line
pub type VoltageRun = CalibrationRun<VoltageRecord, ResidualSummary>;
/// Current runs report every pass of the fit
pub type CurrentRun = CalibrationRun<CurrentRecord, Vec<PassDiagnostics>>;

/// Fit a voltage calibration for every partition of `samples`.
///
/// # Errors
/// Returns [`Error::NoCalibrations`] if no partition could be fitted.
pub fn calibrate_voltage(
    samples: &[RawVoltageSample],
    config: &VoltageFitConfig,
) -> Result<VoltageRun> {
    run(samples, RawVoltageSample::key, "voltage", |key, group| {
        let record = fit_voltage_partition(key, group, config)?;
        let summary = ResidualSummary::from_residuals(
            voltage_residuals(&record, group)
                .into_iter()
                .map(|r| r.residual),
        );
        Ok((record, summary))
    })
}

/// Fit a current calibration for every partition of `samples`.
///
/// # Errors
/// Returns [`Error::NoCalibrations`] if no partition could be fitted.
pub fn calibrate_current(
    samples: &[RawCurrentSample],
    config: &CurrentFitConfig,
) -> Result<CurrentRun> {
    run(samples, RawCurrentSample::key, "current", |key, group| {
        let CurrentFit { record, passes } = fit_current_partition(key, group, config)?;
        Ok((record, passes))
    })
}

fn run<S, R, D, K, F>(
    samples: &[S],
    key_of: K,
    kind: &str,
    fit: F,
) -> Result<CalibrationRun<R, D>>
where
    S: Clone + Sync,
    R: Record + Send,
    R::Key: Send + Sync,
    D: Send,
    K: Fn(&S) -> R::Key,
    F: Fn(&R::Key, &[S]) -> Result<(R, D)> + Sync,
{
    let partitions = partition_by(samples, key_of);

    // `collect` on an indexed parallel iterator keeps the partition order
    let outcomes = partitions
        .par_iter()
        .map(|(key, group)| fit(key, group.as_slice()))
        .collect::<Vec<_>>();

    let mut store = CalibrationStore::new();
    let mut diagnostics = BTreeMap::new();
    let mut skipped = vec![];
    for ((key, _), outcome) in partitions.into_iter().zip(outcomes) {
        match outcome {
            Ok((record, diagnostic)) => {
                store.insert(record)?;
                diagnostics.insert(key, diagnostic);
            }
            Err(error) if error.is_partition_local() => {
                tracing::warn!(kind, key = %key, error = %error, "skipping partition");
                skipped.push(SkippedPartition { key, error });
            }
            Err(error) => return Err(error),
        }
    }

    tracing::info!(
        kind,
        fitted = store.len(),
        skipped = skipped.len(),
        "calibration run finished"
    );
    if store.is_empty() {
        return Err(Error::NoCalibrations);
    }
    Ok(CalibrationRun {
        store,
        diagnostics,
        skipped,
    })
}

/// Voltage and current calibration of one measurement campaign
#[derive(Debug)]
pub struct Calibration {
    pub voltage: VoltageRun,
    pub current: CurrentRun,
}

/// Calibrate from a directory holding [`VOLTAGE_SAMPLES_FILE`], [`CURRENT_SAMPLES_FILE`] and
/// optionally [`CONFIG_FILE`]. Without a configuration file the defaults apply.
///
/// # Errors
/// Returns an error if a file is missing or malformed, or if either sweep produces no
/// calibration.
pub fn build(working_directory: &Path) -> Result<Calibration> {
    let config_path = working_directory.join(CONFIG_FILE);
    let config = if config_path.exists() {
        FitConfig::from_file(&config_path)?
    } else {
        tracing::debug!(path = %config_path.display(), "no configuration file, using defaults");
        FitConfig::default()
    };

    let voltage_samples =
        dataset::voltage_samples_from_file(&working_directory.join(VOLTAGE_SAMPLES_FILE))?;
    let current_samples =
        dataset::current_samples_from_file(&working_directory.join(CURRENT_SAMPLES_FILE))?;
    tracing::info!(
        directory = %working_directory.display(),
        voltage_samples = voltage_samples.len(),
        current_samples = current_samples.len(),
        "read calibration sweeps"
    );

    Ok(Calibration {
        voltage: calibrate_voltage(&voltage_samples, &config.voltage)?,
        current: calibrate_current(&current_samples, &config.current)?,
    })
}

impl Calibration {
    /// Write both calibration tables into `directory`.
    ///
    /// # Errors
    /// Returns an error if a file cannot be written.
    pub fn write_tables(&self, directory: &Path) -> Result<()> {
        dataset::write_voltage_records(
            fs::File::create(directory.join(VOLTAGE_TABLE_FILE))?,
            self.voltage.store.iter(),
        )?;
        dataset::write_current_records(
            fs::File::create(directory.join(CURRENT_TABLE_FILE))?,
            self.current.store.iter(),
        )?;
        Ok(())
    }
}

impl<K: fmt::Display> fmt::Display for SkippedPartition<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.error)
    }
}

#[cfg(test)]
mod tests {
    use ndarray_rand::rand::{Rng, SeedableRng};
    use rand_isaac::Isaac64Rng;

    use super::{calibrate_current, calibrate_voltage};
    use crate::config::{CurrentFitConfig, VoltageFitConfig};
    use crate::current::{CurrentParams, ResistorNetwork};
    use crate::dataset::{RawCurrentSample, RawVoltageSample};
    use crate::key::{partition_by, VoltageKey};
    use crate::voltage::fit_voltage_partition;
    use crate::Error;

    fn voltage_sweep(rng: &mut impl Rng, channels: &[&str]) -> Vec<RawVoltageSample> {
        let mut samples = vec![];
        for channel in channels {
            let m = rng.gen_range(8e-4..1.2e-3);
            let b = rng.gen_range(-0.01..0.01);
            for ramp_gain in [1, 3] {
                for _ in 0..30 {
                    let input_voltage: f64 = rng.gen_range(0.0..0.95);
                    samples.push(RawVoltageSample {
                        device: "AMAC01".into(),
                        channel: (*channel).into(),
                        bandgap_control: 10,
                        ramp_gain,
                        input_voltage,
                        adc_value: (input_voltage - b) / m + rng.gen_range(-0.5..0.5),
                    });
                }
            }
        }
        samples
    }

    #[test]
    fn parallel_run_matches_sequential_fits() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let samples = voltage_sweep(&mut rng, &["CH0_L", "CH0_R", "CH1_L", "CH1_R"]);
        let config = VoltageFitConfig::default();

        let run = calibrate_voltage(&samples, &config).unwrap();

        let sequential = partition_by(&samples, RawVoltageSample::key)
            .into_iter()
            .map(|(key, group)| fit_voltage_partition(&key, &group, &config).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(run.store.len(), 8);
        assert!(run.skipped.is_empty());
        assert_eq!(run.store.iter().cloned().collect::<Vec<_>>(), sequential);
        assert!(run.diagnostics.values().all(|summary| summary.max_abs < 16.0));
    }

    #[test]
    fn failing_partitions_are_skipped_not_fatal() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let mut samples = voltage_sweep(&mut rng, &["CH0_L"]);
        // a channel with every reading outside the ramp gain 1 window
        samples.extend((0..5).map(|ii| RawVoltageSample {
            device: "AMAC01".into(),
            channel: "CH9_L".into(),
            bandgap_control: 10,
            ramp_gain: 1,
            input_voltage: 0.7 + 0.01 * f64::from(ii),
            adc_value: 700.0 + 10.0 * f64::from(ii),
        }));

        let run = calibrate_voltage(&samples, &VoltageFitConfig::default()).unwrap();

        assert_eq!(run.store.len(), 2);
        assert_eq!(run.skipped.len(), 1);
        let skipped = &run.skipped[0];
        assert_eq!(
            skipped.key,
            VoltageKey {
                device: "AMAC01".into(),
                channel: "CH9_L".into(),
                bandgap_control: 10,
                ramp_gain: 1,
            }
        );
        assert!(matches!(skipped.error, Error::EmptyFilteredData { .. }));
        assert!(run.store.get(&skipped.key).is_none());
    }

    #[test]
    fn a_run_without_any_calibration_is_an_error() {
        assert!(matches!(
            calibrate_voltage(&[], &VoltageFitConfig::default()),
            Err(Error::NoCalibrations)
        ));

        let saturated = RawCurrentSample {
            device: "AMAC01".into(),
            channel: "CH1_L".into(),
            bandgap_control: 10,
            ramp_gain: 3,
            op_amp_gain: 0,
            resistor_value: 1_000.0,
            input_current: 1e-3,
            adc_value: 1023.0,
        };
        assert!(matches!(
            calibrate_current(&[saturated], &CurrentFitConfig::default()),
            Err(Error::NoCalibrations)
        ));
    }

    #[test]
    fn current_runs_report_both_passes() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let network = ResistorNetwork::default();
        let params = CurrentParams {
            m: 1e-6,
            b: 2e-6,
            v_off: -0.08,
            r_i: 45.0,
        };
        let mut samples = vec![];
        for op_amp_gain in [4, 6] {
            for resistor_value in [1_000.0, 3_000.0, 10_000.0] {
                for _ in 0..20 {
                    let adc_value: f64 = rng.gen_range(50.0..1000.0);
                    samples.push(RawCurrentSample {
                        device: "AMAC01".into(),
                        channel: "CH1_L".into(),
                        bandgap_control: 10,
                        ramp_gain: 3,
                        op_amp_gain,
                        resistor_value,
                        input_current: network.predicted_current(
                            &params,
                            adc_value,
                            resistor_value,
                        ),
                        adc_value,
                    });
                }
            }
        }

        let run = calibrate_current(&samples, &CurrentFitConfig::default()).unwrap();

        assert_eq!(run.store.len(), 2);
        for (key, passes) in &run.diagnostics {
            assert_eq!(passes.len(), 2, "{key}");
            assert_eq!(passes[1].samples_used, 60);
        }
        for record in run.store.iter() {
            approx::assert_relative_eq!(record.r_i, params.r_i, max_relative = 1e-4);
        }
    }
}
