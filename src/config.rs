use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Settings for a calibration run, usually read from a `calibration.toml`.
///
/// Every field has a default matching the chip's standard sweep, so an empty file is a valid
/// configuration:
///
/// ```
/// use adc_calib::config::FitConfig;
///
/// let config = FitConfig::from_toml_str("[current]\nmode = \"single_pass\"").unwrap();
/// assert_eq!(config.voltage.residual_threshold, 16.0);
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FitConfig {
    pub voltage: VoltageFitConfig,
    pub current: CurrentFitConfig,
}

impl FitConfig {
    /// Parse and validate a configuration from TOML source.
    ///
    /// # Errors
    /// Returns an error if the source is not valid TOML for this structure, or if any value is
    /// out of range.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a configuration file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or fails [`FitConfig::from_toml_str`].
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check the thresholds and model constants are usable.
    ///
    /// # Errors
    /// Returns [`Error::Config`] naming the first offending value.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("voltage.residual_threshold", self.voltage.residual_threshold),
            ("voltage.xmax", self.voltage.xmax),
            ("voltage.low_ramp_gain_xmax", self.voltage.low_ramp_gain_xmax),
            ("current.loose_threshold", self.current.loose_threshold),
            ("current.tight_threshold", self.current.tight_threshold),
            ("current.single_pass_threshold", self.current.single_pass_threshold),
            ("current.saturation.default_ceiling", self.current.saturation.default_ceiling),
            ("current.tolerance", self.current.tolerance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::Config(format!("{name} must be positive, got {value}")));
            }
        }
        if !(self.current.network_resistance.is_finite() && self.current.network_resistance >= 0.0)
        {
            return Err(Error::Config(format!(
                "current.network_resistance must be non-negative, got {}",
                self.current.network_resistance
            )));
        }
        if self.current.seed_r_i < 0.0 {
            return Err(Error::Config(format!(
                "current.seed_r_i must satisfy the RI >= 0 bound, got {}",
                self.current.seed_r_i
            )));
        }
        if self.current.max_iters == 0 {
            return Err(Error::Config("current.max_iters must be at least 1".into()));
        }
        for entry in &self.current.saturation.ceilings {
            if !(entry.ceiling.is_finite() && entry.ceiling > 0.0) {
                return Err(Error::Config(format!(
                    "saturation ceiling for gain index {} must be positive",
                    entry.gain_index
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct VoltageFitConfig {
    /// Ramp gain setting at which the ADC saturates early
    pub low_ramp_gain: i64,
    /// Upper input voltage of the fit window at `low_ramp_gain`
    pub low_ramp_gain_xmax: f64,
    /// Upper input voltage of the fit window at any other ramp gain
    pub xmax: f64,
    /// Samples further than this many ADC counts from the initial line are dropped
    pub residual_threshold: f64,
}

impl Default for VoltageFitConfig {
    fn default() -> Self {
        Self {
            low_ramp_gain: 1,
            low_ramp_gain_xmax: 0.6,
            xmax: 1.0,
            residual_threshold: 16.0,
        }
    }
}

impl VoltageFitConfig {
    /// The exclusive upper bound of input voltage used for the initial fit
    #[must_use]
    pub const fn fit_window_max(&self, ramp_gain: i64) -> f64 {
        if ramp_gain == self.low_ramp_gain {
            self.low_ramp_gain_xmax
        } else {
            self.xmax
        }
    }
}

/// How the current calibration is fitted
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FitMode {
    /// Seeded linear pass followed by two bounded nonlinear passes over `(m, b, Voff, RI)`
    #[default]
    TwoPass,
    /// One filtered linear fit with `Voff` and `RI` held at their seeds
    SinglePass,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CurrentFitConfig {
    pub mode: FitMode,
    /// Resistance of the fixed part of the network in series with the probe resistor, in ohm
    pub network_resistance: f64,
    /// Injected offset used for the seed pass, in volt
    pub seed_v_off: f64,
    /// Internal series resistance used for the seed pass, in ohm
    pub seed_r_i: f64,
    /// Residual cut (ADC counts) before the first nonlinear pass
    pub loose_threshold: f64,
    /// Residual cut (ADC counts) before the second nonlinear pass
    pub tight_threshold: f64,
    /// Residual cut (ADC counts) of [`FitMode::SinglePass`]
    pub single_pass_threshold: f64,
    /// Iteration limit of each nonlinear pass
    pub max_iters: u64,
    /// Gauss-Newton stopping tolerance on the change of the scaled residual norm
    pub tolerance: f64,
    pub saturation: SaturationCeilings,
}

impl Default for CurrentFitConfig {
    fn default() -> Self {
        Self {
            mode: FitMode::default(),
            network_resistance: 60.0,
            seed_v_off: -0.1,
            seed_r_i: 50.0,
            loose_threshold: 512.0,
            tight_threshold: 8.0,
            single_pass_threshold: 16.0,
            max_iters: 100,
            tolerance: f64::EPSILON.sqrt(),
            saturation: SaturationCeilings::default(),
        }
    }
}

/// Ideal input current limits for each op-amp gain setting.
///
/// Settings are grouped in pairs: the table is indexed by `floor(op_amp_gain / 2)`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SaturationCeilings {
    /// Ceiling in amp for gain indices absent from `ceilings`
    pub default_ceiling: f64,
    pub ceilings: Vec<Ceiling>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq)]
pub struct Ceiling {
    pub gain_index: i64,
    /// Ceiling in amp
    pub ceiling: f64,
}

impl Default for SaturationCeilings {
    fn default() -> Self {
        let table = [(0, 1e-5), (1, 3.5e-4), (2, 2.5e-3), (3, 3e-3), (4, 3e-3)];
        Self {
            default_ceiling: 1.0,
            ceilings: table
                .into_iter()
                .map(|(gain_index, ceiling)| Ceiling {
                    gain_index,
                    ceiling,
                })
                .collect(),
        }
    }
}

impl SaturationCeilings {
    /// Input currents at or above the returned value saturate the converter
    #[must_use]
    pub fn ceiling_for(&self, op_amp_gain: i64) -> f64 {
        let gain_index = op_amp_gain.div_euclid(2);
        self.ceilings
            .iter()
            .find(|entry| entry.gain_index == gain_index)
            .map_or(self.default_ceiling, |entry| entry.ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::{FitConfig, FitMode};

    #[test]
    fn empty_source_gives_defaults() {
        let config = FitConfig::from_toml_str("").unwrap();
        assert_eq!(config, FitConfig::default());
    }

    #[test]
    fn defaults_survive_a_toml_round_trip() {
        let source = toml::to_string(&FitConfig::default()).unwrap();
        let parsed = FitConfig::from_toml_str(&source).unwrap();
        assert_eq!(parsed, FitConfig::default());
    }

    #[test]
    fn ceilings_are_indexed_by_half_the_gain() {
        let ceilings = FitConfig::default().current.saturation;
        approx::assert_relative_eq!(ceilings.ceiling_for(0), 1e-5);
        approx::assert_relative_eq!(ceilings.ceiling_for(1), 1e-5);
        approx::assert_relative_eq!(ceilings.ceiling_for(3), 3.5e-4);
        approx::assert_relative_eq!(ceilings.ceiling_for(5), 2.5e-3);
        approx::assert_relative_eq!(ceilings.ceiling_for(9), 3e-3);
        approx::assert_relative_eq!(ceilings.ceiling_for(10), 1.0);
    }

    #[test]
    fn partial_tables_override_selected_values() {
        let source = r#"
            [voltage]
            residual_threshold = 20.0

            [current]
            mode = "single_pass"

            [current.saturation]
            default_ceiling = 0.5

            [[current.saturation.ceilings]]
            gain_index = 0
            ceiling = 2e-5
        "#;
        let config = FitConfig::from_toml_str(source).unwrap();
        approx::assert_relative_eq!(config.voltage.residual_threshold, 20.0);
        approx::assert_relative_eq!(config.voltage.xmax, 1.0);
        assert_eq!(config.current.mode, FitMode::SinglePass);
        approx::assert_relative_eq!(config.current.saturation.ceiling_for(1), 2e-5);
        approx::assert_relative_eq!(config.current.saturation.ceiling_for(2), 0.5);
        approx::assert_relative_eq!(config.current.tight_threshold, 8.0);
    }

    #[test]
    fn non_positive_thresholds_are_rejected() {
        let err = FitConfig::from_toml_str("[current]\ntight_threshold = 0.0").unwrap_err();
        assert!(err.to_string().contains("current.tight_threshold"));
    }

    #[test]
    fn window_depends_on_ramp_gain() {
        let voltage = FitConfig::default().voltage;
        approx::assert_relative_eq!(voltage.fit_window_max(1), 0.6);
        approx::assert_relative_eq!(voltage.fit_window_max(3), 1.0);
    }
}
