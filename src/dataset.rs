//! Sweep samples and the flat calibration table.
//!
//! Raw device logs are parsed elsewhere; this module only reads the tabulated samples that
//! parsing produces, and writes or reads the calibration table. Column names follow the
//! tables the analysis has always used (`AMAC`, `Channel`, `ADCvalue`, ...).

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::key::{CurrentKey, VoltageKey};
use crate::store::{CurrentRecord, VoltageRecord};
use crate::{Error, Result};

/// One point of a voltage sweep
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawVoltageSample {
    #[serde(rename = "AMAC")]
    pub device: String,
    #[serde(rename = "Channel")]
    pub channel: String,
    #[serde(rename = "BandgapControl")]
    pub bandgap_control: i64,
    #[serde(rename = "RampGain")]
    pub ramp_gain: i64,
    #[serde(rename = "InputVoltage")]
    pub input_voltage: f64,
    #[serde(rename = "ADCvalue")]
    pub adc_value: f64,
}

impl RawVoltageSample {
    #[must_use]
    pub fn key(&self) -> VoltageKey {
        VoltageKey {
            device: self.device.clone(),
            channel: self.channel.clone(),
            bandgap_control: self.bandgap_control,
            ramp_gain: self.ramp_gain,
        }
    }
}

/// One point of a current sweep.
///
/// Missing readings are carried as `NaN` and dropped by the current fitter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RawCurrentSample {
    #[serde(rename = "AMAC")]
    pub device: String,
    #[serde(rename = "Channel")]
    pub channel: String,
    #[serde(rename = "BandgapControl")]
    pub bandgap_control: i64,
    #[serde(rename = "RampGain")]
    pub ramp_gain: i64,
    #[serde(rename = "OpAmpGain")]
    pub op_amp_gain: i64,
    #[serde(rename = "ResistorValue")]
    pub resistor_value: f64,
    #[serde(rename = "InputCurrent")]
    pub input_current: f64,
    #[serde(rename = "ADCvalue")]
    pub adc_value: f64,
}

impl RawCurrentSample {
    #[must_use]
    pub fn key(&self) -> CurrentKey {
        CurrentKey {
            device: self.device.clone(),
            channel: self.channel.clone(),
            bandgap_control: self.bandgap_control,
            ramp_gain: self.ramp_gain,
            op_amp_gain: self.op_amp_gain,
        }
    }

    /// Whether every reading is present and finite
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.resistor_value.is_finite()
            && self.input_current.is_finite()
            && self.adc_value.is_finite()
    }
}

// Current logs have gaps, so readings are optional on disk
#[derive(Deserialize)]
struct CurrentRow {
    #[serde(rename = "AMAC")]
    device: String,
    #[serde(rename = "Channel")]
    channel: String,
    #[serde(rename = "BandgapControl")]
    bandgap_control: i64,
    #[serde(rename = "RampGain")]
    ramp_gain: i64,
    #[serde(rename = "OpAmpGain")]
    op_amp_gain: i64,
    #[serde(rename = "ResistorValue", deserialize_with = "csv::invalid_option")]
    resistor_value: Option<f64>,
    #[serde(rename = "InputCurrent", deserialize_with = "csv::invalid_option")]
    input_current: Option<f64>,
    #[serde(rename = "ADCvalue", deserialize_with = "csv::invalid_option")]
    adc_value: Option<f64>,
}

impl From<CurrentRow> for RawCurrentSample {
    fn from(row: CurrentRow) -> Self {
        Self {
            device: row.device,
            channel: row.channel,
            bandgap_control: row.bandgap_control,
            ramp_gain: row.ramp_gain,
            op_amp_gain: row.op_amp_gain,
            resistor_value: row.resistor_value.unwrap_or(f64::NAN),
            input_current: row.input_current.unwrap_or(f64::NAN),
            adc_value: row.adc_value.unwrap_or(f64::NAN),
        }
    }
}

/// Flat table row of a voltage calibration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoltageRow {
    #[serde(rename = "AMAC")]
    pub device: String,
    #[serde(rename = "Channel")]
    pub channel: String,
    #[serde(rename = "BandgapControl")]
    pub bandgap_control: i64,
    #[serde(rename = "RampGain")]
    pub ramp_gain: i64,
    pub m: f64,
    pub b: f64,
}

impl From<&VoltageRecord> for VoltageRow {
    fn from(record: &VoltageRecord) -> Self {
        Self {
            device: record.key.device.clone(),
            channel: record.key.channel.clone(),
            bandgap_control: record.key.bandgap_control,
            ramp_gain: record.key.ramp_gain,
            m: record.m,
            b: record.b,
        }
    }
}

impl From<VoltageRow> for VoltageRecord {
    fn from(row: VoltageRow) -> Self {
        Self {
            key: VoltageKey {
                device: row.device,
                channel: row.channel,
                bandgap_control: row.bandgap_control,
                ramp_gain: row.ramp_gain,
            },
            m: row.m,
            b: row.b,
        }
    }
}

/// Flat table row of a current calibration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentCalibrationRow {
    #[serde(rename = "AMAC")]
    pub device: String,
    #[serde(rename = "Channel")]
    pub channel: String,
    #[serde(rename = "BandgapControl")]
    pub bandgap_control: i64,
    #[serde(rename = "RampGain")]
    pub ramp_gain: i64,
    #[serde(rename = "OpAmpGain")]
    pub op_amp_gain: i64,
    pub m: f64,
    pub b: f64,
    #[serde(rename = "Voff")]
    pub v_off: f64,
    #[serde(rename = "RI")]
    pub r_i: f64,
}

impl From<&CurrentRecord> for CurrentCalibrationRow {
    fn from(record: &CurrentRecord) -> Self {
        Self {
            device: record.key.device.clone(),
            channel: record.key.channel.clone(),
            bandgap_control: record.key.bandgap_control,
            ramp_gain: record.key.ramp_gain,
            op_amp_gain: record.key.op_amp_gain,
            m: record.m,
            b: record.b,
            v_off: record.v_off,
            r_i: record.r_i,
        }
    }
}

impl From<CurrentCalibrationRow> for CurrentRecord {
    fn from(row: CurrentCalibrationRow) -> Self {
        Self {
            key: CurrentKey {
                device: row.device,
                channel: row.channel,
                bandgap_control: row.bandgap_control,
                ramp_gain: row.ramp_gain,
                op_amp_gain: row.op_amp_gain,
            },
            m: row.m,
            b: row.b,
            v_off: row.v_off,
            r_i: row.r_i,
        }
    }
}

fn read_rows<T, R>(reader: R) -> Result<Vec<T>>
where
    T: for<'de> Deserialize<'de>,
    R: Read,
{
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);
    rdr.deserialize()
        .map(|row| row.map_err(Error::from))
        .collect()
}

fn write_rows<T, W>(writer: W, rows: impl IntoIterator<Item = T>) -> Result<()>
where
    T: Serialize,
    W: Write,
{
    let mut wtr = csv::Writer::from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

fn open(filepath: &Path) -> Result<fs::File> {
    if !filepath.exists() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} not found", filepath.display()),
        )));
    }
    Ok(fs::File::open(filepath)?)
}

/// Read a tabulated voltage sweep with a header row.
///
/// # Errors
/// Returns an error if a row is malformed.
pub fn read_voltage_samples<R: Read>(reader: R) -> Result<Vec<RawVoltageSample>> {
    read_rows(reader)
}

/// Read a tabulated current sweep with a header row. Empty readings become `NaN`.
///
/// # Errors
/// Returns an error if a row is malformed.
pub fn read_current_samples<R: Read>(reader: R) -> Result<Vec<RawCurrentSample>> {
    let rows: Vec<CurrentRow> = read_rows(reader)?;
    Ok(rows.into_iter().map(RawCurrentSample::from).collect())
}

/// # Errors
/// Returns an error if the file is missing or a row is malformed.
pub fn voltage_samples_from_file(filepath: &Path) -> Result<Vec<RawVoltageSample>> {
    read_voltage_samples(open(filepath)?)
}

/// # Errors
/// Returns an error if the file is missing or a row is malformed.
pub fn current_samples_from_file(filepath: &Path) -> Result<Vec<RawCurrentSample>> {
    read_current_samples(open(filepath)?)
}

/// Write voltage calibrations as a flat table.
///
/// # Errors
/// Returns an error if writing fails.
pub fn write_voltage_records<'a, W: Write>(
    writer: W,
    records: impl IntoIterator<Item = &'a VoltageRecord>,
) -> Result<()> {
    write_rows(writer, records.into_iter().map(VoltageRow::from))
}

/// Write current calibrations as a flat table.
///
/// # Errors
/// Returns an error if writing fails.
pub fn write_current_records<'a, W: Write>(
    writer: W,
    records: impl IntoIterator<Item = &'a CurrentRecord>,
) -> Result<()> {
    write_rows(writer, records.into_iter().map(CurrentCalibrationRow::from))
}

/// Read back a table written by [`write_voltage_records`].
///
/// # Errors
/// Returns an error if a row is malformed.
pub fn read_voltage_records<R: Read>(reader: R) -> Result<Vec<VoltageRecord>> {
    let rows: Vec<VoltageRow> = read_rows(reader)?;
    Ok(rows.into_iter().map(VoltageRecord::from).collect())
}

/// Read back a table written by [`write_current_records`].
///
/// # Errors
/// Returns an error if a row is malformed.
pub fn read_current_records<R: Read>(reader: R) -> Result<Vec<CurrentRecord>> {
    let rows: Vec<CurrentCalibrationRow> = read_rows(reader)?;
    Ok(rows.into_iter().map(CurrentRecord::from).collect())
}
