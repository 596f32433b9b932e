//! Fitted calibrations and their lookup.
//!
//! A [`CalibrationStore`] holds at most one record per partition key. Records are only ever
//! inserted after a fit succeeded, and are read-only afterwards. Lookups take a [`KeyQuery`],
//! whose wildcard fields must still narrow the store down to exactly one record:
//!
//! ```
//! use adc_calib::key::{VoltageKey, VoltageQuery};
//! use adc_calib::store::{CalibrationStore, VoltageRecord};
//!
//! let key = |channel: &str| VoltageKey {
//!     device: "AMAC01".into(),
//!     channel: channel.into(),
//!     bandgap_control: 10,
//!     ramp_gain: 3,
//! };
//! let store = CalibrationStore::from_records([
//!     VoltageRecord { key: key("CH0_L"), m: 1e-3, b: 0.0 },
//!     VoltageRecord { key: key("CH0_R"), m: 1.1e-3, b: 0.0 },
//! ])
//! .unwrap();
//!
//! let volts = store.convert(&VoltageQuery::any().channel("CH0_R"), 500.0).unwrap();
//! approx::assert_relative_eq!(volts, 0.55);
//! assert!(store.lookup(&VoltageQuery::any().device("AMAC01")).is_err());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::current::{CurrentParams, ResistorNetwork};
use crate::dataset::{CurrentCalibrationRow, VoltageRow};
use crate::key::{CurrentKey, KeyQuery, VoltageKey};
use crate::{Error, Result};

/// A fitted calibration curve for one partition key
pub trait Record {
    type Key: Ord + Clone + fmt::Display;

    fn key(&self) -> &Self::Key;

    /// Physical value for a raw ADC reading, `m * adc + b`
    fn convert(&self, adc: f64) -> f64;
}

/// Voltage calibration, `voltage = m * adc + b`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoltageRecord {
    pub key: VoltageKey,
    pub m: f64,
    pub b: f64,
}

impl VoltageRecord {
    /// ADC reading expected for an input voltage
    #[must_use]
    pub fn expected_adc(&self, voltage: f64) -> f64 {
        (voltage - self.b) / self.m
    }
}

impl Record for VoltageRecord {
    type Key = VoltageKey;

    fn key(&self) -> &VoltageKey {
        &self.key
    }

    fn convert(&self, adc: f64) -> f64 {
        self.m.mul_add(adc, self.b)
    }
}

/// Current calibration.
///
/// `m * adc + b` is the corrected current, i.e. the current reaching the converter once the
/// injected offset `v_off` and internal resistance `r_i` of the input network are accounted for.
/// Use [`CurrentRecord::predicted_current`] to go back to the current flowing through the probe
/// resistor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentRecord {
    pub key: CurrentKey,
    pub m: f64,
    pub b: f64,
    pub v_off: f64,
    pub r_i: f64,
}

impl CurrentRecord {
    #[must_use]
    pub const fn params(&self) -> CurrentParams {
        CurrentParams {
            m: self.m,
            b: self.b,
            v_off: self.v_off,
            r_i: self.r_i,
        }
    }

    /// Current through a probe resistor of `resistor_value` ohm that produces `adc`
    #[must_use]
    pub fn predicted_current(
        &self,
        network: &ResistorNetwork,
        adc: f64,
        resistor_value: f64,
    ) -> f64 {
        network.predicted_current(&self.params(), adc, resistor_value)
    }

    /// Corrected current for a known input current through `resistor_value` ohm
    #[must_use]
    pub fn corrected_input_current(
        &self,
        network: &ResistorNetwork,
        input_current: f64,
        resistor_value: f64,
    ) -> f64 {
        network.corrected_current(&self.params(), input_current, resistor_value)
    }
}

impl Record for CurrentRecord {
    type Key = CurrentKey;

    fn key(&self) -> &CurrentKey {
        &self.key
    }

    fn convert(&self, adc: f64) -> f64 {
        self.m.mul_add(adc, self.b)
    }
}

/// Apply a calibration to a raw reading
pub fn convert<R: Record>(adc: f64, record: &R) -> f64 {
    record.convert(adc)
}

/// Look up the calibration matching `query` and apply it to `adc`.
///
/// # Errors
/// See [`CalibrationStore::convert`].
pub fn convert_with<R, Q>(store: &CalibrationStore<R>, query: &Q, adc: f64) -> Result<f64>
where
    R: Record,
    Q: KeyQuery<R::Key>,
{
    store.convert(query, adc)
}

/// Fitted calibrations of one run, ordered by key
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationStore<R: Record> {
    records: BTreeMap<R::Key, R>,
}

pub type VoltageStore = CalibrationStore<VoltageRecord>;
pub type CurrentStore = CalibrationStore<CurrentRecord>;

impl<R: Record> Default for CalibrationStore<R> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
        }
    }
}

impl<R: Record> CalibrationStore<R> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from records with pairwise distinct keys.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateKey`] if two records share a key.
    pub fn from_records(records: impl IntoIterator<Item = R>) -> Result<Self> {
        let mut store = Self::new();
        for record in records {
            store.insert(record)?;
        }
        Ok(store)
    }

    /// Add the record for a key not yet present.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateKey`] if the key already has a record; the stored one is kept.
    pub fn insert(&mut self, record: R) -> Result<()> {
        if self.records.contains_key(record.key()) {
            return Err(Error::DuplicateKey {
                key: record.key().to_string(),
            });
        }
        self.records.insert(record.key().clone(), record);
        Ok(())
    }

    /// The record stored under exactly `key`
    pub fn get(&self, key: &R::Key) -> Option<&R> {
        self.records.get(key)
    }

    /// The single record matching `query`.
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] when nothing matches and [`Error::AmbiguousKey`] when more than
    /// one record does. The first match is never picked silently.
    pub fn lookup<Q: KeyQuery<R::Key>>(&self, query: &Q) -> Result<&R> {
        let mut matching = self.records.values().filter(|record| query.matches(record.key()));
        let Some(found) = matching.next() else {
            return Err(Error::NotFound {
                query: query.to_string(),
            });
        };
        let others = matching.count();
        if others > 0 {
            return Err(Error::AmbiguousKey {
                query: query.to_string(),
                matches: others + 1,
            });
        }
        Ok(found)
    }

    /// Convert a raw reading with the calibration matching `query`.
    ///
    /// # Errors
    /// Returns [`Error::MissingCalibrationForKey`] when no calibration exists for the query, and
    /// [`Error::AmbiguousKey`] when it does not single one out.
    pub fn convert<Q: KeyQuery<R::Key>>(&self, query: &Q, adc: f64) -> Result<f64> {
        match self.lookup(query) {
            Ok(record) => Ok(record.convert(adc)),
            Err(Error::NotFound { query }) => Err(Error::MissingCalibrationForKey { query }),
            Err(e) => Err(e),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &R::Key> {
        self.records.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> impl Iterator<Item = R> {
        self.records.into_values()
    }
}

impl VoltageStore {
    /// Flat table rows in key order
    #[must_use]
    pub fn rows(&self) -> Vec<VoltageRow> {
        self.iter().map(VoltageRow::from).collect()
    }
}

impl CurrentStore {
    /// Flat table rows in key order
    #[must_use]
    pub fn rows(&self) -> Vec<CurrentCalibrationRow> {
        self.iter().map(CurrentCalibrationRow::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::current::ResistorNetwork;
    use crate::key::{CurrentKey, CurrentQuery, VoltageKey, VoltageQuery};
    use crate::Error;

    use super::{convert, convert_with, CalibrationStore, CurrentRecord, Record, VoltageRecord};

    fn voltage_record(device: &str, channel: &str, ramp_gain: i64, m: f64) -> VoltageRecord {
        VoltageRecord {
            key: VoltageKey {
                device: device.into(),
                channel: channel.into(),
                bandgap_control: 10,
                ramp_gain,
            },
            m,
            b: 0.01,
        }
    }

    fn store() -> CalibrationStore<VoltageRecord> {
        CalibrationStore::from_records([
            voltage_record("AMAC01", "CH0_L", 1, 1.0e-3),
            voltage_record("AMAC01", "CH0_L", 3, 1.1e-3),
            voltage_record("AMAC01", "CH0_R", 3, 1.2e-3),
            voltage_record("AMAC02", "CH0_L", 3, 1.3e-3),
        ])
        .unwrap()
    }

    #[test]
    fn fully_specified_query_finds_its_record() {
        let store = store();
        let record = store
            .lookup(&VoltageQuery::from(&voltage_record("AMAC01", "CH0_R", 3, 0.0).key))
            .unwrap();
        approx::assert_relative_eq!(record.m, 1.2e-3);
    }

    #[test]
    fn wildcard_over_two_values_is_ambiguous() {
        let store = store();
        // ramp gain has two values for AMAC01/CH0_L
        let err = store
            .lookup(&VoltageQuery::any().device("AMAC01").channel("CH0_L"))
            .unwrap_err();
        assert!(matches!(err, Error::AmbiguousKey { matches: 2, .. }));
    }

    #[test]
    fn wildcard_resolving_to_one_record_succeeds() {
        let store = store();
        let record = store.lookup(&VoltageQuery::any().ramp_gain(1)).unwrap();
        assert_eq!(record.key.channel, "CH0_L");
    }

    #[test]
    fn unmatched_queries_are_not_found() {
        let store = store();
        let err = store.lookup(&VoltageQuery::any().device("AMAC09")).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn converting_without_calibration_never_defaults() {
        let store = store();
        let err = store
            .convert(&VoltageQuery::any().device("AMAC09"), 100.0)
            .unwrap_err();
        assert!(matches!(err, Error::MissingCalibrationForKey { .. }));
    }

    #[test]
    fn duplicate_keys_are_rejected_and_first_record_kept() {
        let mut store = store();
        let err = store
            .insert(voltage_record("AMAC02", "CH0_L", 3, 9.9))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
        let kept = store.lookup(&VoltageQuery::any().device("AMAC02")).unwrap();
        approx::assert_relative_eq!(kept.m, 1.3e-3);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn records_apply_the_affine_law() {
        let record = voltage_record("AMAC01", "CH0_L", 3, 2e-3);
        approx::assert_relative_eq!(convert(250.0, &record), 0.51);
        approx::assert_relative_eq!(record.expected_adc(record.convert(731.0)), 731.0);
    }

    #[test]
    fn current_records_invert_the_network() {
        let record = CurrentRecord {
            key: CurrentKey {
                device: "AMAC01".into(),
                channel: "CH1_L".into(),
                bandgap_control: 10,
                ramp_gain: 3,
                op_amp_gain: 4,
            },
            m: 2e-6,
            b: 1e-6,
            v_off: -0.08,
            r_i: 42.0,
        };
        let network = ResistorNetwork::default();
        let resistor = 1_000.0;
        let input = record.predicted_current(&network, 300.0, resistor);
        approx::assert_relative_eq!(
            record.corrected_input_current(&network, input, resistor),
            record.convert(300.0),
            max_relative = 1e-12
        );

        let store = CalibrationStore::from_records([record]).unwrap();
        approx::assert_relative_eq!(
            convert_with(&store, &CurrentQuery::any().op_amp_gain(4), 300.0).unwrap(),
            6.01e-4,
            max_relative = 1e-12
        );
        approx::assert_relative_eq!(store.rows()[0].r_i, 42.0);
    }
}
