//! Partition keys identifying one calibration curve, and wildcard queries over them.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one voltage calibration curve
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoltageKey {
    pub device: String,
    pub channel: String,
    pub bandgap_control: i64,
    pub ramp_gain: i64,
}

/// Identifies one current calibration curve.
///
/// The probe resistor is a covariate of the fit and deliberately not part of the key.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrentKey {
    pub device: String,
    pub channel: String,
    pub bandgap_control: i64,
    pub ramp_gain: i64,
    pub op_amp_gain: i64,
}

impl fmt::Display for VoltageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AMAC={}, Channel={}, BandgapControl={}, RampGain={}",
            self.device, self.channel, self.bandgap_control, self.ramp_gain
        )
    }
}

impl fmt::Display for CurrentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AMAC={}, Channel={}, BandgapControl={}, RampGain={}, OpAmpGain={}",
            self.device, self.channel, self.bandgap_control, self.ramp_gain, self.op_amp_gain
        )
    }
}

/// One field of a query: either a concrete value or a wildcard
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Selector<T> {
    #[default]
    Any,
    Exactly(T),
}

impl<T: PartialEq> Selector<T> {
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Self::Any => true,
            Self::Exactly(expected) => expected == value,
        }
    }
}

impl<T> From<T> for Selector<T> {
    fn from(value: T) -> Self {
        Self::Exactly(value)
    }
}

impl<T: fmt::Display> fmt::Display for Selector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "*"),
            Self::Exactly(value) => write!(f, "{value}"),
        }
    }
}

/// A possibly partial key, used to look up stored calibrations
pub trait KeyQuery<K>: fmt::Display {
    fn matches(&self, key: &K) -> bool;
}

/// Query over [`VoltageKey`]s. Unset fields match anything.
///
/// ```
/// use adc_calib::key::{KeyQuery, VoltageKey, VoltageQuery};
///
/// let key = VoltageKey {
///     device: "AMAC01".into(),
///     channel: "CH0_R".into(),
///     bandgap_control: 10,
///     ramp_gain: 3,
/// };
/// assert!(VoltageQuery::any().channel("CH0_R").ramp_gain(3).matches(&key));
/// assert!(!VoltageQuery::any().bandgap_control(9).matches(&key));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VoltageQuery {
    pub device: Selector<String>,
    pub channel: Selector<String>,
    pub bandgap_control: Selector<i64>,
    pub ramp_gain: Selector<i64>,
}

impl VoltageQuery {
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Selector::Exactly(device.into());
        self
    }

    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Selector::Exactly(channel.into());
        self
    }

    #[must_use]
    pub fn bandgap_control(mut self, bandgap_control: i64) -> Self {
        self.bandgap_control = Selector::Exactly(bandgap_control);
        self
    }

    #[must_use]
    pub fn ramp_gain(mut self, ramp_gain: i64) -> Self {
        self.ramp_gain = Selector::Exactly(ramp_gain);
        self
    }
}

impl KeyQuery<VoltageKey> for VoltageQuery {
    fn matches(&self, key: &VoltageKey) -> bool {
        self.device.matches(&key.device)
            && self.channel.matches(&key.channel)
            && self.bandgap_control.matches(&key.bandgap_control)
            && self.ramp_gain.matches(&key.ramp_gain)
    }
}

impl From<&VoltageKey> for VoltageQuery {
    fn from(key: &VoltageKey) -> Self {
        Self {
            device: key.device.clone().into(),
            channel: key.channel.clone().into(),
            bandgap_control: key.bandgap_control.into(),
            ramp_gain: key.ramp_gain.into(),
        }
    }
}

impl fmt::Display for VoltageQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AMAC={}, Channel={}, BandgapControl={}, RampGain={}",
            self.device, self.channel, self.bandgap_control, self.ramp_gain
        )
    }
}

/// Query over [`CurrentKey`]s. Unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CurrentQuery {
    pub device: Selector<String>,
    pub channel: Selector<String>,
    pub bandgap_control: Selector<i64>,
    pub ramp_gain: Selector<i64>,
    pub op_amp_gain: Selector<i64>,
}

impl CurrentQuery {
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Selector::Exactly(device.into());
        self
    }

    #[must_use]
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Selector::Exactly(channel.into());
        self
    }

    #[must_use]
    pub fn bandgap_control(mut self, bandgap_control: i64) -> Self {
        self.bandgap_control = Selector::Exactly(bandgap_control);
        self
    }

    #[must_use]
    pub fn ramp_gain(mut self, ramp_gain: i64) -> Self {
        self.ramp_gain = Selector::Exactly(ramp_gain);
        self
    }

    #[must_use]
    pub fn op_amp_gain(mut self, op_amp_gain: i64) -> Self {
        self.op_amp_gain = Selector::Exactly(op_amp_gain);
        self
    }
}

impl KeyQuery<CurrentKey> for CurrentQuery {
    fn matches(&self, key: &CurrentKey) -> bool {
        self.device.matches(&key.device)
            && self.channel.matches(&key.channel)
            && self.bandgap_control.matches(&key.bandgap_control)
            && self.ramp_gain.matches(&key.ramp_gain)
            && self.op_amp_gain.matches(&key.op_amp_gain)
    }
}

impl From<&CurrentKey> for CurrentQuery {
    fn from(key: &CurrentKey) -> Self {
        Self {
            device: key.device.clone().into(),
            channel: key.channel.clone().into(),
            bandgap_control: key.bandgap_control.into(),
            ramp_gain: key.ramp_gain.into(),
            op_amp_gain: key.op_amp_gain.into(),
        }
    }
}

impl fmt::Display for CurrentQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AMAC={}, Channel={}, BandgapControl={}, RampGain={}, OpAmpGain={}",
            self.device, self.channel, self.bandgap_control, self.ramp_gain, self.op_amp_gain
        )
    }
}

/// Split `samples` into disjoint groups sharing the same key.
///
/// Every sample lands in exactly one group and keeps its relative order within it. Groups are
/// returned in ascending key order, so repeated calls on the same input agree.
pub fn partition_by<S, K, F>(samples: &[S], key_of: F) -> Vec<(K, Vec<S>)>
where
    S: Clone,
    K: Ord,
    F: Fn(&S) -> K,
{
    let mut groups: BTreeMap<K, Vec<S>> = BTreeMap::new();
    for sample in samples {
        groups.entry(key_of(sample)).or_default().push(sample.clone());
    }
    groups.into_iter().collect()
}
