//! Error type for calibration runs and lookups.
//!
//! Two families of failure live here. Per-partition failures
//! ([`Error::EmptyFilteredData`], [`Error::FitConvergence`]) are recovered by the run: the key is
//! logged, recorded as skipped and no record is produced. Lookup failures ([`Error::NotFound`],
//! [`Error::AmbiguousKey`], [`Error::MissingCalibrationForKey`]) are returned to the caller, who
//! must decide what to do. A run in which no partition produced a record is reported as
//! [`Error::NoCalibrations`].

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no data left after {stage} for {key}")]
    EmptyFilteredData { key: String, stage: &'static str },

    #[error("fit failed for {key}: {reason}")]
    FitConvergence { key: String, reason: String },

    #[error("no calibration matches {query}")]
    NotFound { query: String },

    #[error("{matches} calibrations match {query}, expected exactly one")]
    AmbiguousKey { query: String, matches: usize },

    #[error("no calibration stored for {query}")]
    MissingCalibrationForKey { query: String },

    #[error("a calibration for {key} is already stored")]
    DuplicateKey { key: String },

    #[error("no partition produced a calibration")]
    NoCalibrations,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Whether the error only invalidates a single partition of a run.
    #[must_use]
    pub const fn is_partition_local(&self) -> bool {
        matches!(
            self,
            Self::EmptyFilteredData { .. } | Self::FitConvergence { .. }
        )
    }
}
