#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
// #![warn(clippy::cargo)]

pub mod calibration;
pub mod config;
pub mod current;
pub mod dataset;
pub mod diagnostics;
pub mod error;
pub mod key;
pub mod math;
pub(crate) mod minimisation;
pub mod store;
pub mod voltage;

pub use error::{Error, Result};
