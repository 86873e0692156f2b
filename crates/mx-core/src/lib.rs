//! # mx-core
//!
//! Core types shared by the microx crates:
//! - the error taxonomy ([`Error`], [`Result`]) used by every estimator,
//!   variance routine and specification test;
//! - serialisable summary records ([`CoefRecord`], [`CoefTable`]) consumed by
//!   presentation layers.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{CoefRecord, CoefTable};
