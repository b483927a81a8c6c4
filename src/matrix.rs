//! Matrix Data Model
//!
//! The columnar in-memory table that every collector produces and every
//! plugin and exporter consumes. A matrix holds one object type (`volume`,
//! `lun`, ...) as a set of keyed instances (rows), metric descriptors
//! (columns) and a dense `f64` value store with per-cell present bits.
//!
//! For counter-style metrics (delta, rate, percent, average) the matrix
//! also carries the previous raw snapshot, used by [`Matrix::publish_prepare`]
//! to cook the values actually published each cycle.
//!
//! # Example
//!
//! ```rust
//! use strata::matrix::{Matrix, MetricKind};
//!
//! # fn main() -> Result<(), strata::PollerError> {
//! let mut m = Matrix::new("volume", "Rest:volume");
//! m.add_metric("read_ops", MetricKind::Rate)?;
//! m.add_instance("vol1")?;
//! m.set_value("read_ops", "vol1", 1000.0)?;
//! m.publish_prepare(10.0)?;
//! m.snapshot_commit(10.0);
//! # Ok(())
//! # }
//! ```

mod core;
mod instance;
mod metric;

pub use self::core::Matrix;
pub use instance::Instance;
pub use metric::{Metric, MetricKind};
