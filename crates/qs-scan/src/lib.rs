//! # qs-scan
//!
//! Grid scans over multi-stage near-axis optimizations.
//!
//! A scan samples one or more stage parameters on a linear or logarithmic
//! grid, runs the full pipeline for every grid point on a pool of worker
//! threads, filters the outcomes against keep thresholds and appends the
//! retained results to a resumable store.

pub mod checkpoint;
pub mod driver;
pub mod filter;
pub mod grid;
pub mod input;
pub mod job;
pub mod pool;
pub mod telemetry;

pub use checkpoint::{Checkpointer, JsonlResultStore, MemoryResultStore, ResultStore};
pub use driver::{ScanDriver, ScanPlan, ScanReport, ScanSettings, ScanStopReason};
pub use filter::{KeepThresholds, ResultFilter};
pub use grid::{Grid, GridPoint, ScanDimension};
pub use input::{ScanInput, DEFAULT_RESULTS_PATH};
pub use job::{RunId, ScanJobSpec, ScanResult, Verdict};
