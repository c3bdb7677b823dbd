//! Vulnerability scanner adapters.
//!
//! The scan gate itself lives in `shipyard_core::scan`; this crate only runs
//! scanners and turns their output into a [`shipyard_core::ScanReport`].

pub mod grype;

pub use grype::GrypeScanner;
