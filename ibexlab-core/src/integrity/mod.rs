//! Integrity validation of raw snapshots.

pub mod fill;
pub mod report;
pub mod summary;
pub mod validator;

pub use report::{
    GapRun, OutOfRange, RangeIssue, ValidatedPrices, ValidationReport, ValidationStatus,
};
pub use summary::{summary_csv, write_summary};
pub use validator::{run_validation, IntegrityValidator, Validation, ValidationOutcome};
