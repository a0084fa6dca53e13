//! `leasehold-core` — configuration, retry backoff and lease-bound execution
//! shared by the scheduler and the work processor.

pub mod backoff;
pub mod config;
pub mod error;
pub mod executor;

pub use backoff::Backoff;
pub use config::LeaseholdConfig;
pub use error::{LeaseholdError, Result};
pub use executor::{run_lease_bound, LeaseBoundOutcome};
