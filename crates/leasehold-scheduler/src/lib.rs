//! `leasehold-scheduler` — recurring jobs that run on exactly one node per
//! trigger.
//!
//! # Overview
//!
//! Every node registers the same named jobs and calls
//! [`LeasedScheduler::start`]. On each trigger a node tries to acquire the
//! job's lease from the shared [`LeaseStore`](leasehold_store::LeaseStore);
//! the winner runs the body while renewing the lease, everyone re-arms the
//! next trigger regardless of outcome. Only lease state is shared; job
//! registrations live in memory on each node.
//!
//! # Schedule variants
//!
//! | Variant     | Behaviour                                               |
//! |-------------|---------------------------------------------------------|
//! | `FixedRate` | Fixed grid from `start`; overrun grid points are skipped |
//! | `Cron`      | Next fire time computed from the expression at trigger  |

pub mod engine;
pub mod error;
pub mod schedule;
pub mod types;

pub use engine::LeasedScheduler;
pub use error::{Result, SchedulerError};
pub use types::{JobAction, JobContext, Schedule};
