//! `leasehold-store` — the durable coordination layer.
//!
//! Two contracts live here, both expressed as single conditional writes so
//! that correctness never depends on a read followed by an unchecked write:
//!
//! | Trait          | Resource            | Operations                                   |
//! |----------------|---------------------|----------------------------------------------|
//! | [`LeaseStore`] | named object (job)  | acquire / renew / release                    |
//! | [`WorkStore`]  | work record         | create / claim / renew / mark / reschedule   |
//!
//! [`SqliteStore`] implements both on top of a single SQLite file (or an
//! in-memory database for tests). Other backends only need to uphold the same
//! contracts; `tests/` holds the suite every backend must pass.

pub mod db;
pub mod error;
pub mod lease;
pub mod sqlite;
pub mod tx;
pub mod types;
pub mod work;

pub use error::{Result, StoreError};
pub use lease::LeaseStore;
pub use sqlite::SqliteStore;
pub use tx::run_in_transaction;
pub use types::{Lease, NewWork, Page, WorkFilter, WorkRecord, WorkStatus};
pub use work::WorkStore;
