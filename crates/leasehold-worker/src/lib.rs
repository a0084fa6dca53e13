//! `leasehold-worker` — durable work requests and the processors that run
//! them.
//!
//! Producers go through [`WorkClient`]; each [`WorkRequestProcessor`] is
//! bound to one work type, claims records from the shared
//! [`WorkStore`](leasehold_store::WorkStore) and dispatches them to the
//! [`WorkHandler`] registered for their payload type.

pub mod client;
pub mod codec;
pub mod error;
pub mod handler;
pub mod processor;

pub use client::{SubmitOptions, WorkClient, WorkHandle};
pub use codec::{Codec, JsonCodec};
pub use error::{Result, WorkerError};
pub use handler::{WorkContext, WorkHandler};
pub use processor::WorkRequestProcessor;
