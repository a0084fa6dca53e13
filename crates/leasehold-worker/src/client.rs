use std::sync::Arc;

use leasehold_store::{NewWork, Page, WorkFilter, WorkRecord, WorkStore};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::codec::Codec;
use crate::error::{Result, WorkerError};

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// `None` defers to the processor's default.
    pub max_retries: Option<u32>,
    pub schema_version: u32,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            max_retries: None,
            schema_version: 1,
        }
    }
}

/// Returned by [`WorkClient::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkHandle {
    pub id: String,
    pub work_type: String,
    pub payload_type: String,
}

/// Producer and operator side of the work queue.
#[derive(Clone)]
pub struct WorkClient {
    store: Arc<dyn WorkStore>,
    codec: Arc<dyn Codec>,
}

impl WorkClient {
    pub fn new(store: Arc<dyn WorkStore>, codec: Arc<dyn Codec>) -> Self {
        Self { store, codec }
    }

    #[instrument(skip(self, payload, opts))]
    pub async fn submit<P: Serialize>(
        &self,
        work_type: &str,
        payload_type: &str,
        payload: &P,
        opts: SubmitOptions,
    ) -> Result<WorkHandle> {
        if work_type.trim().is_empty() || payload_type.trim().is_empty() {
            return Err(WorkerError::InvalidRequest(
                "work type and payload type must not be empty".to_string(),
            ));
        }
        let value =
            serde_json::to_value(payload).map_err(|e| WorkerError::Codec(e.to_string()))?;
        let bytes = self.codec.encode(&value, opts.schema_version)?;

        let record = self
            .store
            .create_work(NewWork {
                work_type: work_type.to_string(),
                payload: bytes,
                payload_type: payload_type.to_string(),
                payload_schema_version: opts.schema_version,
                codec: self.codec.name().to_string(),
                max_retries: opts.max_retries,
            })
            .await?;
        info!(work_id = %record.id, "work submitted");

        Ok(WorkHandle {
            id: record.id,
            work_type: record.work_type,
            payload_type: record.payload_type,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkRecord>> {
        Ok(self.store.get_work(id).await?)
    }

    pub async fn list(&self, filter: &WorkFilter, page: Page) -> Result<Vec<WorkRecord>> {
        Ok(self.store.list_work(filter, page).await?)
    }

    /// Decode a record's payload with this client's codec.
    pub fn payload(&self, record: &WorkRecord) -> Result<Value> {
        if record.codec != self.codec.name() {
            return Err(WorkerError::Codec(format!(
                "record written with {:?}, client uses {:?}",
                record.codec,
                self.codec.name()
            )));
        }
        self.codec.decode(
            &record.payload,
            &record.payload_type,
            record.payload_schema_version,
        )
    }

    /// `false` when the record is missing or already terminal.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        Ok(self.store.mark_cancelled(id).await?)
    }

    /// Hold a `NEW` record back from processors until resumed.
    pub async fn pause(&self, id: &str) -> Result<bool> {
        Ok(self.store.pause(id).await?)
    }

    pub async fn resume(&self, id: &str) -> Result<bool> {
        Ok(self.store.resume(id).await?)
    }
}

impl std::fmt::Debug for WorkClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkClient")
            .field("codec", &self.codec.name())
            .finish()
    }
}
