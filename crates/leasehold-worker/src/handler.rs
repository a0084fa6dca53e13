use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Handed to a handler alongside the decoded payload.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub work_id: String,
    pub work_type: String,
    pub payload_type: String,
    /// 1-based; greater than one on retries.
    pub attempt: u32,
    /// Cancelled when the record's lease is lost or shutdown gives up on
    /// this run. Results produced after that may not be recorded.
    pub cancel: CancellationToken,
}

/// Business logic for one payload type.
///
/// Returning `Err` (or panicking) counts as a failed attempt and goes
/// through the processor's retry policy.
///
/// ```ignore
/// #[derive(Deserialize)]
/// struct Welcome { to: String }
///
/// struct SendWelcome;
///
/// #[async_trait]
/// impl WorkHandler for SendWelcome {
///     type Payload = Welcome;
///
///     async fn handle(&self, payload: Welcome, _ctx: WorkContext) -> anyhow::Result<()> {
///         mailer::send(&payload.to).await
///     }
/// }
/// ```
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;

    async fn handle(&self, payload: Self::Payload, ctx: WorkContext) -> anyhow::Result<()>;
}

/// Type-erased handler stored in a processor's registry.
pub(crate) trait HandlerRunner: Send + Sync {
    /// Convert `payload` into the handler's type and return the future that
    /// runs it. A conversion error means the record can never succeed.
    fn prepare(
        self: Arc<Self>,
        payload: Value,
        ctx: WorkContext,
    ) -> Result<BoxFuture<'static, anyhow::Result<()>>, serde_json::Error>;
}

impl<H> HandlerRunner for H
where
    H: WorkHandler,
{
    fn prepare(
        self: Arc<Self>,
        payload: Value,
        ctx: WorkContext,
    ) -> Result<BoxFuture<'static, anyhow::Result<()>>, serde_json::Error> {
        let payload: H::Payload = serde_json::from_value(payload)?;
        Ok(Box::pin(async move { self.handle(payload, ctx).await }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Welcome {
        to: String,
    }

    struct Expect(&'static str);

    #[async_trait]
    impl WorkHandler for Expect {
        type Payload = Welcome;

        async fn handle(&self, payload: Welcome, _ctx: WorkContext) -> anyhow::Result<()> {
            anyhow::ensure!(payload.to == self.0, "unexpected recipient {}", payload.to);
            Ok(())
        }
    }

    fn ctx() -> WorkContext {
        WorkContext {
            work_id: "w1".to_string(),
            work_type: "email".to_string(),
            payload_type: "welcome".to_string(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn erased_handler_decodes_into_payload_type() {
        let runner: Arc<dyn HandlerRunner> = Arc::new(Expect("ops@example.com"));
        let fut = Arc::clone(&runner)
            .prepare(json!({"to": "ops@example.com"}), ctx())
            .unwrap();
        fut.await.unwrap();

        let fut = runner.prepare(json!({"to": "root@example.com"}), ctx()).unwrap();
        assert!(fut.await.is_err());
    }

    #[test]
    fn shape_mismatch_is_reported_before_running() {
        let runner: Arc<dyn HandlerRunner> = Arc::new(Expect("x"));
        assert!(runner.prepare(json!({"recipient": 7}), ctx()).is_err());
    }
}
