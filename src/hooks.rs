use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::session::Session;

/// The error type lifecycle hooks may fail with. The formatted error becomes
/// the message sent back to the client where the protocol calls for one.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// SubscriptionHooks defines the lifecycle callbacks a server can attach to
/// a connection. Implementations may override any subset; every hook
/// defaults to a no-op, and [`NoopHooks`] satisfies callers that need none.
#[async_trait]
pub trait SubscriptionHooks: Send + Sync + 'static {
    /// Invoked when a `connection_init` message is received, before the
    /// connection is acknowledged. Returning an error rejects the
    /// connection: no `connection_ack` is sent and the client receives a
    /// `connection_error` instead.
    async fn on_connect(
        &self,
        connection_params: Option<&Value>,
        session: &Session,
    ) -> Result<(), HookError> {
        let _ = (connection_params, session);
        Ok(())
    }

    /// Invoked before a `start` message is executed. Returning an error
    /// aborts the operation with an `error` message; no execution happens.
    async fn on_operation(
        &self,
        connection_params: Option<&Value>,
        session: &Session,
        operation_id: &str,
    ) -> Result<(), HookError> {
        let _ = (connection_params, session, operation_id);
        Ok(())
    }

    /// Invoked when an operation ends, either by a `stop` message or by its
    /// result stream finishing. Failures are logged and swallowed.
    async fn on_operation_complete(&self, session: &Session) -> Result<(), HookError> {
        let _ = session;
        Ok(())
    }

    /// Invoked when the client terminates the connection. Failures are
    /// logged and swallowed; the transport is closed regardless.
    async fn on_disconnect(
        &self,
        session: &Session,
        connection_params: Option<&Value>,
    ) -> Result<(), HookError> {
        let _ = (session, connection_params);
        Ok(())
    }
}

#[async_trait]
impl<H: SubscriptionHooks> SubscriptionHooks for Arc<H> {
    async fn on_connect(
        &self,
        connection_params: Option<&Value>,
        session: &Session,
    ) -> Result<(), HookError> {
        (**self).on_connect(connection_params, session).await
    }

    async fn on_operation(
        &self,
        connection_params: Option<&Value>,
        session: &Session,
        operation_id: &str,
    ) -> Result<(), HookError> {
        (**self)
            .on_operation(connection_params, session, operation_id)
            .await
    }

    async fn on_operation_complete(&self, session: &Session) -> Result<(), HookError> {
        (**self).on_operation_complete(session).await
    }

    async fn on_disconnect(
        &self,
        session: &Session,
        connection_params: Option<&Value>,
    ) -> Result<(), HookError> {
        (**self).on_disconnect(session, connection_params).await
    }
}

/// The no-op hooks used when callers do not supply their own.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHooks;

#[async_trait]
impl SubscriptionHooks for NoopHooks {}
