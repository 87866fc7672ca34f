use std::{fmt, sync::Arc};

use futures::stream::BoxStream;

use crate::{client_message::GraphQLRequest, server_message::GraphQLResponse};

/// SubscriptionExecutor defines the requirements for execution engines that
/// can drive subscription operations. The protocol layer never interprets
/// queries itself; it hands every accepted `start` payload to the executor
/// and forwards the resulting stream to the client.
pub trait SubscriptionExecutor: Send + Sync + 'static {
    /// The error a result stream may fail with. The formatted error is sent
    /// to the client as the contents of an `error` message.
    type Error: fmt::Display + Send + 'static;

    /// Executes a subscription request, returning the lazy stream of
    /// results. The stream may be finite or infinite; an `Err` item reports
    /// a failed stream and ends the operation. Dropping the stream must
    /// cancel the underlying execution.
    fn execute_subscription(
        &self,
        request: GraphQLRequest,
    ) -> BoxStream<'static, Result<GraphQLResponse, Self::Error>>;
}

impl<E: SubscriptionExecutor> SubscriptionExecutor for Arc<E> {
    type Error = E::Error;

    fn execute_subscription(
        &self,
        request: GraphQLRequest,
    ) -> BoxStream<'static, Result<GraphQLResponse, Self::Error>> {
        (**self).execute_subscription(request)
    }
}
