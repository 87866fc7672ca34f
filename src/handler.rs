use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    channel::oneshot,
    future::{self, FutureExt},
    stream::{self, BoxStream, Stream, StreamExt},
};
use serde_json::Value;

use crate::{
    ConnectionConfig,
    client_message::{ClientMessage, GraphQLRequest},
    executor::SubscriptionExecutor,
    hooks::{NoopHooks, SubscriptionHooks},
    keep_alive::keep_alive_stream,
    server_message::{GraphQLError, GraphQLResponse, ServerMessage},
    session::Session,
};

/// Converts a message into a one-item stream.
fn one(message: ServerMessage) -> BoxStream<'static, ServerMessage> {
    stream::once(future::ready(message)).boxed()
}

/// Runs the `on_operation_complete` hook without holding up the caller.
fn spawn_operation_complete<H: SubscriptionHooks>(hooks: Arc<H>, session: Arc<Session>) {
    tokio::spawn(async move {
        if let Err(e) = hooks.on_operation_complete(&session).await {
            log::warn!(
                "session {}: on_operation_complete hook failed: {e}",
                session.id(),
            );
        }
    });
}

/// SubscriptionProtocolHandler drives the server side of the legacy
/// `graphql-ws` protocol. It is invoked once per inbound text frame and
/// returns the lazy stream of messages to send back; the surrounding
/// transport merges the streams of all frames of a connection into its
/// outgoing sink (see [`Connection`](crate::Connection)).
///
/// The handler itself never blocks: session bookkeeping happens before it
/// returns, while hook invocations and result streaming are deferred into
/// the returned stream and driven by downstream demand.
pub struct SubscriptionProtocolHandler<E, H = NoopHooks> {
    executor: Arc<E>,
    hooks: Arc<H>,
    config: ConnectionConfig,
}

impl<E: SubscriptionExecutor> SubscriptionProtocolHandler<E> {
    /// Creates a handler without lifecycle hooks.
    pub fn new(executor: E, config: ConnectionConfig) -> Self {
        Self::with_hooks(executor, NoopHooks, config)
    }
}

impl<E: SubscriptionExecutor, H: SubscriptionHooks> SubscriptionProtocolHandler<E, H> {
    /// Creates a handler with the given lifecycle hooks.
    pub fn with_hooks(executor: E, hooks: H, config: ConnectionConfig) -> Self {
        Self {
            executor: Arc::new(executor),
            hooks: Arc::new(hooks),
            config,
        }
    }

    /// Handles one inbound text frame, returning the stream of messages to
    /// send to the peer. The stream may be empty, finite, or infinite (a
    /// successful init may chain the keep-alive ticker); it is not consumed
    /// here, so the call returns immediately.
    ///
    /// A malformed frame never tears down the session: it is answered with
    /// a `connection_error` and the connection lives on. Only a
    /// `connection_terminate` closes the transport.
    pub fn handle(&self, frame: &str, session: &Arc<Session>) -> BoxStream<'static, ServerMessage> {
        match ClientMessage::from_text(frame) {
            Ok(ClientMessage::ConnectionInit { id, payload }) => {
                self.connection_init(id, payload, session)
            }
            Ok(ClientMessage::Start { id, payload }) => self.start(id, payload, session),
            Ok(ClientMessage::Stop { id }) => self.stop(id, session),
            Ok(ClientMessage::ConnectionTerminate) => self.terminate(session),
            Err(e) => {
                log::debug!("session {}: {e}", session.id());
                let id = e.operation_id().map(ToOwned::to_owned);
                one(ServerMessage::connection_error(id, e.to_string()))
            }
        }
    }

    fn connection_init(
        &self,
        id: Option<String>,
        payload: Option<Value>,
        session: &Arc<Session>,
    ) -> BoxStream<'static, ServerMessage> {
        session.set_connection_params(payload.clone());
        let settled = session.begin_connect();

        let hooks = Arc::clone(&self.hooks);
        let session = Arc::clone(session);
        let keep_alive_interval = self.config.keep_alive_interval;
        stream::once(async move {
            let reactions = match hooks.on_connect(payload.as_ref(), &session).await {
                Ok(()) => {
                    session.mark_initialized();
                    let ack = one(ServerMessage::ConnectionAck);
                    match keep_alive_interval {
                        // The legacy protocol only starts keep-alives for
                        // init frames that carried an id, and only once per
                        // session.
                        Some(interval)
                            if !interval.is_zero()
                                && id.is_some()
                                && session.start_keep_alive() =>
                        {
                            ack.chain(keep_alive_stream(interval)).boxed()
                        }
                        _ => ack,
                    }
                }
                Err(e) => {
                    session.mark_connect_failed(e.to_string());
                    one(ServerMessage::connection_error(id, e.to_string()))
                }
            };
            // Unblock operations that arrived while the hook was running.
            let _ = settled.send(());
            reactions
        })
        .flatten()
        .boxed()
    }

    fn start(
        &self,
        id: String,
        request: GraphQLRequest,
        session: &Arc<Session>,
    ) -> BoxStream<'static, ServerMessage> {
        let (tx, rx) = oneshot::channel();
        if !session.try_insert_operation(&id, tx) {
            // We already have an operation with this id, so we can't start
            // a new one.
            return stream::empty().boxed();
        }

        // Captured before returning so that only inits received earlier can
        // hold this operation up.
        let gate = session.connect_gate();
        let executor = Arc::clone(&self.executor);
        let hooks = Arc::clone(&self.hooks);
        let session = Arc::clone(session);
        stream::once(async move {
            if let Some(gate) = gate {
                // The connect hook settles before any operation hook runs.
                let _ = gate.await;
            }
            if let Some(message) = session.connect_failure() {
                session.remove_operation(&id);
                return one(ServerMessage::connection_error(Some(id), message));
            }

            let params = session.connection_params();
            match hooks.on_operation(params.as_ref(), &session, &id).await {
                Ok(()) => {
                    let results = executor
                        .execute_subscription(request)
                        .map(|r| r.map_err(|e| e.to_string()))
                        .boxed();
                    SubscriptionStream::new(id, results, rx, session, hooks).boxed()
                }
                Err(e) => {
                    session.remove_operation(&id);
                    one(ServerMessage::Error {
                        id,
                        payload: GraphQLResponse::from_errors(vec![GraphQLError::new(
                            e.to_string(),
                        )]),
                    })
                }
            }
        })
        .flatten()
        .boxed()
    }

    fn stop(&self, id: Option<String>, session: &Arc<Session>) -> BoxStream<'static, ServerMessage> {
        let Some(id) = id else {
            return stream::empty().boxed();
        };
        match session.remove_operation(&id) {
            Some(handle) => {
                // Dropping the handle ends the operation's stream; the final
                // `complete` is ours to send.
                drop(handle);
                spawn_operation_complete(Arc::clone(&self.hooks), Arc::clone(session));
                one(ServerMessage::Complete { id })
            }
            None => stream::empty().boxed(),
        }
    }

    fn terminate(&self, session: &Arc<Session>) -> BoxStream<'static, ServerMessage> {
        let hooks = Arc::clone(&self.hooks);
        let params = session.connection_params();
        {
            let session = Arc::clone(session);
            tokio::spawn(async move {
                if let Err(e) = hooks.on_disconnect(&session, params.as_ref()).await {
                    log::warn!("session {}: on_disconnect hook failed: {e}", session.id());
                }
            });
        }

        // Cancelling every live operation ends their outbound streams.
        drop(session.drain_operations());
        session.close();
        stream::empty().boxed()
    }
}

/// The outbound stream of one live operation: executor results tagged with
/// the operation id, terminated by exactly one `complete` or `error`.
struct SubscriptionStream<H> {
    id: String,
    results: BoxStream<'static, Result<GraphQLResponse, String>>,
    cancel: oneshot::Receiver<()>,
    session: Arc<Session>,
    hooks: Arc<H>,
    done: bool,
}

impl<H: SubscriptionHooks> SubscriptionStream<H> {
    fn new(
        id: String,
        results: BoxStream<'static, Result<GraphQLResponse, String>>,
        cancel: oneshot::Receiver<()>,
        session: Arc<Session>,
        hooks: Arc<H>,
    ) -> Self {
        Self {
            id,
            results,
            cancel,
            session,
            hooks,
            done: false,
        }
    }

    /// Unregisters the operation after it ran to its natural end (exhausted
    /// or failed upstream), firing the completion hook if the entry was
    /// still ours to remove.
    fn finish(&mut self) {
        self.done = true;
        if self.session.remove_operation(&self.id).is_some() {
            spawn_operation_complete(Arc::clone(&self.hooks), Arc::clone(&self.session));
        }
    }
}

impl<H: SubscriptionHooks> Stream for SubscriptionStream<H> {
    type Item = ServerMessage;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(None);
        }

        // A fired (or dropped) cancel handle ends the stream without a
        // `complete`: whoever cancelled owns any final message.
        if this.cancel.poll_unpin(cx).is_ready() {
            this.done = true;
            return Poll::Ready(None);
        }

        match this.results.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(response))) => {
                let message = if response.has_errors() {
                    ServerMessage::Error {
                        id: this.id.clone(),
                        payload: response,
                    }
                } else {
                    ServerMessage::Data {
                        id: this.id.clone(),
                        payload: response,
                    }
                };
                Poll::Ready(Some(message))
            }
            Poll::Ready(Some(Err(message))) => {
                this.finish();
                Poll::Ready(Some(ServerMessage::Error {
                    id: this.id.clone(),
                    payload: GraphQLResponse::from_errors(vec![GraphQLError::new(message)]),
                }))
            }
            Poll::Ready(None) => {
                this.finish();
                Poll::Ready(Some(ServerMessage::Complete {
                    id: this.id.clone(),
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<H> Drop for SubscriptionStream<H> {
    fn drop(&mut self) {
        if !self.done {
            // Downstream cancellation: unregister without emitting anything.
            self.session.remove_operation(&self.id);
        }
    }
}
