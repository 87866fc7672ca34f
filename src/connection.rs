use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

use futures::{
    Sink, Stream,
    stream::{BoxStream, SelectAll},
};

use crate::{
    executor::SubscriptionExecutor, handler::SubscriptionProtocolHandler,
    hooks::SubscriptionHooks, server_message::ServerMessage, session::Session,
};

/// Implements the `graphql-ws` protocol over one connection. This is a sink
/// for inbound text frames and a stream of [`ServerMessage`]s: every frame
/// is fed through the [`SubscriptionProtocolHandler`] and the per-frame
/// outbound streams are merged here, so the surrounding server only has to
/// forward frames in and serialize messages out. The stream ends once the
/// session has been terminated or the sink half has been closed; either
/// drops every in-flight operation stream along with the keep-alive ticker.
pub struct Connection<E: SubscriptionExecutor, H: SubscriptionHooks> {
    handler: SubscriptionProtocolHandler<E, H>,
    session: Arc<Session>,
    reactions: SelectAll<BoxStream<'static, ServerMessage>>,
    stream_waker: Option<Waker>,
    sink_closed: bool,
}

impl<E, H> Connection<E, H>
where
    E: SubscriptionExecutor,
    H: SubscriptionHooks,
{
    /// Creates a new connection around a handler and the session of a newly
    /// accepted transport.
    pub fn new(handler: SubscriptionProtocolHandler<E, H>, session: Arc<Session>) -> Self {
        Self {
            handler,
            session,
            reactions: SelectAll::new(),
            stream_waker: None,
            sink_closed: false,
        }
    }

    /// The session this connection operates on.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl<E, H> Sink<String> for Connection<E, H>
where
    E: SubscriptionExecutor,
    H: SubscriptionHooks,
{
    type Error = Infallible;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.sink_closed {
            panic!("poll_ready called after close");
        }
        // `handle` never blocks, so the sink is always ready. Operations
        // that must wait on an in-flight connect hook do so inside their
        // own reaction streams.
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, frame: String) -> Result<(), Self::Error> {
        let s = self.get_mut();
        if s.sink_closed {
            panic!("start_send called after close");
        }
        let reactions = s.handler.handle(&frame, &s.session);
        s.reactions.push(reactions);
        if let Some(waker) = s.stream_waker.take() {
            waker.wake();
        }
        Ok(())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.sink_closed = true;
        if let Some(waker) = self.stream_waker.take() {
            // Wake up the stream so it can close too.
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }
}

impl<E, H> Stream for Connection<E, H>
where
    E: SubscriptionExecutor,
    H: SubscriptionHooks,
{
    type Item = ServerMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream_waker = Some(cx.waker().clone());

        if self.sink_closed || self.session.is_closed() {
            return Poll::Ready(None);
        }

        // Poll the reactions for new outgoing messages.
        if !self.reactions.is_empty() {
            match Pin::new(&mut self.reactions).poll_next(cx) {
                Poll::Ready(Some(message)) => return Poll::Ready(Some(message)),
                Poll::Ready(None) => {
                    // In rare cases, the reaction stream may terminate. For
                    // example, this will happen if the first frame we
                    // receive does not require any reaction. Just recreate
                    // it in that case.
                    self.reactions = SelectAll::new();
                }
                Poll::Pending => {}
            }
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use futures::{SinkExt, StreamExt, stream};
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        ConnectionConfig, client_message::GraphQLRequest, server_message::GraphQLResponse,
        session::Transport,
    };

    #[derive(Default)]
    struct FakeTransport {
        closed: AtomicUsize,
    }

    impl Transport for FakeTransport {
        fn id(&self) -> &str {
            "fake"
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct OneShotExecutor;

    impl SubscriptionExecutor for OneShotExecutor {
        type Error = Infallible;

        fn execute_subscription(
            &self,
            request: GraphQLRequest,
        ) -> BoxStream<'static, Result<GraphQLResponse, Infallible>> {
            if request.query.contains("never") {
                stream::pending().boxed()
            } else {
                stream::iter(vec![Ok(GraphQLResponse::from_data(json!("myData")))]).boxed()
            }
        }
    }

    fn new_conn() -> (
        Connection<OneShotExecutor, crate::NoopHooks>,
        Arc<FakeTransport>,
    ) {
        new_conn_with_config(ConnectionConfig::new())
    }

    fn new_conn_with_config(
        config: ConnectionConfig,
    ) -> (
        Connection<OneShotExecutor, crate::NoopHooks>,
        Arc<FakeTransport>,
    ) {
        let transport = Arc::new(FakeTransport::default());
        let session = Arc::new(Session::new(Arc::clone(&transport)));
        let handler = SubscriptionProtocolHandler::new(OneShotExecutor, config);
        (Connection::new(handler, session), transport)
    }

    #[tokio::test]
    async fn test_subscription_flow() {
        let (mut conn, _) = new_conn();

        conn.send(r#"{"type":"connection_init"}"#.into())
            .await
            .unwrap();
        assert_eq!(conn.next().await, Some(ServerMessage::ConnectionAck));

        conn.send(
            r#"{"type":"start","id":"foo","payload":{"query":"subscription { message }"}}"#.into(),
        )
        .await
        .unwrap();
        assert_eq!(
            conn.next().await,
            Some(ServerMessage::Data {
                id: "foo".into(),
                payload: GraphQLResponse::from_data(json!("myData")),
            }),
        );
        assert_eq!(
            conn.next().await,
            Some(ServerMessage::Complete { id: "foo".into() }),
        );
    }

    #[tokio::test]
    async fn test_interleaved_operations() {
        let (mut conn, _) = new_conn();

        conn.send(r#"{"type":"connection_init"}"#.into())
            .await
            .unwrap();
        assert_eq!(conn.next().await, Some(ServerMessage::ConnectionAck));

        conn.send(
            r#"{"type":"start","id":"foo","payload":{"query":"subscription { never }"}}"#.into(),
        )
        .await
        .unwrap();
        conn.send(
            r#"{"type":"start","id":"bar","payload":{"query":"subscription { message }"}}"#.into(),
        )
        .await
        .unwrap();

        // The live "foo" operation does not hold "bar" up.
        assert_eq!(
            conn.next().await,
            Some(ServerMessage::Data {
                id: "bar".into(),
                payload: GraphQLResponse::from_data(json!("myData")),
            }),
        );
        assert_eq!(
            conn.next().await,
            Some(ServerMessage::Complete { id: "bar".into() }),
        );

        conn.send(r#"{"type":"stop","id":"foo"}"#.into())
            .await
            .unwrap();
        assert_eq!(
            conn.next().await,
            Some(ServerMessage::Complete { id: "foo".into() }),
        );
    }

    #[tokio::test]
    async fn test_keep_alives() {
        let (mut conn, _) = new_conn_with_config(
            ConnectionConfig::new().with_keep_alive_interval(Duration::from_millis(20)),
        );

        conn.send(r#"{"type":"connection_init","id":"ka"}"#.into())
            .await
            .unwrap();
        assert_eq!(conn.next().await, Some(ServerMessage::ConnectionAck));

        for _ in 0..5 {
            assert_eq!(conn.next().await, Some(ServerMessage::ConnectionKeepAlive));
        }
    }

    #[tokio::test]
    async fn test_errors_do_not_end_the_connection() {
        let (mut conn, _) = new_conn();

        conn.send("not json".into()).await.unwrap();
        assert!(matches!(
            conn.next().await,
            Some(ServerMessage::ConnectionError { .. }),
        ));

        conn.send(r#"{"type":"connection_init"}"#.into())
            .await
            .unwrap();
        assert_eq!(conn.next().await, Some(ServerMessage::ConnectionAck));
    }

    #[derive(Default)]
    struct SlowConnectHooks {
        events: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SubscriptionHooks for SlowConnectHooks {
        async fn on_connect(
            &self,
            _connection_params: Option<&Value>,
            _session: &Session,
        ) -> Result<(), crate::HookError> {
            self.events.lock().push("connect:begin".into());
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.events.lock().push("connect:end".into());
            Ok(())
        }

        async fn on_operation(
            &self,
            _connection_params: Option<&Value>,
            _session: &Session,
            _operation_id: &str,
        ) -> Result<(), crate::HookError> {
            self.events.lock().push("operation".into());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pipelined_start_waits_for_the_connect_hook() {
        let hooks = Arc::new(SlowConnectHooks::default());
        let transport = Arc::new(FakeTransport::default());
        let session = Arc::new(Session::new(Arc::clone(&transport)));
        let handler = SubscriptionProtocolHandler::with_hooks(
            OneShotExecutor,
            Arc::clone(&hooks),
            ConnectionConfig::new(),
        );
        let mut conn = Connection::new(handler, session);

        // Apollo clients do not wait for the ack before starting.
        conn.send(r#"{"type":"connection_init"}"#.into())
            .await
            .unwrap();
        conn.send(
            r#"{"type":"start","id":"foo","payload":{"query":"subscription { message }"}}"#.into(),
        )
        .await
        .unwrap();

        assert_eq!(conn.next().await, Some(ServerMessage::ConnectionAck));
        assert_eq!(
            conn.next().await,
            Some(ServerMessage::Data {
                id: "foo".into(),
                payload: GraphQLResponse::from_data(json!("myData")),
            }),
        );
        assert_eq!(
            conn.next().await,
            Some(ServerMessage::Complete { id: "foo".into() }),
        );

        // The operation hook only ran once the connect hook had settled.
        assert_eq!(
            hooks.events.lock().clone(),
            vec!["connect:begin", "connect:end", "operation"],
        );
    }

    #[tokio::test]
    async fn test_sink_close_ends_the_stream() {
        let (mut conn, _) = new_conn_with_config(
            ConnectionConfig::new().with_keep_alive_interval(Duration::from_millis(20)),
        );

        conn.send(r#"{"type":"connection_init","id":"ka"}"#.into())
            .await
            .unwrap();
        assert_eq!(conn.next().await, Some(ServerMessage::ConnectionAck));

        // An abrupt transport teardown closes the sink half without a
        // terminate frame ever arriving; the stream half ends with it.
        conn.close().await.unwrap();
        assert_eq!(conn.next().await, None);
    }

    #[tokio::test]
    async fn test_terminate_ends_the_stream() {
        let (mut conn, transport) = new_conn_with_config(
            ConnectionConfig::new().with_keep_alive_interval(Duration::from_millis(20)),
        );

        conn.send(r#"{"type":"connection_init","id":"ka"}"#.into())
            .await
            .unwrap();
        assert_eq!(conn.next().await, Some(ServerMessage::ConnectionAck));

        conn.send(
            r#"{"type":"start","id":"foo","payload":{"query":"subscription { never }"}}"#.into(),
        )
        .await
        .unwrap();

        conn.send(r#"{"type":"connection_terminate"}"#.into())
            .await
            .unwrap();

        // Termination drops the keep-alive and every operation stream.
        assert_eq!(conn.next().await, None);
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }
}
