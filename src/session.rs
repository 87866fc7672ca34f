use std::{collections::HashMap, sync::Arc};

use futures::{
    channel::oneshot,
    future::{FutureExt as _, Shared},
};
use parking_lot::Mutex;
use serde_json::Value;

/// Transport defines the handle the surrounding server supplies for one
/// WebSocket connection. The protocol layer never frames messages itself; it
/// only needs a stable id for the connection and a way to close it.
pub trait Transport: Send + Sync + 'static {
    /// A stable identifier for the connection.
    fn id(&self) -> &str;

    /// Closes the connection. Invoked at most once per session.
    fn close(&self);
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn id(&self) -> &str {
        (**self).id()
    }

    fn close(&self) {
        (**self).close()
    }
}

/// A handle used to end a live operation's outbound stream. Dropping it
/// cancels the operation.
pub(crate) type CancelHandle = oneshot::Sender<()>;

/// Resolves once the `connection_init` that opened it has settled, accepted
/// or rejected. Operations that arrive while the connect hook is still
/// running wait on this instead of racing it.
pub(crate) type ConnectGate = Shared<oneshot::Receiver<()>>;

/// How far the connection handshake has progressed.
enum ConnectPhase {
    /// No `connection_init` has been accepted yet.
    Fresh,
    /// A `connection_init` has been accepted.
    Initialized,
    /// The last `connection_init` was rejected by the connect hook. The
    /// message is replayed to any `start` arriving before a successful init.
    Failed(String),
}

/// The per-session map of live operations.
#[derive(Default)]
struct OperationRegistry {
    live: HashMap<String, CancelHandle>,
}

impl OperationRegistry {
    /// Stores the handle only if the id is not already live.
    fn try_insert(&mut self, id: &str, handle: CancelHandle) -> bool {
        if self.live.contains_key(id) {
            return false;
        }
        // Go ahead and prune canceled handles before adding a new one.
        self.live.retain(|_, tx| !tx.is_canceled());
        self.live.insert(id.to_owned(), handle);
        true
    }

    fn remove(&mut self, id: &str) -> Option<CancelHandle> {
        self.live.remove(id)
    }

    fn drain_all(&mut self) -> Vec<CancelHandle> {
        self.live.drain().map(|(_, handle)| handle).collect()
    }
}

struct SessionState {
    phase: ConnectPhase,
    connect_gate: Option<ConnectGate>,
    connection_params: Option<Value>,
    keep_alive_started: bool,
    operations: OperationRegistry,
    closed: bool,
}

/// Session owns the state for the lifetime of one WebSocket connection: the
/// handshake phase, the init payload retained for hook calls, the keep-alive
/// latch, and the registry of live operations. All of it sits behind one
/// mutex so frames delivered concurrently still observe atomic updates.
pub struct Session {
    transport: Arc<dyn Transport>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Creates the session for a newly opened connection.
    pub fn new(transport: impl Transport) -> Self {
        Self {
            transport: Arc::new(transport),
            state: Mutex::new(SessionState {
                phase: ConnectPhase::Fresh,
                connect_gate: None,
                connection_params: None,
                keep_alive_started: false,
                operations: OperationRegistry::default(),
                closed: false,
            }),
        }
    }

    /// The transport-supplied connection id.
    pub fn id(&self) -> &str {
        self.transport.id()
    }

    /// Whether a `connection_init` has been accepted on this session.
    pub fn is_initialized(&self) -> bool {
        matches!(self.state.lock().phase, ConnectPhase::Initialized)
    }

    /// The payload of the most recent `connection_init`, if any.
    pub fn connection_params(&self) -> Option<Value> {
        self.state.lock().connection_params.clone()
    }

    /// Whether the transport has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub(crate) fn set_connection_params(&self, params: Option<Value>) {
        self.state.lock().connection_params = params;
    }

    /// Opens a new handshake window. The returned sender must be fired (or
    /// dropped) once the connect hook settles; until then, every gate handed
    /// out by [`Session::connect_gate`] stays pending.
    pub(crate) fn begin_connect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().connect_gate = Some(rx.shared());
        tx
    }

    /// The gate of the most recent `connection_init`, if one was received.
    /// Settled gates resolve immediately.
    pub(crate) fn connect_gate(&self) -> Option<ConnectGate> {
        self.state.lock().connect_gate.clone()
    }

    pub(crate) fn mark_initialized(&self) {
        self.state.lock().phase = ConnectPhase::Initialized;
    }

    pub(crate) fn mark_connect_failed(&self, message: String) {
        self.state.lock().phase = ConnectPhase::Failed(message);
    }

    /// The rejection message of a failed handshake, if the session is in
    /// that state.
    pub(crate) fn connect_failure(&self) -> Option<String> {
        match &self.state.lock().phase {
            ConnectPhase::Failed(message) => Some(message.clone()),
            ConnectPhase::Fresh | ConnectPhase::Initialized => None,
        }
    }

    /// Atomically registers an operation. Returns `false`, leaving the
    /// registry untouched, when the id is already live.
    pub(crate) fn try_insert_operation(&self, id: &str, handle: CancelHandle) -> bool {
        self.state.lock().operations.try_insert(id, handle)
    }

    /// Atomically removes an operation, returning its cancel handle.
    pub(crate) fn remove_operation(&self, id: &str) -> Option<CancelHandle> {
        self.state.lock().operations.remove(id)
    }

    /// Removes and returns every live operation's cancel handle.
    pub(crate) fn drain_operations(&self) -> Vec<CancelHandle> {
        self.state.lock().operations.drain_all()
    }

    /// Latches the keep-alive producer. Returns whether this call was the
    /// one that started it; at most one call per session ever is.
    pub(crate) fn start_keep_alive(&self) -> bool {
        let mut state = self.state.lock();
        if state.keep_alive_started {
            false
        } else {
            state.keep_alive_started = true;
            true
        }
    }

    /// Closes the transport. Only the first call reaches the transport.
    pub(crate) fn close(&self) {
        let already_closed = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.closed, true)
        };
        if !already_closed {
            self.transport.close();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

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

    fn new_session() -> (Session, Arc<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        (Session::new(Arc::clone(&transport)), transport)
    }

    #[test]
    fn test_registry_uniqueness() {
        let (session, _) = new_session();

        let (tx, _rx) = oneshot::channel();
        assert!(session.try_insert_operation("foo", tx));

        let (tx, _rx2) = oneshot::channel();
        assert!(!session.try_insert_operation("foo", tx));

        let (tx, _rx3) = oneshot::channel();
        assert!(session.try_insert_operation("bar", tx));

        assert!(session.remove_operation("foo").is_some());
        assert!(session.remove_operation("foo").is_none());

        let (tx, _rx4) = oneshot::channel();
        assert!(session.try_insert_operation("foo", tx));

        let drained = session.drain_operations();
        assert_eq!(drained.len(), 2);
        assert!(session.remove_operation("bar").is_none());
    }

    #[test]
    fn test_registry_prunes_canceled_handles() {
        let (session, _) = new_session();

        let (tx, rx) = oneshot::channel();
        assert!(session.try_insert_operation("foo", tx));
        drop(rx);

        // Inserting elsewhere sweeps the dead handle out.
        let (tx, _rx) = oneshot::channel();
        assert!(session.try_insert_operation("bar", tx));
        assert_eq!(session.drain_operations().len(), 1);
    }

    #[test]
    fn test_close_reaches_transport_once() {
        let (session, transport) = new_session();

        assert!(!session.is_closed());
        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(transport.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_keep_alive_latch() {
        let (session, _) = new_session();

        assert!(session.start_keep_alive());
        assert!(!session.start_keep_alive());
    }

    #[test]
    fn test_connect_gate_settles() {
        let (session, _) = new_session();
        assert!(session.connect_gate().is_none());

        let settled = session.begin_connect();
        let gate = session.connect_gate().unwrap();
        assert!(gate.clone().now_or_never().is_none());

        let _ = settled.send(());
        assert!(gate.now_or_never().is_some());
    }

    #[test]
    fn test_connect_phase() {
        let (session, _) = new_session();

        assert!(!session.is_initialized());
        assert_eq!(session.connect_failure(), None);

        session.mark_connect_failed("denied".into());
        assert!(!session.is_initialized());
        assert_eq!(session.connect_failure(), Some("denied".into()));

        session.mark_initialized();
        assert!(session.is_initialized());
        assert_eq!(session.connect_failure(), None);
    }
}
