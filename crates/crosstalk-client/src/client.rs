//! The client facade.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crosstalk_wire::Payload;

use crate::call::{Call, CallFailure, CallReceiver};
use crate::config::ClientConfig;
use crate::connector::{Connector, TcpConnector};
use crate::errors::CallError;
use crate::parallel::ParallelResults;
use crate::pool::{ConnectionKey, IdentityHandle, Pool};

/// An IPC client whose calls return values of type `V`.
///
/// One client multiplexes any number of concurrent calls over one pooled
/// connection per `(peer, identity)`. Cheap to share behind an `Arc`;
/// callers on any task may invoke [`call`](Self::call) concurrently.
///
/// ```ignore
/// let client: Client<RawBytes> = Client::new(ClientConfig::default());
/// let reply = client.call(&RawBytes(request), "region-a:60020").await?;
/// client.stop().await;
/// ```
pub struct Client<V: Payload, C: Connector = TcpConnector> {
    pool: Arc<Pool<C, V>>,
    counter: AtomicI32,
    refs: AtomicUsize,
}

impl<V: Payload> Client<V, TcpConnector> {
    /// Create a client that opens plain TCP connections.
    pub fn new(config: ClientConfig) -> Self {
        let connector = TcpConnector::new(config.tcp_nodelay);
        Self::with_connector(config, connector)
    }
}

impl<V: Payload, C: Connector> Client<V, C> {
    /// Create a client with an injected transport factory.
    pub fn with_connector(config: ClientConfig, connector: C) -> Self {
        Self {
            pool: Pool::new(config, connector),
            counter: AtomicI32::new(0),
            refs: AtomicUsize::new(1),
        }
    }

    /// Whether [`stop`](Self::stop) has not run yet.
    pub fn is_running(&self) -> bool {
        self.pool.running.load(Ordering::SeqCst)
    }

    /// Number of pooled connections right now. Diagnostics only.
    pub fn active_connections(&self) -> usize {
        self.pool.len()
    }

    /// Record another owner of this client.
    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Record that an owner let go of this client.
    pub fn dec_ref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Whether no owner remains. Advisory for shared ownership across
    /// higher-level users; [`stop`](Self::stop) does not consult it.
    pub fn has_no_references(&self) -> bool {
        self.refs.load(Ordering::SeqCst) == 0
    }

    /// Call `addr` with no identity.
    pub async fn call(&self, param: &impl Payload, addr: &str) -> Result<V, CallError> {
        self.call_with_identity(param, addr, None).await
    }

    /// Send `param` to the server at `addr` and wait for its reply.
    ///
    /// Remote errors are raised as [`CallError::Remote`] and can be
    /// inspected; local transport failures come wrapped in an envelope
    /// naming the peer, with the I/O error as the source.
    pub async fn call_with_identity(
        &self,
        param: &impl Payload,
        addr: &str,
        identity: Option<&IdentityHandle>,
    ) -> Result<V, CallError> {
        let receiver = self.submit(param, addr, identity).await?;
        match receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(failure)) => Err(surface(addr, failure)),
            // The slot vanished without an outcome. Connection cleanup
            // should make this impossible; report it rather than hang.
            Err(_) => Err(CallError::Io {
                peer: addr.to_owned(),
                source: Arc::new(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "call abandoned without completion",
                )),
            }),
        }
    }

    /// Send each parameter to the matching address and collect the replies
    /// positionally. Calls that fail, whichever way, leave `None` in their
    /// slot; the parallel path itself never errors.
    ///
    /// # Panics
    ///
    /// Panics if `params` and `addrs` differ in length.
    pub async fn call_parallel(&self, params: &[impl Payload], addrs: &[&str]) -> Vec<Option<V>> {
        assert_eq!(params.len(), addrs.len(), "one address per parameter");
        if addrs.is_empty() {
            return Vec::new();
        }

        let mut results = ParallelResults::new(params.len());
        for (index, (param, addr)) in params.iter().zip(addrs).enumerate() {
            match self.submit(param, addr, None).await {
                Ok(receiver) => results.attach(index, receiver),
                Err(e) => {
                    tracing::info!(peer = %addr, error = %e, "parallel call failed at submit");
                    results.submit_failed();
                }
            }
        }
        results.collect().await
    }

    /// Allocate a call, route it through the pool, and send it.
    async fn submit(
        &self,
        param: &impl Payload,
        addr: &str,
        identity: Option<&IdentityHandle>,
    ) -> Result<CallReceiver<V>, CallError> {
        if !self.is_running() {
            return Err(CallError::ClientStopped);
        }

        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let (mut call, receiver) = Call::new(id, param);
        let key = ConnectionKey::new(addr, identity.cloned());

        let conn = self.pool.acquire(&key, &mut call)?;
        conn.clone().setup_io().await;
        conn.send(&call).await;
        Ok(receiver)
    }

    /// Stop the client. Every connection is torn down, every pending call
    /// completes with [`CallError::ClientStopped`], and further calls fail
    /// immediately. Idempotent; the reference count is not consulted.
    pub async fn stop(&self) {
        if self
            .pool
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        tracing::debug!("stopping client");
        // A caller that raced the flag flip may still insert a connection;
        // keep tearing down until the pool stays empty.
        loop {
            let connections = self.pool.snapshot();
            if connections.is_empty() {
                break;
            }
            for conn in &connections {
                conn.wake();
            }
            for conn in &connections {
                conn.shutdown().await;
            }
        }
        tracing::debug!("client stopped");
    }
}

/// Turn a call failure into what the caller sees, tagging local transport
/// failures with the peer address.
fn surface(addr: &str, failure: CallFailure) -> CallError {
    match failure {
        CallFailure::Remote(e) => CallError::Remote(e),
        CallFailure::Stopped => CallError::ClientStopped,
        CallFailure::UnknownHost => CallError::UnknownHost {
            peer: addr.to_owned(),
        },
        CallFailure::Io(e) => CallError::envelope(addr, e),
    }
}
