//! The rendezvous between a caller and its connection's reader.
//!
//! A [`Call`] pairs an id and a serialized request with a one-shot
//! completion channel. The caller awaits the receiving half; whichever side
//! finishes the call (the reader delivering a response, or connection
//! cleanup delivering the close cause) consumes the sending half, so a call
//! completes at most once by construction.

use std::io;
use std::sync::Arc;

use crosstalk_wire::Payload;
use tokio::sync::oneshot;

use crate::errors::RemoteError;

/// Why a call failed, before the facade wraps it for the caller.
#[derive(Debug, Clone)]
pub(crate) enum CallFailure {
    /// The server answered with an error.
    Remote(RemoteError),
    /// The client stopped while the call was pending.
    Stopped,
    /// The peer address did not resolve.
    UnknownHost,
    /// Transport failure on the owning connection.
    Io(Arc<io::Error>),
}

pub(crate) type CallOutcome<V> = Result<V, CallFailure>;
pub(crate) type CallSender<V> = oneshot::Sender<CallOutcome<V>>;
pub(crate) type CallReceiver<V> = oneshot::Receiver<CallOutcome<V>>;

/// An in-flight request.
pub(crate) struct Call<V> {
    pub(crate) id: i32,
    pub(crate) request: Vec<u8>,
    completion: Option<CallSender<V>>,
}

impl<V: Payload> Call<V> {
    /// Allocate a call for `param`, returning the slot the caller awaits.
    pub(crate) fn new(id: i32, param: &impl Payload) -> (Self, CallReceiver<V>) {
        let (tx, rx) = oneshot::channel();
        let mut request = Vec::new();
        param.write(&mut request);
        (
            Self {
                id,
                request,
                completion: Some(tx),
            },
            rx,
        )
    }

    /// Hand the completion channel to a connection. `None` once taken.
    pub(crate) fn take_completion(&mut self) -> Option<CallSender<V>> {
        self.completion.take()
    }
}
