//! The application side of a session.

use crate::{
    error::HandshakeError,
    protocol::{Message, SessionHandle},
};

/// Connection handler: the application callbacks a session drives.
///
/// A handler is owned by exactly one session and all callbacks run on
/// that session's task, so implementations need no synchronization. The
/// handler can be swapped mid-connection with
/// [`SessionHandle::set_handler`]; the replacement gets a fresh
/// `on_open`.
pub trait Handler: Send {
    /// Called while the opening handshake is validated, after the
    /// protocol-mandated headers have been checked. This is the place to
    /// inspect request headers, pick a subprotocol and set response
    /// headers. Returning an error rejects the connection with the given
    /// HTTP status.
    fn validate(&mut self, _session: &mut SessionHandle) -> Result<(), HandshakeError> {
        Ok(())
    }

    /// Called once the session reaches the open state.
    fn on_open(&mut self, _session: &mut SessionHandle) {}

    /// Called for every complete text or binary message.
    fn on_message(&mut self, _session: &mut SessionHandle, _message: Message) {}

    /// Called exactly once when the session is over, whether it closed
    /// cleanly or the transport was dropped.
    fn on_close(&mut self, _session: &mut SessionHandle) {}
}

/// Stub for a handler that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandler;

impl Handler for NoHandler {}
