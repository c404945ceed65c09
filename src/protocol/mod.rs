//! Generic WebSocket session state machine.

pub mod frame;

mod message;

pub use self::{
    frame::{coding::CloseCode, CloseFrame, Utf8Bytes},
    message::Message,
};

use self::{
    frame::{
        coding::{Control, Data, OpCode},
        Frame, FrameWriter,
    },
    message::{IncompleteMessage, IncompleteMessageType},
};
use crate::{
    endpoint::{AccessChannel, Endpoint},
    error::{Error, ProtocolError, Result},
    handler::Handler,
    handshake::headers::Headers,
};
use bytes::Bytes;
use log::*;
use std::{fmt, sync::Arc, time::Duration};

/// Indicates a Client or Server role of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This session is a server.
    Server,
    /// This session is a client.
    Client,
}

/// The lifecycle state of a session.
///
/// Transitions are monotonic: `Connecting` is never re-entered, and
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The opening handshake has not completed yet.
    Connecting,
    /// Frames are being exchanged.
    Open,
    /// A close frame has been sent or received, the close handshake is in
    /// progress.
    Closing,
    /// The session is over.
    Closed,
}

/// The configuration for a WebSocket session.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Read buffer capacity. Bounds the number of unconsumed bytes held
    /// from the network. The default value is 16 KiB.
    pub read_buffer_size: usize,
    /// The maximum size of an incoming message. `None` means no size
    /// limit. The default value is 64 MiB.
    pub max_message_size: Option<usize>,
    /// The maximum size of a single incoming frame payload. `None` means
    /// no size limit. The default value is 16 MiB.
    pub max_frame_size: Option<usize>,
    /// How long the peer may take to complete the opening handshake.
    /// The default value is 5 seconds.
    pub handshake_timeout: Duration,
    /// How long to wait for the peer to acknowledge a close frame before
    /// dropping TCP. The default value is 1 second.
    pub close_timeout: Duration,
    /// How long a client waits for the server EOF after a completed close
    /// handshake. The default value is 1 second.
    pub eof_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 16 * 1024,
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            handshake_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
            eof_grace: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    /// Set [`Self::read_buffer_size`].
    pub fn read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    /// Set [`Self::max_message_size`].
    pub fn max_message_size(mut self, max_message_size: Option<usize>) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set [`Self::max_frame_size`].
    pub fn max_frame_size(mut self, max_frame_size: Option<usize>) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Set [`Self::handshake_timeout`].
    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Set [`Self::close_timeout`].
    pub fn close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Set [`Self::eof_grace`].
    pub fn eof_grace(mut self, eof_grace: Duration) -> Self {
        self.eof_grace = eof_grace;
        self
    }
}

/// The per-connection session core handed to application callbacks.
///
/// Everything here is synchronous: operations record state changes and
/// queue outgoing frames; the owning I/O task flushes the queue and keeps
/// the timers. All mutation happens on that task, so no locking is needed.
pub struct SessionHandle {
    role: Role,
    state: SessionState,
    endpoint: Arc<dyn Endpoint>,
    pub(crate) config: SessionConfig,

    // Facts established by the opening handshake.
    pub(crate) resource: String,
    pub(crate) origin: String,
    pub(crate) version: u32,
    pub(crate) client_headers: Headers,
    pub(crate) server_headers: Headers,
    pub(crate) client_subprotocols: Vec<String>,
    pub(crate) client_extensions: Vec<String>,
    subprotocol: String,
    extensions: Vec<String>,

    // Close bookkeeping.
    local_close_code: CloseCode,
    local_close_reason: Utf8Bytes,
    remote_close_code: CloseCode,
    remote_close_reason: Utf8Bytes,
    closed_by_me: bool,
    dropped_by_me: bool,
    was_clean: bool,

    // Message being reassembled, if any.
    incomplete: Option<IncompleteMessage>,

    writer: FrameWriter,
    close_deadline_wanted: bool,
    replacement_handler: Option<Box<dyn Handler>>,
}

impl SessionHandle {
    pub(crate) fn new(role: Role, endpoint: Arc<dyn Endpoint>, config: SessionConfig) -> Self {
        Self {
            role,
            state: SessionState::Connecting,
            endpoint,
            config,
            resource: String::new(),
            origin: String::new(),
            version: 0,
            client_headers: Headers::default(),
            server_headers: Headers::default(),
            client_subprotocols: Vec::new(),
            client_extensions: Vec::new(),
            subprotocol: String::new(),
            extensions: Vec::new(),
            local_close_code: CloseCode::Status,
            local_close_reason: Utf8Bytes::default(),
            remote_close_code: CloseCode::Status,
            remote_close_reason: Utf8Bytes::default(),
            closed_by_me: false,
            dropped_by_me: false,
            was_clean: false,
            incomplete: None,
            writer: FrameWriter::default(),
            close_deadline_wanted: false,
            replacement_handler: None,
        }
    }

    /*** status accessors ***/

    /// The session role chosen at construction.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The request URI from the opening handshake.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// The `Origin` (or `Sec-WebSocket-Origin` for versions below 13)
    /// announced by the client, or an empty string.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The negotiated WebSocket protocol version (7, 8 or 13).
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The subprotocol negotiated during the opening handshake, or the
    /// empty string if none was selected.
    pub fn subprotocol(&self) -> &str {
        if self.state == SessionState::Connecting {
            self.warn("subprotocol is not available before the handshake has completed");
        }
        &self.subprotocol
    }

    /// The negotiated subprotocol without the not-yet-open warning, for
    /// response generation while still in the connecting state.
    pub(crate) fn subprotocol_raw(&self) -> &str {
        &self.subprotocol
    }

    /// Extensions negotiated during the opening handshake, in selection order.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Look up a header from the client request (case-insensitive).
    pub fn client_header(&self, name: &str) -> Option<&str> {
        self.client_headers.find(name)
    }

    /// Look up a header the server put into the handshake response.
    pub fn server_header(&self, name: &str) -> Option<&str> {
        self.server_headers.find(name)
    }

    /// Whether both endpoints exchanged close frames.
    pub fn was_clean(&self) -> bool {
        self.was_clean
    }

    /// Whether this endpoint sent the first close frame or initiated the
    /// TCP shutdown.
    pub fn closed_by_me(&self) -> bool {
        self.closed_by_me
    }

    /// Whether this endpoint initiated the TCP drop.
    pub fn dropped_by_me(&self) -> bool {
        self.dropped_by_me
    }

    /// The close code this endpoint sent, `CloseCode::Status` if none.
    pub fn local_close_code(&self) -> CloseCode {
        self.local_close_code
    }

    /// The close reason this endpoint sent.
    pub fn local_close_reason(&self) -> &str {
        &self.local_close_reason
    }

    /// The close code received from the peer, `CloseCode::Status` if none.
    pub fn remote_close_code(&self) -> CloseCode {
        self.remote_close_code
    }

    /// The close reason received from the peer.
    pub fn remote_close_reason(&self) -> &str {
        &self.remote_close_reason
    }

    /*** handshake interface, usable from `Handler::validate` ***/

    /// Add a header to the handshake response. The reserved handshake
    /// headers (`Upgrade`, `Connection`, `Sec-WebSocket-Accept`, `Server`)
    /// cannot be overridden; attempts to do so are ignored.
    pub fn set_header(&mut self, name: &str, value: &str) {
        const RESERVED: [&str; 4] = ["Upgrade", "Connection", "Sec-WebSocket-Accept", "Server"];
        if RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name)) {
            self.warn(&format!("ignoring reserved handshake response header {name}"));
            return;
        }
        self.server_headers.append(name, value);
    }

    /// Choose the subprotocol for this session. Only callable while the
    /// handshake is being validated; a non-empty name must be among the
    /// values the client proposed.
    pub fn select_subprotocol(&mut self, name: &str) -> Result<()> {
        if self.state != SessionState::Connecting {
            return Err(Error::Internal(
                "subprotocol can only be selected during handshake validation".into(),
            ));
        }
        if !name.is_empty() && !self.client_subprotocols.iter().any(|p| p == name) {
            return Err(Error::Internal(
                "attempted to choose a subprotocol not proposed by the client".into(),
            ));
        }
        self.subprotocol = name.to_owned();
        Ok(())
    }

    /// Accept an extension for this session. Only callable while the
    /// handshake is being validated; the name must be among the values
    /// the client proposed. An empty name is a no-op.
    pub fn select_extension(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        if self.state != SessionState::Connecting {
            return Err(Error::Internal(
                "extensions can only be selected during handshake validation".into(),
            ));
        }
        if !self.client_extensions.iter().any(|e| e == name) {
            return Err(Error::Internal(
                "attempted to choose an extension not proposed by the client".into(),
            ));
        }
        self.extensions.push(name.to_owned());
        Ok(())
    }

    /*** session interface ***/

    /// Queue a text message. Valid only while the session is open.
    pub fn send(&mut self, text: impl Into<Utf8Bytes>) {
        if self.state != SessionState::Open {
            self.warn("tried to send a message from a session that isn't open");
            return;
        }
        let text = text.into();
        self.queue(Frame::message(Bytes::from(text), OpCode::Data(Data::Text), true));
    }

    /// Queue a binary message. Valid only while the session is open.
    pub fn send_binary(&mut self, data: impl Into<Bytes>) {
        if self.state != SessionState::Open {
            self.warn("tried to send a message from a session that isn't open");
            return;
        }
        self.queue(Frame::message(data, OpCode::Data(Data::Binary), true));
    }

    /// Queue a ping frame. Valid only while the session is open.
    pub fn ping(&mut self, payload: impl Into<Bytes>) {
        if self.state != SessionState::Open {
            self.warn("tried to send a ping from a session that isn't open");
            return;
        }
        self.queue(Frame::ping(payload));
    }

    /// Queue a pong frame. Valid only while the session is open.
    pub fn pong(&mut self, payload: impl Into<Bytes>) {
        if self.state != SessionState::Open {
            self.warn("tried to send a pong from a session that isn't open");
            return;
        }
        self.queue(Frame::pong(payload));
    }

    /// Initiate the closing handshake.
    ///
    /// Applications may use `CloseCode::Normal` or codes in the 4000-4999
    /// range; everything else is rewritten to a wire-legal equivalent
    /// before it is sent.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        self.initiate_close(code, reason.into());
    }

    /// Replace the connection handler. The new handler's `on_open` is
    /// invoked once the swap is performed by the session task.
    pub fn set_handler(&mut self, handler: Box<dyn Handler>) {
        self.replacement_handler = Some(handler);
    }

    /*** frame processing ***/

    /// Dispatch one parsed frame. Returns a message when one became
    /// complete and should be delivered to the handler.
    pub(crate) fn process_frame(&mut self, frame: Frame) -> Result<Option<Message>> {
        match self.state {
            SessionState::Open => match frame.header().opcode {
                OpCode::Data(Data::Continue) => self.process_continuation(frame),
                OpCode::Data(Data::Text) | OpCode::Data(Data::Binary) => self.process_data(frame),
                OpCode::Control(Control::Ping) => {
                    self.access_log("ping", AccessChannel::Control);
                    let payload = frame.into_payload();
                    self.queue(Frame::pong(payload));
                    Ok(None)
                }
                OpCode::Control(Control::Pong) => {
                    self.access_log("pong", AccessChannel::Control);
                    Ok(None)
                }
                OpCode::Control(Control::Close) => {
                    debug!("processing close frame");
                    self.process_close(frame)?;
                    Ok(None)
                }
                OpCode::Data(Data::Reserved(i)) | OpCode::Control(Control::Reserved(i)) => {
                    Err(Error::Protocol(ProtocolError::InvalidOpcode(i)))
                }
            },
            SessionState::Closing => {
                if frame.header().opcode == OpCode::Control(Control::Close) {
                    self.process_close(frame)?;
                } else {
                    // In-flight frames the peer sent before seeing our
                    // close frame; they are not delivered.
                    debug!("ignoring {frame} received in closing state");
                }
                Ok(None)
            }
            _ => Err(Error::Fatal("frame processed outside of open/closing state".into())),
        }
    }

    fn process_data(&mut self, frame: Frame) -> Result<Option<Message>> {
        let opcode = frame.header().opcode;
        if self.incomplete.is_some() {
            let data = match opcode {
                OpCode::Data(data) => data,
                _ => unreachable!("control frames are dispatched before data"),
            };
            return Err(Error::Protocol(ProtocolError::ExpectedFragment(data)));
        }

        let kind = match opcode {
            OpCode::Data(Data::Text) => IncompleteMessageType::Text,
            _ => IncompleteMessageType::Binary,
        };

        if frame.header().is_final {
            // Unfragmented: deliver straight from the parser's payload
            // without going through the accumulator.
            message::check_max_size(frame.payload().len(), self.config.max_message_size)?;
            let message = match kind {
                IncompleteMessageType::Text => Message::Text(frame.into_text()?),
                IncompleteMessageType::Binary => Message::Binary(frame.into_payload()),
            };
            Ok(Some(message))
        } else {
            let mut incomplete = IncompleteMessage::new(kind);
            incomplete.extend(frame.into_payload(), self.config.max_message_size)?;
            self.incomplete = Some(incomplete);
            Ok(None)
        }
    }

    fn process_continuation(&mut self, frame: Frame) -> Result<Option<Message>> {
        let is_final = frame.header().is_final;
        let incomplete = self
            .incomplete
            .as_mut()
            .ok_or(Error::Protocol(ProtocolError::UnexpectedContinueFrame))?;
        incomplete.extend(frame.into_payload(), self.config.max_message_size)?;

        if is_final {
            let message = self.incomplete.take().expect("Bug: incomplete message vanished");
            Ok(Some(message.complete()?))
        } else {
            Ok(None)
        }
    }

    fn process_close(&mut self, frame: Frame) -> Result<()> {
        let close = frame.into_close()?;
        let (code, reason) = match close {
            Some(CloseFrame { code, reason }) => (code, reason),
            None => (CloseCode::Status, Utf8Bytes::default()),
        };
        self.remote_close_code = code;
        self.remote_close_reason = reason.clone();

        match self.state {
            SessionState::Open => {
                debug!("peer initiated close, acknowledging");
                self.emit_close(code, reason);
            }
            SessionState::Closing => {
                debug!("received close ack");
                self.closed_by_me = true;
            }
            _ => return Err(Error::Fatal("close frame processed in invalid state".into())),
        }

        self.was_clean = true;
        self.state = SessionState::Closed;
        Ok(())
    }

    /*** close helpers ***/

    /// Start the closing handshake from this endpoint, either on behalf
    /// of the application or to recover from a frame error.
    pub(crate) fn initiate_close(&mut self, code: CloseCode, reason: Utf8Bytes) {
        if self.state != SessionState::Open {
            self.warn("tried to close a session that isn't open");
            return;
        }
        self.closed_by_me = true;
        self.emit_close(code, reason);
    }

    /// Send a close frame, rewriting codes that may not appear on the
    /// wire, and enter the closing state. Used both for locally initiated
    /// closes and for acknowledgements.
    fn emit_close(&mut self, code: CloseCode, reason: Utf8Bytes) {
        debug_assert_eq!(self.state, SessionState::Open);
        self.state = SessionState::Closing;
        self.close_deadline_wanted = true;

        let close = rewrite_close(code, reason);
        self.local_close_code = close.code;
        self.local_close_reason = close.reason.clone();

        self.queue(Frame::close(Some(close)));
    }

    /// Record the outcome of a TCP-level teardown. Dropping the transport
    /// only counts as closing the session when no close handshake settled
    /// the question first.
    pub(crate) fn mark_dropped(&mut self, by_me: bool) {
        self.dropped_by_me = by_me;
        if by_me && self.state != SessionState::Closed {
            self.closed_by_me = true;
        }
        self.state = SessionState::Closed;
    }

    /// Record an EOF or transport failure observed on the socket.
    pub(crate) fn mark_transport_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    pub(crate) fn open(&mut self) {
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.state = SessionState::Open;
    }

    /*** plumbing for the session task ***/

    fn queue(&mut self, mut frame: Frame) {
        if self.role == Role::Client {
            // Frames sent by the client must be masked, with a fresh key
            // per frame.
            frame.set_mask(self.endpoint.rng());
        }
        self.writer.queue(frame);
    }

    pub(crate) fn has_output(&self) -> bool {
        !self.writer.is_empty()
    }

    pub(crate) fn take_output(&mut self) -> Bytes {
        self.writer.take()
    }

    pub(crate) fn take_close_deadline_request(&mut self) -> bool {
        std::mem::take(&mut self.close_deadline_wanted)
    }

    pub(crate) fn take_replacement_handler(&mut self) -> Option<Box<dyn Handler>> {
        self.replacement_handler.take()
    }

    pub(crate) fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub(crate) fn access_log(&self, msg: &str, channel: AccessChannel) {
        self.endpoint.access_log(msg, channel);
    }

    fn warn(&self, msg: &str) {
        self.endpoint.log(msg, Level::Warn);
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("resource", &self.resource)
            .field("version", &self.version)
            .field("was_clean", &self.was_clean)
            .field("closed_by_me", &self.closed_by_me)
            .field("dropped_by_me", &self.dropped_by_me)
            .finish()
    }
}

/// Apply the wire-legality rules to a close tuple about to be sent.
fn rewrite_close(code: CloseCode, reason: Utf8Bytes) -> CloseFrame {
    match code {
        // No status to echo: answer with a normal closure.
        CloseCode::Status => CloseFrame { code: CloseCode::Normal, reason: Utf8Bytes::default() },
        // Synthesized for internal failures; 1006 itself may not be sent.
        CloseCode::Abnormal => CloseFrame { code: CloseCode::Policy, reason },
        c if c.is_invalid() => {
            CloseFrame { code: CloseCode::Protocol, reason: "Status code is invalid".into() }
        }
        c if c.is_reserved() => {
            CloseFrame { code: CloseCode::Protocol, reason: "Status code is reserved".into() }
        }
        c => CloseFrame { code: c, reason },
    }
}
