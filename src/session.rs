//! The per-connection session driver.
//!
//! A [`Session`] owns one full-duplex byte stream and drives it from the
//! opening handshake through framed message exchange to the closing
//! handshake. Everything runs on the task that calls [`Session::run`];
//! application callbacks execute inline on that task and talk back
//! through the [`SessionHandle`].

use crate::{
    endpoint::{AccessChannel, Endpoint},
    error::{Error, ProtocolError, Result},
    handler::Handler,
    handshake::{server, MAX_HEAD_BYTES},
    protocol::{
        frame::FrameParser, CloseCode, Role, SessionConfig, SessionHandle, SessionState,
    },
};
use bytes::{Buf, BytesMut};
use log::*;
use std::{fmt, io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::{sleep_until, timeout, timeout_at, Instant},
};

/// A WebSocket session over a generic byte stream.
///
/// Create one with [`Session::accept`] for a freshly accepted server
/// connection, or [`Session::from_upgraded`] for a stream whose upgrade
/// already happened elsewhere, then call [`Session::run`] to drive it to
/// completion. The session state remains inspectable through
/// [`Session::handle`] after the run ends.
pub struct Session<S> {
    stream: S,
    /// Unconsumed bytes from the network, bounded by the configured read
    /// buffer size.
    buf: BytesMut,
    parser: FrameParser,
    handle: SessionHandle,
    handler: Box<dyn Handler>,
    /// Deadline for the peer's close acknowledgement, armed when our
    /// first close frame goes out.
    close_deadline: Option<Instant>,
    /// Single-writer rule: set for the duration of a socket write.
    writing: bool,
    /// Whether `on_open` has fired, and therefore `on_close` must.
    opened: bool,
    /// Whether the peer closed the transport before we did.
    eof: bool,
    /// Whether the stream has been shut down already.
    dropped: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Create a server session for a just-accepted connection. The
    /// opening handshake is performed by [`Session::run`].
    pub fn accept(
        stream: S,
        handler: impl Handler + 'static,
        endpoint: Arc<dyn Endpoint>,
        config: SessionConfig,
    ) -> Self {
        Self::new(stream, Role::Server, handler, endpoint, config, false)
    }

    /// Create a session over a stream whose upgrade handshake has already
    /// been performed elsewhere. This is also how client sessions are
    /// built.
    pub fn from_upgraded(
        stream: S,
        role: Role,
        handler: impl Handler + 'static,
        endpoint: Arc<dyn Endpoint>,
        config: SessionConfig,
    ) -> Self {
        Self::new(stream, role, handler, endpoint, config, true)
    }

    fn new(
        stream: S,
        role: Role,
        handler: impl Handler + 'static,
        endpoint: Arc<dyn Endpoint>,
        config: SessionConfig,
        upgraded: bool,
    ) -> Self {
        let mut handle = SessionHandle::new(role, endpoint, config);
        if upgraded {
            handle.open();
        }
        Self {
            stream,
            buf: BytesMut::with_capacity(config.read_buffer_size),
            // A server must receive masked frames, a client unmasked ones.
            parser: FrameParser::new(role == Role::Server, config.max_frame_size),
            handle,
            handler: Box::new(handler),
            close_deadline: None,
            writing: false,
            opened: false,
            eof: false,
            dropped: false,
        }
    }

    /// The session core: handshake facts, close bookkeeping and state.
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Drive the session until it is closed and the stream released.
    ///
    /// Returns `Ok` whenever the connection ran its course, including
    /// teardowns caused by timeouts, protocol violations and peer EOF.
    /// An error means the handshake was rejected or the transport failed
    /// in a way that was not part of an orderly teardown.
    pub async fn run(&mut self) -> Result<()> {
        if self.handle.state() == SessionState::Connecting {
            match timeout(self.handle.config.handshake_timeout, self.read_handshake()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.log_error("handshake failed", &err);
                    self.drop_tcp(true).await?;
                    return Err(err);
                }
                Err(_) => {
                    debug!("handshake timed out");
                    self.drop_tcp(true).await?;
                    return Ok(());
                }
            }
        }

        if self.handle.state() == SessionState::Open {
            self.opened = true;
            self.handler.on_open(&mut self.handle);
            self.after_dispatch().await?;
        }

        self.read_frames().await?;
        self.finalize().await
    }

    /// Read and answer the opening handshake. Any bytes that follow the
    /// request head stay in the buffer for the frame loop.
    async fn read_handshake(&mut self) -> Result<()> {
        loop {
            match server::try_parse(&self.buf) {
                Ok(Some((size, request))) => {
                    let head = String::from_utf8_lossy(&self.buf[..size]).into_owned();
                    self.handle.access_log(&head, AccessChannel::Handshake);
                    self.buf.advance(size);

                    let result = server::negotiate(&mut self.handle, self.handler.as_mut(), request);
                    let response = match &result {
                        Ok(()) => server::build_accept_response(&mut self.handle),
                        Err(err) => server::build_error_response(err),
                    };
                    self.write_all(&response).await?;

                    return match result {
                        Ok(()) => {
                            self.handle.open();
                            self.log_open_result(101);
                            Ok(())
                        }
                        Err(err) => {
                            self.log_open_result(err.code.as_u16());
                            Err(err.into())
                        }
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    // Unparseable request: answer and give up.
                    let _ = self.write_all(&server::build_error_response(&err)).await;
                    return Err(err.into());
                }
            }

            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(Error::AttackAttempt);
            }
            self.buf.reserve(512);
            if self.stream.read_buf(&mut self.buf).await? == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    /// The frame read loop: consume as many complete frames as the buffer
    /// holds, dispatch each, then read at least the bytes the parser
    /// still needs, racing the close deadline when one is armed.
    async fn read_frames(&mut self) -> Result<()> {
        loop {
            while matches!(self.handle.state(), SessionState::Open | SessionState::Closing) {
                match self.parser.consume(&mut self.buf) {
                    Ok(Some(frame)) => {
                        match self.handle.process_frame(frame) {
                            Ok(Some(message)) => {
                                trace!("delivering {message}");
                                self.handler.on_message(&mut self.handle, message);
                            }
                            Ok(None) => {}
                            Err(err) => self.recover(err).await?,
                        }
                        self.after_dispatch().await?;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        self.recover(err).await?;
                        self.after_dispatch().await?;
                    }
                }
            }

            if self.handle.state() == SessionState::Closed {
                return Ok(());
            }

            let needed = self.parser.bytes_needed().clamp(1, self.handle.config.read_buffer_size);
            self.buf.reserve(needed);

            let read_result = match self.close_deadline {
                Some(deadline) => {
                    tokio::select! {
                        result = self.stream.read_buf(&mut self.buf) => Some(result),
                        _ = sleep_until(deadline) => None,
                    }
                }
                None => Some(self.stream.read_buf(&mut self.buf).await),
            };

            match read_result {
                None => {
                    // The peer never acknowledged our close frame.
                    debug!("close timed out");
                    self.drop_tcp(true).await?;
                    return Ok(());
                }
                Some(Ok(0)) => {
                    // An EOF here always precedes a settled close
                    // handshake; a completed exchange leaves the loop
                    // before another read is issued.
                    self.eof = true;
                    self.log_error(
                        "received EOF",
                        &Error::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                    );
                    self.handle.mark_transport_closed();
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    self.log_error("error reading frame", &err);
                    self.handle.mark_transport_closed();
                    return Ok(());
                }
            }
        }
    }

    /// Recover from a frame-level error: protocol and payload violations
    /// turn into a close handshake, soft errors are logged and skipped,
    /// anything else tears the connection down.
    async fn recover(&mut self, err: Error) -> Result<()> {
        self.parser.reset();
        self.handle.access_log(&err.to_string(), AccessChannel::Frame);
        self.log_error("frame error", &err);

        match &err {
            Error::Protocol(_) => {
                self.handle.initiate_close(CloseCode::Protocol, err.to_string().into());
            }
            Error::Utf8(_) => {
                self.handle.initiate_close(CloseCode::Invalid, err.to_string().into());
            }
            Error::Capacity(_) => {
                self.handle.initiate_close(CloseCode::Size, err.to_string().into());
            }
            Error::Internal(_) => {
                self.handle.initiate_close(CloseCode::Error, err.to_string().into());
            }
            Error::Soft(_) => {}
            _ => {
                debug!("dropping TCP due to unrecoverable error");
                self.drop_tcp(true).await?;
            }
        }
        Ok(())
    }

    /// Housekeeping between a dispatched frame or callback and the next
    /// read: install a replacement handler, arm the close deadline and
    /// flush queued output.
    async fn after_dispatch(&mut self) -> Result<()> {
        if let Some(handler) = self.handle.take_replacement_handler() {
            self.handler = handler;
            self.handler.on_open(&mut self.handle);
        }

        if self.handle.take_close_deadline_request() && self.close_deadline.is_none() {
            self.close_deadline = Some(Instant::now() + self.handle.config.close_timeout);
        }

        self.flush_output().await
    }

    /// Write everything the session queued. A write failure is terminal:
    /// it is logged and the connection is dropped.
    async fn flush_output(&mut self) -> Result<()> {
        if !self.handle.has_output() || self.dropped {
            return Ok(());
        }
        debug_assert!(!self.writing, "Bug: overlapping writes");
        self.writing = true;
        let data = self.handle.take_output();
        let result = self.stream.write_all(&data).await;
        self.writing = false;

        if let Err(err) = result {
            self.log_error("error writing frame data", &err);
            self.drop_tcp(false).await?;
        } else {
            self.handle.access_log("write complete", AccessChannel::Frame);
        }
        Ok(())
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        debug_assert!(!self.writing, "Bug: overlapping writes");
        self.writing = true;
        let result = self.stream.write_all(data).await;
        self.writing = false;
        result?;
        Ok(self.stream.flush().await?)
    }

    /// The session is over: log the result, tell the handler, release the
    /// socket according to the role.
    async fn finalize(&mut self) -> Result<()> {
        self.close_deadline = None;
        self.log_close_result();

        if self.opened {
            self.handler.on_close(&mut self.handle);
        }

        match self.handle.role() {
            Role::Server => {
                // The server holds the TIME_WAIT state, so it drops first.
                self.drop_tcp(!self.eof).await
            }
            Role::Client => {
                if self.handle.was_clean() && self.handle.closed_by_me() && !self.eof && !self.dropped
                {
                    // We received the acknowledgement; give the server a
                    // bounded amount of time to drop the connection first.
                    let deadline = Instant::now() + self.handle.config.eof_grace;
                    let mut peer_dropped = false;
                    let mut scratch = [0u8; 512];
                    while !peer_dropped {
                        match timeout_at(deadline, self.stream.read(&mut scratch)).await {
                            Err(_) => break,
                            Ok(Ok(0)) | Ok(Err(_)) => peer_dropped = true,
                            Ok(Ok(_)) => {}
                        }
                    }
                    self.drop_tcp(!peer_dropped).await
                } else {
                    self.drop_tcp(!self.eof).await
                }
            }
        }
    }

    /// Shut the stream down in both directions. A kernel "not connected"
    /// error means the peer beat us to it and is ignored; other errors
    /// propagate.
    async fn drop_tcp(&mut self, by_me: bool) -> Result<()> {
        self.close_deadline = None;
        if !self.dropped {
            self.dropped = true;
            self.handle.mark_dropped(by_me);
            if let Err(err) = self.stream.shutdown().await {
                if err.kind() != io::ErrorKind::NotConnected {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn log_open_result(&self, code: u16) {
        let user_agent = self.handle.client_header("User-Agent").unwrap_or("NULL");
        let msg = format!(
            "v{} {} {} {}",
            self.handle.version(),
            user_agent,
            self.handle.resource(),
            code
        );
        self.handle.access_log(&msg, AccessChannel::Handshake);
    }

    fn log_close_result(&self) {
        let local_reason = self.handle.local_close_reason();
        let remote_reason = self.handle.remote_close_reason();
        let msg = format!(
            "{} close local:[{}{}{}] remote:[{}{}{}]",
            if self.handle.was_clean() { "Clean" } else { "Unclean" },
            self.handle.local_close_code(),
            if local_reason.is_empty() { "" } else { "," },
            local_reason,
            self.handle.remote_close_code(),
            if remote_reason.is_empty() { "" } else { "," },
            remote_reason,
        );
        self.handle.access_log(&msg, AccessChannel::Disconnect);
    }

    fn log_error(&self, msg: &str, err: &impl fmt::Display) {
        self.handle.endpoint().log(&format!("{msg} ({err})"), Level::Error);
    }
}

impl<S> fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.handle.role())
            .field("state", &self.handle.state())
            .field("buffered", &self.buf.len())
            .finish()
    }
}
