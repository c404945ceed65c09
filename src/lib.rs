//! Lightweight WebSocket endpoint sessions for Rust.
//!
//! One [`Session`] drives a single connection from the HTTP upgrade
//! through framed message exchange to the closing handshake, invoking an
//! application [`Handler`] for the events it produces. Endpoint-wide
//! capabilities (host validation, masking randomness, logging) come from
//! a shared [`Endpoint`].
//!
//! ```no_run
//! use scheelite::{DefaultEndpoint, Handler, Message, Session, SessionConfig, SessionHandle};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&mut self, session: &mut SessionHandle, message: Message) {
//!         match message {
//!             Message::Text(text) => session.send(text),
//!             Message::Binary(data) => session.send_binary(data),
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> scheelite::Result<()> {
//!     let endpoint = Arc::new(DefaultEndpoint::default());
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9002").await?;
//!     loop {
//!         let (stream, _) = listener.accept().await?;
//!         let endpoint = endpoint.clone();
//!         tokio::spawn(async move {
//!             let mut session =
//!                 Session::accept(stream, Echo, endpoint, SessionConfig::default());
//!             let _ = session.run().await;
//!         });
//!     }
//! }
//! ```
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod endpoint;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod protocol;

mod session;

pub use crate::{
    endpoint::{AccessChannel, DefaultEndpoint, Endpoint},
    error::{Error, HandshakeError, Result},
    handler::{Handler, NoHandler},
    protocol::{
        CloseCode, CloseFrame, Message, Role, SessionConfig, SessionHandle, SessionState,
        Utf8Bytes,
    },
    session::Session,
};
