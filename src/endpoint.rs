//! Capabilities shared by every session of an endpoint.

use log::Level;

/// Channels of the access log, one per kind of connection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessChannel {
    /// Opening handshake requests and results.
    Handshake,
    /// Close results and TCP teardown.
    Disconnect,
    /// Frame-level events.
    Frame,
    /// Control frames and everything else.
    Control,
}

impl AccessChannel {
    /// The log target used by the default [`Endpoint::access_log`].
    pub fn target(self) -> &'static str {
        match self {
            AccessChannel::Handshake => "scheelite::access::handshake",
            AccessChannel::Disconnect => "scheelite::access::disconnect",
            AccessChannel::Frame => "scheelite::access::frame",
            AccessChannel::Control => "scheelite::access::control",
        }
    }
}

/// Capabilities a session borrows from its endpoint: host validation for
/// the opening handshake, randomness for client-side masking, and the two
/// log channels. The endpoint is shared between sessions and is never
/// mutated by them.
pub trait Endpoint: Send + Sync {
    /// Whether `host` names this endpoint. Consulted for the `Host`
    /// header of every handshake request.
    fn validate_host(&self, _host: &str) -> bool {
        true
    }

    /// A uniform 32-bit random draw, used for frame masks in the client
    /// role.
    fn rng(&self) -> u32 {
        rand::random()
    }

    /// The value of the `Server` header in handshake responses.
    fn server_agent(&self) -> &str {
        concat!("scheelite/", env!("CARGO_PKG_VERSION"))
    }

    /// Error/diagnostic log sink.
    fn log(&self, msg: &str, level: Level) {
        log::log!(target: "scheelite", level, "{msg}");
    }

    /// Access log sink, one channel per event class.
    fn access_log(&self, msg: &str, channel: AccessChannel) {
        log::log!(target: channel.target(), Level::Debug, "{msg}");
    }
}

/// An endpoint that accepts every host and logs through the [`log`] facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEndpoint;

impl Endpoint for DefaultEndpoint {}
