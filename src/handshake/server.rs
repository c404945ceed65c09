//! Server side of the opening handshake.

use super::{
    derive_accept_key,
    headers::{contains_token, split_tokens, Headers},
    MAX_HEADERS,
};
use crate::{
    error::{HandshakeError, Result},
    handler::Handler,
    protocol::SessionHandle,
};
use httparse::Status;
use log::*;
use std::fmt::Write as _;

/// A parsed client upgrade request.
#[derive(Debug)]
pub(crate) struct Request {
    pub resource: String,
    pub headers: Headers,
}

/// Try to parse a request head out of `buf`.
///
/// Returns the number of bytes the head occupied (everything beyond it
/// already belongs to the frame stream) together with the request, `None`
/// while the terminating empty line has not arrived yet, or a handshake
/// rejection for malformed requests.
pub(crate) fn try_parse(buf: &[u8]) -> Result<Option<(usize, Request)>, HandshakeError> {
    let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut hbuffer);

    let size = match req.parse(buf) {
        Ok(Status::Complete(size)) => size,
        Ok(Status::Partial) => return Ok(None),
        Err(err) => {
            return Err(HandshakeError::new(400, format!("malformed handshake request: {err}")))
        }
    };

    if req.method != Some("GET") {
        return Err(HandshakeError::new(
            400,
            format!("handshake has invalid method: {}", req.method.unwrap_or("")),
        ));
    }

    if req.version != Some(1) {
        return Err(HandshakeError::new(400, "handshake has invalid HTTP version"));
    }

    let mut headers = Headers::default();
    for header in req.headers.iter() {
        let value = String::from_utf8_lossy(header.value);
        headers.append(header.name, &value);
    }

    let resource = req.path.unwrap_or("").to_owned();
    Ok(Some((size, Request { resource, headers })))
}

/// Validate the parsed request against the protocol requirements, in
/// order, then hand over to the application's `validate` callback.
///
/// On success the session handle carries all handshake facts and any
/// negotiated subprotocol/extensions.
pub(crate) fn negotiate(
    session: &mut SessionHandle,
    handler: &mut dyn Handler,
    request: Request,
) -> Result<(), HandshakeError> {
    session.resource = request.resource;
    session.client_headers = request.headers;

    let host = session
        .client_headers
        .find("Host")
        .map(str::to_owned)
        .ok_or_else(|| HandshakeError::new(400, "required Host header is missing"))?;
    if !session.endpoint().validate_host(&host) {
        return Err(HandshakeError::new(
            400,
            format!("host {host} is not one of this server's names"),
        ));
    }

    match session.client_headers.find("Upgrade") {
        None => return Err(HandshakeError::new(400, "required Upgrade header is missing")),
        Some(upgrade) if !upgrade.eq_ignore_ascii_case("websocket") => {
            return Err(HandshakeError::new(
                400,
                format!("Upgrade header was {upgrade} instead of \"websocket\""),
            ));
        }
        Some(_) => {}
    }

    match session.client_headers.find("Connection") {
        None => return Err(HandshakeError::new(400, "required Connection header is missing")),
        Some(connection) if !contains_token(connection, "upgrade") => {
            return Err(HandshakeError::new(
                400,
                format!("Connection header \"{connection}\" does not contain required token \"upgrade\""),
            ));
        }
        Some(_) => {}
    }

    match session.client_headers.find("Sec-WebSocket-Key") {
        None | Some("") => {
            return Err(HandshakeError::new(400, "required Sec-WebSocket-Key header is missing"))
        }
        Some(_) => {}
    }

    let version = session
        .client_headers
        .find("Sec-WebSocket-Version")
        .ok_or_else(|| HandshakeError::new(400, "required Sec-WebSocket-Version header is missing"))?;
    session.version = match version.trim().parse() {
        Ok(v @ (7 | 8 | 13)) => v,
        _ => {
            return Err(HandshakeError::new(
                400,
                format!("this server doesn't support WebSocket protocol version {version}"),
            ));
        }
    };

    let origin_header = if session.version < 13 { "Sec-WebSocket-Origin" } else { "Origin" };
    if let Some(origin) = session.client_headers.find(origin_header) {
        session.origin = origin.to_owned();
    }

    session.client_subprotocols = session
        .client_headers
        .find("Sec-WebSocket-Protocol")
        .map(split_tokens)
        .unwrap_or_default();
    session.client_extensions = session
        .client_headers
        .find("Sec-WebSocket-Extensions")
        .map(split_tokens)
        .unwrap_or_default();

    handler.validate(session)
}

/// Build the `101 Switching Protocols` response. Records the headers it
/// emits so they remain visible through `server_header`.
pub(crate) fn build_accept_response(session: &mut SessionHandle) -> Vec<u8> {
    let key = session
        .client_headers
        .find("Sec-WebSocket-Key")
        .expect("Bug: accept response without a client key");
    let accept = derive_accept_key(key.as_bytes());
    let agent = session.endpoint().server_agent().to_owned();

    let mut reply = String::with_capacity(256);
    reply.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    let _ = write!(
        reply,
        "Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\
         Server: {agent}\r\n"
    );

    let mut reserved = Headers::default();
    reserved.append("Upgrade", "websocket");
    reserved.append("Connection", "Upgrade");
    reserved.append("Sec-WebSocket-Accept", &accept);
    reserved.append("Server", &agent);

    if !session.subprotocol_raw().is_empty() {
        let _ = write!(reply, "Sec-WebSocket-Protocol: {}\r\n", session.subprotocol_raw());
        reserved.append("Sec-WebSocket-Protocol", session.subprotocol_raw());
    }
    if !session.extensions().is_empty() {
        let extensions = session.extensions().join(", ");
        let _ = write!(reply, "Sec-WebSocket-Extensions: {extensions}\r\n");
        reserved.append("Sec-WebSocket-Extensions", &extensions);
    }

    for (name, value) in session.server_headers.iter() {
        let _ = writeln!(reply, "{name}: {value}\r");
    }
    reply.push_str("\r\n");

    for (name, value) in reserved.iter() {
        session.server_headers.append(name, value);
    }

    debug!("handshake accepted for {}", session.resource());
    reply.into_bytes()
}

/// Build the error response for a rejected handshake:
/// a bare status line, with the canonical reason phrase as fallback.
pub(crate) fn build_error_response(error: &HandshakeError) -> Vec<u8> {
    format!("HTTP/1.1 {} {}\r\n\r\n", error.code.as_u16(), error.reason_phrase()).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{DefaultEndpoint, Endpoint};
    use crate::handler::NoHandler;
    use crate::protocol::{Role, SessionConfig};
    use std::sync::Arc;

    const GOOD_REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Origin: http://example.com\r\n\
        \r\n";

    fn fresh_session() -> SessionHandle {
        SessionHandle::new(
            Role::Server,
            Arc::new(DefaultEndpoint::default()),
            SessionConfig::default(),
        )
    }

    fn negotiated(raw: &[u8]) -> Result<SessionHandle, HandshakeError> {
        let (_, request) = try_parse(raw).unwrap().unwrap();
        let mut session = fresh_session();
        negotiate(&mut session, &mut NoHandler, request)?;
        Ok(session)
    }

    #[test]
    fn partial_request_needs_more_bytes() {
        assert!(try_parse(&GOOD_REQUEST[..GOOD_REQUEST.len() - 2]).unwrap().is_none());
    }

    #[test]
    fn parse_reports_head_size() {
        let mut with_tail = GOOD_REQUEST.to_vec();
        with_tail.extend_from_slice(&[0x81, 0x00]);
        let (size, request) = try_parse(&with_tail).unwrap().unwrap();
        assert_eq!(size, GOOD_REQUEST.len());
        assert_eq!(request.resource, "/chat");
    }

    #[test]
    fn successful_negotiation_records_facts() {
        let session = negotiated(GOOD_REQUEST).unwrap();
        assert_eq!(session.resource(), "/chat");
        assert_eq!(session.origin(), "http://example.com");
        assert_eq!(session.version(), 13);
        assert_eq!(session.client_header("host"), Some("server.example.com"));
    }

    #[test]
    fn accept_response_contains_rfc_vector() {
        let mut session = negotiated(GOOD_REQUEST).unwrap();
        let response = String::from_utf8(build_accept_response(&mut session)).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
        assert_eq!(
            session.server_header("sec-websocket-accept"),
            Some("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
        );
    }

    #[test]
    fn non_get_method_is_rejected() {
        let raw = b"POST /chat HTTP/1.1\r\nHost: h\r\n\r\n";
        let err = try_parse(raw).unwrap_err();
        assert_eq!(err.code.as_u16(), 400);
    }

    #[test]
    fn wrong_http_version_is_rejected() {
        let raw = b"GET /chat HTTP/1.0\r\nHost: h\r\n\r\n";
        assert_eq!(try_parse(raw).unwrap_err().code.as_u16(), 400);
    }

    #[test]
    fn missing_headers_fail_in_documented_order() {
        for (omit, expect) in [
            ("Host", "Host header"),
            ("Upgrade", "Upgrade header"),
            ("Connection", "Connection header"),
            ("Sec-WebSocket-Key", "Sec-WebSocket-Key header"),
            ("Sec-WebSocket-Version", "Sec-WebSocket-Version header"),
        ] {
            let raw = String::from_utf8(GOOD_REQUEST.to_vec()).unwrap();
            let stripped: String = raw
                .lines()
                .filter(|line| !line.starts_with(&format!("{omit}:")))
                .map(|line| format!("{line}\r\n"))
                .collect();
            let err = negotiated(stripped.as_bytes()).unwrap_err();
            assert_eq!(err.code.as_u16(), 400, "omitting {omit}");
            assert!(err.reason_phrase().contains(expect), "omitting {omit}: {err}");
        }
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let raw = String::from_utf8(GOOD_REQUEST.to_vec())
            .unwrap()
            .replace("Version: 13", "Version: 6");
        assert_eq!(negotiated(raw.as_bytes()).unwrap_err().code.as_u16(), 400);
    }

    #[test]
    fn old_versions_use_sec_websocket_origin() {
        let raw = String::from_utf8(GOOD_REQUEST.to_vec())
            .unwrap()
            .replace("Version: 13", "Version: 8")
            .replace("Origin:", "Sec-WebSocket-Origin:");
        let session = negotiated(raw.as_bytes()).unwrap();
        assert_eq!(session.version(), 8);
        assert_eq!(session.origin(), "http://example.com");
    }

    #[test]
    fn host_validation_is_delegated_to_the_endpoint() {
        struct OneHost;
        impl Endpoint for OneHost {
            fn validate_host(&self, host: &str) -> bool {
                host == "expected.example.com"
            }
        }

        let (_, request) = try_parse(GOOD_REQUEST).unwrap().unwrap();
        let mut session =
            SessionHandle::new(Role::Server, Arc::new(OneHost), SessionConfig::default());
        let err = negotiate(&mut session, &mut NoHandler, request).unwrap_err();
        assert_eq!(err.code.as_u16(), 400);
        assert!(err.reason_phrase().contains("server.example.com"));
    }

    #[test]
    fn client_token_lists_are_extracted() {
        let raw = String::from_utf8(GOOD_REQUEST.to_vec()).unwrap().replace(
            "Origin:",
            "Sec-WebSocket-Protocol: chat, superchat\r\nSec-WebSocket-Extensions: permessage-foo; x=1\r\nOrigin:",
        );
        let session = negotiated(raw.as_bytes()).unwrap();
        assert_eq!(session.client_subprotocols, vec!["chat", "superchat"]);
        assert_eq!(session.client_extensions, vec!["permessage-foo; x=1"]);
    }

    #[test]
    fn negotiated_subprotocol_appears_in_response() {
        struct PickChat;
        impl Handler for PickChat {
            fn validate(&mut self, session: &mut SessionHandle) -> Result<(), HandshakeError> {
                session.select_subprotocol("chat").map_err(|_| HandshakeError::from_code(500))
            }
        }

        let raw = String::from_utf8(GOOD_REQUEST.to_vec())
            .unwrap()
            .replace("Origin:", "Sec-WebSocket-Protocol: chat, superchat\r\nOrigin:");
        let (_, request) = try_parse(raw.as_bytes()).unwrap().unwrap();
        let mut session = fresh_session();
        negotiate(&mut session, &mut PickChat, request).unwrap();
        let response = String::from_utf8(build_accept_response(&mut session)).unwrap();
        assert!(response.contains("Sec-WebSocket-Protocol: chat\r\n"));
    }

    #[test]
    fn application_headers_are_emitted_after_reserved_ones() {
        let (_, request) = try_parse(GOOD_REQUEST).unwrap().unwrap();
        let mut session = fresh_session();
        session.set_header("X-Answer", "42");
        session.set_header("Server", "impostor");
        negotiate(&mut session, &mut NoHandler, request).unwrap();
        let response = String::from_utf8(build_accept_response(&mut session)).unwrap();
        assert!(response.contains("X-Answer: 42\r\n"));
        assert!(!response.contains("impostor"));
    }

    #[test]
    fn rejection_response_is_a_bare_status_line() {
        let response = build_error_response(&HandshakeError::from_code(400));
        assert_eq!(response, b"HTTP/1.1 400 Bad Request\r\n\r\n");

        let response = build_error_response(&HandshakeError::new(403, "no such origin"));
        assert_eq!(response, b"HTTP/1.1 403 no such origin\r\n\r\n");
    }

    #[test]
    fn folded_headers_survive_parsing() {
        let raw = String::from_utf8(GOOD_REQUEST.to_vec())
            .unwrap()
            .replace("Origin:", "X-Tag: one\r\nX-Tag: two\r\nOrigin:");
        let session = negotiated(raw.as_bytes()).unwrap();
        assert_eq!(session.client_header("x-tag"), Some("one, two"));
    }
}
