//! SSE framing: the preamble headers and per-message wire frames (§4.1).
//!
//! Parsing the inbound SSE stream is delegated to the client-side
//! collaborator (`reqwest_eventsource::EventSource`, standing in for the
//! browser's `EventSource`) — this module only emits frames.

use crate::message::{ControlDirective, Message};
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};

/// `Content-Type` advertised for every SSE response.
pub const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Build the response headers for an SSE preamble, echoing CORS credentials
/// back to the given origin (or falling back to `Host` — see
/// [`cors_origin`]).
pub fn preamble_headers(allow_origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static(EVENT_STREAM_CONTENT_TYPE),
    );
    headers.insert(
        hyper::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        hyper::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-credentials"),
        HeaderValue::from_static("true"),
    );
    insert_allow_origin(&mut headers, allow_origin);
    headers
}

/// CORS headers attached to the (empty-bodied) response to a POST.
pub fn post_response_headers(allow_origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("access-control-allow-credentials"),
        HeaderValue::from_static("true"),
    );
    insert_allow_origin(&mut headers, allow_origin);
    headers
}

fn insert_allow_origin(headers: &mut HeaderMap, allow_origin: &str) {
    if let Ok(value) = HeaderValue::from_str(allow_origin) {
        headers.insert(
            HeaderName::from_static("access-control-allow-origin"),
            value,
        );
    }
}

/// Pick the CORS origin to echo back: the request's `Origin` if present,
/// falling back to `Host` to accommodate clients that omit `Origin` (§4.3).
pub fn cors_origin(origin: Option<&str>, host: Option<&str>) -> String {
    origin
        .or(host)
        .unwrap_or("*")
        .to_string()
}

/// Encode one application message as a `message`-event SSE frame:
/// `data: <json-encoded message>\n\n`.
///
/// The JSON encoding is applied to the already-string payload, so embedded
/// newlines and control characters are escaped and cannot corrupt framing.
pub fn encode_message_frame(message: &Message) -> Bytes {
    let json = serde_json::to_string(message.as_str()).expect("string always encodes");
    Bytes::from(format!("data: {json}\n\n"))
}

/// Encode a transport-level control frame, e.g. the `close` directive.
///
/// Wire shape: `event: control\ndata: <json-encoded literal>\n\n`.
pub fn encode_control_frame(directive: ControlDirective) -> Bytes {
    let json = serde_json::to_string(directive.as_str()).expect("string always encodes");
    Bytes::from(format!("event: control\ndata: {json}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn message_frame_escapes_embedded_newlines() {
        let frame = encode_message_frame(&Message::new("line one\nline two"));
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert_eq!(text, "data: \"line one\\nline two\"\n\n");
        // The frame itself must contain no bare newline inside the payload
        // region: exactly one blank-line terminator at the very end.
        assert_eq!(text.matches("\n\n").count(), 1);
    }

    #[test]
    fn control_frame_carries_close_literal() {
        let frame = encode_control_frame(ControlDirective::Close);
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert_eq!(text, "event: control\ndata: \"close\"\n\n");
    }

    #[test]
    fn cors_origin_prefers_origin_over_host() {
        assert_eq!(
            cors_origin(Some("https://a.example"), Some("b.example")),
            "https://a.example"
        );
        assert_eq!(cors_origin(None, Some("b.example")), "b.example");
        assert_eq!(cors_origin(None, None), "*");
    }

    #[test]
    fn preamble_headers_has_required_fields() {
        let headers = preamble_headers("https://a.example");
        assert_eq!(
            headers.get(hyper::header::CONTENT_TYPE).unwrap(),
            EVENT_STREAM_CONTENT_TYPE
        );
        assert_eq!(
            headers.get(hyper::header::CACHE_CONTROL).unwrap(),
            "no-cache"
        );
        assert_eq!(
            headers
                .get("access-control-allow-origin")
                .unwrap()
                .to_str()
                .unwrap(),
            "https://a.example"
        );
    }
}
