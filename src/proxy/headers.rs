//! Request header sanitization
//!
//! Strips hop-by-hop and proxy-specific headers before a request leaves the
//! proxy. These are meaningful only on the connection they arrived on and
//! must not be relayed to the next hop.

use hyper::header::{ACCEPT_ENCODING, CONNECTION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::Request;

/// Non-standard hop-by-hop header some clients send to proxies
const PROXY_CONNECTION: &str = "proxy-connection";

/// Remove headers that must not be forwarded to the origin.
///
/// `Accept-Encoding` is dropped so the outbound transport negotiates its own
/// encoding; the remaining four are single-hop headers. Idempotent: applying
/// this to an already-sanitized request changes nothing.
pub fn sanitize_request<B>(req: &mut Request<B>) {
    let headers = req.headers_mut();
    headers.remove(ACCEPT_ENCODING);
    headers.remove(PROXY_CONNECTION);
    headers.remove(PROXY_AUTHENTICATE);
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(CONNECTION);
}
