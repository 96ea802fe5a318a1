//! Lets a target tell the load balancer "re-send this exact request to a
//! different target" via a response header, without the client seeing the
//! round trip. Requires a rewindable request body — a target that asks for
//! reproxy after the original body has already been consumed past recovery
//! gets a 500, not a silent retry on a truncated body.

use http::{HeaderValue, Response};

pub const REPROXY_HEADER: &str = "x-kamal-reproxy";
pub const REPROXY_LOCATION_HEADER: &str = "x-kamal-reproxy-location";

#[derive(Debug, Clone)]
pub struct ReproxyConfig {
    pub max_retries: u32,
}

impl Default for ReproxyConfig {
    fn default() -> Self {
        Self { max_retries: 5 }
    }
}

/// Marks an outbound request as reproxy-eligible so the receiving target
/// knows it's allowed to ask for a re-route.
pub fn mark_request<B>(req: &mut http::Request<B>) {
    req.headers_mut()
        .insert(REPROXY_HEADER, HeaderValue::from_static("true"));
}

/// Extracts the reproxy destination host from a response, if the target
/// asked for one. The header carries a full URL (e.g. `http://u2/`); this
/// parses it and returns its `host:port` authority — the form `Target::addr`
/// uses — rather than the raw header value.
pub fn reproxy_location<B>(resp: &Response<B>) -> Option<String> {
    let raw = resp
        .headers()
        .get(REPROXY_LOCATION_HEADER)
        .and_then(|v| v.to_str().ok())?;
    let uri: http::Uri = raw.parse().ok()?;
    uri.authority().map(|a| a.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Response;

    #[test]
    fn extracts_authority_from_url_header() {
        let resp = Response::builder()
            .header(REPROXY_LOCATION_HEADER, "http://10.0.0.5:3000/")
            .body(())
            .unwrap();
        assert_eq!(reproxy_location(&resp), Some("10.0.0.5:3000".to_string()));
    }

    #[test]
    fn extracts_authority_without_explicit_port() {
        let resp = Response::builder()
            .header(REPROXY_LOCATION_HEADER, "http://u2/")
            .body(())
            .unwrap();
        assert_eq!(reproxy_location(&resp), Some("u2".to_string()));
    }

    #[test]
    fn returns_none_without_header() {
        let resp = Response::builder().body(()).unwrap();
        assert_eq!(reproxy_location(&resp), None);
    }

    #[test]
    fn mark_request_sets_header() {
        let mut req = http::Request::builder().body(()).unwrap();
        mark_request(&mut req);
        assert_eq!(req.headers().get(REPROXY_HEADER).unwrap(), "true");
    }
}
