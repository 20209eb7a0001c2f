//! The shared-secret gate (§6/§7), shared by both the WebSocket admission
//! path and the four HTTP control-plane endpoints.
//!
//! A `SHARED_SECRET` unset in [`RelayConfig`](crate::config::RelayConfig)
//! disables the gate entirely (development only, per §6); this is expressed
//! as `Option<&SecretString>` rather than a bypass flag so "no secret
//! configured" and "secret configured" are the only two states a caller can
//! observe.

use axum::http::HeaderMap;
use secrecy::{ExposeSecret as _, SecretString};

const API_KEY_HEADER: &str = "x-api-key";
const SUBPROTOCOL_HEADER: &str = "sec-websocket-protocol";
const SUBPROTOCOL_TOKEN: &str = "x-api-key";

/// The outcome of checking a request's WebSocket upgrade headers against the
/// shared secret.
pub(crate) enum WsAuthOutcome {
    /// No secret is configured; the gate is disabled.
    Disabled,
    /// The `X-API-KEY` header matched.
    Header,
    /// The `x-api-key`/secret pair was found in `Sec-WebSocket-Protocol`; the
    /// contained string is the subprotocol the server must echo back on
    /// accept (§6: "the server echoes the first subprotocol on accept").
    Subprotocol(String),
    /// Neither header nor subprotocol presented a matching secret.
    Denied,
}

/// Checks a plain HTTP request's `X-API-KEY` header against the configured
/// secret. Used by the four control-plane endpoints (§6).
pub(crate) fn check_http(headers: &HeaderMap, shared_secret: Option<&SecretString>) -> bool {
    let Some(secret) = shared_secret else {
        return true;
    };
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| constant_time_eq(value, secret.expose_secret()))
}

/// Checks a WebSocket upgrade request against the configured secret, trying
/// the `X-API-KEY` header first and the `Sec-WebSocket-Protocol` subprotocol
/// list second (§6: browsers cannot set custom headers on a WS upgrade).
pub(crate) fn check_ws(headers: &HeaderMap, shared_secret: Option<&SecretString>) -> WsAuthOutcome {
    let Some(secret) = shared_secret else {
        return WsAuthOutcome::Disabled;
    };
    if headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| constant_time_eq(value, secret.expose_secret()))
    {
        return WsAuthOutcome::Header;
    }
    if let Some(protocols) = headers
        .get(SUBPROTOCOL_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        let tokens: Vec<&str> = protocols.split(',').map(str::trim).collect();
        for pair in tokens.windows(2) {
            if pair[0].eq_ignore_ascii_case(SUBPROTOCOL_TOKEN)
                && constant_time_eq(pair[1], secret.expose_secret())
                && let Some(first) = tokens.first()
            {
                return WsAuthOutcome::Subprotocol((*first).to_owned());
            }
        }
    }
    WsAuthOutcome::Denied
}

/// Constant-time string comparison so the shared-secret check does not leak
/// timing information about how many leading bytes matched.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        headers
    }

    #[test]
    fn disabled_when_no_secret_configured() {
        assert!(check_http(&HeaderMap::new(), None));
    }

    #[test]
    fn http_header_must_match() {
        let secret = SecretString::from("s3cr3t".to_owned());
        assert!(check_http(
            &header_map(&[("x-api-key", "s3cr3t")]),
            Some(&secret)
        ));
        assert!(!check_http(
            &header_map(&[("x-api-key", "wrong")]),
            Some(&secret)
        ));
        assert!(!check_http(&HeaderMap::new(), Some(&secret)));
    }

    #[test]
    fn ws_subprotocol_pair_is_accepted_and_echoes_first_token() {
        let secret = SecretString::from("s3cr3t".to_owned());
        let headers = header_map(&[("sec-websocket-protocol", "x-api-key, s3cr3t")]);
        match check_ws(&headers, Some(&secret)) {
            WsAuthOutcome::Subprotocol(echoed) => assert_eq!(echoed, "x-api-key"),
            _ => panic!("expected subprotocol match"),
        }
    }

    #[test]
    fn ws_denies_wrong_secret_in_subprotocol() {
        let secret = SecretString::from("s3cr3t".to_owned());
        let headers = header_map(&[("sec-websocket-protocol", "x-api-key, nope")]);
        assert!(matches!(check_ws(&headers, Some(&secret)), WsAuthOutcome::Denied));
    }
}
