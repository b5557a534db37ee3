//! Authentication and request signing.
//!
//! Signed requests carry the API key in the `X-BX-APIKEY` header and a
//! `signature` parameter: the lowercase hex HMAC-SHA256 of the canonical query
//! string, keyed with the API secret. The canonical query string is every
//! non-nil parameter (including `timestamp`) sorted by key and joined as
//! `k=v` pairs with `&`. The secret itself is never transmitted.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::request::Params;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the API key on every signed request.
pub const API_KEY_HEADER: &str = "X-BX-APIKEY";

/// API key + secret, immutable for the life of the client.
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    secret_key: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Sign `params` with this secret.
    pub fn sign(&self, params: &Params) -> String {
        sign_params(&self.secret_key, params)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Compute an HMAC-SHA256 signature and return it as a lowercase hex string.
///
/// # Example
///
/// ```ignore
/// let sig = hmac_sha256_sign("my_secret", "symbol=BTC-USDT&timestamp=1234567890");
/// assert_eq!(sig.len(), 64); // 32 bytes → 64 hex chars
/// ```
pub fn hmac_sha256_sign(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Build the canonical (unencoded) query string that gets signed.
///
/// Nil parameters are dropped and keys come out sorted, so the result does
/// not depend on insertion order.
pub fn canonical_query(params: &Params) -> String {
    params
        .present()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build the URL-encoded query string actually transmitted. Same pairs and
/// order as [`canonical_query`].
pub fn encoded_query(params: &Params) -> String {
    params
        .present()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Signature over the canonical query string of `params`.
pub fn sign_params(secret: &str, params: &Params) -> String {
    hmac_sha256_sign(secret, &canonical_query(params))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_sha256_known_vector() {
        // RFC 4231 test case 2.
        let sig = hmac_sha256_sign("Jefe", "what do ya want for nothing?");
        assert_eq!(
            sig,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn canonical_query_sorts_and_drops_nil() {
        let params = Params::new()
            .with("symbol", "BTC-USDT")
            .with_opt::<f64>("price", None)
            .with("quantity", 0.5)
            .with("timestamp", 1_700_000_000_000u64);
        assert_eq!(
            canonical_query(&params),
            "quantity=0.5&symbol=BTC-USDT&timestamp=1700000000000"
        );
    }

    #[test]
    fn signature_is_deterministic() {
        let params = Params::new().with("symbol", "ETH-USDT").with("timestamp", 42u64);
        let a = sign_params("secret", &params);
        let b = sign_params("secret", &params);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn signature_ignores_insertion_order() {
        let pairs = [
            ("symbol", "BTC-USDT"),
            ("side", "BUY"),
            ("positionSide", "LONG"),
            ("type", "MARKET"),
            ("quantity", "0.01"),
            ("timestamp", "1700000000000"),
        ];
        let forward = pairs.iter().fold(Params::new(), |p, (k, v)| p.with(k, v));
        let backward = pairs.iter().rev().fold(Params::new(), |p, (k, v)| p.with(k, v));
        // Rotations as well, not only the reverse.
        for shift in 0..pairs.len() {
            let mut rotated = pairs.to_vec();
            rotated.rotate_left(shift);
            let p = rotated.iter().fold(Params::new(), |p, (k, v)| p.with(k, v));
            assert_eq!(sign_params("s3cr3t", &p), sign_params("s3cr3t", &forward));
        }
        assert_eq!(sign_params("s3cr3t", &forward), sign_params("s3cr3t", &backward));
    }

    #[test]
    fn nil_parameters_do_not_change_signature() {
        let base = Params::new().with("symbol", "BTC-USDT").with("timestamp", 1u64);
        let with_nil = base.clone().with_opt::<&str>("clientOrderID", None);
        assert_eq!(sign_params("k", &base), sign_params("k", &with_nil));
    }

    #[test]
    fn different_secret_changes_signature() {
        let params = Params::new().with("symbol", "BTC-USDT");
        assert_ne!(sign_params("a", &params), sign_params("b", &params));
    }

    #[test]
    fn encoded_query_escapes_json_values() {
        let params = Params::new().with("stopLoss", r#"{"type":"STOP_MARKET"}"#);
        assert_eq!(
            encoded_query(&params),
            "stopLoss=%7B%22type%22%3A%22STOP_MARKET%22%7D"
        );
    }

    #[test]
    fn debug_redacts_secret() {
        let creds = Credentials::new("key", "very-secret");
        let dbg = format!("{creds:?}");
        assert!(dbg.contains("key"));
        assert!(!dbg.contains("very-secret"));
    }
}
