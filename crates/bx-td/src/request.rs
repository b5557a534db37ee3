//! Request parameters and the signed-request builder.

use std::collections::BTreeMap;

use crate::auth::{self, Credentials};

/// HTTP verbs used by the REST API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request parameters: string keys, scalar values rendered as strings, and
/// explicit nils that are dropped before signing and transmission.
///
/// Keys are kept sorted, so iteration order is the canonical signing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params(BTreeMap<String, Option<String>>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    /// Builder-style insert of an optional value; `None` is recorded as nil.
    pub fn with_opt<V: ToString>(mut self, key: &str, value: Option<V>) -> Self {
        self.0.insert(key.to_string(), value.map(|v| v.to_string()));
        self
    }

    pub fn insert(&mut self, key: &str, value: impl ToString) {
        self.0.insert(key.to_string(), Some(value.to_string()));
    }

    /// Value of a present (non-nil) parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_deref())
    }

    /// Non-nil pairs in key order.
    pub fn present(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .filter_map(|(k, v)| v.as_deref().map(|v| (k.as_str(), v)))
    }

    pub fn is_empty(&self) -> bool {
        self.present().next().is_none()
    }
}

/// A fully built request, ready for a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Path below the base URL, e.g. `/openApi/swap/v2/trade/order`.
    pub path: String,
    /// URL-encoded query string without the leading `?` (may be empty).
    pub query: String,
    /// API key header value; `None` for public endpoints.
    pub api_key: Option<String>,
}

impl HttpRequest {
    /// Full URL for `base_url`.
    pub fn url(&self, base_url: &str) -> String {
        if self.query.is_empty() {
            format!("{base_url}{}", self.path)
        } else {
            format!("{base_url}{}?{}", self.path, self.query)
        }
    }
}

/// A logical API call before signing.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub method: HttpMethod,
    pub path: String,
    pub params: Params,
    pub signed: bool,
}

impl SignedRequest {
    pub fn new(method: HttpMethod, path: &str, params: Params, signed: bool) -> Self {
        Self {
            method,
            path: path.to_string(),
            params,
            signed,
        }
    }

    /// Produce the wire request.
    ///
    /// Signed requests get `timestamp` added, then `signature` computed over
    /// the canonical query and appended last. Every verb carries its
    /// parameters in the URL; POST bodies stay empty.
    pub fn build(&self, credentials: &Credentials, timestamp_ms: u64) -> HttpRequest {
        if !self.signed {
            return HttpRequest {
                method: self.method,
                path: self.path.clone(),
                query: auth::encoded_query(&self.params),
                api_key: None,
            };
        }

        let params = self.params.clone().with("timestamp", timestamp_ms);
        let signature = credentials.sign(&params);
        let encoded = auth::encoded_query(&params);
        HttpRequest {
            method: self.method,
            path: self.path.clone(),
            query: format!("{encoded}&signature={signature}"),
            api_key: Some(credentials.api_key().to_string()),
        }
    }
}
