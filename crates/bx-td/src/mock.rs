//! Scripted in-memory [`Transport`] for tests.
//!
//! Replies are registered per `(method, path)` route, optionally narrowed to
//! requests whose parameter `key` equals `value` (e.g. `type=STOP_MARKET`).
//! Queued replies are consumed in order; a route's `always` reply answers once
//! its queue is empty. Every request is recorded with its decoded parameters.
//!
//! ```ignore
//! let mock = Arc::new(MockTransport::new());
//! mock.push_when(HttpMethod::Post, ORDER, "type", "STOP_MARKET", MockReply::exchange(-1001, "busy"));
//! mock.always(HttpMethod::Post, ORDER, MockReply::data(json!({"order": {"orderId": 1}})));
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bx_core::error::{BxError, BxResult};
use serde_json::json;

use crate::request::{HttpMethod, HttpRequest};
use crate::transport::Transport;

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Success envelope around this `data`.
    Data(serde_json::Value),
    /// Error envelope with this code and message.
    Exchange { code: i64, msg: String },
    /// Transport-level failure.
    Network(String),
    /// Body returned verbatim.
    Raw(serde_json::Value),
    /// Panics inside `send`, as a bug in the caller's stack would.
    Panic(String),
}

impl MockReply {
    pub fn data(data: serde_json::Value) -> Self {
        Self::Data(data)
    }

    pub fn exchange(code: i64, msg: &str) -> Self {
        Self::Exchange { code, msg: msg.to_string() }
    }

    pub fn network(msg: &str) -> Self {
        Self::Network(msg.to_string())
    }

    pub fn panic(msg: &str) -> Self {
        Self::Panic(msg.to_string())
    }

    fn render(&self) -> BxResult<serde_json::Value> {
        match self {
            Self::Data(data) => Ok(json!({"code": 0, "msg": "", "data": data})),
            Self::Exchange { code, msg } => Ok(json!({"code": code, "msg": msg})),
            Self::Network(msg) => Err(BxError::Network(msg.clone())),
            Self::Raw(body) => Ok(body.clone()),
            Self::Panic(msg) => panic!("{msg}"),
        }
    }
}

/// A request as the mock saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: HttpMethod,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub api_key: Option<String>,
}

impl RecordedCall {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    fn matches(&self, method: HttpMethod, path: &str, when: Option<(&str, &str)>) -> bool {
        self.method == method
            && self.path == path
            && when.is_none_or(|(k, v)| self.param(k) == Some(v))
    }
}

struct Rule {
    method: HttpMethod,
    path: String,
    when: Option<(String, String)>,
    queue: VecDeque<MockReply>,
    fallback: Option<MockReply>,
}

impl Rule {
    fn accepts(&self, call: &RecordedCall) -> bool {
        call.matches(
            self.method,
            &self.path,
            self.when.as_ref().map(|(k, v)| (k.as_str(), v.as_str())),
        )
    }

    fn next_reply(&mut self) -> Option<MockReply> {
        self.queue.pop_front().or_else(|| self.fallback.clone())
    }
}

#[derive(Default)]
pub struct MockTransport {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot reply for `method path`.
    pub fn push(&self, method: HttpMethod, path: &str, reply: MockReply) {
        self.rule_mut(method, path, None, |r| r.queue.push_back(reply));
    }

    /// Queue a one-shot reply for requests where `key == value`.
    pub fn push_when(&self, method: HttpMethod, path: &str, key: &str, value: &str, reply: MockReply) {
        self.rule_mut(method, path, Some((key, value)), |r| r.queue.push_back(reply));
    }

    /// Reply used whenever the route's queue is empty.
    pub fn always(&self, method: HttpMethod, path: &str, reply: MockReply) {
        self.rule_mut(method, path, None, |r| r.fallback = Some(reply));
    }

    /// Conditional variant of [`always`](Self::always).
    pub fn always_when(&self, method: HttpMethod, path: &str, key: &str, value: &str, reply: MockReply) {
        self.rule_mut(method, path, Some((key, value)), |r| r.fallback = Some(reply));
    }

    /// Every request received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Requests to `method path`.
    pub fn calls_to(&self, method: HttpMethod, path: &str) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.matches(method, path, None))
            .collect()
    }

    pub fn count(&self, method: HttpMethod, path: &str) -> usize {
        self.calls_to(method, path).len()
    }

    /// Requests to `method path` where `key == value`.
    pub fn count_when(&self, method: HttpMethod, path: &str, key: &str, value: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.matches(method, path, Some((key, value))))
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn rule_mut(
        &self,
        method: HttpMethod,
        path: &str,
        when: Option<(&str, &str)>,
        f: impl FnOnce(&mut Rule),
    ) {
        let when = when.map(|(k, v)| (k.to_string(), v.to_string()));
        let mut rules = lock(&self.rules);
        let idx = match rules
            .iter()
            .position(|r| r.method == method && r.path == path && r.when == when)
        {
            Some(idx) => idx,
            None => {
                rules.push(Rule {
                    method,
                    path: path.to_string(),
                    when,
                    queue: VecDeque::new(),
                    fallback: None,
                });
                rules.len() - 1
            }
        };
        f(&mut rules[idx]);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &HttpRequest) -> BxResult<serde_json::Value> {
        if self.is_closed() {
            return Err(BxError::Closed);
        }
        let call = RecordedCall {
            method: request.method,
            path: request.path.clone(),
            params: decode_query(&request.query),
            api_key: request.api_key.clone(),
        };
        lock(&self.calls).push(call.clone());

        // Conditional rules take precedence over catch-all ones.
        let mut rules = lock(&self.rules);
        let mut order: Vec<usize> = (0..rules.len()).collect();
        order.sort_by_key(|&i| rules[i].when.is_none());
        let reply = order.into_iter().find_map(|i| {
            let rule = &mut rules[i];
            if rule.accepts(&call) { rule.next_reply() } else { None }
        });
        drop(rules);
        if let Some(reply) = reply {
            return reply.render();
        }
        Err(BxError::Internal(format!(
            "no mock reply for {} {} {:?}",
            call.method, call.path, call.params
        )))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

fn decode_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            let decode = |s: &str| {
                urlencoding::decode(s)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| s.to_string())
            };
            (decode(k), decode(v))
        })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
