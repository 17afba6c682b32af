use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Sleeper, TransportError};

pub(crate) type Scripted = Result<HttpResponse, TransportError>;

/// Replays canned results in order and records every request it sees.
/// Once the script runs dry it repeats `fallback`, or fails loudly if there is none.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    fallback: Option<Scripted>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new(script: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn always(result: Scripted) -> Self {
        Self {
            fallback: Some(result),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpTransport for ScriptedTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        match &self.fallback {
            Some(result) => result.clone(),
            None => Err(TransportError::Request {
                url: request.url.clone(),
                message: "scripted transport exhausted".to_string(),
            }),
        }
    }
}

pub(crate) fn json_response(status: u16, payload: Value) -> HttpResponse {
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    HttpResponse {
        status,
        headers,
        body: serde_json::to_vec(&payload).unwrap(),
        final_url: "https://api.example.com/api/v1?path=generate".to_string(),
        body_truncated: false,
    }
}

pub(crate) fn bytes_response(
    status: u16,
    content_type: Option<&str>,
    body: &[u8],
    final_url: &str,
) -> HttpResponse {
    let mut headers = BTreeMap::new();
    if let Some(content_type) = content_type {
        headers.insert("content-type".to_string(), content_type.to_string());
    }
    HttpResponse {
        status,
        headers,
        body: body.to_vec(),
        final_url: final_url.to_string(),
        body_truncated: false,
    }
}

pub(crate) fn recording_sleeper() -> (Sleeper, Arc<Mutex<Vec<Duration>>>) {
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let sink = recorded.clone();
    let sleeper: Sleeper = Arc::new(move |delay: Duration| sink.lock().unwrap().push(delay));
    (sleeper, recorded)
}

pub(crate) const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDRfake";
