//! Shared fixtures for dispatcher integration tests: wiremock responders that
//! capture, fail, or delay requests, plus report collection helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ajo_webhooks::{DeliveryReport, Dispatcher, DispatcherConfig, EventData, RetryPolicy};
use tokio::sync::broadcast;
use wiremock::{Request, Respond, ResponseTemplate};

pub const SECRET_A: &str = "whsec_endpoint_a_12345";
pub const SECRET_B: &str = "whsec_endpoint_b_67890";

/// Small delays so retry tests finish quickly.
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, 10)
}

pub fn dispatcher() -> Dispatcher {
    Dispatcher::new(DispatcherConfig::default()).expect("dispatcher")
}

pub fn dispatcher_with_timeout(timeout: Duration) -> Dispatcher {
    Dispatcher::new(DispatcherConfig::default().with_request_timeout(timeout)).expect("dispatcher")
}

/// Turn a `json!({...})` object into envelope data.
pub fn data(value: serde_json::Value) -> EventData {
    value.as_object().cloned().expect("event data must be a JSON object")
}

/// Receive `n` reports or panic after a generous timeout.
pub async fn collect_reports(rx: &mut broadcast::Receiver<DeliveryReport>, n: usize) -> Vec<DeliveryReport> {
    let mut reports = Vec::with_capacity(n);
    while reports.len() < n {
        let report = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for delivery report")
            .expect("report channel closed");
        reports.push(report);
    }
    reports
}

// ---------------------------------------------------------------------------
// CapturedRequest
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl CapturedRequest {
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

fn capture(request: &Request) -> CapturedRequest {
    CapturedRequest {
        body: request.body.clone(),
        headers: request
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - records requests and answers with a fixed status
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
    delay: Option<Duration>,
}

impl CaptureResponder {
    pub fn new() -> Self {
        Self::with_status(200)
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
            delay: None,
        }
    }

    /// Respond after `delay` (200 OK).
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.requests.lock().unwrap().push(capture(request));
        let response = ResponseTemplate::new(self.response_code);
        match self.delay {
            Some(delay) => response.set_delay(delay),
            None => response,
        }
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
}

impl FailingResponder {
    /// Fail `n` times with 500, then return 200.
    pub fn fail_times(n: u32) -> Self {
        Self::fail_with_status(n, 500)
    }

    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
        }
    }

    /// Never succeeds.
    pub fn always(failure_code: u16) -> Self {
        Self::fail_with_status(u32::MAX, failure_code)
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(200)
        }
    }
}
