//! End-to-end timing of request dispatch.
//!
//! A timer is a tree: the root records the whole request, contributors
//! record logical stages, and service calls record individual upstream
//! invocations under a contributor. Service calls may be started and ended
//! from parallel tasks; each node records its own duration independently
//! and parents never cascade stop to children.
use std::{
    error::Error,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant, SystemTime},
};

use serde::Serialize;

#[derive(Debug)]
struct Span {
    start_wall: SystemTime,
    start: Instant,
    end_wall: Option<SystemTime>,
    duration: Duration,
    error: String,
}

impl Span {
    fn open() -> Self {
        Self {
            start_wall: SystemTime::now(),
            start: Instant::now(),
            end_wall: None,
            duration: Duration::ZERO,
            error: String::new(),
        }
    }

    fn close(&mut self, err: Option<&dyn Error>) {
        self.end_wall = Some(SystemTime::now());
        self.duration = self.start.elapsed();
        if let Some(err) = err {
            self.error = err.to_string();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Root of one request's timing tree.
pub struct EndToEndTimer {
    name: String,
    tracking: String,
    span: Mutex<Span>,
    contributors: Mutex<Vec<Arc<Contributor>>>,
}

/// A named span recording one logical stage of the request.
pub struct Contributor {
    name: String,
    span: Mutex<Span>,
    service_calls: Mutex<Vec<Arc<ServiceCall>>>,
}

/// A named sub-span recording one upstream invocation.
pub struct ServiceCall {
    name: String,
    endpoint: String,
    span: Mutex<Span>,
}

impl EndToEndTimer {
    /// Start a new timer. `tracking` is a fresh correlation id.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tracking: uuid::Uuid::new_v4().to_string(),
            span: Mutex::new(Span::open()),
            contributors: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The correlation id assigned at construction.
    pub fn tracking(&self) -> &str {
        &self.tracking
    }

    /// Append a contributor starting now. The returned handle may be shared
    /// across tasks.
    pub fn start_contributor(&self, name: &str) -> Arc<Contributor> {
        let contributor = Arc::new(Contributor {
            name: name.to_string(),
            span: Mutex::new(Span::open()),
            service_calls: Mutex::new(Vec::new()),
        });
        lock(&self.contributors).push(contributor.clone());
        contributor
    }

    /// Stop the root span, recording its duration and error.
    pub fn stop(&self, err: Option<&dyn Error>) {
        lock(&self.span).close(err);
    }

    /// The root span's recorded duration (zero until stopped).
    pub fn duration(&self) -> Duration {
        lock(&self.span).duration
    }

    /// The root span's recorded error message (empty when none).
    pub fn error(&self) -> String {
        lock(&self.span).error.clone()
    }

    /// Error messages of every contributor that recorded one.
    pub fn contributor_errors(&self) -> Vec<String> {
        lock(&self.contributors)
            .iter()
            .filter_map(|c| {
                let error = lock(&c.span).error.clone();
                (!error.is_empty()).then_some(error)
            })
            .collect()
    }

    /// True iff the root recorded no error and no contributor did either.
    pub fn error_free(&self) -> bool {
        lock(&self.span).error.is_empty() && self.contributor_errors().is_empty()
    }

    /// Deterministic JSON rendering: fixed key order, contributors and
    /// service calls in insertion order, durations in integer nanoseconds.
    pub fn to_json_string(&self) -> String {
        let contributors: Vec<ContributorJson> = lock(&self.contributors)
            .iter()
            .map(|c| c.to_json())
            .collect();

        let root = lock(&self.span);
        let json = TimerJson {
            name: &self.name,
            tracking: &self.tracking,
            start: format_wall(root.start_wall),
            end: root.end_wall.map(format_wall),
            duration: root.duration.as_nanos() as u64,
            error_free: root.error.is_empty() && contributors.iter().all(|c| c.error.is_empty()),
            error: root.error.clone(),
            contributors,
        };
        drop(root);

        serde_json::to_string(&json).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to serialize timer");
            String::from("{}")
        })
    }
}

impl Contributor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a service call starting now. Safe to call from parallel tasks.
    pub fn start_service_call(&self, name: &str, endpoint: &str) -> Arc<ServiceCall> {
        let call = Arc::new(ServiceCall {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            span: Mutex::new(Span::open()),
        });
        lock(&self.service_calls).push(call.clone());
        call
    }

    /// End this contributor. Child service calls are unaffected; they record
    /// their own durations whenever they end.
    pub fn end(&self, err: Option<&dyn Error>) {
        lock(&self.span).close(err);
    }

    pub fn duration(&self) -> Duration {
        lock(&self.span).duration
    }

    pub fn error(&self) -> String {
        lock(&self.span).error.clone()
    }

    /// Number of service calls recorded so far.
    pub fn service_call_count(&self) -> usize {
        lock(&self.service_calls).len()
    }

    /// Durations of the recorded service calls, in insertion order.
    pub fn service_call_durations(&self) -> Vec<Duration> {
        lock(&self.service_calls)
            .iter()
            .map(|call| lock(&call.span).duration)
            .collect()
    }

    fn to_json(&self) -> ContributorJson {
        let service_calls = lock(&self.service_calls)
            .iter()
            .map(|call| {
                let span = lock(&call.span);
                ServiceCallJson {
                    name: call.name.clone(),
                    endpoint: call.endpoint.clone(),
                    start: format_wall(span.start_wall),
                    end: span.end_wall.map(format_wall),
                    duration: span.duration.as_nanos() as u64,
                    error: span.error.clone(),
                }
            })
            .collect();

        let span = lock(&self.span);
        ContributorJson {
            name: self.name.clone(),
            start: format_wall(span.start_wall),
            end: span.end_wall.map(format_wall),
            duration: span.duration.as_nanos() as u64,
            error: span.error.clone(),
            service_calls,
        }
    }
}

impl ServiceCall {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// End this service call, recording its duration and error.
    pub fn end(&self, err: Option<&dyn Error>) {
        lock(&self.span).close(err);
    }

    pub fn duration(&self) -> Duration {
        lock(&self.span).duration
    }

    pub fn error(&self) -> String {
        lock(&self.span).error.clone()
    }
}

fn format_wall(t: SystemTime) -> String {
    humantime::format_rfc3339_nanos(t).to_string()
}

#[derive(Serialize)]
struct TimerJson<'a> {
    name: &'a str,
    tracking: &'a str,
    start: String,
    end: Option<String>,
    duration: u64,
    #[serde(rename = "errorFree")]
    error_free: bool,
    error: String,
    contributors: Vec<ContributorJson>,
}

#[derive(Serialize)]
struct ContributorJson {
    name: String,
    start: String,
    end: Option<String>,
    duration: u64,
    error: String,
    #[serde(rename = "serviceCalls")]
    service_calls: Vec<ServiceCallJson>,
}

#[derive(Serialize)]
struct ServiceCallJson {
    name: String,
    endpoint: String,
    start: String,
    end: Option<String>,
    duration: u64,
    error: String,
}
