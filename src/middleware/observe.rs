//! The edge of the pipeline: correlation id, response recording, panic
//! recovery and the access log, wrapped around whatever handles the request.
//!
//! For one request the order is fixed: the id is assigned before anything is
//! recorded, and the access-log decision reads the final record.

use std::future::Future;
use std::time::Instant;

use http::HeaderValue;
use tracing::{debug, field};

use crate::config::LogConfig;
use crate::middleware::access_log::{LogPolicy, RequestMeta, sanitize_headers};
use crate::middleware::recorder::{ResponseRecord, ResponseRecorder, ResponseWriter};
use crate::middleware::recover::{self, Fault};
use crate::middleware::request_id::{REQUEST_ID_HEADER, RequestId};
use crate::request::Request;
use crate::response::Response;

/// What happened to one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub request_id: RequestId,
    pub record: ResponseRecord,
    pub fault: Option<Fault>,
}

pub struct Observer {
    policy: LogPolicy,
}

impl Observer {
    pub fn new(config: LogConfig) -> Self {
        Self { policy: LogPolicy::new(config) }
    }

    pub fn with_policy(policy: LogPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &LogPolicy {
        &self.policy
    }

    /// Runs one request through `next`, writing the response into `writer`.
    ///
    /// Never panics because `next` did. If the returned future is dropped
    /// before completion (client went away), the access-log decision still
    /// runs with whatever was recorded, flagged `cancelled`.
    pub async fn run<W, F, Fut>(&self, mut req: Request, writer: W, next: F) -> Completion
    where
        W: ResponseWriter,
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let started = Instant::now();
        let id = RequestId::resolve(req.headers());
        req.extensions_mut().insert(id.clone());

        let config = self.policy.config();
        let meta = RequestMeta::capture(&req, id.clone(), config.max_ua_ref_len);
        let headers = config.log_headers.then(|| sanitize_headers(req.headers()));
        debug!(
            ts_ms = meta.unix_millis(),
            req.id = %meta.id,
            req.method = %meta.method,
            req.path = %meta.path,
            req.ip = %meta.client_ip,
            req.headers = headers.as_ref().map(field::debug),
            "request started"
        );

        let mut rec = ResponseRecorder::new(writer);
        if let Ok(value) = HeaderValue::from_str(id.as_str()) {
            rec.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        let mut pending = Pending { policy: &self.policy, meta: &meta, started, rec, done: false };
        let fault = recover::guard(&mut pending.rec, &meta, started, req, next).await.err();
        let record = pending.finish();

        Completion { request_id: id, record, fault }
    }
}

/// Emits the access-log record exactly once: on [`finish`](Pending::finish),
/// or on drop if the request was abandoned midway.
struct Pending<'a, W: ResponseWriter> {
    policy: &'a LogPolicy,
    meta: &'a RequestMeta,
    started: Instant,
    rec: ResponseRecorder<W>,
    done: bool,
}

impl<W: ResponseWriter> Pending<'_, W> {
    fn finish(mut self) -> ResponseRecord {
        self.log(false);
        self.done = true;
        self.rec.record()
    }

    fn log(&self, cancelled: bool) {
        let record = self.rec.record();
        if let Some(mut event) = self.policy.evaluate(self.meta, record, self.started.elapsed()) {
            event.cancelled = cancelled;
            event.emit();
        }
    }
}

impl<W: ResponseWriter> Drop for Pending<'_, W> {
    fn drop(&mut self) {
        if !self.done {
            self.log(true);
        }
    }
}
