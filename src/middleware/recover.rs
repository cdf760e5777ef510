//! Panic recovery.
//!
//! A panicking handler must cost one request, never the process. The guard
//! calls into the downstream chain and polls the future it returns inside one
//! `catch_unwind` scope, so panics in synchronous middleware or handler code
//! are caught as well as panics across `.await`s. On a panic it answers `500`
//! (if the status line is still unsent), logs the payload at Error and
//! returns normally.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures_util::FutureExt;
use http::StatusCode;
use tracing::{error, warn};

use crate::middleware::access_log::{RequestMeta, duration_ms};
use crate::middleware::recorder::{ResponseRecorder, ResponseWriter};
use crate::request::Request;
use crate::response::Response;

/// A panic caught by [`guard`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub message: String,
}

/// Runs `next(req)` to completion and writes its response into `rec`,
/// converting a panic into a `500` and an Error-level `"panic recovered"`
/// record.
pub async fn guard<W, F, Fut>(
    rec: &mut ResponseRecorder<W>,
    meta: &RequestMeta,
    started: Instant,
    req: Request,
    next: F,
) -> Result<(), Fault>
where
    W: ResponseWriter,
    F: FnOnce(Request) -> Fut,
    Fut: Future<Output = Response>,
{
    let downstream = async move { next(req).await };
    match AssertUnwindSafe(downstream).catch_unwind().await {
        Ok(res) => {
            if let Err(e) = res.write_to(rec) {
                warn!(req.id = %meta.id, "response write failed: {e}");
            }
            Ok(())
        }
        Err(payload) => {
            let fault = Fault { message: panic_message(&*payload) };
            if rec.wrote_header() {
                warn!(
                    req.id = %meta.id,
                    res.status = rec.record().status.as_u16(),
                    "panic after the status was sent; leaving it unchanged"
                );
            } else {
                rec.write_header(StatusCode::INTERNAL_SERVER_ERROR);
            }
            error!(
                req.id = %meta.id,
                req.method = %meta.method,
                req.path = %meta.path,
                error = %fault.message,
                duration_ms = duration_ms(started.elapsed()),
                "panic recovered"
            );
            Err(fault)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::recorder::tests::FullWriter;
    use crate::middleware::request_id::RequestId;
    use crate::test_support::{Captured, capture};

    fn post() -> Request {
        http::Request::post("/app/routes").body(bytes::Bytes::new()).unwrap().into()
    }

    fn meta() -> RequestMeta {
        RequestMeta::capture(&post(), RequestId::generate(), 120)
    }

    async fn explode(msg: &'static str) -> Response {
        panic!("{}", String::from(msg))
    }

    /// Panics while building the future, before anything is polled.
    fn explode_now(req: Request) -> std::future::Ready<Response> {
        let id: u32 = req.param("id").unwrap_or("abc").parse().expect("numeric id");
        std::future::ready(Response::text(id.to_string()))
    }

    #[tokio::test]
    async fn normal_response_is_written() {
        let mut rec = ResponseRecorder::new(FullWriter::default());
        let out = guard(&mut rec, &meta(), Instant::now(), post(), |_| async {
            Response::builder().status(StatusCode::CREATED).text("made")
        })
        .await;

        assert_eq!(out, Ok(()));
        assert_eq!(rec.record().status, StatusCode::CREATED);
        assert_eq!(rec.record().bytes, 4);
        assert_eq!(rec.into_inner().flushes, 1);
    }

    #[tokio::test]
    async fn panic_becomes_500_and_one_error_record() {
        let (events, _guard) = capture();
        let mut rec = ResponseRecorder::new(FullWriter::default());

        let out = guard(&mut rec, &meta(), Instant::now(), post(), |_| explode("route table exploded")).await;

        assert_eq!(out, Err(Fault { message: "route table exploded".into() }));
        assert_eq!(rec.record().status, StatusCode::INTERNAL_SERVER_ERROR);

        let errors: Vec<Captured> = events.take().into_iter()
            .filter(|e| e.level == tracing::Level::ERROR)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "panic recovered");
        assert_eq!(errors[0].fields["error"], "route table exploded");
        assert!(errors[0].fields["duration_ms"].parse::<u64>().is_ok());
    }

    #[tokio::test]
    async fn status_already_sent_is_left_alone() {
        let mut rec = ResponseRecorder::new(FullWriter::default());
        rec.write_header(StatusCode::ACCEPTED);

        let out = guard(&mut rec, &meta(), Instant::now(), post(), |_| explode("late failure")).await;

        assert_eq!(out.unwrap_err().message, "late failure");
        assert_eq!(rec.record().status, StatusCode::ACCEPTED);
        assert_eq!(rec.into_inner().statuses, [StatusCode::ACCEPTED]);
    }

    #[tokio::test]
    async fn synchronous_panic_is_caught_too() {
        let (events, _guard) = capture();
        let mut rec = ResponseRecorder::new(FullWriter::default());

        let out = guard(&mut rec, &meta(), Instant::now(), post(), explode_now).await;

        assert_eq!(out.unwrap_err().message, "numeric id: ParseIntError { kind: InvalidDigit }");
        assert_eq!(rec.record().status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(events.take().iter().any(|e| e.message == "panic recovered"));
    }
}
