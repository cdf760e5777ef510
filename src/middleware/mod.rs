//! Middleware layer.
//!
//! Two kinds of stages live here.
//!
//! The **edge** stages run for every request the server accepts, wrapped
//! around the whole chain by [`Observer`]:
//!
//! ```text
//! request ─▶ request_id ─▶ recorder ─▶ recover ─▶ [ chain ] ─▶ handler
//!                                                     │
//!          access_log  ◀──────── status, bytes, duration
//! ```
//!
//! The **chain** stages implement [`Middleware`] and are registered on the
//! router with [`Router::layer`](crate::Router::layer): [`RateLimit`],
//! [`NoCache`] and [`RoleGate`], plus anything an application writes itself.

pub mod access_log;
pub mod client_ip;
pub mod no_cache;
pub mod observe;
pub mod rate_limit;
pub mod reaper;
pub mod recorder;
pub mod recover;
pub mod request_id;
pub mod role;

use std::sync::Arc;

use crate::handler::BoxFuture;
use crate::request::Request;
use crate::router::Routes;

pub use access_log::{LogLevel, LogPolicy, Sampler, ThreadRngSampler};
pub use no_cache::NoCache;
pub use observe::Observer;
pub use rate_limit::{RateLimit, RateLimiter, RouteClasses, TokenBucket, VisitorRegistry};
pub use reaper::Reaper;
pub use recorder::{Connection, Flush, Hijack, Push, ResponseRecord, ResponseRecorder, ResponseWriter};
pub use request_id::RequestId;
pub use role::{CharacterId, RoleGate, RoleLookup};

/// A link in the request chain.
///
/// Call `next.run(req)` to continue, or return a response without calling it
/// to short-circuit (a 429, a 401).
///
/// ```rust
/// use liner::middleware::{Middleware, Next};
/// use liner::{BoxFuture, Request};
///
/// struct Hello;
///
/// impl Middleware for Hello {
///     fn handle(&self, req: Request, next: Next) -> BoxFuture {
///         Box::pin(async move {
///             let mut res = next.run(req).await;
///             res.headers_mut().insert("x-hello", "world".parse().unwrap());
///             res
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, req: Request, next: Next) -> BoxFuture;
}

/// The remainder of the chain after the current middleware.
pub struct Next {
    layers: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    routes: Arc<Routes>,
}

impl Next {
    pub(crate) fn new(layers: Arc<[Arc<dyn Middleware>]>, routes: Arc<Routes>) -> Self {
        Self { layers, index: 0, routes }
    }

    /// Hands `req` to the next layer, or to the routed handler after the last one.
    pub fn run(self, req: Request) -> BoxFuture {
        match self.layers.get(self.index).cloned() {
            Some(layer) => {
                let next = Next { index: self.index + 1, ..self };
                layer.handle(req, next)
            }
            None => self.routes.call(req),
        }
    }
}
