//! # liner
//!
//! A small HTTP service framework with the request pipeline a public web app
//! needs in front of its handlers:
//!
//! - **Correlation ids**: every request gets an `X-Request-ID`, either the
//!   one the client sent or a fresh 128-bit hex id, echoed on the response.
//! - **Access log**: one structured JSON record per request, at a level
//!   derived from status and latency, with static-asset noise skipped or
//!   sampled and healthy 2xx traffic optionally sampled.
//! - **Panic recovery**: a panicking handler costs one `500`, never the
//!   process.
//! - **Per-client rate limiting** for write requests, keyed by client IP and
//!   route class, with idle clients reaped in the background.
//!
//! Routing is a radix tree per method via [`matchit`]; hyper carries HTTP/1.1
//! and HTTP/2; shutdown on SIGTERM / Ctrl-C drains in-flight requests.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use liner::middleware::{NoCache, RateLimiter};
//! use liner::{Config, Request, Response, Router, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), liner::Error> {
//!     let config = Config::from_env();
//!     liner::telemetry::init(&config.log)?;
//!
//!     let mut limiter = RateLimiter::new(config.rate_limit.clone());
//!     limiter.start_reaper();
//!
//!     let app = Router::new()
//!         .layer(NoCache)
//!         .layer(limiter.layer())
//!         .get("/app/routes/{id}", get_route)
//!         .post("/app/routes", create_route);
//!
//!     Server::bind(([0, 0, 0, 0], config.port))
//!         .observer(liner::middleware::Observer::new(config.log))
//!         .serve(app)
//!         .await?;
//!
//!     limiter.shutdown().await;
//!     Ok(())
//! }
//!
//! async fn get_route(req: Request) -> Response {
//!     let id = req.param("id").unwrap_or("unknown");
//!     Response::json(format!(r#"{{"id":"{id}"}}"#))
//! }
//!
//! async fn create_route(req: Request) -> Response {
//!     if req.body().is_empty() {
//!         return Response::status(StatusCode::BAD_REQUEST);
//!     }
//!     Response::builder()
//!         .status(StatusCode::CREATED)
//!         .header("location", "/app/routes/99")
//!         .no_body()
//! }
//! ```

pub mod config;
mod error;
mod handler;
pub mod middleware;
mod request;
mod response;
mod router;
mod server;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::Error;
pub use handler::{BoxFuture, Handler};
pub use http::{Method, StatusCode};
pub use request::Request;
pub use response::{BufferedWriter, IntoResponse, Response, ResponseBuilder};
pub use router::{Chain, Router};
pub use server::Server;
