//! Cache-suppression headers for dynamic responses.

use http::HeaderValue;
use http::header::{CACHE_CONTROL, EXPIRES, HeaderName, PRAGMA};

use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;

const HEADERS: [(HeaderName, &str); 3] = [
    (CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
    (PRAGMA, "no-cache"),
    (EXPIRES, "0"),
];

/// Marks responses as uncacheable. Headers the handler set itself win.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl Middleware for NoCache {
    fn handle(&self, req: Request, next: Next) -> BoxFuture {
        Box::pin(async move {
            let mut res = next.run(req).await;
            for (name, value) in HEADERS {
                res.headers_mut().entry(name).or_insert(HeaderValue::from_static(value));
            }
            res
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use crate::router::Router;

    fn get(path: &str) -> Request {
        http::Request::get(path).body(bytes::Bytes::new()).unwrap().into()
    }

    #[tokio::test]
    async fn adds_cache_headers() {
        let chain = Router::new()
            .layer(NoCache)
            .get("/app/routes", |_req: Request| async { Response::json("[]") })
            .into_chain();

        let res = chain.call(get("/app/routes")).await;
        assert_eq!(res.headers()[CACHE_CONTROL], "no-store, no-cache, must-revalidate");
        assert_eq!(res.headers()[PRAGMA], "no-cache");
        assert_eq!(res.headers()[EXPIRES], "0");
    }

    #[tokio::test]
    async fn handler_headers_are_kept() {
        let chain = Router::new()
            .layer(NoCache)
            .get("/assets/{*file}", |_req: Request| async {
                Response::builder().header("cache-control", "public, max-age=3600").text("css")
            })
            .into_chain();

        let res = chain.call(get("/assets/site.css")).await;
        assert_eq!(res.headers()[CACHE_CONTROL], "public, max-age=3600");
        assert_eq!(res.headers()[PRAGMA], "no-cache");
    }

    #[tokio::test]
    async fn unmatched_routes_are_covered_too() {
        let chain = Router::new().layer(NoCache).into_chain();
        let res = chain.call(get("/missing")).await;
        assert_eq!(res.status_code(), http::StatusCode::NOT_FOUND);
        assert_eq!(res.headers()[EXPIRES], "0");
    }
}
