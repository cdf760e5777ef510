//! Radix-tree request router and the frozen middleware [`Chain`].
//!
//! One tree per HTTP method. O(path-length) lookup. Middleware registered with
//! [`Router::layer`] wraps every routed handler, outermost first.

use std::collections::HashMap;
use std::sync::Arc;

use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;

use crate::handler::{BoxFuture, BoxedHandler, Handler};
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// The application router.
///
/// Build it once at startup; pass it to [`Server::serve`](crate::Server::serve)
/// or freeze it with [`Router::into_chain`].
pub struct Router {
    routes: Routes,
    layers: Vec<Arc<dyn Middleware>>,
}

impl Router {
    pub fn new() -> Self {
        Self { routes: Routes::default(), layers: Vec::new() }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax, catch-alls `{*name}`:
    ///
    /// ```rust,no_run
    /// # use liner::{Method, Request, Response, Router};
    /// # async fn get_route(_: Request) -> Response { Response::text("") }
    /// # async fn asset(_: Request) -> Response { Response::text("") }
    /// Router::new()
    ///     .on(Method::GET, "/app/routes/{id}", get_route)
    ///     .on(Method::GET, "/assets/{*file}",  asset);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `path` conflicts with an already registered route.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.routes
            .trees
            .entry(method)
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::DELETE, path, handler)
    }

    /// Wrap every route in `middleware`. Layers run in registration order:
    /// the first one registered sees the request first and the response last.
    pub fn layer(mut self, middleware: impl Middleware) -> Self {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Freezes the routing table and layers into a cheaply cloneable [`Chain`].
    pub fn into_chain(self) -> Chain {
        Chain {
            layers: self.layers.into(),
            routes: Arc::new(self.routes),
        }
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

/// The routing table proper: the innermost link of every chain.
#[derive(Default)]
pub(crate) struct Routes {
    trees: HashMap<Method, MatchitRouter<BoxedHandler>>,
}

impl Routes {
    pub(crate) fn call(&self, mut req: Request) -> BoxFuture {
        let Some((handler, params)) = self.lookup(req.method(), req.path()) else {
            return Box::pin(async { Response::status(StatusCode::NOT_FOUND) });
        };
        req.set_params(params);
        handler.call(req)
    }

    fn lookup(
        &self,
        method: &Method,
        path: &str,
    ) -> Option<(BoxedHandler, HashMap<String, String>)> {
        let tree = self.trees.get(method)?;
        let matched = tree.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((handler, params))
    }
}

/// A frozen router: middleware layers in front of the routing table.
#[derive(Clone)]
pub struct Chain {
    layers: Arc<[Arc<dyn Middleware>]>,
    routes: Arc<Routes>,
}

impl Chain {
    /// Runs `req` through every layer and the matching handler.
    pub fn call(&self, req: Request) -> BoxFuture {
        Next::new(Arc::clone(&self.layers), Arc::clone(&self.routes)).run(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Trace {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Trace {
        fn handle(&self, req: Request, next: Next) -> BoxFuture {
            let name = self.name;
            let log = Arc::clone(&self.log);
            Box::pin(async move {
                log.lock().unwrap().push(format!("{name}:pre"));
                let res = next.run(req).await;
                log.lock().unwrap().push(format!("{name}:post"));
                res
            })
        }
    }

    fn get(path: &str) -> Request {
        http::Request::get(path).body(bytes::Bytes::new()).unwrap().into()
    }

    async fn route(req: Request) -> Response {
        Response::text(format!("route {}", req.param("id").unwrap_or("?")))
    }

    #[tokio::test]
    async fn routes_with_params() {
        let chain = Router::new().get("/app/routes/{id}", route).into_chain();
        let res = chain.call(get("/app/routes/42")).await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body(), b"route 42");
    }

    #[tokio::test]
    async fn unknown_path_or_method_is_not_found() {
        let chain = Router::new().get("/app/routes/{id}", route).into_chain();
        assert_eq!(chain.call(get("/nope")).await.status_code(), StatusCode::NOT_FOUND);

        let post = http::Request::post("/app/routes/1").body(bytes::Bytes::new()).unwrap();
        assert_eq!(chain.call(post.into()).await.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn layers_run_outermost_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = Router::new()
            .layer(Trace { name: "a", log: Arc::clone(&log) })
            .layer(Trace { name: "b", log: Arc::clone(&log) })
            .get("/app/routes/{id}", route)
            .into_chain();

        chain.call(get("/app/routes/1")).await;
        assert_eq!(*log.lock().unwrap(), ["a:pre", "b:pre", "b:post", "a:post"]);
    }
}
