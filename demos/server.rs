//! Demo app with the full pipeline: request ids, access log, panic recovery,
//! no-cache headers, per-client rate limiting and a role-gated admin route.
//!
//! Run with:
//!   LOG_LEVEL=debug LOG_HEADERS=true cargo run --example server
//!
//! Try:
//!   curl -i http://localhost:8080/app/routes
//!   for i in $(seq 12); do curl -s -o /dev/null -w '%{http_code}\n' -X POST localhost:8080/app/login; done
//!   curl -i http://localhost:8080/app/admin -H 'cookie: char=90000001'
//!   curl -i http://localhost:8080/app/boom

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use liner::middleware::role::LookupError;
use liner::middleware::{CharacterId, NoCache, Observer, RateLimiter, RoleGate, RoleLookup};
use liner::{Config, Request, Response, Router, Server, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() -> Result<(), liner::Error> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let config = Config::from_env();
    liner::telemetry::init(&config.log)?;

    let mut limiter = RateLimiter::new(config.rate_limit.clone());
    limiter.start_reaper();

    let admin = Router::new()
        .layer(NoCache)
        .layer(limiter.layer())
        .layer(RoleGate::new(Arc::new(StaticRoles), ["admin"]))
        .get("/app/admin", admin_home);

    let app = Router::new()
        .layer(NoCache)
        .layer(limiter.layer())
        .post("/app/login", login)
        .get("/app/routes", list_routes)
        .post("/app/routes", create_route)
        .get("/assets/{*file}", asset)
        .get("/app/boom", boom);

    // The admin gate only fronts one route, so it gets its own listener on
    // the next port up.
    let admin_stop = CancellationToken::new();
    let admin_task = match config.port.checked_add(1) {
        Some(port) => {
            let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], port)))
                .observer(Observer::new(config.log.clone()));
            Some(tokio::spawn(server.serve_with_shutdown(admin, admin_stop.clone().cancelled_owned())))
        }
        None => {
            warn!(port = config.port, "no port left for the admin listener; admin routes disabled");
            None
        }
    };

    Server::bind(SocketAddr::from(([0, 0, 0, 0], config.port)))
        .observer(Observer::new(config.log))
        .serve(app)
        .await?;

    admin_stop.cancel();
    if let Some(task) = admin_task {
        match task.await {
            Ok(res) => res?,
            Err(e) => error!("admin listener task failed: {e}"),
        }
    }
    limiter.shutdown().await;
    Ok(())
}

struct StaticRoles;

#[async_trait]
impl RoleLookup for StaticRoles {
    async fn has_any_role(&self, character: &str, roles: &[String]) -> Result<bool, LookupError> {
        let role = if character == "90000001" { "admin" } else { "pilot" };
        Ok(roles.iter().any(|r| r == role))
    }
}

async fn login(_req: Request) -> Response {
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header("location", "/app/routes")
        .header("set-cookie", "char=90000001; Path=/; HttpOnly")
        .no_body()
}

async fn list_routes(_req: Request) -> Response {
    Response::json(r#"[{"id":1,"from":"Jita","to":"Amarr"}]"#)
}

async fn create_route(req: Request) -> Response {
    if req.body().is_empty() {
        return Response::builder().status(StatusCode::BAD_REQUEST).text("empty body");
    }
    Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/app/routes/2")
        .no_body()
}

async fn asset(req: Request) -> Response {
    let file = req.param("file").unwrap_or_default();
    Response::builder()
        .header("cache-control", "public, max-age=3600")
        .text(format!("/* {file} */"))
}

async fn admin_home(req: Request) -> Response {
    let who = req.extensions().get::<CharacterId>().map(|c| c.to_string()).unwrap_or_default();
    Response::text(format!("hello, {who}"))
}

async fn boom(_req: Request) -> Response {
    panic!("demo handler panicked")
}
