//! Role-based access for routes behind the `char` session cookie.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::StatusCode;
use http::header::COOKIE;
use tracing::{error, warn};

use crate::handler::BoxFuture;
use crate::middleware::{Middleware, Next};
use crate::request::Request;
use crate::response::Response;

/// Cookie holding the signed-in character's id.
pub const CHARACTER_COOKIE: &str = "char";

/// The authenticated character, stored in request extensions by [`RoleGate`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CharacterId(pub String);

impl CharacterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CharacterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type LookupError = Box<dyn std::error::Error + Send + Sync>;

/// Answers whether a character holds any of a set of roles.
#[async_trait]
pub trait RoleLookup: Send + Sync + 'static {
    async fn has_any_role(&self, character: &str, roles: &[String]) -> Result<bool, LookupError>;
}

/// Admits only characters holding one of `roles`.
///
/// * no `char` cookie, or an empty one: `401 Not authenticated`
/// * lookup failed: `500 Error checking user role`
/// * no matching role: `403 Forbidden`
#[derive(Clone)]
pub struct RoleGate {
    lookup: Arc<dyn RoleLookup>,
    roles: Arc<[String]>,
}

impl RoleGate {
    pub fn new<I, S>(lookup: Arc<dyn RoleLookup>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { lookup, roles: roles.into_iter().map(Into::into).collect() }
    }
}

impl Middleware for RoleGate {
    fn handle(&self, mut req: Request, next: Next) -> BoxFuture {
        let lookup = Arc::clone(&self.lookup);
        let roles = Arc::clone(&self.roles);

        Box::pin(async move {
            let Some(character) = character_cookie(&req) else {
                return reject(StatusCode::UNAUTHORIZED, "Not authenticated");
            };

            match lookup.has_any_role(&character, &roles).await {
                Ok(true) => {
                    req.extensions_mut().insert(CharacterId(character));
                    next.run(req).await
                }
                Ok(false) => {
                    warn!(req.id = req.request_id().unwrap_or("-"), character = %character,
                        req.path = req.path(), "role check denied");
                    reject(StatusCode::FORBIDDEN, "Forbidden")
                }
                Err(e) => {
                    error!(req.id = req.request_id().unwrap_or("-"), character = %character,
                        error = %e, "role lookup failed");
                    reject(StatusCode::INTERNAL_SERVER_ERROR, "Error checking user role")
                }
            }
        })
    }
}

fn character_cookie(req: &Request) -> Option<String> {
    req.headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(cookie::Cookie::split_parse)
        .filter_map(Result::ok)
        .find(|c| c.name() == CHARACTER_COOKIE)
        .map(|c| c.value().to_owned())
        .filter(|v| !v.is_empty())
}

fn reject(status: StatusCode, message: &'static str) -> Response {
    Response::builder().status(status).text(message)
}
