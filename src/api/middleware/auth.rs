use crate::AppState;
use crate::utils::auth::validate_jwt;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use serde::Deserialize;

/// Caller identity attached to every request; `None` for anonymous callers.
#[derive(Debug, Clone, Default)]
pub struct Owner(pub Option<String>);

impl Owner {
    pub fn id(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

#[derive(Deserialize)]
struct AuthQuery {
    token: Option<String>,
}

/// Resolves the caller from a Bearer header or `?token=` query.
///
/// Never rejects: handlers decide which operations need an owner.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let auth_header = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string());

    let token = if let Some(t) = auth_header {
        Some(t)
    } else {
        // Try query parameter
        let query = req.uri().query().unwrap_or_default();
        serde_urlencoded::from_str::<AuthQuery>(query)
            .ok()
            .and_then(|q| q.token)
    };

    let owner = match token {
        Some(token) => match validate_jwt(&token, &state.config.jwt_secret) {
            Ok(claims) => Some(claims.sub),
            Err(e) => {
                tracing::debug!("Ignoring invalid token: {}", e);
                None
            }
        },
        None => None,
    };

    req.extensions_mut().insert(Owner(owner));
    next.run(req).await
}
