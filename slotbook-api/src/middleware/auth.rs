use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

/// Identity issued by the platform's auth service. Only `sub` and `role` are read here.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub exp: usize,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == "ADMIN" || self.role == "SUPER_ADMIN"
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

pub fn decode_claims(token: &str, secret: &str) -> Result<Claims, AppError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| AppError::AuthenticationError(format!("Invalid token: {}", e)))
}

// ============================================================================
// Identity Middleware
// ============================================================================

/// Resolves the caller when a bearer token is present. Anonymous requests pass
/// through without claims; a bad token is rejected.
pub async fn identity_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let claims = match bearer_token(req.headers()) {
        Some(token) => Some(decode_claims(token, &state.auth.secret)?),
        None => None,
    };
    if let Some(claims) = claims {
        req.extensions_mut().insert(claims);
    }
    Ok(next.run(req).await)
}

// ============================================================================
// Admin Authorization Middleware
// ============================================================================

pub async fn admin_auth_middleware(req: Request, next: Next) -> Result<Response, AppError> {
    let claims = req
        .extensions()
        .get::<Claims>()
        .ok_or_else(|| AppError::AuthenticationError("Missing bearer token".to_string()))?;

    if !claims.is_admin() {
        tracing::warn!(subject = %claims.sub, role = %claims.role, "Admin route refused");
        return Err(AppError::AuthorizationError("Admin role required".to_string()));
    }

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(role: &str, secret: &str) -> String {
        let claims = Claims {
            sub: "user-1".to_string(),
            role: role.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn decodes_valid_token() {
        let claims = decode_claims(&token("SUPER_ADMIN", "s3cret"), "s3cret").unwrap();
        assert_eq!(claims.sub, "user-1");
        assert!(claims.is_admin());
    }

    #[test]
    fn rejects_token_signed_with_other_secret() {
        let err = decode_claims(&token("ADMIN", "other"), "s3cret").unwrap_err();
        assert!(matches!(err, AppError::AuthenticationError(_)));
    }

    #[test]
    fn extracts_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
    }
}
