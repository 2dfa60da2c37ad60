use std::sync::Arc;

use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};

use parley_chat::ChatService;
use parley_db::Database;
use parley_types::api::Claims;
use parley_types::models::Identity;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub chat: ChatService<Database>,
    pub jwt_secret: String,
}

/// Sign a token for `identity`. Tokens normally come from the identity
/// provider; this exists for local tooling and tests.
pub fn create_token(
    secret: &str,
    identity: &Identity,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let exp = (Utc::now() + ttl).timestamp().max(0) as usize;

    let claims = Claims {
        sub: identity.user_id,
        username: identity.display_name.clone(),
        avatar: identity.avatar.clone(),
        exp,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}
