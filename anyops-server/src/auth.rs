//! Login and session handling. Tokens are opaque and held in memory;
//! a restart simply logs everyone out.

use crate::keys::IdentityStore;
use crate::store::Store;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

pub const LOGIN_FAILED_MSG: &str = "用户名或密码错误";
pub const UNAUTHORIZED_MSG: &str = "未登录或令牌无效";

/// Resolved identity attached to authenticated requests.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub username: String,
    pub role: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Clone, Default)]
pub struct Sessions {
    tokens: Arc<RwLock<HashMap<String, CurrentUser>>>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates credentials against the user records. Stored and
    /// submitted passwords may each be ciphertext or legacy plaintext;
    /// both sides are resolved before comparing.
    pub fn login(
        &self,
        store: &Store,
        ids: &IdentityStore,
        req: &LoginRequest,
    ) -> Option<(String, CurrentUser)> {
        let submitted = ids.resolve_password(&req.password);
        let user = store.read(|d| {
            d.users
                .iter()
                .find(|u| u.username == req.username && ids.resolve_password(&u.password) == submitted)
                .cloned()
        })?;

        let current = CurrentUser {
            username: user.username,
            role: user.role,
        };
        let token = Uuid::new_v4().to_string();
        self.tokens.write().insert(token.clone(), current.clone());
        Some((token, current))
    }

    pub fn resolve(&self, token: &str) -> Option<CurrentUser> {
        self.tokens.read().get(token).cloned()
    }

    pub fn revoke(&self, token: &str) {
        self.tokens.write().remove(token);
    }
}

/// Extracts the bearer token from an Authorization header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Store, IdentityStore, Sessions) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data.json")).unwrap();
        let ids = IdentityStore::with_key_bits(dir.path().join("keys"), 1024);
        (dir, store, ids, Sessions::new())
    }

    #[test]
    fn seeded_admin_can_log_in_with_plaintext() {
        let (_dir, store, ids, sessions) = fixture();
        let (token, user) = sessions
            .login(
                &store,
                &ids,
                &LoginRequest {
                    username: "admin".to_string(),
                    password: "password".to_string(),
                },
            )
            .unwrap();
        assert_eq!(user.role, "admin");
        assert_eq!(sessions.resolve(&token).unwrap().username, "admin");
    }

    #[test]
    fn wrong_password_yields_no_session() {
        let (_dir, store, ids, sessions) = fixture();
        assert!(sessions
            .login(
                &store,
                &ids,
                &LoginRequest {
                    username: "admin".to_string(),
                    password: "nope".to_string(),
                },
            )
            .is_none());
    }

    #[test]
    fn revoked_token_stops_resolving() {
        let (_dir, store, ids, sessions) = fixture();
        let (token, _) = sessions
            .login(
                &store,
                &ids,
                &LoginRequest {
                    username: "admin".to_string(),
                    password: "password".to_string(),
                },
            )
            .unwrap();
        sessions.revoke(&token);
        assert!(sessions.resolve(&token).is_none());
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }
}
