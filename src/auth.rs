// Request authentication.
//
// A caller is either a logged-in surveyor or a device presenting the shared
// `Session-Api-Token` header. Surveyor sessions live entirely in a private
// (encrypted and authenticated) `session` cookie keyed from SECRET_KEY, so the
// server keeps no per-login state and sessions survive restarts.

use std::collections::BTreeMap;
use std::future::{Ready, ready};
use std::path::PathBuf;

use actix_web::cookie::{Cookie, CookieJar, Key, time::Duration as CookieDuration};
use actix_web::{FromRequest, HttpRequest, dev::Payload, web};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::AppState;
use crate::error::AppError;

pub const SESSION_COOKIE: &str = "session";
pub const API_TOKEN_HEADER: &str = "Session-Api-Token";

const SESSION_MAX_AGE_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User { user_id: String },
    ApiToken,
}

impl Principal {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Principal::User { user_id } => Some(user_id),
            Principal::ApiToken => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserEntry {
    pub password: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub access: Option<String>,
    #[serde(default)]
    pub vehicle_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub city: Option<String>,
    pub access: Option<String>,
    pub vehicle_type: Option<String>,
}

pub struct Authenticator {
    api_token: Option<String>,
    users_file: PathBuf,
    key: Key,
}

impl Authenticator {
    /// `secret` must be at least 32 bytes; config loading enforces this.
    /// Without one, a random key is used and sessions end with the process.
    pub fn new(api_token: Option<String>, users_file: PathBuf, secret: Option<&str>) -> Self {
        let key = match secret {
            Some(secret) => Key::derive_from(secret.as_bytes()),
            None => {
                warn!("SECRET_KEY not set, sessions will not survive a restart");
                Key::generate()
            }
        };

        Self {
            api_token,
            users_file,
            key,
        }
    }

    /// Checks `password` against the users file.
    pub async fn login(&self, password: &str) -> Option<Session> {
        let users = self.load_users().await;
        let (user_id, entry) = users.into_iter().find(|(_, u)| u.password == password)?;

        debug!(user_id = %user_id, "Session opened");
        Some(Session {
            user_id,
            city: entry.city,
            access: entry.access,
            vehicle_type: entry.vehicle_type,
        })
    }

    pub fn session_cookie(&self, session: &Session) -> Result<Cookie<'static>, AppError> {
        let value = serde_json::to_string(session)
            .map_err(|e| AppError::Session(e.to_string()))?;

        let mut jar = CookieJar::new();
        jar.private_mut(&self.key).add(
            Cookie::build(SESSION_COOKIE, value)
                .path("/")
                .http_only(true)
                .max_age(CookieDuration::days(SESSION_MAX_AGE_DAYS))
                .finish(),
        );

        jar.get(SESSION_COOKIE)
            .cloned()
            .ok_or_else(|| AppError::Session("cookie jar dropped the session".to_string()))
    }

    pub fn removal_cookie() -> Cookie<'static> {
        let mut removal = Cookie::new(SESSION_COOKIE, "");
        removal.set_path("/");
        removal.make_removal();
        removal
    }

    /// Decrypts the session cookie. Tampered, foreign or stale-format cookies yield `None`.
    pub fn session(&self, req: &HttpRequest) -> Option<Session> {
        let cookie = req.cookie(SESSION_COOKIE)?;

        let mut jar = CookieJar::new();
        jar.add_original(cookie);
        let opened = jar.private(&self.key).get(SESSION_COOKIE)?;

        serde_json::from_str(opened.value()).ok()
    }

    pub fn resolve(&self, req: &HttpRequest) -> Result<Principal, AppError> {
        // Mobile clients send the token header on every call, so a mismatch
        // falls through to the session cookie instead of failing outright.
        let presented = req
            .headers()
            .get(API_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok());

        if let (Some(expected), Some(presented)) = (&self.api_token, presented) {
            if presented == expected.as_str() {
                return Ok(Principal::ApiToken);
            }
            debug!(path = req.path(), "API token mismatch, trying session cookie");
        }

        let session = self.session(req).ok_or(AppError::Unauthorized)?;

        Ok(Principal::User {
            user_id: session.user_id,
        })
    }

    async fn load_users(&self) -> BTreeMap<String, UserEntry> {
        let contents = match tokio::fs::read_to_string(&self.users_file).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(path = %self.users_file.display(), error = %e, "Users file unavailable");
                return BTreeMap::new();
            }
        };

        serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!(path = %self.users_file.display(), error = %e, "Users file is not valid JSON");
            BTreeMap::new()
        })
    }
}

impl FromRequest for Principal {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let result = match req.app_data::<web::Data<AppState>>() {
            Some(state) => state.auth.resolve(req),
            None => Err(AppError::Unauthorized),
        };
        ready(result)
    }
}
