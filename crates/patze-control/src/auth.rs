//! Bearer-token authorization for the control surface.
//!
//! The mode comes from `TELEMETRY_AUTH_MODE`/`TELEMETRY_AUTH_TOKEN`, else
//! from `auth.json` (0600) in the settings dir. `/health` is always open.

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use patze_persist::write_atomic_private;
use patze_proto::{ApiError, ErrorCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    pub mode: AuthFileMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthFileMode {
    None,
    Token,
}

impl AuthConfig {
    pub fn open() -> Self {
        Self {
            mode: AuthFileMode::None,
            token: None,
        }
    }

    /// Environment first, `auth.json` second, open mode last.
    pub fn load(settings_dir: &Path) -> Self {
        match std::env::var("TELEMETRY_AUTH_MODE").ok().as_deref() {
            Some("none") => return Self::open(),
            Some("token") => {
                if let Ok(token) = std::env::var("TELEMETRY_AUTH_TOKEN")
                    && !token.is_empty()
                {
                    return Self {
                        mode: AuthFileMode::Token,
                        token: Some(token),
                    };
                }
                warn!("TELEMETRY_AUTH_MODE=token but no TELEMETRY_AUTH_TOKEN; falling back to auth.json");
            }
            _ => {}
        }

        let path = settings_dir.join("auth.json");
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(error = %e, "corrupt auth.json, running open");
                Self::open()
            }),
            Err(_) => Self::open(),
        }
    }

    /// Persist to `auth.json` with owner-only permissions.
    pub fn save(&self, settings_dir: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        write_atomic_private(&settings_dir.join("auth.json"), &bytes)
    }

    pub fn proto_mode(&self) -> patze_proto::AuthMode {
        match self.mode {
            AuthFileMode::None => patze_proto::AuthMode::None,
            AuthFileMode::Token => patze_proto::AuthMode::Token,
        }
    }

    fn accepts(&self, bearer: Option<&str>) -> bool {
        match (self.mode, &self.token) {
            (AuthFileMode::None, _) => true,
            (AuthFileMode::Token, Some(expected)) => bearer == Some(expected.as_str()),
            (AuthFileMode::Token, None) => false,
        }
    }
}

fn bearer_from(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Axum middleware enforcing the configured mode on every guarded route.
pub async fn require_auth(
    State(auth): State<Arc<AuthConfig>>,
    request: Request,
    next: Next,
) -> Result<Response, crate::error::HttpError> {
    if auth.accepts(bearer_from(&request)) {
        Ok(next.run(request).await)
    } else {
        info!(path = %request.uri().path(), "unauthorized request rejected");
        Err(crate::error::HttpError(ApiError::new(ErrorCode::Unauthorized)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_mode_accepts_anything() {
        let auth = AuthConfig::open();
        assert!(auth.accepts(None));
        assert!(auth.accepts(Some("whatever")));
    }

    #[test]
    fn test_token_mode_requires_exact_match() {
        let auth = AuthConfig {
            mode: AuthFileMode::Token,
            token: Some("s3cret".to_string()),
        };
        assert!(auth.accepts(Some("s3cret")));
        assert!(!auth.accepts(Some("wrong")));
        assert!(!auth.accepts(None));
    }

    #[cfg(unix)]
    #[test]
    fn test_save_sets_private_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let auth = AuthConfig {
            mode: AuthFileMode::Token,
            token: Some("t".to_string()),
        };
        auth.save(dir.path()).expect("save");
        let mode = std::fs::metadata(dir.path().join("auth.json"))
            .expect("meta")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = AuthConfig::load(dir.path());
        assert_eq!(loaded.mode, AuthFileMode::Token);
    }
}
