//! Session identity: access token, tenant and user.
//!
//! Services never read tokens from disk themselves; they ask a
//! [`CredentialsProvider`]. [`Credentials`] is the stock provider, backed
//! by `{config_dir}/credentials.json` (mode 0600) and `FLEET_*`
//! environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::sync::RwLock;

/// File name inside the config directory.
const CREDENTIALS_FILE: &str = "credentials.json";

/// Source of the bearer token, tenant id and user id.
pub trait CredentialsProvider: Send + Sync + std::fmt::Debug {
    /// Bearer token, if signed in.
    fn access_token(&self) -> Option<String>;

    /// Tenant the session belongs to.
    fn tenant_id(&self) -> Option<String>;

    /// Signed-in user.
    fn user_id(&self) -> Option<String>;

    /// Whether a session is signed in.
    fn is_authenticated(&self) -> bool {
        self.access_token().is_some_and(|token| !token.is_empty())
    }
}

/// Stored identity for one signed-in session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Bearer token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Tenant id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// User id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Credentials {
    /// Load from the config directory, then apply environment overrides.
    ///
    /// A missing file is not an error.
    pub fn load() -> Result<Self> {
        let dir = crate::config::Config::config_dir()?;
        let mut creds = Self::load_from(&dir)?;
        creds.apply_env_overrides();
        Ok(creds)
    }

    /// Load `credentials.json` from `dir` without environment overrides.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CREDENTIALS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Malformed {}", path.display()))
    }

    /// Write `credentials.json` into `dir` with owner-only permissions.
    ///
    /// A new file is created 0600; an existing one is narrowed to 0600
    /// before the token is written into it.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CREDENTIALS_FILE);
        let content = serde_json::to_string_pretty(self)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;

        #[cfg(unix)]
        file.set_permissions(fs::Permissions::from_mode(0o600))?;

        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write {}", path.display()))?;

        log::debug!("Saved credentials to {}", path.display());
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("FLEET_ACCESS_TOKEN") {
            self.access_token = Some(token);
        }
        if let Ok(tenant_id) = std::env::var("FLEET_TENANT_ID") {
            self.tenant_id = Some(tenant_id);
        }
        if let Ok(user_id) = std::env::var("FLEET_USER_ID") {
            self.user_id = Some(user_id);
        }
    }
}

impl CredentialsProvider for Credentials {
    fn access_token(&self) -> Option<String> {
        self.access_token.clone()
    }

    fn tenant_id(&self) -> Option<String> {
        self.tenant_id.clone()
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}

/// Credentials that change over the session (sign-in, logout).
#[derive(Debug, Default)]
pub struct SessionCredentials {
    inner: RwLock<Credentials>,
}

impl SessionCredentials {
    /// Wrap an initial set of credentials.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            inner: RwLock::new(credentials),
        }
    }

    /// Replace the signed-in identity.
    pub fn sign_in(&self, credentials: Credentials) {
        *self
            .inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = credentials;
    }

    /// Forget the signed-in identity.
    pub fn sign_out(&self) {
        self.sign_in(Credentials::default());
    }

    fn snapshot(&self) -> Credentials {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl CredentialsProvider for SessionCredentials {
    fn access_token(&self) -> Option<String> {
        self.snapshot().access_token
    }

    fn tenant_id(&self) -> Option<String> {
        self.snapshot().tenant_id
    }

    fn user_id(&self) -> Option<String> {
        self.snapshot().user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Credentials {
        Credentials {
            access_token: Some("tok".into()),
            tenant_id: Some("tenant-1".into()),
            user_id: Some("user-1".into()),
        }
    }

    #[test]
    fn test_save_and_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        sample().save_to(dir.path()).unwrap();

        assert_eq!(Credentials::load_from(dir.path()).unwrap(), sample());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        sample().save_to(dir.path()).unwrap();

        let mode = fs::metadata(dir.path().join(CREDENTIALS_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_existing_readable_file_is_narrowed_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE);
        fs::write(&path, "{\"accessToken\":\"a-much-longer-stale-token-value\"}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        sample().save_to(dir.path()).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(Credentials::load_from(dir.path()).unwrap(), sample());
    }

    #[test]
    fn test_missing_file_is_empty_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let creds = Credentials::load_from(dir.path()).unwrap();
        assert_eq!(creds, Credentials::default());
        assert!(!creds.is_authenticated());
    }

    #[test]
    fn test_empty_token_is_not_authenticated() {
        let creds = Credentials {
            access_token: Some(String::new()),
            ..Credentials::default()
        };
        assert!(!creds.is_authenticated());
    }

    #[test]
    fn test_session_sign_out() {
        let session = SessionCredentials::new(sample());
        assert!(session.is_authenticated());
        assert_eq!(session.user_id().as_deref(), Some("user-1"));

        session.sign_out();
        assert!(!session.is_authenticated());
        assert_eq!(session.tenant_id(), None);
    }
}
