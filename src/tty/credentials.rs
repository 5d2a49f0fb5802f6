//! Credential storage for bridge targets.
//!
//! Targets are addressed by an opaque host id. The store resolves an id to
//! [`Credentials`]; private key files are read when the store is loaded, so
//! nothing downstream touches the filesystem.
//!
//! # Hosts file
//!
//! ```json
//! [
//!   {"id": "web-1", "host": "10.0.0.5", "user": "deploy",
//!    "auth_mode": "password", "password": "secret"},
//!   {"id": "db-1", "host": "db.internal", "port": 2222, "user": "ops",
//!    "auth_mode": "private_key", "private_key_path": "/etc/bridge/db.key"}
//! ]
//! ```

use std::path::Path;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{info, warn};

use crate::tty::error::CredentialError;
use crate::tty::types::{AuthMethod, Credentials};

const DEFAULT_SSH_PORT: u16 = 22;

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// One entry of the hosts file.
#[derive(Debug, Deserialize)]
struct HostRecord {
    id: String,
    host: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    user: String,
    #[serde(flatten)]
    auth: AuthRecord,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "auth_mode", rename_all = "snake_case")]
enum AuthRecord {
    Password {
        password: String,
    },
    PrivateKey {
        #[serde(default)]
        private_key: Option<String>,
        #[serde(default)]
        private_key_path: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

impl AuthRecord {
    fn into_method(self, base: Option<&Path>) -> Result<AuthMethod, CredentialError> {
        match self {
            AuthRecord::Password { password } => Ok(AuthMethod::Password(password)),
            AuthRecord::PrivateKey {
                private_key: Some(key),
                password,
                ..
            } => Ok(AuthMethod::PrivateKey {
                key: key.into_bytes(),
                password,
            }),
            AuthRecord::PrivateKey {
                private_key: None,
                private_key_path: Some(path),
                password,
            } => {
                let resolved = match base {
                    Some(dir) if Path::new(&path).is_relative() => dir.join(&path),
                    _ => Path::new(&path).to_path_buf(),
                };
                let key = std::fs::read(&resolved).map_err(|source| CredentialError::Io {
                    path: resolved.display().to_string(),
                    source,
                })?;
                Ok(AuthMethod::PrivateKey { key, password })
            }
            AuthRecord::PrivateKey {
                private_key: None,
                private_key_path: None,
                password: Some(password),
            } => Ok(AuthMethod::Password(password)),
            AuthRecord::PrivateKey { .. } => Err(CredentialError::Parse(serde::de::Error::custom(
                "private_key auth requires private_key or private_key_path",
            ))),
        }
    }
}

/// Trait for credential lookups.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// request handlers.
pub trait CredentialStore: Send + Sync {
    /// Resolve a host id into connection credentials.
    fn resolve(&self, host_id: &str) -> Result<Credentials, CredentialError>;

    /// All known host ids, sorted.
    fn list(&self) -> Vec<String>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// DashMap-based implementation of [`CredentialStore`].
#[derive(Default)]
pub struct DashMapCredentialStore {
    hosts: DashMap<String, Credentials>,
}

impl DashMapCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host_id: impl Into<String>, creds: Credentials) {
        self.hosts.insert(host_id.into(), creds);
    }

    /// Parse a hosts document. Relative key paths resolve against `base`.
    pub fn from_json(json: &str, base: Option<&Path>) -> Result<Self, CredentialError> {
        let records: Vec<HostRecord> = serde_json::from_str(json)?;
        let store = Self::new();
        for record in records {
            let auth = record.auth.into_method(base)?;
            if store.hosts.contains_key(&record.id) {
                warn!("Duplicate host id {}, keeping the last entry", record.id);
            }
            store.insert(
                record.id,
                Credentials::new(record.user, record.host, record.port, auth),
            );
        }
        Ok(store)
    }

    /// Load the hosts file at `path`.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| CredentialError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let store = Self::from_json(&json, path.parent())?;
        info!("Loaded {} host(s) from {}", store.len(), path.display());
        Ok(store)
    }
}

impl CredentialStore for DashMapCredentialStore {
    fn resolve(&self, host_id: &str) -> Result<Credentials, CredentialError> {
        self.hosts
            .get(host_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CredentialError::UnknownHost(host_id.to_string()))
    }

    fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.hosts.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn len(&self) -> usize {
        self.hosts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tty::testutil::TEST_PRIVATE_KEY;

    #[test]
    fn test_password_record() {
        let store = DashMapCredentialStore::from_json(
            r#"[{"id": "web", "host": "10.0.0.5", "user": "deploy",
                 "auth_mode": "password", "password": "secret"}]"#,
            None,
        )
        .unwrap();

        let creds = store.resolve("web").unwrap();
        assert_eq!(creds.target(), "deploy@10.0.0.5:22");
        assert_eq!(creds.auth, AuthMethod::Password("secret".into()));
    }

    #[test]
    fn test_inline_key_with_password_fallback() {
        let json = serde_json::json!([{
            "id": "db", "host": "db.internal", "port": 2222, "user": "ops",
            "auth_mode": "private_key", "private_key": TEST_PRIVATE_KEY, "password": "pw"
        }])
        .to_string();
        let store = DashMapCredentialStore::from_json(&json, None).unwrap();

        let creds = store.resolve("db").unwrap();
        assert_eq!(creds.port, 2222);
        assert_eq!(creds.auth.private_key(), Some(TEST_PRIVATE_KEY.as_bytes()));
        assert_eq!(creds.auth.password(), Some("pw"));
    }

    #[test]
    fn test_key_path_relative_to_hosts_file() {
        let dir = std::env::temp_dir().join(format!("bridge-creds-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("id_test"), TEST_PRIVATE_KEY).unwrap();
        std::fs::write(
            dir.join("hosts.json"),
            r#"[{"id": "k", "host": "h", "user": "u",
                 "auth_mode": "private_key", "private_key_path": "id_test"}]"#,
        )
        .unwrap();

        let store = DashMapCredentialStore::load_from_file(dir.join("hosts.json")).unwrap();
        let creds = store.resolve("k").unwrap();
        assert_eq!(creds.auth.private_key(), Some(TEST_PRIVATE_KEY.as_bytes()));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_key_file_is_io_error() {
        let err = DashMapCredentialStore::from_json(
            r#"[{"id": "k", "host": "h", "user": "u",
                 "auth_mode": "private_key", "private_key_path": "/nonexistent/key"}]"#,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, CredentialError::Io { .. }));
    }

    #[test]
    fn test_key_mode_without_material_is_rejected() {
        let err = DashMapCredentialStore::from_json(
            r#"[{"id": "k", "host": "h", "user": "u", "auth_mode": "private_key"}]"#,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, CredentialError::Parse(_)));
    }

    #[test]
    fn test_unknown_auth_mode_is_parse_error() {
        let err = DashMapCredentialStore::from_json(
            r#"[{"id": "k", "host": "h", "user": "u", "auth_mode": "agent"}]"#,
            None,
        )
        .err()
        .unwrap();
        assert!(matches!(err, CredentialError::Parse(_)));
    }

    #[test]
    fn test_unknown_host() {
        let store = DashMapCredentialStore::new();
        assert!(store.is_empty());
        assert!(matches!(
            store.resolve("nope"),
            Err(CredentialError::UnknownHost(id)) if id == "nope"
        ));
    }

    #[test]
    fn test_list_is_sorted() {
        let store = DashMapCredentialStore::new();
        for id in ["b", "a", "c"] {
            store.insert(
                id,
                Credentials::new("u", "h", 22, AuthMethod::Password("p".into())),
            );
        }
        assert_eq!(store.list(), vec!["a", "b", "c"]);
        assert_eq!(store.len(), 3);
    }
}
