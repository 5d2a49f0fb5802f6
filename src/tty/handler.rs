//! russh client handler and host key verification.
//!
//! Host key checking is a caller decision expressed as a [`HostKeyPolicy`].
//! Nothing here accepts unknown keys unless the caller explicitly chose
//! [`HostKeyPolicy::AcceptAny`]. An unset policy pins an empty fingerprint
//! set and therefore rejects every host.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use russh::{client, keys};
use tracing::{debug, warn};

/// Caller-supplied host key check: `(host, key) -> accepted`.
pub type HostKeyCallback = dyn Fn(&str, &keys::PublicKey) -> bool + Send + Sync;

/// How advertised server keys are verified.
#[derive(Clone)]
pub enum HostKeyPolicy {
    /// Accept every key (similar to `StrictHostKeyChecking=no`). Explicit opt-in only.
    AcceptAny,
    /// Accept keys whose SHA-256 fingerprint (`SHA256:...`) is in the set.
    Pinned(Arc<HashSet<String>>),
    Custom(Arc<HostKeyCallback>),
}

impl HostKeyPolicy {
    pub fn pinned<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Pinned(Arc::new(fingerprints.into_iter().map(Into::into).collect()))
    }

    pub fn custom(f: impl Fn(&str, &keys::PublicKey) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Parse a policy from configuration text.
    ///
    /// `accept-any` selects [`HostKeyPolicy::AcceptAny`]; anything else is a
    /// comma-separated fingerprint list. `None` pins nothing.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("accept-any") => Self::AcceptAny,
            Some(s) => Self::pinned(s.split(',').map(str::trim).filter(|f| !f.is_empty())),
            None => Self::pinned(Vec::<String>::new()),
        }
    }

    pub fn accepts(&self, host: &str, key: &keys::PublicKey) -> bool {
        match self {
            Self::AcceptAny => true,
            Self::Pinned(set) => set.contains(&fingerprint(key)),
            Self::Custom(f) => f(host, key),
        }
    }
}

impl fmt::Debug for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcceptAny => f.write_str("AcceptAny"),
            Self::Pinned(set) => f.debug_tuple("Pinned").field(&set.len()).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// SHA-256 fingerprint in OpenSSH notation.
pub fn fingerprint(key: &keys::PublicKey) -> String {
    key.fingerprint(keys::HashAlg::Sha256).to_string()
}

/// Client handler for russh that verifies host keys against a policy.
///
/// A rejected key is recorded so the connector can report a host key
/// mismatch instead of a generic transport error.
pub struct SshClientHandler {
    host: String,
    policy: HostKeyPolicy,
    rejected: Arc<Mutex<Option<String>>>,
}

impl SshClientHandler {
    pub fn new(host: impl Into<String>, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            policy,
            rejected: Arc::new(Mutex::new(None)),
        }
    }

    /// Shared slot holding the fingerprint of a rejected key, if any.
    pub fn rejected_slot(&self) -> Arc<Mutex<Option<String>>> {
        self.rejected.clone()
    }
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy.accepts(&self.host, server_public_key) {
            debug!("Accepted host key for {}", self.host);
            return Ok(true);
        }

        let fp = fingerprint(server_public_key);
        warn!("Rejected host key {} for {}", fp, self.host);
        if let Ok(mut slot) = self.rejected.lock() {
            *slot = Some(fp);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tty::testutil::{TEST_PUBLIC_KEY, TEST_PUBLIC_KEY_FINGERPRINT};

    fn test_key() -> keys::PublicKey {
        keys::PublicKey::from_openssh(TEST_PUBLIC_KEY).unwrap()
    }

    #[test]
    fn test_fingerprint_matches_openssh() {
        assert_eq!(fingerprint(&test_key()), TEST_PUBLIC_KEY_FINGERPRINT);
    }

    #[test]
    fn test_unset_policy_rejects() {
        let policy = HostKeyPolicy::parse(None);
        assert!(!policy.accepts("db", &test_key()));
    }

    #[test]
    fn test_accept_any_is_explicit() {
        let policy = HostKeyPolicy::parse(Some(" Accept-Any "));
        assert!(matches!(policy, HostKeyPolicy::AcceptAny));
        assert!(policy.accepts("db", &test_key()));
    }

    #[test]
    fn test_pinned_list() {
        let raw = format!("SHA256:other, {}", TEST_PUBLIC_KEY_FINGERPRINT);
        let policy = HostKeyPolicy::parse(Some(&raw));
        assert!(policy.accepts("db", &test_key()));

        let policy = HostKeyPolicy::parse(Some("SHA256:other"));
        assert!(!policy.accepts("db", &test_key()));
    }

    #[test]
    fn test_custom_callback_sees_host() {
        let policy = HostKeyPolicy::custom(|host, _key| host == "trusted");
        assert!(policy.accepts("trusted", &test_key()));
        assert!(!policy.accepts("other", &test_key()));
    }

    #[tokio::test]
    async fn test_handler_records_rejection() {
        use russh::client::Handler;

        let mut handler = SshClientHandler::new("db", HostKeyPolicy::parse(None));
        let slot = handler.rejected_slot();
        let accepted = handler.check_server_key(&test_key()).await.unwrap();
        assert!(!accepted);
        assert_eq!(
            slot.lock().unwrap().as_deref(),
            Some(TEST_PUBLIC_KEY_FINGERPRINT)
        );
    }

    #[test]
    fn test_policy_debug_hides_contents() {
        let policy = HostKeyPolicy::pinned(["SHA256:a", "SHA256:b"]);
        assert_eq!(format!("{:?}", policy), "Pinned(2)");
    }
}
