//! In-memory private key SSH authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::tty::handler::SshClientHandler;

use super::traits::AuthStrategy;

/// Public key authentication with a key decoded from stored credentials.
///
/// Only passphrase-less keys are supported.
pub struct KeyAuth {
    key: Arc<keys::PrivateKey>,
}

impl KeyAuth {
    /// Decode OpenSSH or PEM key material.
    pub fn from_bytes(material: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(material)
            .map_err(|e| format!("Private key is not valid UTF-8: {}", e))?;
        let key = keys::decode_secret_key(text, None)
            .map_err(|e| format!("Failed to decode private key: {}", e))?;
        Ok(Self { key: Arc::new(key) })
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(self.key.clone(), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tty::testutil::TEST_PRIVATE_KEY;

    #[test]
    fn test_decodes_openssh_key() {
        let auth = KeyAuth::from_bytes(TEST_PRIVATE_KEY.as_bytes()).unwrap();
        assert_eq!(auth.name(), "key");
    }

    #[test]
    fn test_rejects_garbage() {
        let err = KeyAuth::from_bytes(b"not a key").err().unwrap();
        assert!(err.contains("Failed to decode private key"));
    }

    #[test]
    fn test_rejects_non_utf8() {
        let err = KeyAuth::from_bytes(&[0xff, 0xfe, 0x00]).err().unwrap();
        assert!(err.contains("UTF-8"));
    }
}
