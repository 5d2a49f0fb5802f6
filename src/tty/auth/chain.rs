//! Authentication chain for trying multiple strategies.

use async_trait::async_trait;
use russh::client;
use tracing::{debug, warn};

use crate::tty::handler::SshClientHandler;
use crate::tty::types::AuthMethod;

use super::traits::AuthStrategy;
use super::{KeyAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// The first successful authentication stops the chain.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the chain for stored credentials.
    ///
    /// A private key that decodes is tried first; a key that fails to decode
    /// is skipped with a warning. The password, if any, is always appended as
    /// a fallback. Errors when no usable method remains.
    pub fn for_method(auth: &AuthMethod) -> Result<Self, String> {
        let mut chain = Self::new();

        if let Some(material) = auth.private_key() {
            match KeyAuth::from_bytes(material) {
                Ok(key) => chain = chain.with_strategy(key),
                Err(e) => warn!("Skipping private key: {}", e),
            }
        }

        if let Some(password) = auth.password() {
            chain = chain.with_password(password);
        }

        if chain.is_empty() {
            return Err(format!(
                "no usable authentication method for {} credentials",
                auth.mode()
            ));
        }

        Ok(chain)
    }

    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.with_strategy(PasswordAuth::new(password))
    }

    pub fn with_strategy(mut self, strategy: impl AuthStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;

        for strategy in &self.strategies {
            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Authentication succeeded with strategy: {}", strategy.name());
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Authentication rejected for strategy: {}", strategy.name());
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => {
                    debug!("Authentication error with strategy {}: {}", strategy.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
