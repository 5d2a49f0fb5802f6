//! Authentication strategies for SSH connections.
//!
//! Credentials arrive as a closed [`AuthMethod`](crate::tty::types::AuthMethod);
//! [`AuthChain::for_method`] turns it into an ordered list of strategies
//! exactly once, at connect time.
//!
//! # Available Strategies
//!
//! - [`KeyAuth`]: Private key decoded from stored key material
//! - [`PasswordAuth`]: Password-based authentication

mod chain;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
