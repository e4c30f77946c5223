//! Authentication: the credential type, the single-flight token
//! lifecycle manager, and the multi-account session registry.

pub mod credential;
pub mod registry;
pub mod tokens;

pub use credential::Credential;
pub use registry::SessionRegistry;
pub use tokens::TokenManager;
