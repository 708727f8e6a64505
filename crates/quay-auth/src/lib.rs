//! Authentication engine: passwords, second factor, tokens, directory
//! fallback.

pub mod auth;

pub use auth::crypto::SecretBox;
pub use auth::directory::{DirectoryConfig, DirectoryService, DirectoryUser};
pub use auth::error::{AuthError, AuthErrorKind, AuthResult};
pub use auth::service::AuthService;
pub use auth::store::PrincipalStore;
pub use auth::tokens::{Claims, RefreshStore, TokenService};
pub use auth::types::*;
