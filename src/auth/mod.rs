//! Authentication: the sign-in ceremony, second-factor codes, and the
//! persistent automation-token cache.

pub mod protocol;
pub mod token_cache;
pub mod totp;

pub use protocol::{AuthError, AuthProtocolClient, Credentials, LoginFlow, LoginSession};
pub use token_cache::{current_bearer, AcquiredToken, TokenCache};
