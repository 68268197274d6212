//! defer-auth: verifies that task callbacks come from the queue
//! infrastructure.
//!
//! Two [`CallbackAuthenticator`] variants exist and one is chosen at
//! startup: [`OidcAuthenticator`] checks the identity token the queue
//! attaches (audience = the route's execute URL), [`LocalAuthenticator`]
//! accepts everything in local/offline mode.

pub mod core;
pub mod options;
pub mod verifier;

pub use crate::core::{
    authenticator_for, authenticator_from_config, extract_bearer_token, CallbackAuthenticator,
    CallbackPrincipal, LocalAuthenticator, OidcAuthenticator,
};
pub use options::OidcOptions;
pub use verifier::{Claims, Hs256Verifier, JwksVerifier, TokenVerifier, VerifyError};
