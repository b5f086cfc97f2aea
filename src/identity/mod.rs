//! Identity: principals, bearer tokens, signup/login and current-principal resolution.
//! Keep the public surface thin and split implementation across sub-modules.

mod error;
mod principal;
mod provider;
pub mod resolver;
pub mod token;

pub use error::AuthError;
pub use principal::{Principal, PrincipalRecord, SecretHash};
pub use provider::{AuthProvider, LocalAuthProvider, LoginRequest, LoginResponse, SignupRequest};
pub use resolver::{bearer_token, resolve};
pub use token::{Claims, Clock, ManualClock, SystemClock, Token, TokenService};
