//! `bulkjobs-auth`: identity and access rules for the job pipeline.
//!
//! Decoupled from HTTP and storage: the API layer decodes a bearer token into
//! an [`Actor`] and asks this crate what that actor may do.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod roles;

pub use authorize::{Actor, AuthzError, authorize_submit, authorize_view};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use roles::Role;
