//! Pre-crypto validation: message bodies and key usability.
//!
//! Both validators are pure with respect to key state. [`MessageValidator`]
//! never sees key material; [`SecurityValidator`] only sees metadata.

mod message;
mod security;

pub use message::{
    BodyEncoding, DEFAULT_MAX_BODY_SIZE, MAX_ASSOCIATED_DATA_SIZE, MessageLimits, MessageValidator,
    ValidationError,
};
pub use security::{Operation, SecurityError, SecurityValidator};
