//! Structural checks on message bodies before they reach the encryption path.

use thiserror::Error;

/// Default maximum body size (10 MiB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Largest caller-supplied associated data (16 KiB). Fits inside the
/// envelope's header allowance.
pub const MAX_ASSOCIATED_DATA_SIZE: usize = 16 * 1024;

/// How message bodies are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyEncoding {
    /// UTF-8 text. Control characters other than `\n`, `\r` and `\t` are
    /// rejected.
    #[default]
    Utf8Text,
    /// Opaque bytes, no encoding checks
    Binary,
}

/// Size and encoding limits for message bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLimits {
    /// Largest accepted body in bytes
    pub max_body_size: usize,
    /// Body encoding
    pub encoding: BodyEncoding,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self { max_body_size: DEFAULT_MAX_BODY_SIZE, encoding: BodyEncoding::default() }
    }
}

/// Message body rejected by [`MessageValidator`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Zero-length body
    #[error("message body is empty")]
    EmptyBody,

    /// Body exceeds the configured size limit
    #[error("message body too large: {size} bytes (max {max})")]
    BodyTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Associated data exceeds [`MAX_ASSOCIATED_DATA_SIZE`]
    #[error("associated data too large: {size} bytes (max {max})")]
    AssociatedDataTooLarge {
        /// Actual size in bytes
        size: usize,
        /// Fixed maximum
        max: usize,
    },

    /// Body is not valid for the configured encoding
    #[error("invalid encoding at byte {offset}: {reason}")]
    InvalidEncoding {
        /// Byte offset of the first offending byte
        offset: usize,
        /// What was wrong
        reason: String,
    },
}

/// Stateless message body validator.
///
/// Pure: touches no key material and holds nothing but its limits. Callers
/// run [`validate`](Self::validate) before handing a body to the engine; the
/// engine re-runs [`check_bounds`](Self::check_bounds) regardless.
#[derive(Debug, Clone, Default)]
pub struct MessageValidator {
    limits: MessageLimits,
}

impl MessageValidator {
    /// Create a validator with the given limits.
    pub fn new(limits: MessageLimits) -> Self {
        Self { limits }
    }

    /// Configured limits.
    pub fn limits(&self) -> MessageLimits {
        self.limits
    }

    /// Full validation: size bounds, then encoding.
    pub fn validate(&self, body: &[u8]) -> Result<(), ValidationError> {
        self.check_bounds(body.len())?;

        match self.limits.encoding {
            BodyEncoding::Binary => Ok(()),
            BodyEncoding::Utf8Text => check_text(body),
        }
    }

    /// Size bounds only.
    pub fn check_bounds(&self, len: usize) -> Result<(), ValidationError> {
        if len == 0 {
            return Err(ValidationError::EmptyBody);
        }
        if len > self.limits.max_body_size {
            return Err(ValidationError::BodyTooLarge { size: len, max: self.limits.max_body_size });
        }
        Ok(())
    }

    /// Size bound on associated data. Empty is allowed.
    pub fn check_associated_data(&self, len: usize) -> Result<(), ValidationError> {
        if len > MAX_ASSOCIATED_DATA_SIZE {
            return Err(ValidationError::AssociatedDataTooLarge {
                size: len,
                max: MAX_ASSOCIATED_DATA_SIZE,
            });
        }
        Ok(())
    }
}

fn check_text(body: &[u8]) -> Result<(), ValidationError> {
    let text = std::str::from_utf8(body).map_err(|e| ValidationError::InvalidEncoding {
        offset: e.valid_up_to(),
        reason: "invalid UTF-8".to_string(),
    })?;

    match text.char_indices().find(|&(_, c)| c.is_control() && !matches!(c, '\n' | '\r' | '\t')) {
        Some((offset, c)) => Err(ValidationError::InvalidEncoding {
            offset,
            reason: format!("control character U+{:04X}", u32::from(c)),
        }),
        None => Ok(()),
    }
}
