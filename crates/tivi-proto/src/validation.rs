//! Validation helpers for client-supplied fields.
//!
//! The server never inspects negotiation payloads; these checks cover the
//! fields it stores or echoes to other participants.

use crate::api::CredentialsRequest;
use crate::device::DeviceRegistration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Required field is empty
    EmptyField { field: &'static str },
    /// Field is longer than allowed
    TooLong { field: &'static str, max: usize, actual: usize },
    /// Field contains invalid data
    InvalidData { field: &'static str, reason: &'static str },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyField { field } => write!(f, "required field '{}' is empty", field),
            Self::TooLong { field, max, actual } => {
                write!(f, "field '{}' is {} characters long, maximum is {}", field, actual, max)
            }
            Self::InvalidData { field, reason } => {
                write!(f, "field '{}' contains invalid data: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

pub type ValidationResult<T> = Result<T, ValidationError>;

pub mod limits {
    pub const MAX_ID_LEN: usize = 128;
    pub const MAX_NAME_LEN: usize = 128;
    pub const MAX_OS_VERSION_LEN: usize = 256;
    pub const MAX_EMAIL_LEN: usize = 254;
    pub const MIN_PASSWORD_LEN: usize = 8;
    pub const MAX_PASSWORD_LEN: usize = 1024;
    /// Largest accepted screen edge in pixels.
    pub const MAX_SCREEN_EDGE: u32 = 16_384;
}

fn check_text(field: &'static str, value: &str, max: usize) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::EmptyField { field });
    }
    let len = value.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, max, actual: len });
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::InvalidData {
            field,
            reason: "control characters",
        });
    }
    Ok(())
}

/// Device and user identifiers: non-empty, bounded, printable.
pub fn validate_identifier(field: &'static str, value: &str) -> ValidationResult<()> {
    check_text(field, value, limits::MAX_ID_LEN)?;
    if value.chars().any(char::is_whitespace) {
        return Err(ValidationError::InvalidData {
            field,
            reason: "whitespace",
        });
    }
    Ok(())
}

pub fn validate_device_name(name: &str) -> ValidationResult<()> {
    check_text("name", name, limits::MAX_NAME_LEN)
}

pub fn validate_registration(reg: &DeviceRegistration) -> ValidationResult<()> {
    check_text("name", &reg.name, limits::MAX_NAME_LEN)?;
    check_text("osVersion", &reg.os_version, limits::MAX_OS_VERSION_LEN)?;

    let res = reg.capabilities.resolution;
    if res.width > limits::MAX_SCREEN_EDGE || res.height > limits::MAX_SCREEN_EDGE {
        return Err(ValidationError::InvalidData {
            field: "capabilities.resolution",
            reason: "exceeds maximum screen size",
        });
    }
    Ok(())
}

pub fn validate_credentials(req: &CredentialsRequest) -> ValidationResult<()> {
    check_text("email", &req.email, limits::MAX_EMAIL_LEN)?;
    if !req.email.contains('@') {
        return Err(ValidationError::InvalidData {
            field: "email",
            reason: "missing '@'",
        });
    }
    let len = req.password.chars().count();
    if len < limits::MIN_PASSWORD_LEN {
        return Err(ValidationError::InvalidData {
            field: "password",
            reason: "too short",
        });
    }
    if len > limits::MAX_PASSWORD_LEN {
        return Err(ValidationError::TooLong {
            field: "password",
            max: limits::MAX_PASSWORD_LEN,
            actual: len,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceCapabilities, Platform, Resolution};
    use proptest::prelude::*;

    fn registration(name: &str) -> DeviceRegistration {
        DeviceRegistration {
            name: name.to_string(),
            platform: Platform::Windows,
            os_version: "11 23H2".to_string(),
            mac_address: None,
            ip_address: None,
            capabilities: DeviceCapabilities::default(),
        }
    }

    #[test]
    fn rejects_blank_name() {
        assert_eq!(
            validate_registration(&registration("   ")),
            Err(ValidationError::EmptyField { field: "name" })
        );
    }

    #[test]
    fn rejects_oversized_resolution() {
        let mut reg = registration("office");
        reg.capabilities.resolution = Resolution {
            width: 100_000,
            height: 1080,
        };
        assert!(matches!(
            validate_registration(&reg),
            Err(ValidationError::InvalidData { field: "capabilities.resolution", .. })
        ));
    }

    #[test]
    fn credentials_need_at_sign_and_length() {
        let ok = CredentialsRequest {
            email: "ops@example.com".into(),
            password: "correct horse".into(),
        };
        assert!(validate_credentials(&ok).is_ok());

        let short = CredentialsRequest {
            email: "ops@example.com".into(),
            password: "123".into(),
        };
        assert!(validate_credentials(&short).is_err());

        let no_at = CredentialsRequest {
            email: "ops.example.com".into(),
            password: "correct horse".into(),
        };
        assert!(validate_credentials(&no_at).is_err());
    }

    proptest! {
        #[test]
        fn printable_identifiers_accepted(id in "[A-Za-z0-9_-]{1,128}") {
            prop_assert!(validate_identifier("deviceId", &id).is_ok());
        }

        #[test]
        fn identifiers_with_whitespace_rejected(a in "[a-z]{1,10}", b in "[a-z]{1,10}") {
            let id = format!("{} {}", a, b);
            prop_assert!(validate_identifier("deviceId", &id).is_err());
        }
    }
}
