//! Validation of outbound SMS submissions.
//!
//! The modem runs in single-part text mode, so a body must fit in one
//! 160-character SMS and must not contain the Ctrl+Z (submit) or ESC (abort)
//! characters that terminate the `AT+CMGS` body.

/// Maximum body length for a single-part text-mode SMS.
pub const MAX_BODY_CHARS: usize = 160;

const MIN_PHONE_DIGITS: usize = 7;
const MAX_PHONE_DIGITS: usize = 15;

/// Reasons a submission is rejected before reaching the modem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Phone number is empty")]
    EmptyPhone,

    #[error("Phone number contains invalid characters: {chars}")]
    InvalidPhoneCharacters { chars: String },

    #[error("Phone number must have {min}-{max} digits (got {got})")]
    PhoneLength { min: usize, max: usize, got: usize },

    #[error("Message body is empty")]
    EmptyBody,

    #[error("Message body is too long (maximum {max} characters, got {got})")]
    BodyTooLong { max: usize, got: usize },

    #[error("Message body contains a modem control character")]
    ControlCharacter,
}

/// Validate an E.164-like destination: optional leading `+`, then 7-15 digits.
///
/// Spaces, dashes, dots and parentheses are tolerated and stripped from the
/// returned normalized number.
pub fn validate_phone(phone: &str) -> Result<String, ValidationError> {
    let trimmed = phone.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyPhone);
    }
    let (plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let invalid: String = rest
        .chars()
        .filter(|c| !c.is_ascii_digit() && !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    if !invalid.is_empty() {
        return Err(ValidationError::InvalidPhoneCharacters { chars: invalid });
    }
    let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < MIN_PHONE_DIGITS || digits.len() > MAX_PHONE_DIGITS {
        return Err(ValidationError::PhoneLength {
            min: MIN_PHONE_DIGITS,
            max: MAX_PHONE_DIGITS,
            got: digits.len(),
        });
    }
    Ok(if plus { format!("+{}", digits) } else { digits })
}

/// Validate a message body for single-part text-mode sending.
pub fn validate_body(body: &str) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::EmptyBody);
    }
    let len = body.chars().count();
    if len > MAX_BODY_CHARS {
        return Err(ValidationError::BodyTooLong {
            max: MAX_BODY_CHARS,
            got: len,
        });
    }
    if body.chars().any(|c| c == '\x1A' || c == '\x1B') {
        return Err(ValidationError::ControlCharacter);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_international_numbers() {
        assert_eq!(validate_phone("+15551234567").unwrap(), "+15551234567");
        assert_eq!(validate_phone(" +44 (20) 7946-0958 ").unwrap(), "+442079460958");
        assert_eq!(validate_phone("5551234567").unwrap(), "5551234567");
    }

    #[test]
    fn rejects_bad_numbers() {
        assert_eq!(validate_phone(""), Err(ValidationError::EmptyPhone));
        assert!(matches!(
            validate_phone("+1555\"ATD"),
            Err(ValidationError::InvalidPhoneCharacters { .. })
        ));
        assert!(matches!(
            validate_phone("+123"),
            Err(ValidationError::PhoneLength { got: 3, .. })
        ));
        assert!(matches!(
            validate_phone("+1234567890123456"),
            Err(ValidationError::PhoneLength { got: 16, .. })
        ));
    }

    #[test]
    fn body_limits() {
        assert!(validate_body("Hello {name}").is_ok());
        assert!(validate_body(&"a".repeat(160)).is_ok());
        assert_eq!(
            validate_body(&"a".repeat(161)),
            Err(ValidationError::BodyTooLong { max: 160, got: 161 })
        );
        // Characters, not bytes
        assert!(validate_body(&"é".repeat(160)).is_ok());
        assert_eq!(validate_body("   "), Err(ValidationError::EmptyBody));
        assert_eq!(
            validate_body("early\x1Aend"),
            Err(ValidationError::ControlCharacter)
        );
    }
}
