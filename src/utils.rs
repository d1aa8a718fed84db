use uuid::Uuid;

const MAX_IDENTIFIER_LEN: usize = 64;

/// A fresh 128 bit random token rendered as 32 hex characters.
pub fn new_identifier() -> String {
    Uuid::new_v4().to_simple().to_string()
}

/// Identifiers end up inside store keys so they are kept to a safe alphabet.
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_IDENTIFIER_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
