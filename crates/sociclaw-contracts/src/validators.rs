use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid provider format. Allowed: letters, numbers, _ and -, length 2-32.")]
    Provider,
    #[error("Invalid provider_user_id format. Allowed length 1-128.")]
    ProviderUserId,
}

fn provider_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^[a-z0-9_-]{2,32}$").expect("valid provider regex"))
}

fn provider_user_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9:_@.\-]{1,128}$").expect("valid provider user id regex")
    })
}

pub fn validate_provider(value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if !provider_pattern().is_match(trimmed) {
        return Err(ValidationError::Provider);
    }
    Ok(trimmed.to_string())
}

pub fn validate_provider_user_id(value: &str) -> Result<String, ValidationError> {
    let trimmed = value.trim();
    if !provider_user_id_pattern().is_match(trimmed) {
        return Err(ValidationError::ProviderUserId);
    }
    Ok(trimmed.to_string())
}

/// Upstream `user_id` for a validated provider identity.
pub fn upstream_user_id(provider: &str, provider_user_id: &str) -> Result<String, ValidationError> {
    Ok(format!(
        "{}:{}",
        validate_provider(provider)?,
        validate_provider_user_id(provider_user_id)?
    ))
}

/// Shows the first and last four characters of a secret, or `***` when it is short.
pub fn redact_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
