use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("Bearer token is empty")]
    Empty,

    #[error("Bearer token contains whitespace")]
    Malformed,
}

/// A bearer credential with any `Bearer ` prefix already removed.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BearerToken(String);

impl BearerToken {
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let trimmed = raw.trim_start();
        let token = match trimmed.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => trimmed[7..].trim(),
            _ => trimmed.trim_end(),
        };

        if token.is_empty() {
            return Err(TokenError::Empty);
        }
        if token.chars().any(char::is_whitespace) {
            return Err(TokenError::Malformed);
        }

        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for BearerToken {
    type Error = TokenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<BearerToken> for String {
    fn from(token: BearerToken) -> Self {
        token.0
    }
}

// Never print credentials in logs.
impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let visible: String = self.0.chars().take(4).collect();
        write!(f, "BearerToken({}***)", visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_strips_bearer_prefix() {
        assert_eq!(BearerToken::parse("Bearer abc.def.ghi").unwrap().as_str(), "abc.def.ghi");
        assert_eq!(BearerToken::parse("bearer   tok").unwrap().as_str(), "tok");
        assert_eq!(BearerToken::parse("  tok  ").unwrap().as_str(), "tok");
    }

    #[test]
    fn test_rejects_empty_and_malformed() {
        assert_matches!(BearerToken::parse(""), Err(TokenError::Empty));
        assert_matches!(BearerToken::parse("Bearer "), Err(TokenError::Empty));
        assert_matches!(BearerToken::parse("two parts"), Err(TokenError::Malformed));
    }

    #[test]
    fn test_debug_hides_token() {
        let token = BearerToken::parse("secret-value").unwrap();
        let printed = format!("{:?}", token);
        assert!(!printed.contains("secret-value"));
        assert_eq!(token.as_str(), "secret-value");
    }
}
