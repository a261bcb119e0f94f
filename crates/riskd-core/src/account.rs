//! Account identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Trading account identifier.
///
/// Partition key for risk state and for the persistence queue: everything
/// keyed by an `AccountId` is independent of every other account.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-system safe form, used by file-backed stores for file names.
    pub fn file_stem(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AccountId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CoreError::InvalidAccount("empty account id".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_parse_rejects_empty() {
        assert!("  ".parse::<AccountId>().is_err());
        assert_eq!("acct-1".parse::<AccountId>().unwrap().as_str(), "acct-1");
    }

    #[test]
    fn test_file_stem_replaces_separators() {
        let id = AccountId::new("desk/alpha:01");
        assert_eq!(id.file_stem(), "desk_alpha_01");
    }
}
