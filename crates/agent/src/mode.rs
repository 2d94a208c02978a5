use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Restricts which file globs the backend may request dynamically through
/// the `upload.files` trigger option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Only the configured glob may be uploaded.
    #[default]
    Strict,
    /// A requested glob must match the configured glob as a pattern.
    Scoped,
    /// Any requested glob is accepted.
    Lax,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Strict => "strict",
            Self::Scoped => "scoped",
            Self::Lax => "lax",
        };
        f.write_str(name)
    }
}

/// Rejected access-mode value.
#[derive(Debug, thiserror::Error)]
#[error("accepted values are 'strict', 'lax' and 'scoped'")]
pub struct ParseAccessModeError;

impl FromStr for AccessMode {
    type Err = ParseAccessModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "scoped" => Ok(Self::Scoped),
            "lax" => Ok(Self::Lax),
            _ => Err(ParseAccessModeError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_strict() {
        assert_eq!(AccessMode::default(), AccessMode::Strict);
    }

    #[test]
    fn parse_and_display_roundtrip() {
        for mode in [AccessMode::Strict, AccessMode::Scoped, AccessMode::Lax] {
            assert_eq!(mode.to_string().parse::<AccessMode>().unwrap(), mode);
        }
    }

    #[test]
    fn rejects_unknown_value() {
        assert!("open".parse::<AccessMode>().is_err());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&AccessMode::Scoped).unwrap(), "\"scoped\"");
        let parsed: AccessMode = serde_json::from_str("\"lax\"").unwrap();
        assert_eq!(parsed, AccessMode::Lax);
    }
}
