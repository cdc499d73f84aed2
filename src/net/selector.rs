use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::NftwallError;

/// Characters allowed in a host name, the dot included so that a wildcard can span labels
const ALLOWED_DNS_CHARS: &str = "[-a-zA-Z0-9_.]";

/// Regex for the bare "*" pattern: any run of labels each ending in a dot, or the root label
const MATCH_ALL_REGEX: &str = "(^([-a-zA-Z0-9_]+[.])+$)|(^[.]$)";

/// Selects DNS names either by exact name or by wildcard pattern
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FqdnSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_pattern: Option<String>,
}

impl FqdnSelector {
    pub fn name(name: impl Into<String>) -> Self {
        Self {
            match_name: Some(name.into()),
            match_pattern: None,
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            match_name: None,
            match_pattern: Some(pattern.into()),
        }
    }

    /// Exact name if set, the pattern otherwise
    pub fn get_name(&self) -> &str {
        self.match_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .or(self.match_pattern.as_deref())
            .unwrap_or_default()
    }

    /// Whether this selector matches by exact name
    pub fn is_exact(&self) -> bool {
        self.match_name.as_deref().is_some_and(|name| !name.is_empty())
    }

    pub fn validate(&self) -> Result<(), NftwallError> {
        let has_name = self.is_exact();
        let has_pattern = self
            .match_pattern
            .as_deref()
            .is_some_and(|pattern| !pattern.is_empty());
        match (has_name, has_pattern) {
            (true, true) => Err(NftwallError::InvalidSelector {
                reason: "only one of matchName and matchPattern may be set".to_string(),
            }),
            (false, false) => Err(NftwallError::InvalidSelector {
                reason: "one of matchName or matchPattern must be set".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Compile the selector into an anchored regular expression
    ///
    /// The name or pattern is lower-cased and made fully qualified first.
    /// Literal dots are escaped and every `*` matches any run of host-name
    /// characters, so `*.com` matches both `example.com.` and `foo.bar.com.`.
    pub fn get_regex(&self) -> Result<Regex, NftwallError> {
        let raw = self.get_name();
        let pattern = to_fqdn(raw);

        let expression = if pattern.trim_end_matches('.') == "*" {
            MATCH_ALL_REGEX.to_string()
        } else {
            let escaped = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(&format!("{ALLOWED_DNS_CHARS}*"));
            format!("^{escaped}$")
        };

        Regex::new(&expression).map_err(|source| NftwallError::InvalidPattern {
            pattern: raw.to_string(),
            source,
        })
    }
}

/// Lower-case a DNS name and append the trailing dot if missing
pub fn to_fqdn(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    if lowered.ends_with('.') {
        lowered
    } else {
        format!("{lowered}.")
    }
}
