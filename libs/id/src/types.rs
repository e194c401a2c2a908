//! Workload identity types.
//!
//! Namespaces are validated as RFC 1123 DNS labels, workload names as
//! RFC 1123 DNS subdomains, matching what the API server accepts.

use crate::define_name;
use crate::IdError;

define_name!(Namespace, "namespace", label);
define_name!(WorkloadName, "workload name", subdomain);

/// Separator used in the display form (`namespace/name`).
pub const DISPLAY_SEPARATOR: char = '/';

/// Separator used in the record-key form (`namespace.name`).
pub const RECORD_SEPARATOR: char = '.';

// =============================================================================
// Workload Key
// =============================================================================

/// Identity of a workload: its namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadKey {
    namespace: Namespace,
    name: WorkloadName,
}

impl WorkloadKey {
    /// Builds a key from raw namespace and name strings.
    pub fn new(namespace: &str, name: &str) -> Result<Self, IdError> {
        Ok(Self {
            namespace: Namespace::parse(namespace)?,
            name: WorkloadName::parse(name)?,
        })
    }

    /// Parses the display form `namespace/name`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty { kind: "workload key" });
        }
        let Some((namespace, name)) = s.split_once(DISPLAY_SEPARATOR) else {
            return Err(IdError::MissingSeparator(s.to_string(), DISPLAY_SEPARATOR));
        };
        Self::new(namespace, name)
    }

    /// Parses the record-key form `namespace.name`.
    pub fn from_record_key(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty { kind: "record key" });
        }
        let Some((namespace, name)) = s.split_once(RECORD_SEPARATOR) else {
            return Err(IdError::MissingSeparator(s.to_string(), RECORD_SEPARATOR));
        };
        Self::new(namespace, name)
    }

    /// Formats the key for use in a record substrate.
    #[must_use]
    pub fn record_key(&self) -> String {
        format!("{}{}{}", self.namespace, RECORD_SEPARATOR, self.name)
    }

    /// Returns the namespace.
    #[must_use]
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the workload name.
    #[must_use]
    pub fn name(&self) -> &WorkloadName {
        &self.name
    }
}

impl std::fmt::Display for WorkloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.namespace, DISPLAY_SEPARATOR, self.name)
    }
}

impl std::str::FromStr for WorkloadKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for WorkloadKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for WorkloadKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Validation
// =============================================================================

#[doc(hidden)]
pub mod validate {
    use crate::IdError;

    const MAX_LABEL: usize = 63;
    const MAX_SUBDOMAIN: usize = 253;

    /// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric ends.
    pub fn label(kind: &'static str, s: &str) -> Result<(), IdError> {
        check(kind, s, MAX_LABEL, |c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
        })
    }

    /// RFC 1123 subdomain: a label that may also contain '.'.
    pub fn subdomain(kind: &'static str, s: &str) -> Result<(), IdError> {
        check(kind, s, MAX_SUBDOMAIN, |c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.'
        })
    }

    fn check(
        kind: &'static str,
        s: &str,
        max: usize,
        allowed: impl Fn(char) -> bool,
    ) -> Result<(), IdError> {
        if s.is_empty() {
            return Err(IdError::Empty { kind });
        }
        if s.len() > max {
            return Err(IdError::TooLong {
                kind,
                value: s.to_string(),
                max,
            });
        }
        if let Some(ch) = s.chars().find(|c| !allowed(*c)) {
            return Err(IdError::InvalidCharacter {
                kind,
                value: s.to_string(),
                ch,
            });
        }
        let alnum = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
        let starts = s.chars().next().is_some_and(alnum);
        let ends = s.chars().last().is_some_and(alnum);
        if !starts || !ends {
            return Err(IdError::InvalidBoundary {
                kind,
                value: s.to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
