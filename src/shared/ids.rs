use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

macro_rules! define_id_type {
    ($name:ident, $kind:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn parse(raw: &str) -> Result<Self, String> {
                validate_identifier_value($kind, raw)?;
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                self.as_str()
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(&value)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let raw = String::deserialize(deserializer)?;
                Self::parse(&raw).map_err(|err| {
                    D::Error::custom(format!("invalid {} `{}`: {}", $kind, raw, err))
                })
            }
        }
    };
}

define_id_type!(StepId, "step id");
define_id_type!(PolicyName, "policy name");

/// Run identifiers are lexicographically sortable: a UTC timestamp with `:`
/// replaced by `-` (filesystem-safe), followed by a short random suffix.
/// Example: `2026-08-01T14-03-22Z-9f3a61b2`.
pub fn generate_run_id(now: DateTime<Utc>) -> String {
    let stamp = now.format("%Y-%m-%dT%H-%M-%SZ");
    let mut raw = [0u8; 4];
    let suffix = match getrandom::getrandom(&mut raw) {
        Ok(()) => raw.iter().map(|b| format!("{b:02x}")).collect::<String>(),
        Err(_) => format!("{:08x}", std::process::id()),
    };
    format!("{stamp}-{suffix}")
}

pub fn validate_run_id(raw: &str) -> Result<(), String> {
    validate_identifier_value("run id", raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn step_ids_reject_path_characters() {
        assert!(StepId::parse("build-step_1").is_ok());
        assert!(StepId::parse("").is_err());
        assert!(StepId::parse("../escape").is_err());
        assert!(StepId::parse("a/b").is_err());
    }

    #[test]
    fn run_ids_sort_by_generation_time() {
        let earlier = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 1).unwrap();
        let a = generate_run_id(earlier);
        let b = generate_run_id(later);
        assert!(a < b);
        assert!(validate_run_id(&a).is_ok());
    }
}
