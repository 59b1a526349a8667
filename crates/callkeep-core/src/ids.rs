use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Separator between the value and the backend domain of a qualified id.
pub const DOMAIN_SEPARATOR: char = '@';

/// A backend-qualified identifier: `value@domain`.
///
/// The domain may be empty for ids coming from a single-backend context,
/// in which case the display form is just the value.
#[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct QualifiedId {
    value: String,
    domain: String,
}

impl QualifiedId {
    pub fn new(value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            domain: domain.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for QualifiedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.domain.is_empty() {
            f.write_str(&self.value)
        } else {
            write!(f, "{}{}{}", self.value, DOMAIN_SEPARATOR, self.domain)
        }
    }
}

impl FromStr for QualifiedId {
    type Err = std::convert::Infallible;

    // Domains never contain '@', values might: split on the last one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.rsplit_once(DOMAIN_SEPARATOR) {
            Some((value, domain)) => Self::new(value, domain),
            None => Self::new(s, ""),
        })
    }
}

macro_rules! qualified_id {
    ($name:ident) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(into = "String", from = "String")]
        pub struct $name(QualifiedId);

        impl $name {
            pub fn new(value: impl Into<String>, domain: impl Into<String>) -> Self {
                Self(QualifiedId::new(value, domain))
            }

            /// Fresh id on the given domain, mostly useful in tests and demos.
            pub fn random(domain: impl Into<String>) -> Self {
                Self::new(Uuid::now_v7().to_string(), domain)
            }

            pub fn value(&self) -> &str {
                self.0.value()
            }

            pub fn domain(&self) -> &str {
                self.0.domain()
            }

            /// Same domain, different value.
            pub fn with_value(&self, value: impl Into<String>) -> Self {
                Self::new(value, self.0.domain())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse().map(Self)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                match s.parse::<QualifiedId>() {
                    Ok(id) => Self(id),
                    Err(never) => match never {},
                }
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.to_string()
            }
        }
    };
}

qualified_id!(UserId);
qualified_id!(ConversationId);
