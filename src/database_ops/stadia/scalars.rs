//! Identifier and scalar types shared by the wire parsers and the cache tables.
//!
//! Each type validates on construction (including when deserialized), so a
//! value that exists is known to be well-formed.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::util::proto::Proto;
use crate::util::sql::SqlValue;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{value:?} is not a valid {kind}")]
pub struct ScalarError {
    pub kind: &'static str,
    pub value: String,
}

impl ScalarError {
    fn new(kind: &'static str, value: impl fmt::Display) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

macro_rules! string_scalar {
    ($(#[$meta:meta])* $name:ident, $pattern:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            fn pattern() -> &'static Regex {
                static PATTERN: OnceLock<Regex> = OnceLock::new();
                PATTERN.get_or_init(|| Regex::new($pattern).expect("static regex"))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ScalarError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                if Self::pattern().is_match(&value) {
                    Ok(Self(value))
                } else {
                    Err(ScalarError::new(stringify!($name), value))
                }
            }
        }

        impl TryFrom<&str> for $name {
            type Error = ScalarError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::try_from(value.to_string())
            }
        }

        impl FromStr for $name {
            type Err = ScalarError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::try_from(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&$name> for SqlValue {
            fn from(value: &$name) -> Self {
                SqlValue::Text(value.0.clone())
            }
        }

        impl From<&$name> for Proto {
            fn from(value: &$name) -> Self {
                Proto::String(value.0.clone())
            }
        }
    };
}

macro_rules! integer_scalar {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "u64", into = "u64")]
        pub struct $name(u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl TryFrom<u64> for $name {
            type Error = ScalarError;

            fn try_from(value: u64) -> Result<Self, Self::Error> {
                if value > 0 {
                    Ok(Self(value))
                } else {
                    Err(ScalarError::new(stringify!($name), value))
                }
            }
        }

        impl FromStr for $name {
            type Err = ScalarError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                value
                    .parse::<u64>()
                    .map_err(|_| ScalarError::new(stringify!($name), value))
                    .and_then(Self::try_from)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&$name> for SqlValue {
            fn from(value: &$name) -> Self {
                SqlValue::from(value.0)
            }
        }

        impl From<&$name> for Proto {
            fn from(value: &$name) -> Self {
                Proto::from(value.0)
            }
        }
    };
}

macro_rules! uuid_scalar {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(Uuid);

        impl $name {
            pub fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl TryFrom<String> for $name {
            type Error = ScalarError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Uuid::parse_str(&value)
                    .map(Self)
                    .map_err(|_| ScalarError::new(stringify!($name), value))
            }
        }

        impl FromStr for $name {
            type Err = ScalarError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::try_from(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0.hyphenated().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl From<&$name> for SqlValue {
            fn from(value: &$name) -> Self {
                SqlValue::Text(value.to_string())
            }
        }

        impl From<&$name> for Proto {
            fn from(value: &$name) -> Self {
                Proto::String(value.to_string())
            }
        }
    };
}

string_scalar!(GameId, r"^[0-9a-f]+rcp1$");
string_scalar!(SkuId, r"^[0-9a-f]+p?$");
string_scalar!(OrganizationId, r"^[0-9a-f]+pup1$");
string_scalar!(
    /// Decimal account number; the service never hands out fewer than four digits.
    PlayerId,
    r"^[1-9][0-9]{3,}$"
);
string_scalar!(PlayerName, r"(?i)^[a-z][a-z0-9]{2,14}$");
string_scalar!(PlayerNumber, r"^(0000|[1-9][0-9]{3})$");
string_scalar!(
    /// Search prefix: a name prefix, optionally followed by `#` and a partial number.
    GamertagPrefix,
    r"^[a-z][a-z0-9]{1,15}(#(([1-9][0-9]{0,3})|0{0,4})?)?$"
);

integer_scalar!(StoreListId);
integer_scalar!(SubscriptionId);

uuid_scalar!(CaptureId);
uuid_scalar!(StateId);

/// Keys for the account-level tables, each of which holds exactly one record.
macro_rules! singleton_key {
    ($name:ident, $literal:literal) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name;

        impl $name {
            pub const LITERAL: &'static str = $literal;
        }

        impl TryFrom<String> for $name {
            type Error = ScalarError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                if value == $literal {
                    Ok(Self)
                } else {
                    Err(ScalarError::new(stringify!($name), value))
                }
            }
        }

        impl FromStr for $name {
            type Err = ScalarError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::try_from(value.to_string())
            }
        }

        impl From<$name> for String {
            fn from(_: $name) -> Self {
                $literal.to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str($literal)
            }
        }

        impl From<&$name> for SqlValue {
            fn from(_: &$name) -> Self {
                SqlValue::Text($literal.to_string())
            }
        }

        impl From<&$name> for Proto {
            fn from(_: &$name) -> Self {
                Proto::String($literal.to_string())
            }
        }
    };
}

singleton_key!(MyGamesKey, "myGames");
singleton_key!(MyPurchasesKey, "myPurchases");
singleton_key!(MyFriendsKey, "myFriends");
singleton_key!(MyRecentPlayersKey, "myRecentPlayers");
