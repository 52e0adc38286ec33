//! Typed identifiers for the values the graph is keyed by.
//!
//! Keys are compared structurally, so `(IdentityToken, SectionId)` can never
//! collide with another key that happens to concatenate to the same string.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }
    };
}

string_id! {
    /// Opaque token for the signed-in user. Absence means signed out.
    IdentityToken
}

string_id!(CourseId);
string_id!(SectionId);
string_id!(TaskId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_transparently() {
        let id = SectionId::new("sec-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"sec-1\"");
        assert_eq!(id.to_string(), "sec-1");
    }

    #[test]
    fn tuple_keys_do_not_collide() {
        let a = (IdentityToken::from("ab"), SectionId::from("c"));
        let b = (IdentityToken::from("a"), SectionId::from("bc"));
        assert_ne!(a, b);
    }
}
