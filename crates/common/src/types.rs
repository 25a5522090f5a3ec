use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps an existing identifier.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a trading account.
    ///
    /// Account ids are opaque strings chosen by the owning service; they are
    /// not required to be UUIDs.
    AccountId
);

string_id!(
    /// Identifier of the client (customer) owning one or more accounts.
    ClientId
);

string_id!(
    /// Identifier scoping the idempotency of one operation.
    ///
    /// Either supplied by the caller or generated with [`OperationId::generate`].
    /// Unique per operation type.
    OperationId
);

impl OperationId {
    /// Generates a new random operation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}

impl AccountId {
    /// Generates a new random account id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }
}
