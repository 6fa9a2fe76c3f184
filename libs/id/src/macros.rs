//! Macros for defining typed ID types.

/// Macro to define a typed ID backed by a UUID.
///
/// This generates a newtype wrapper around `Uuid` with:
/// - A `KIND` constant used in error messages and logs
/// - `new()` to generate a fresh random ID
/// - `parse()` to parse from string (trimmed, case-insensitive)
/// - `Display` and `FromStr` implementations
/// - `Serialize` and `Deserialize` implementations
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(CampaignId, "campaign id");
///
/// let campaign_id = CampaignId::new();
/// let parsed: CampaignId = "84197fc8-830a-4a8e-8339-7a70c2bfa104".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        /// A typed ID for this entity type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Uuid);

        impl $name {
            /// Human readable kind of this ID.
            pub const KIND: &'static str = $kind;

            /// Creates a new ID with a fresh random UUID.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Uuid::new_v4())
            }

            /// Creates an ID from a raw UUID.
            #[must_use]
            pub const fn from_uuid(uuid: $crate::Uuid) -> Self {
                Self(uuid)
            }

            /// Creates an ID from a 128-bit value. Handy for deterministic fixtures.
            #[must_use]
            pub const fn from_u128(value: u128) -> Self {
                Self($crate::Uuid::from_u128(value))
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> $crate::Uuid {
                self.0
            }

            /// Parses an ID from a string.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                let s = s.trim();
                if s.is_empty() {
                    return Err($crate::IdError::Empty { kind: Self::KIND });
                }

                let uuid = $crate::Uuid::parse_str(s).map_err(|e| $crate::IdError::InvalidUuid {
                    kind: Self::KIND,
                    message: e.to_string(),
                })?;

                Ok(Self(uuid))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }

        impl AsRef<$crate::Uuid> for $name {
            fn as_ref(&self) -> &$crate::Uuid {
                &self.0
            }
        }
    };
}
