//! Crate-internal macros.

/// Declares an enum whose variants each wrap one serde payload struct, and
/// derives the type-name dispatch used to persist it.
///
/// The variant name doubles as the persisted type name (`event_type` for
/// events, `commandClass` for commands), so renaming a variant is a breaking
/// change for existing event logs.
macro_rules! payload_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident($payload:ty)
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant($payload),
            )+
        }

        impl $name {
            /// Every type name this enum can be decoded from.
            pub const TYPE_NAMES: &'static [&'static str] = &[$(stringify!($variant)),+];

            /// Returns the persisted type name of this value.
            pub fn type_name(&self) -> &'static str {
                match self {
                    $($name::$variant(_) => stringify!($variant),)+
                }
            }

            /// Serializes the wrapped payload.
            pub fn to_json_value(&self) -> crate::Result<serde_json::Value> {
                Ok(match self {
                    $($name::$variant(payload) => serde_json::to_value(payload)?,)+
                })
            }

            /// Decodes a payload given its persisted type name.
            pub fn from_json_value(type_name: &str, value: serde_json::Value) -> crate::Result<Self> {
                $(
                    if type_name == stringify!($variant) {
                        return Ok($name::$variant(serde_json::from_value(value)?));
                    }
                )+
                Err(crate::Error::Schema(format!(
                    "unknown {} type '{}'",
                    stringify!($name),
                    type_name
                )))
            }
        }

        $(
            impl From<$payload> for $name {
                fn from(payload: $payload) -> Self {
                    $name::$variant(payload)
                }
            }
        )+
    };
}

/// Declares a validated string newtype.
///
/// The generated type can only be constructed through `new`, which runs the
/// given validator. Deserialization goes through the same validator, so an
/// invalid identifier can never be read back from the event log either.
macro_rules! string_id {
    (
        $(#[$meta:meta])*
        $name:ident, $validate:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validates and wraps the given string.
            pub fn new(value: impl Into<String>) -> crate::Result<Self> {
                let value = value.into();
                let validate: fn(&str) -> bool = $validate;
                if validate(&value) {
                    Ok(Self(value))
                } else {
                    Err(crate::Error::InvalidIdentifier(format!(
                        "'{}' is not a valid {}",
                        value,
                        stringify!($name)
                    )))
                }
            }

            /// Returns the string representation.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = crate::Error;

            fn try_from(value: String) -> crate::Result<Self> {
                Self::new(value)
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::Error;

            fn from_str(value: &str) -> crate::Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.0
            }
        }
    };
}
