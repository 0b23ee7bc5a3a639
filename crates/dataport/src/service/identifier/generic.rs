use std::{ops::Deref, str::FromStr};

use serde::{Deserialize, Serialize};

macro_rules! define_id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord, Copy)]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            #[must_use]
            pub fn new(id: uuid::Uuid) -> Self {
                Self(id)
            }

            #[must_use]
            pub fn new_random() -> Self {
                Self(uuid::Uuid::now_v7())
            }
        }

        impl Deref for $name {
            type Target = uuid::Uuid;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(value: uuid::Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$name> for uuid::Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl AsRef<uuid::Uuid> for $name {
            fn as_ref(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        // Deserialize is separately implemented to provide better error messages
        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> std::result::Result<$name, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Ok($name::from(uuid::Uuid::from_str(&s).map_err(|_| {
                    serde::de::Error::custom(format!(
                        "Provided {} is not a valid UUID. Got {s}.",
                        stringify!($name),
                    ))
                })?))
            }
        }
    };
}

define_id_type!(DatasetId);
define_id_type!(JobId);
define_id_type!(AccessId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde() {
        let id = DatasetId::new_random();
        let serialized = serde_json::to_value(id).unwrap();
        assert_eq!(serialized, serde_json::json!(id.0.to_string()));
        let deserialized: DatasetId = serde_json::from_value(serialized).unwrap();
        assert_eq!(id, deserialized);
    }

    #[test]
    fn test_type_name_in_error() {
        let err = serde_json::from_value::<JobId>(serde_json::json!("not-a-uuid")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Provided JobId is not a valid UUID. Got not-a-uuid."
        );
    }
}
