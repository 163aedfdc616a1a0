use serde::{Deserialize, Serialize};

// Keys are assigned by the backend and treated as opaque strings.
macro_rules! opaque_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

opaque_id!(
    /// Key of a channel under `channels/`.
    ChannelId
);

opaque_id!(
    /// Key of a message under `channels/{id}/messages/`.
    MessageId
);

opaque_id!(
    /// Identity of a chat participant (the auth uid on the hosted backend).
    ParticipantId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_their_key() {
        let id = ChannelId::from("-Kx01");
        assert_eq!(id.to_string(), "-Kx01");
        assert_eq!(id.as_str(), "-Kx01");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = MessageId::new("m1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"m1\"");
    }
}
