use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(ConversationId);
id_newtype!(SenderId);
id_newtype!(MessageId);
id_newtype!(GroupId);

/// A resolved, runtime-stable recipient handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub id: String,
    pub display_name: String,
}

/// One inbound message event as delivered by a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub conversation_id: ConversationId,
    pub sender_id: SenderId,
    pub sender_name: String,
    pub message_id: MessageId,
    /// Text or caption; empty for bare media parts.
    pub text: String,
    /// Present when the message is one part of a multi-part media group.
    pub group_id: Option<GroupId>,
    pub reply_to_id: Option<MessageId>,
    /// True when the replied-to message was authored by this account.
    pub reply_to_self: bool,
    pub is_private: bool,
    pub received_at: DateTime<Utc>,
}
