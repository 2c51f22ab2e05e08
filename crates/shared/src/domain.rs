use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(ChannelId);
id_newtype!(MessageId);

macro_rules! string_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_newtype!(ConnectionId);
string_newtype!(IdempotencyKey);
string_newtype!(ResourceScope);

impl IdempotencyKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ResourceScope {
    pub fn channel(channel_id: ChannelId) -> Self {
        Self(format!("channel:{}", channel_id.0))
    }

    pub fn user(user_id: UserId) -> Self {
        Self(format!("user:{}", user_id.0))
    }

    /// Returns the channel id for `channel:<id>` scopes.
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.0
            .strip_prefix("channel:")
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(ChannelId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Messaging,
    Livestream,
    Team,
}
