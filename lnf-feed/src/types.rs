use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
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

id_newtype!(MessageId);
id_newtype!(UserId);

/// An account on the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub screen_name: String,
}

impl User {
    pub fn new(id: impl Into<UserId>, screen_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            screen_name: screen_name.into(),
        }
    }

    /// `@screen_name`, ready to be placed in a message body.
    pub fn handle(&self) -> String {
        format!("@{}", self.screen_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedMessage {
    pub id: MessageId,
    pub author: User,
    /// Full body text, never truncated.
    pub text: String,
    #[serde(default)]
    pub in_reply_to: Option<MessageId>,
    /// Mentioned accounts in body order.
    #[serde(default)]
    pub mentions: Vec<User>,
    /// True when the message re-shares another message instead of carrying its own content.
    #[serde(default)]
    pub is_reshare: bool,
    pub received_at: DateTime<Utc>,
}

impl FeedMessage {
    /// Mentions that are none of `excluded`, in body order.
    pub fn mentions_except<'a>(
        &'a self,
        excluded: &'a [&'a UserId],
    ) -> impl Iterator<Item = &'a User> + 'a {
        self.mentions
            .iter()
            .filter(move |u| !excluded.iter().any(|id| **id == u.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mentions_except_keeps_order_and_skips_excluded() {
        let me = UserId::new("1");
        let author = UserId::new("2");
        let msg = FeedMessage {
            id: "100".into(),
            author: User::new("2", "peer1"),
            text: "@lnfeedbot @peerbot1 @other".to_string(),
            in_reply_to: None,
            mentions: vec![
                User::new("1", "lnfeedbot"),
                User::new("3", "peerbot1"),
                User::new("4", "other"),
                User::new("2", "peer1"),
            ],
            is_reshare: false,
            received_at: Utc::now(),
        };
        let excluded = [&me, &author];
        let names: Vec<&str> = msg
            .mentions_except(&excluded)
            .map(|u| u.screen_name.as_str())
            .collect();
        assert_eq!(names, vec!["peerbot1", "other"]);
    }
}
