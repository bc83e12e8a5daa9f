//! # Domain Models
//!
//! These structs represent the entities the relay core works with.
//! Platform identifiers are opaque snowflake-style integers; they are
//! wrapped in newtypes so a channel can never be passed where a user is
//! expected.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! snowflake {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map($name)
            }
        }
    };
}

snowflake!(
    /// A user on the chat platform (recipients, operators and the bot itself).
    UserId
);
snowflake!(
    /// A channel: relay channel, private (DM) channel, log channel or category.
    ChannelId
);
snowflake!(
    /// A single message inside a channel.
    MessageId
);

/// Minimal reference to a user, enough to credit an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: UserId,
    pub name: String,
}

/// The author of a message as delivered by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Author {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub bot: bool,
    /// When the platform account was created.
    pub created_at: DateTime<Utc>,
    /// When the user joined the served community, if they are a member.
    #[serde(default)]
    pub joined_at: Option<DateTime<Utc>>,
}

impl Author {
    pub fn to_user_ref(&self) -> UserRef {
        UserRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

/// A message observed on the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author: Author,
    #[serde(default)]
    pub content: String,
    /// Attachment URLs.
    #[serde(default)]
    pub attachments: Vec<String>,
    /// True when the message was sent in a private (DM) channel.
    #[serde(default)]
    pub private: bool,
    /// Timestamp carried by the message card, if the bot attached one.
    #[serde(default)]
    pub stamp: Option<DateTime<Utc>>,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Content plus one line per attachment.
    pub fn body(&self) -> String {
        let mut body = self.content.clone();
        for url in &self.attachments {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str("📎 ");
            body.push_str(url);
        }
        body
    }
}

/// A message the relay asks the transport to post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub title: Option<String>,
    pub body: String,
    pub footer: Option<String>,
    /// Card timestamp. The creation response carries the thread's
    /// `created_at` here so it can later be recognised.
    pub stamp: Option<DateTime<Utc>>,
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn titled(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            body: body.into(),
            ..Self::default()
        }
    }

    pub fn with_footer(mut self, footer: impl Into<String>) -> Self {
        self.footer = Some(footer.into());
        self
    }

    pub fn stamped(mut self, stamp: DateTime<Utc>) -> Self {
        self.stamp = Some(stamp);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Category,
    Private,
}

/// Channel metadata returned by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub category: Option<ChannelId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Open,
    Closing,
    Closed,
}

/// Who ended a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Closer {
    User { id: UserId, name: String },
    /// Inactivity auto-close, or a closure with no attributable user.
    Automatic,
}

impl Closer {
    pub fn user(id: UserId, name: impl Into<String>) -> Self {
        Closer::User {
            id,
            name: name.into(),
        }
    }

    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Closer::User { id, .. } => Some(*id),
            Closer::Automatic => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Closer::User { name, .. } => name,
            Closer::Automatic => "Automatic",
        }
    }
}

impl From<UserRef> for Closer {
    fn from(user: UserRef) -> Self {
        Closer::User {
            id: user.id,
            name: user.name,
        }
    }
}

/// Arguments of a close call.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseRequest {
    pub closer: Closer,
    /// Zero closes immediately.
    pub after: Duration,
    /// Suppress the notice sent to the recipient.
    pub silent: bool,
    pub delete_channel: bool,
    /// Replaces the default closing notice.
    pub message: Option<String>,
    pub auto_close: bool,
}

impl CloseRequest {
    pub fn new(closer: Closer) -> Self {
        Self {
            closer,
            after: Duration::zero(),
            silent: false,
            delete_channel: true,
            message: None,
            auto_close: false,
        }
    }

    /// An inactivity close, scheduled `after` from now.
    pub fn automatic(after: Duration) -> Self {
        Self {
            after,
            auto_close: true,
            ..Self::new(Closer::Automatic)
        }
    }

    pub fn after(mut self, after: Duration) -> Self {
        self.after = after;
        self
    }

    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    pub fn keep_channel(mut self) -> Self {
        self.delete_channel = false;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn into_closure(self, recipient_id: UserId, now: DateTime<Utc>) -> PendingClosure {
        PendingClosure {
            recipient_id,
            fire_at: now + self.after,
            closer: self.closer,
            silent: self.silent,
            delete_channel: self.delete_channel,
            message: self.message,
            auto_close: self.auto_close,
        }
    }
}

/// A scheduled closure. Persisted so a restart can recompute the delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingClosure {
    pub recipient_id: UserId,
    pub fire_at: DateTime<Utc>,
    pub closer: Closer,
    pub silent: bool,
    pub delete_channel: bool,
    pub message: Option<String>,
    #[serde(default)]
    pub auto_close: bool,
}

/// A block on a subject. The kind is derived from `reason`, see
/// [`crate::block::BlockKind::classify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub subject_id: UserId,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// The audit record of one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadLog {
    /// Short public key used to reference the log.
    pub key: String,
    pub recipient_id: UserId,
    pub recipient_name: String,
    pub channel_id: ChannelId,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closer: Option<Closer>,
    pub close_message: Option<String>,
}

impl ThreadLog {
    pub fn open(recipient: &Author, channel_id: ChannelId, created_at: DateTime<Utc>) -> Self {
        let mut key = Uuid::new_v4().simple().to_string();
        key.truncate(12);
        Self {
            key,
            recipient_id: recipient.id,
            recipient_name: recipient.name.clone(),
            channel_id,
            created_at,
            closed_at: None,
            closer: None,
            close_message: None,
        }
    }
}

/// Closing details written onto a [`ThreadLog`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedLog {
    pub closer: Closer,
    pub message: Option<String>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Sent by the recipient.
    ThreadMessage,
    /// Operator reply delivered to the recipient.
    Reply,
    /// Operator chatter in the relay channel, never delivered.
    Internal,
}

/// One message inside a thread log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message_id: MessageId,
    pub author: UserRef,
    pub content: String,
    pub kind: LogKind,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn from_message(message: &ChatMessage, kind: LogKind) -> Self {
        Self {
            message_id: message.id,
            author: message.author.to_user_ref(),
            content: message.body(),
            kind,
            created_at: message.sent_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkOrigin {
    Recipient,
    Operator,
}

/// Persisted pairing of a relay-channel message with its private-channel
/// counterpart. Replaces scanning channel history for embedded ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageLink {
    pub recipient_id: UserId,
    pub relay_channel: ChannelId,
    pub relay_message: MessageId,
    pub private_channel: ChannelId,
    pub private_message: MessageId,
    pub origin: LinkOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionEvent {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub user_id: UserId,
    /// Display name of the reactor, used to credit a close.
    #[serde(default)]
    pub user_name: Option<String>,
    pub emoji: String,
    #[serde(default)]
    pub private: bool,
}

/// Events delivered by the chat gateway, one at a time per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayEvent {
    MessageReceived {
        message: ChatMessage,
    },
    /// An operator reply command already parsed by the gateway bridge.
    ReplyCommand {
        message: ChatMessage,
    },
    /// `message.content` holds the edited content.
    MessageEdited {
        message: ChatMessage,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    ReactionAdded(ReactionEvent),
    ChannelDeleted {
        channel: ChannelInfo,
        #[serde(default)]
        deleted_by: Option<UserRef>,
    },
    MemberJoined {
        user_id: UserId,
    },
    MemberRemoved {
        user_id: UserId,
    },
    Typing {
        channel_id: ChannelId,
        user_id: UserId,
        #[serde(default)]
        private: bool,
    },
}
