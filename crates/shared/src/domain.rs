use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(UserId);
id_newtype!(GroupId);
id_newtype!(ChatId);
id_newtype!(MessageId);

/// A conversation a consumer can ask to receive push notifications for.
///
/// Only group conversations have a dedicated push channel; direct chats are
/// delivered over the current user's personal channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conversation {
    Group { group_id: GroupId },
    Chat { chat_id: ChatId },
}

/// Push channel name for a group conversation.
pub fn group_channel(group_id: GroupId) -> String {
    format!("/group/{}", group_id.0)
}

/// Push channel name for a user's personal notifications.
pub fn user_channel(user_id: UserId) -> String {
    format!("/user/{}", user_id.0)
}
