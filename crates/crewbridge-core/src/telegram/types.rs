//! Telegram Bot API wire types.
//!
//! Only the fields the bridge actually reads are modeled; everything else in
//! an update is ignored by serde.

use serde::{Deserialize, Serialize};

/// One incoming update from the webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub reply_to_message: Option<Box<Message>>,
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub photo: Option<Vec<PhotoSize>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub file_id: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: i64,
    pub height: i64,
    #[serde(default)]
    pub file_size: Option<i64>,
}

/// `getFile` result: the download path on Telegram's file server.
#[derive(Debug, Clone, Deserialize)]
pub struct File {
    #[serde(default)]
    pub file_path: Option<String>,
}

/// `getMe` result.
#[derive(Debug, Clone, Deserialize)]
pub struct Me {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

/// `getWebhookInfo` result.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookInfo {
    #[serde(default)]
    pub url: String,
}

/// One slash-command menu entry for `setMyCommands`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BotCommand {
    pub command: String,
    pub description: String,
}

impl Message {
    /// The largest photo variant, by pixel area.
    pub fn largest_photo(&self) -> Option<&PhotoSize> {
        self.photo
            .as_deref()?
            .iter()
            .max_by_key(|p| p.width * p.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_parses_minimal_message() {
        let json = r#"{
            "update_id": 7,
            "message": {
                "message_id": 1,
                "chat": {"id": 42},
                "from": {"id": 42},
                "text": "/team"
            }
        }"#;
        let update: Update = serde_json::from_str(json).unwrap();
        let msg = update.message.unwrap();
        assert_eq!(msg.chat.id, 42);
        assert_eq!(msg.text.as_deref(), Some("/team"));
        assert!(msg.photo.is_none());
    }

    #[test]
    fn test_largest_photo_by_area() {
        let json = r#"{
            "message_id": 1,
            "chat": {"id": 42},
            "photo": [
                {"file_id": "small", "width": 90, "height": 60},
                {"file_id": "big", "width": 1280, "height": 960},
                {"file_id": "mid", "width": 320, "height": 240}
            ]
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.largest_photo().unwrap().file_id, "big");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let json = r#"{"update_id": 1, "edited_message": {"anything": true}}"#;
        let update: Update = serde_json::from_str(json).unwrap();
        assert!(update.message.is_none());
    }
}
