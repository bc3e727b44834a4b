use serde::{Deserialize, Serialize};

/// Body of a message posted to an incoming webhook.
/// Optional keys are left out of the serialized JSON entirely when not set.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct WebhookMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_emoji: Option<String>,
}

/// Display overrides configured for a webhook destination rather than carried by records.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct MessageOverrides {
    pub username: Option<String>,
    pub icon_url: Option<String>,
    pub icon_emoji: Option<String>,
}

impl WebhookMessage {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_owned(),
            ..Default::default()
        }
    }

    /// Fill in destination overrides for anything the message does not set itself.
    /// The receiving service shows either an icon URL or an emoji, so a configured icon only
    /// applies when the message carries neither.
    pub fn apply_overrides(&mut self, overrides: &MessageOverrides) {
        if self.username.is_none() {
            self.username.clone_from(&overrides.username);
        }

        if self.icon_url.is_none() && self.icon_emoji.is_none() {
            self.icon_url.clone_from(&overrides.icon_url);
            self.icon_emoji.clone_from(&overrides.icon_emoji);
        }
    }

    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
