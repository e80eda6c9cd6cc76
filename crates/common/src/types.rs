//! Message descriptors shared by the transport and dispatch crates.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A remotely hosted file the gateway fetches and forwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRef {
    pub url: String,
    pub filename: String,
    pub mimetype: String,
}

/// Which media endpoint a file goes through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    File,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::File => "file",
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File payload plus the optional caption and quoted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    pub file: FileRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// One outbound chat message. Batches are ordered lists of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    #[serde(rename_all = "camelCase")]
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    Image(MediaMessage),
    File(MediaMessage),
}

impl OutboundMessage {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            reply_to: None,
        }
    }

    #[must_use]
    pub fn media(kind: MediaKind, media: MediaMessage) -> Self {
        match kind {
            MediaKind::Image => Self::Image(media),
            MediaKind::File => Self::File(media),
        }
    }

    /// Short kind label used in logs and events.
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image(_) => "image",
            Self::File(_) => "file",
        }
    }

    /// Media kind and body, or `None` for text.
    #[must_use]
    pub fn as_media(&self) -> Option<(MediaKind, &MediaMessage)> {
        match self {
            Self::Text { .. } => None,
            Self::Image(m) => Some((MediaKind::Image, m)),
            Self::File(m) => Some((MediaKind::File, m)),
        }
    }

    /// Reject messages the gateway could never deliver.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Text { text, .. } => {
                if text.trim().is_empty() {
                    return Err(Error::invalid("text", "must not be empty"));
                }
            },
            Self::Image(m) | Self::File(m) => {
                if m.file.url.trim().is_empty() {
                    return Err(Error::invalid("file.url", "must not be empty"));
                }
                if m.file.filename.trim().is_empty() {
                    return Err(Error::invalid("file.filename", "must not be empty"));
                }
                if m.file.mimetype.trim().is_empty() {
                    return Err(Error::invalid("file.mimetype", "must not be empty"));
                }
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sample_file() -> FileRef {
        FileRef {
            url: "https://cdn.example.com/a.png".into(),
            filename: "a.png".into(),
            mimetype: "image/png".into(),
        }
    }

    #[test]
    fn text_message_wire_shape() {
        let msg = OutboundMessage::Text {
            text: "hola".into(),
            reply_to: Some("false_123@c.us_AAA".into()),
        };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["text"], "hola");
        assert_eq!(v["replyTo"], "false_123@c.us_AAA");
    }

    #[test]
    fn media_message_parses_without_optionals() {
        let json = r#"{
            "type": "image",
            "file": { "url": "https://x/y.jpg", "filename": "y.jpg", "mimetype": "image/jpeg" }
        }"#;
        let msg: OutboundMessage = serde_json::from_str(json).unwrap();
        let (kind, media) = msg.as_media().unwrap();
        assert_eq!(kind, MediaKind::Image);
        assert!(media.caption.is_none());
        assert!(media.reply_to.is_none());
    }

    #[test]
    fn validate_rejects_blank_text() {
        let err = OutboundMessage::text("   ").validate().unwrap_err();
        assert!(err.to_string().contains("text"));
    }

    #[test]
    fn validate_rejects_missing_url() {
        let mut file = sample_file();
        file.url = String::new();
        let msg = OutboundMessage::media(MediaKind::File, MediaMessage {
            file,
            caption: None,
            reply_to: None,
        });
        assert!(msg.validate().is_err());
    }

    #[test]
    fn media_constructor_picks_variant() {
        let m = MediaMessage {
            file: sample_file(),
            caption: Some("look".into()),
            reply_to: None,
        };
        assert_eq!(
            OutboundMessage::media(MediaKind::File, m.clone()).kind_str(),
            "file"
        );
        assert_eq!(OutboundMessage::media(MediaKind::Image, m).kind_str(), "image");
    }
}
