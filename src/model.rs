use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Telegram user id of a broadcast recipient. Always positive.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct RecipientId(i64);

impl RecipientId {
    pub fn new(id: i64) -> Option<Self> {
        (id > 0).then_some(Self(id))
    }

    pub fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RecipientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FormatMode {
    #[default]
    None,
    #[value(alias = "HTML")]
    Html,
    #[value(alias = "MARKDOWN_V2")]
    MarkdownV2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRef {
    Url(Url),
    Path(PathBuf),
}

impl ImageRef {
    /// `http://` and `https://` references are passed to Telegram as-is;
    /// everything else is a local file uploaded with the request.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(anyhow!("image reference must be non-empty"));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url = Url::parse(raw).with_context(|| format!("invalid image URL {raw}"))?;
            return Ok(ImageRef::Url(url));
        }
        Ok(ImageRef::Path(PathBuf::from(raw)))
    }
}

/// Content of one dispatch run. Exactly one shape per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text {
        text: String,
        format: FormatMode,
    },
    Image {
        image: ImageRef,
        caption: Option<String>,
        format: FormatMode,
    },
}

impl Payload {
    pub fn new(message: &str, image: Option<ImageRef>, format: FormatMode) -> Self {
        match image {
            Some(image) => Payload::Image {
                image,
                caption: (!message.is_empty()).then(|| message.to_string()),
                format,
            },
            None => Payload::Text {
                text: message.to_string(),
                format,
            },
        }
    }

    pub fn format(&self) -> FormatMode {
        match self {
            Payload::Text { format, .. } | Payload::Image { format, .. } => *format,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeKind {
    Delivered,
    DeliveredAfterRetry,
    Forbidden { reason: String },
    Failed { error: String },
}

/// Terminal result for one recipient. Created once, never revised.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Outcome {
    pub recipient: RecipientId,
    #[serde(flatten)]
    pub kind: OutcomeKind,
}

/// A stored user document, as the admin tooling sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: String,
    pub active: bool,
    pub total_used: Option<i64>,
    pub interval_time: Option<i64>,
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub last_used: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertResult {
    Created,
    Updated,
}

impl UpsertResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertResult::Created => "created",
            UpsertResult::Updated => "updated",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_ids_are_positive() {
        assert!(RecipientId::new(0).is_none());
        assert!(RecipientId::new(-42).is_none());
        assert_eq!(RecipientId::new(7).map(RecipientId::get), Some(7));
    }

    #[test]
    fn image_reference_kinds() {
        match ImageRef::parse("https://cdn.example/pic.jpg").unwrap() {
            ImageRef::Url(url) => assert_eq!(url.host_str(), Some("cdn.example")),
            other => panic!("expected url, got {other:?}"),
        }
        assert_eq!(
            ImageRef::parse("./pics/promo.png").unwrap(),
            ImageRef::Path(PathBuf::from("./pics/promo.png"))
        );
        assert!(ImageRef::parse("   ").is_err());
        assert!(ImageRef::parse("http://").is_err());
    }

    #[test]
    fn empty_message_means_no_caption() {
        let image = ImageRef::parse("/tmp/a.png").unwrap();
        let payload = Payload::new("", Some(image), FormatMode::Html);
        match payload {
            Payload::Image { caption, format, .. } => {
                assert_eq!(caption, None);
                assert_eq!(format, FormatMode::Html);
            }
            other => panic!("expected image payload, got {other:?}"),
        }

        let payload = Payload::new("hello", None, FormatMode::None);
        assert_eq!(
            payload,
            Payload::Text {
                text: "hello".into(),
                format: FormatMode::None
            }
        );
    }
}
