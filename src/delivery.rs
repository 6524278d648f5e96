//! Outbound delivery: one send per call, errors folded into four kinds.
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use teloxide::payloads::{SendMessageSetters, SendPhotoSetters};
use teloxide::requests::Requester;
use teloxide::types::{ChatId, InputFile, ParseMode};
use teloxide::{ApiError, Bot, RequestError};
use thiserror::Error;
use tracing::instrument;

use crate::model::{FormatMode, ImageRef, Payload, RecipientId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    /// The API asked us to wait before sending again.
    #[error("rate limited, retry after {}s", .0.as_secs())]
    RateLimited(Duration),
    /// Blocked the bot, deactivated, or never started a conversation.
    #[error("recipient unreachable: {0}")]
    Unreachable(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("transient failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, recipient: RecipientId, payload: &Payload) -> Result<(), SendError>;
}

#[derive(Debug, Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(token: &str) -> Self {
        Self {
            bot: Bot::new(token),
        }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    #[instrument(skip(self, payload))]
    async fn send(&self, recipient: RecipientId, payload: &Payload) -> Result<(), SendError> {
        let chat = ChatId(recipient.get());
        let parse_mode = parse_mode(payload.format());

        let result = match payload {
            Payload::Text { text, .. } => {
                let mut req = self
                    .bot
                    .send_message(chat, text.clone())
                    .disable_web_page_preview(true);
                if let Some(mode) = parse_mode {
                    req = req.parse_mode(mode);
                }
                req.await.map(|_| ())
            }
            Payload::Image { image, caption, .. } => {
                let photo = match image {
                    ImageRef::Url(url) => InputFile::url(url.clone()),
                    ImageRef::Path(path) => {
                        let bytes = read_local_image(path)
                            .await
                            .map_err(|err| SendError::Transient(format!("{}: {err}", path.display())))?;
                        InputFile::memory(bytes).file_name(upload_name(path))
                    }
                };
                let mut req = self.bot.send_photo(chat, photo);
                if let Some(caption) = caption {
                    req = req.caption(caption.clone());
                }
                if let Some(mode) = parse_mode {
                    req = req.parse_mode(mode);
                }
                req.await.map(|_| ())
            }
        };
        result.map_err(classify)
    }
}

fn parse_mode(format: FormatMode) -> Option<ParseMode> {
    match format {
        FormatMode::None => None,
        FormatMode::Html => Some(ParseMode::Html),
        FormatMode::MarkdownV2 => Some(ParseMode::MarkdownV2),
    }
}

/// Read a local image for a single upload. The file is opened and closed
/// inside this call; nothing holds the handle afterwards.
pub async fn read_local_image(path: &Path) -> std::io::Result<Vec<u8>> {
    tokio::fs::read(path).await
}

fn upload_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("image.jpg")
        .to_string()
}

/// Map a Telegram request error onto the delivery taxonomy. The Telegram
/// error text is kept for the report.
pub fn classify(err: RequestError) -> SendError {
    let description = err.to_string();
    match err {
        RequestError::RetryAfter(after) => SendError::RateLimited(after),
        RequestError::Api(api) if is_unreachable(&api) => SendError::Unreachable(description),
        RequestError::Api(_) | RequestError::MigrateToChatId(_) => SendError::Rejected(description),
        _ => SendError::Transient(description),
    }
}

fn is_unreachable(api: &ApiError) -> bool {
    match api {
        ApiError::BotBlocked
        | ApiError::CantInitiateConversation
        | ApiError::CantTalkWithBots
        | ApiError::UserDeactivated
        | ApiError::BotKicked
        | ApiError::BotKickedFromSupergroup => true,
        ApiError::Unknown(text) => text.starts_with("Forbidden"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn blocked_and_never_started_are_unreachable() {
        for api in [
            ApiError::BotBlocked,
            ApiError::CantInitiateConversation,
            ApiError::UserDeactivated,
            ApiError::Unknown("Forbidden: bot was kicked from the channel chat".into()),
        ] {
            match classify(RequestError::Api(api)) {
                SendError::Unreachable(desc) => assert!(!desc.is_empty()),
                other => panic!("expected unreachable, got {other:?}"),
            }
        }
    }

    #[test]
    fn other_api_errors_are_rejected() {
        for api in [
            ApiError::ChatNotFound,
            ApiError::MessageTextIsEmpty,
            ApiError::Unknown("Bad Request: can't parse entities".into()),
        ] {
            assert!(matches!(
                classify(RequestError::Api(api)),
                SendError::Rejected(_)
            ));
        }
    }

    #[test]
    fn io_errors_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "socket timed out");
        match classify(RequestError::Io(io)) {
            SendError::Transient(desc) => assert!(desc.contains("socket timed out")),
            other => panic!("expected transient, got {other:?}"),
        }
    }

    #[test]
    fn parse_modes() {
        assert_eq!(parse_mode(FormatMode::None), None);
        assert_eq!(parse_mode(FormatMode::Html), Some(ParseMode::Html));
        assert_eq!(parse_mode(FormatMode::MarkdownV2), Some(ParseMode::MarkdownV2));
    }

    #[test]
    fn upload_name_uses_file_name() {
        assert_eq!(upload_name(Path::new("/srv/pics/promo.png")), "promo.png");
        assert_eq!(upload_name(Path::new("/")), "image.jpg");
    }

    #[tokio::test]
    async fn local_image_read_and_missing_file() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("promo.jpg");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"\xff\xd8fake-jpeg")
            .unwrap();
        assert_eq!(read_local_image(&path).await.unwrap(), b"\xff\xd8fake-jpeg");
        assert!(read_local_image(&td.path().join("missing.jpg")).await.is_err());
    }

    #[cfg(target_os = "linux")]
    fn open_handles_to(path: &Path) -> usize {
        std::fs::read_dir("/proc/self/fd")
            .unwrap()
            .filter_map(|entry| std::fs::read_link(entry.ok()?.path()).ok())
            .filter(|target| target == path)
            .count()
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn local_image_handle_is_closed_after_read() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("handle.jpg");
        std::fs::write(&path, vec![7u8; 64 * 1024]).unwrap();
        let path = path.canonicalize().unwrap();

        let bytes = read_local_image(&path).await.unwrap();
        assert_eq!(bytes.len(), 64 * 1024);
        assert_eq!(open_handles_to(&path), 0);
    }

    /// One request captured by [`serve_once`].
    struct Captured {
        head: String,
        body: Vec<u8>,
    }

    impl Captured {
        fn json(&self) -> serde_json::Value {
            serde_json::from_slice(&self.body).unwrap()
        }

        fn body_contains(&self, needle: &[u8]) -> bool {
            self.body.windows(needle.len()).any(|w| w == needle)
        }
    }

    /// Accept a single Bot API request on a local port and answer it with
    /// `status` and the JSON `reply`.
    async fn serve_once(status: &'static str, reply: String) -> (Bot, tokio::task::JoinHandle<Captured>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = reqwest::Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            let head_end = loop {
                let n = sock.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed before headers");
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let lower = head.to_ascii_lowercase();
            let content_length = lower
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse::<usize>().unwrap());
            let chunked = lower.contains("transfer-encoding: chunked");
            loop {
                let body = &buf[head_end..];
                let complete = match content_length {
                    Some(len) => body.len() >= len,
                    None => !chunked || body.ends_with(b"0\r\n\r\n"),
                };
                if complete {
                    break;
                }
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                reply.len()
            );
            sock.write_all(response.as_bytes()).await.unwrap();
            let _ = sock.shutdown().await;
            Captured {
                head,
                body: buf[head_end..].to_vec(),
            }
        });
        (Bot::new("123:test").set_api_url(url), handle)
    }

    fn sent_message(content: &str) -> String {
        format!(
            r#"{{"ok":true,"result":{{"message_id":7,"from":{{"id":1,"is_bot":true,"first_name":"notifier","username":"notifier_bot"}},"chat":{{"id":42,"type":"private","first_name":"Ann"}},"date":1700000000,{content}}}}}"#
        )
    }

    fn sent_photo() -> String {
        sent_message(
            r#""photo":[{"file_id":"AgAD","file_unique_id":"AQAD","file_size":1024,"width":90,"height":90}],"caption":"hello""#,
        )
    }

    fn recipient() -> RecipientId {
        RecipientId::new(42).unwrap()
    }

    #[tokio::test]
    async fn text_send_disables_previews_and_sets_parse_mode() {
        let (bot, server) = serve_once("200 OK", sent_message(r#""text":"hello""#)).await;
        let messenger = TelegramMessenger { bot };
        let payload = Payload::new("<b>hello</b>", None, FormatMode::Html);

        messenger.send(recipient(), &payload).await.unwrap();

        let req = server.await.unwrap();
        assert!(req.head.starts_with("POST /bot123:test/sendMessage"), "{}", req.head);
        let body = req.json();
        assert_eq!(body["chat_id"], 42);
        assert_eq!(body["text"], "<b>hello</b>");
        assert_eq!(body["disable_web_page_preview"], true);
        assert_eq!(body["parse_mode"], "HTML");
    }

    #[tokio::test]
    async fn plain_text_has_no_parse_mode() {
        let (bot, server) = serve_once("200 OK", sent_message(r#""text":"hello""#)).await;
        let messenger = TelegramMessenger { bot };

        messenger
            .send(recipient(), &Payload::new("hello", None, FormatMode::None))
            .await
            .unwrap();

        let body = server.await.unwrap().json();
        assert!(body.get("parse_mode").is_none());
        assert_eq!(body["disable_web_page_preview"], true);
    }

    #[tokio::test]
    async fn url_image_is_passed_through_with_caption() {
        let (bot, server) = serve_once("200 OK", sent_photo()).await;
        let messenger = TelegramMessenger { bot };
        let image = ImageRef::parse("https://cdn.example/promo.jpg").unwrap();
        let payload = Payload::new("hello", Some(image), FormatMode::MarkdownV2);

        messenger.send(recipient(), &payload).await.unwrap();

        let req = server.await.unwrap();
        assert!(req.head.contains("/sendPhoto"), "{}", req.head);
        assert!(req.body_contains(b"https://cdn.example/promo.jpg"));
        assert!(req.body_contains(b"hello"));
        assert!(req.body_contains(b"MarkdownV2"));
    }

    #[tokio::test]
    async fn local_image_is_uploaded_and_closed() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("promo.jpg");
        std::fs::write(&path, b"\xff\xd8local-jpeg-bytes").unwrap();
        let path = path.canonicalize().unwrap();

        let (bot, server) = serve_once("200 OK", sent_photo()).await;
        let messenger = TelegramMessenger { bot };
        let payload = Payload::new("hello", Some(ImageRef::Path(path.clone())), FormatMode::None);

        messenger.send(recipient(), &payload).await.unwrap();

        let req = server.await.unwrap();
        assert!(req.head.contains("/sendPhoto"));
        assert!(req.body_contains(b"\xff\xd8local-jpeg-bytes"));
        assert!(req.body_contains(b"promo.jpg"));
        #[cfg(target_os = "linux")]
        assert_eq!(open_handles_to(&path), 0);
    }

    #[tokio::test]
    async fn too_many_requests_is_rate_limited() {
        let reply = r#"{"ok":false,"error_code":429,"description":"Too Many Requests: retry after 2","parameters":{"retry_after":2}}"#;
        let (bot, server) = serve_once("429 Too Many Requests", reply.to_string()).await;
        let messenger = TelegramMessenger { bot };

        let err = messenger
            .send(recipient(), &Payload::new("hello", None, FormatMode::None))
            .await
            .unwrap_err();

        assert_eq!(err, SendError::RateLimited(Duration::from_secs(2)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn blocked_user_is_unreachable() {
        let reply = r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was blocked by the user"}"#;
        let (bot, server) = serve_once("403 Forbidden", reply.to_string()).await;
        let messenger = TelegramMessenger { bot };

        match messenger
            .send(recipient(), &Payload::new("hello", None, FormatMode::None))
            .await
        {
            Err(SendError::Unreachable(reason)) => assert!(reason.contains("blocked"), "{reason}"),
            other => panic!("expected unreachable, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn bad_request_is_rejected() {
        let reply = r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#;
        let (bot, server) = serve_once("400 Bad Request", reply.to_string()).await;
        let messenger = TelegramMessenger { bot };

        let err = messenger
            .send(recipient(), &Payload::new("hello", None, FormatMode::None))
            .await
            .unwrap_err();

        assert!(matches!(err, SendError::Rejected(_)), "{err:?}");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreadable_local_image_fails_before_any_request() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = reqwest::Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        drop(listener);
        let messenger = TelegramMessenger {
            bot: Bot::new("123:test").set_api_url(url),
        };
        let td = tempfile::tempdir().unwrap();
        let image = ImageRef::Path(td.path().join("missing.jpg"));

        match messenger
            .send(recipient(), &Payload::new("hello", Some(image), FormatMode::None))
            .await
        {
            Err(SendError::Transient(msg)) => assert!(msg.contains("missing.jpg"), "{msg}"),
            other => panic!("expected transient, got {other:?}"),
        }
    }
}
