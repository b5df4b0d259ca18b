//! Chat webhook sender (WeCom group robot protocol).
//!
//! Every network call goes through one process-wide lock held by the
//! sender, so messages reach the group in the order they were submitted.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::attempt::{
    AttemptDetail, ChannelKind, DeliveryLog, DeliveryLogError, NewAttempt, ERROR_LIMIT_CHARS,
    PAYLOAD_LIMIT_BYTES,
};
use crate::{sha256_hex, truncate_bytes, truncate_chars};

pub const TEXT_LIMIT_BYTES: usize = 2048;
pub const MARKDOWN_LIMIT_BYTES: usize = 4096;
/// Budget for a single rendered text message, prefix tags included.
pub const FRAGMENT_LIMIT_BYTES: usize = 2040;

const TAG_CHARS: usize = 5;
const MENTION_ALL: &str = "@all";
const UPLOAD_FILE_NAME: &str = "message.txt";
const UPLOAD_TYPE_FILE: &str = "file";
const DEFAULT_UPLOAD_URL: &str = "https://qyapi.weixin.qq.com/cgi-bin/webhook/upload_media";

/// What to do with a body that does not fit one text message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OversizePolicy {
    #[default]
    File,
    Split,
}

impl FromStr for OversizePolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(OversizePolicy::File),
            "split" => Ok(OversizePolicy::Split),
            other => Err(format!("unknown webhook oversize policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    /// Media upload endpoint; derived from `url` when absent.
    pub upload_url: Option<String>,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            upload_url: None,
            timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook is not configured")]
    NotConfigured,
    #[error("webhook message is empty")]
    EmptyMessage,
    #[error("message is {len} bytes, over the {limit} byte webhook ceiling")]
    TooLong { len: usize, limit: usize },
    #[error("failed to encode webhook request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook answered with http status {0}")]
    Status(u16),
    #[error("platform reported error (errcode {code}): {message}")]
    Platform { code: i64, message: String },
    #[error("upload returned type {0:?}, expected file")]
    UploadType(String),
    #[error("invalid upload url: {0}")]
    UploadUrl(String),
    #[error(transparent)]
    Log(#[from] DeliveryLogError),
}

/// A failed send. `correlation_id` is set once the attempt row was reserved.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct WebhookFailure {
    pub correlation_id: Option<String>,
    #[source]
    pub source: WebhookError,
}

impl WebhookFailure {
    fn new(correlation_id: Option<String>, source: WebhookError) -> Self {
        Self {
            correlation_id,
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileDelivery {
    pub correlation_id: String,
    pub media_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SplitDelivery {
    /// Concatenation of every fragment that was sent, tags included.
    pub sent: String,
    pub correlation_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Content<'a> {
    Text { msg: &'a str, mention_all: bool },
    Markdown { msg: &'a str },
}

impl<'a> Content<'a> {
    fn msg(&self) -> &'a str {
        match self {
            Content::Text { msg, .. } | Content::Markdown { msg } => msg,
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookRequest<'a> {
    msgtype: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<TextBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    markdown: Option<MarkdownBody<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<FileBody<'a>>,
}

#[derive(Debug, Serialize)]
struct TextBody<'a> {
    content: &'a str,
    mentioned_list: Vec<&'a str>,
    mentioned_mobile_list: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct MarkdownBody<'a> {
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct FileBody<'a> {
    media_id: &'a str,
}

impl<'a> WebhookRequest<'a> {
    fn from_content(content: Content<'a>) -> Self {
        match content {
            Content::Text { msg, mention_all } => Self {
                msgtype: "text",
                text: Some(TextBody {
                    content: msg,
                    mentioned_list: Vec::new(),
                    mentioned_mobile_list: if mention_all {
                        vec![MENTION_ALL]
                    } else {
                        Vec::new()
                    },
                }),
                markdown: None,
                file: None,
            },
            Content::Markdown { msg } => Self {
                msgtype: "markdown",
                text: None,
                markdown: Some(MarkdownBody { content: msg }),
                file: None,
            },
        }
    }

    fn file(media_id: &'a str) -> Self {
        Self {
            msgtype: "file",
            text: None,
            markdown: None,
            file: Some(FileBody { media_id }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    media_id: String,
}

pub struct WebhookSender {
    config: WebhookConfig,
    log: Arc<dyn DeliveryLog>,
    lock: Mutex<()>,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig, log: Arc<dyn DeliveryLog>) -> Self {
        Self {
            config,
            log,
            lock: Mutex::new(()),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.url.trim().is_empty()
    }

    pub fn send_text(&self, msg: &str, event_id: Option<&str>) -> Result<String, WebhookFailure> {
        let _guard = self.acquire();
        self.post_message(
            Content::Text {
                msg,
                mention_all: false,
            },
            event_id,
        )
    }

    /// Text message that mentions everyone in the group.
    pub fn send_notice_text(
        &self,
        msg: &str,
        event_id: Option<&str>,
    ) -> Result<String, WebhookFailure> {
        let _guard = self.acquire();
        self.post_message(
            Content::Text {
                msg,
                mention_all: true,
            },
            event_id,
        )
    }

    pub fn send_markdown(
        &self,
        msg: &str,
        event_id: Option<&str>,
    ) -> Result<String, WebhookFailure> {
        let _guard = self.acquire();
        self.post_message(Content::Markdown { msg }, event_id)
    }

    /// Sends `text`, then uploads `file_body` and posts it as a file message.
    /// Both steps land on the same attempt row.
    pub fn send_with_file(
        &self,
        text: &str,
        file_body: &str,
        event_id: Option<&str>,
    ) -> Result<FileDelivery, WebhookFailure> {
        let _guard = self.acquire();
        let correlation_id = self.post_message(
            Content::Text {
                msg: text,
                mention_all: false,
            },
            event_id,
        )?;
        match self.post_file(&correlation_id, file_body) {
            Ok(media_id) => Ok(FileDelivery {
                correlation_id,
                media_id,
            }),
            Err(source) => Err(WebhookFailure::new(Some(correlation_id), source)),
        }
    }

    /// Sends `msg` as consecutive tagged fragments; stops at the first failure.
    pub fn send_split(&self, msg: &str, event_id: &str) -> Result<SplitDelivery, WebhookFailure> {
        let _guard = self.acquire();
        self.post_fragments(msg, event_id)
    }

    /// Sends `head` as one text message followed by the fragments of `body`,
    /// with no other message in between.
    pub fn send_head_and_split(
        &self,
        head: &str,
        body: &str,
        event_id: &str,
    ) -> Result<SplitDelivery, WebhookFailure> {
        let _guard = self.acquire();
        self.post_message(
            Content::Text {
                msg: head,
                mention_all: false,
            },
            Some(event_id),
        )?;
        self.post_fragments(body, event_id)
    }

    fn post_fragments(&self, msg: &str, event_id: &str) -> Result<SplitDelivery, WebhookFailure> {
        let fragments = split_for_webhook(msg, event_id, FRAGMENT_LIMIT_BYTES);
        let mut delivery = SplitDelivery::default();
        for fragment in &fragments {
            let correlation_id = self.post_message(
                Content::Text {
                    msg: fragment,
                    mention_all: false,
                },
                Some(event_id),
            )?;
            delivery.sent.push_str(fragment);
            delivery.correlation_ids.push(correlation_id);
        }
        info!(
            "webhook split message for {} into {} fragment(s)",
            event_id,
            fragments.len()
        );
        Ok(delivery)
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn post_message(
        &self,
        content: Content<'_>,
        event_id: Option<&str>,
    ) -> Result<String, WebhookFailure> {
        if !self.is_configured() {
            return Err(WebhookFailure::new(None, WebhookError::NotConfigured));
        }
        let msg = content.msg();
        if msg.is_empty() {
            return Err(WebhookFailure::new(None, WebhookError::EmptyMessage));
        }

        let now = Utc::now();
        let correlation_id = webhook_attempt_id(&self.config.url, msg, now.timestamp());
        let attempt = NewAttempt {
            correlation_id: correlation_id.clone(),
            event_id: event_id.map(str::to_string),
            channel: ChannelKind::Webhook,
            payload: truncate_bytes(msg, PAYLOAD_LIMIT_BYTES).to_string(),
            created_at: now,
            detail: AttemptDetail::Webhook {
                endpoint: endpoint_without_key(&self.config.url),
            },
        };
        self.log
            .save_attempt(&attempt)
            .map_err(|err| WebhookFailure::new(None, err.into()))?;

        let result = self.deliver(content);
        let detail = result.as_ref().err().map(describe);
        if let Err(err) = self.log.record_outcome(&correlation_id, detail.as_deref()) {
            warn!("failed to record webhook outcome for {}: {}", correlation_id, err);
        }
        match result {
            Ok(()) => Ok(correlation_id),
            Err(source) => Err(WebhookFailure::new(Some(correlation_id), source)),
        }
    }

    fn deliver(&self, content: Content<'_>) -> Result<(), WebhookError> {
        let limit = match content {
            Content::Text { .. } => TEXT_LIMIT_BYTES,
            Content::Markdown { .. } => MARKDOWN_LIMIT_BYTES,
        };
        let len = content.msg().len();
        if len >= limit {
            return Err(WebhookError::TooLong { len, limit });
        }
        self.post_request(&WebhookRequest::from_content(content))
    }

    fn post_request(&self, request: &WebhookRequest<'_>) -> Result<(), WebhookError> {
        let body = serde_json::to_vec(request)?;
        let response = self
            .client()?
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status.as_u16()));
        }
        let reply: WebhookResponse = response.json()?;
        if reply.errcode != 0 {
            return Err(WebhookError::Platform {
                code: reply.errcode,
                message: reply.errmsg,
            });
        }
        Ok(())
    }

    fn post_file(&self, correlation_id: &str, body: &str) -> Result<String, WebhookError> {
        self.log
            .save_file_attempt(correlation_id, truncate_bytes(body, PAYLOAD_LIMIT_BYTES))?;

        let media_id = match self.upload(body) {
            Ok(media_id) => media_id,
            Err(err) => {
                self.settle_file(correlation_id, None, Some(&err));
                return Err(err);
            }
        };
        let posted = self.post_request(&WebhookRequest::file(&media_id));
        self.settle_file(correlation_id, Some(&media_id), posted.as_ref().err());
        posted.map(|()| media_id)
    }

    fn settle_file(&self, correlation_id: &str, media_id: Option<&str>, error: Option<&WebhookError>) {
        let detail = error.map(describe);
        if let Err(err) = self
            .log
            .record_file_outcome(correlation_id, media_id, detail.as_deref())
        {
            warn!(
                "failed to record webhook file outcome for {}: {}",
                correlation_id, err
            );
        }
    }

    fn upload(&self, body: &str) -> Result<String, WebhookError> {
        let url = self.upload_url()?;
        let mime = mime_guess::from_path(UPLOAD_FILE_NAME).first_or_octet_stream();
        let part = Part::bytes(body.as_bytes().to_vec())
            .file_name(UPLOAD_FILE_NAME)
            .mime_str(mime.as_ref())?;
        let form = Form::new().part("media", part);
        let response = self.client()?.post(url).multipart(form).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status.as_u16()));
        }
        let reply: UploadResponse = response.json()?;
        if reply.errcode != 0 {
            return Err(WebhookError::Platform {
                code: reply.errcode,
                message: reply.errmsg,
            });
        }
        if reply.kind != UPLOAD_TYPE_FILE {
            return Err(WebhookError::UploadType(reply.kind));
        }
        Ok(reply.media_id)
    }

    fn upload_url(&self) -> Result<Url, WebhookError> {
        let webhook =
            Url::parse(&self.config.url).map_err(|err| WebhookError::UploadUrl(err.to_string()))?;
        let key = webhook
            .query_pairs()
            .find(|(name, _)| name == "key")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_default();
        let base = match &self.config.upload_url {
            Some(url) if !url.trim().is_empty() => url.trim().to_string(),
            _ => derive_upload_base(&webhook),
        };
        let mut url = Url::parse(&base).map_err(|err| WebhookError::UploadUrl(err.to_string()))?;
        url.query_pairs_mut()
            .clear()
            .append_pair("key", &key)
            .append_pair("type", UPLOAD_TYPE_FILE);
        Ok(url)
    }

    fn client(&self) -> Result<Client, WebhookError> {
        Ok(Client::builder().timeout(self.config.timeout).build()?)
    }
}

/// Correlation id of one webhook message.
pub fn webhook_attempt_id(webhook: &str, msg: &str, unix_seconds: i64) -> String {
    sha256_hex(&format!("WXROBOT-{}\n{}\n{}", webhook, msg, unix_seconds))
}

/// Splits `msg` into tagged fragments of at most `limit` bytes each.
///
/// Each non-blank line keeps its trailing newline. Lines are packed into a
/// buffer until the next one would overflow it; a line that cannot fit even
/// on its own is cut at character boundaries and its last piece seeds the
/// next buffer. Blank lines are dropped.
pub fn split_for_webhook(msg: &str, event_id: &str, limit: usize) -> Vec<String> {
    let tag: String = event_id.chars().take(TAG_CHARS).collect();
    let prefix = format!("【{}】", tag);
    let mut fragments = Vec::new();
    let mut buffer = prefix.clone();

    for line in msg.split('\n') {
        if is_blank(line) {
            continue;
        }
        let line = format!("{}\n", line);
        if prefix.len() + line.len() > limit {
            flush(&mut fragments, &mut buffer, &prefix);
            let tail = push_chunks(&mut fragments, &prefix, &line, limit);
            buffer.push_str(tail);
        } else if buffer.len() + line.len() > limit {
            flush(&mut fragments, &mut buffer, &prefix);
            buffer.push_str(&line);
        } else {
            buffer.push_str(&line);
        }
    }
    flush(&mut fragments, &mut buffer, &prefix);
    fragments
}

fn flush(fragments: &mut Vec<String>, buffer: &mut String, prefix: &str) {
    if is_blank(&buffer[prefix.len()..]) {
        buffer.truncate(prefix.len());
        return;
    }
    fragments.push(std::mem::replace(buffer, prefix.to_string()));
}

fn push_chunks<'a>(
    fragments: &mut Vec<String>,
    prefix: &str,
    line: &'a str,
    limit: usize,
) -> &'a str {
    let room = limit.saturating_sub(prefix.len()).max(4);
    let mut rest = line;
    while rest.len() > room {
        let mut cut = truncate_bytes(rest, room).len();
        if cut == 0 {
            cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        fragments.push(format!("{}{}", prefix, &rest[..cut]));
        rest = &rest[cut..];
    }
    rest
}

fn is_blank(line: &str) -> bool {
    line.chars().all(char::is_whitespace)
}

fn describe(err: &WebhookError) -> String {
    truncate_chars(&err.to_string(), ERROR_LIMIT_CHARS)
}

fn endpoint_without_key(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => base.to_string(),
        None => url.to_string(),
    }
}

fn derive_upload_base(webhook: &Url) -> String {
    let path = webhook.path();
    if let Some(base) = path.strip_suffix("/send") {
        let mut url = webhook.clone();
        url.set_query(None);
        url.set_path(&format!("{}/upload_media", base));
        url.to_string()
    } else {
        DEFAULT_UPLOAD_URL.to_string()
    }
}
