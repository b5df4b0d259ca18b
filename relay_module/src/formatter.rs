//! Rendering of notification envelopes, mail subjects and auto-reply bodies.

use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, Local, Utc};
use chrono_tz::Tz;

use send_notifications_module::EmailAddress;

use crate::event::{EventBody, EventKind, InboundEmail, MessageEvent, SystemNotice, WebSubmission};
use crate::filter::display_safe;

const BODY_START: &str = "---消息开始---\n";
const BODY_END: &str = "\n---消息结束---";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const THANK_YOU_TEMPLATE: &str = include_str!("../templates/thank_you.txt");
const REJECTION_TEMPLATE: &str = include_str!("../templates/rejection.txt");

/// Zone the receipt times are rendered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeZoneSetting {
    #[default]
    Utc,
    Local,
    Named(Tz),
}

impl TimeZoneSetting {
    /// `UTC`, `Local` or an IANA name; anything else falls back to UTC.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("utc") {
            return TimeZoneSetting::Utc;
        }
        if value.eq_ignore_ascii_case("local") {
            return TimeZoneSetting::Local;
        }
        match Tz::from_str(value) {
            Ok(tz) => TimeZoneSetting::Named(tz),
            Err(_) => {
                tracing::warn!("unknown time zone {:?}, using UTC", value);
                TimeZoneSetting::Utc
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TimeZoneSetting::Utc => "UTC",
            TimeZoneSetting::Local => "Local",
            TimeZoneSetting::Named(tz) => tz.name(),
        }
    }

    /// `YYYY-MM-DD HH:MM:SS` in this zone.
    pub fn format(&self, at: DateTime<Utc>) -> String {
        match self {
            TimeZoneSetting::Utc => at.format(DATE_FORMAT).to_string(),
            TimeZoneSetting::Local => at.with_timezone(&Local).format(DATE_FORMAT).to_string(),
            TimeZoneSetting::Named(tz) => at.with_timezone(tz).format(DATE_FORMAT).to_string(),
        }
    }

    /// Formatted time followed by the zone name.
    pub fn stamp(&self, at: DateTime<Utc>) -> String {
        format!("{} {}", self.format(at), self.name())
    }
}

/// Channel a rendering is meant for. Inbound mail words its safety line
/// differently for the chat group and for the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Webhook,
    Email,
}

/// Header plus metadata, and the body kept apart so the webhook path can
/// decide how to ship an oversized body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub head: String,
    pub content: String,
}

impl Envelope {
    pub fn full(&self) -> String {
        format!("{}{}{}{}", self.head, BODY_START, self.content, BODY_END)
    }

    pub fn full_len(&self) -> usize {
        self.head.len() + BODY_START.len() + self.content.len() + BODY_END.len()
    }
}

#[derive(Debug, Clone)]
pub struct Formatter {
    zone: TimeZoneSetting,
    relay_name: String,
    web_url: String,
}

impl Formatter {
    pub fn new(zone: TimeZoneSetting, relay_name: impl Into<String>, web_url: impl Into<String>) -> Self {
        Self {
            zone,
            relay_name: relay_name.into(),
            web_url: web_url.into(),
        }
    }

    pub fn zone(&self) -> TimeZoneSetting {
        self.zone
    }

    pub fn relay_name(&self) -> &str {
        &self.relay_name
    }

    pub fn header(&self, kind: EventKind, event_id: &str, at: DateTime<Utc>) -> String {
        match kind {
            EventKind::System => format!(
                "【电子信箱-系统通知】信件ID: {}\n接收时间: {}\n",
                event_id,
                self.zone.stamp(at)
            ),
            _ => format!(
                "【电子信箱】类型：{}\n信件ID: {}\n接收时间: {}\n",
                kind.label(),
                event_id,
                self.zone.stamp(at)
            ),
        }
    }

    pub fn render(&self, event: &MessageEvent, audience: Audience) -> Envelope {
        let mut head = self.header(event.kind(), &event.id, event.received_at);
        let content = match &event.body {
            EventBody::Website(web) => {
                write_web_lines(&mut head, web);
                web.message.clone()
            }
            EventBody::Email(mail) => {
                self.write_inbound_lines(&mut head, mail, audience);
                mail.content.clone()
            }
            EventBody::System(notice) => {
                self.write_system_lines(&mut head, notice, event.received_at);
                notice.content.clone()
            }
        };
        let _ = writeln!(head, "消息长度：{}", content.len());
        Envelope { head, content }
    }

    fn write_inbound_lines(&self, head: &mut String, mail: &InboundEmail, audience: Audience) {
        let _ = writeln!(head, "主题: {}", mail.subject);
        let _ = writeln!(head, "邮件 MessageID: {}", mail.message_id);
        let _ = writeln!(head, "发送人: {}", human_address(&mail.sender));
        let _ = writeln!(head, "宣称发送人: {}", human_address(&mail.from));
        let _ = writeln!(head, "回复地址: {}", human_address(&mail.reply_to));
        let _ = writeln!(head, "收件人: {}", human_address(&mail.recipient));
        let _ = writeln!(head, "邮件日期: {}", self.zone.stamp(mail.sent_at));
        let line = match (audience, mail.content_altered) {
            (Audience::Webhook, false) => "邮件内容是否安全：是",
            (Audience::Webhook, true) => "邮件内容是否安全：否，已处理",
            (Audience::Email, false) => "邮件内容是否存在不安全因素：不存在不安全因素",
            (Audience::Email, true) => "邮件内容是否存在不安全因素：存在不安全因素，已被移除",
        };
        let _ = writeln!(head, "{}", line);
    }

    fn write_system_lines(&self, head: &mut String, notice: &SystemNotice, at: DateTime<Utc>) {
        let _ = writeln!(head, "主题: {}", notice.subject);
        let _ = writeln!(head, "日期: {}", self.zone.stamp(at));
    }

    /// Subject of the forwarded notification, before the send-to-self prefix.
    pub fn subject(&self, event: &MessageEvent) -> String {
        match &event.body {
            EventBody::Website(web) => web_subject(&web.refer, &web.origin),
            EventBody::Email(mail) => format!("邮件：{} ({})", mail.subject, just_name(&mail.from)),
            EventBody::System(notice) => format!("系统通知：{}", notice.subject),
        }
    }

    pub fn thank_you_body(&self, model: &ReplyModel) -> String {
        render_template(THANK_YOU_TEMPLATE, &self.template_fields(model))
    }

    pub fn rejection_body(&self, model: &ReplyModel) -> String {
        render_template(REJECTION_TEMPLATE, &self.template_fields(model))
    }

    fn template_fields(&self, model: &ReplyModel) -> Vec<(&'static str, String)> {
        let web_url = if self.web_url.is_empty() {
            String::new()
        } else {
            format!("网站：{}\n", self.web_url)
        };
        vec![
            ("UserAddr", model.user.address.clone()),
            ("UserName", just_name(&model.user)),
            ("MyAddr", model.relay.address.clone()),
            ("MyName", self.relay_name.clone()),
            ("MyNameAddr", human_address(&model.relay)),
            ("ErrorMsg", model.error.clone().unwrap_or_default()),
            ("Date", self.zone.format(model.date)),
            ("DateLocation", self.zone.name().to_string()),
            ("DateUTC", model.date.format(DATE_FORMAT).to_string()),
            ("WebURL", web_url),
        ]
    }
}

fn write_web_lines(head: &mut String, web: &WebSubmission) {
    let _ = writeln!(head, "站点：{}", web.refer);
    let _ = writeln!(head, "Origin: {}", web.origin);
    let _ = writeln!(head, "Host: {}", web.host);
    let _ = writeln!(head, "IP地址：{}", web.client_ip);
    let _ = writeln!(head, "名字：{}", web.name);
    if web.name_altered {
        let _ = writeln!(
            head,
            "注意：原名字可能包含不安全内容，已被删除（原名字长度：{}）",
            web.original_name_len
        );
    }
    let _ = writeln!(head, "是否匿名：{}", if web.anonymous { "是" } else { "否" });
    match &web.email {
        Some(email) => {
            let _ = writeln!(head, "邮箱：{}", email.address);
        }
        None => head.push_str("邮箱：未预留\n"),
    }
    if web.message_altered {
        let _ = writeln!(
            head,
            "注意：消息可能包含不安全内容，已被删除（消息原长度：{}）",
            web.original_message_len
        );
    }
}

/// Inputs of the thank-you and rejection templates.
#[derive(Debug, Clone)]
pub struct ReplyModel {
    pub user: EmailAddress,
    pub relay: EmailAddress,
    pub error: Option<String>,
    pub date: DateTime<Utc>,
}

/// Replaces `{{Key}}` placeholders in one left-to-right pass. Substituted
/// values are never scanned again; unknown keys stay as written.
fn render_template(template: &str, fields: &[(&'static str, String)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let field = after.find("}}").and_then(|end| {
            let key = &after[..end];
            fields
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (value, end))
        });
        match field {
            Some((value, end)) => {
                out.push_str(value);
                rest = &after[end + 2..];
            }
            None => {
                out.push_str("{{");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn web_subject(refer: &str, origin: &str) -> String {
    if !refer.is_empty() && !origin.is_empty() && refer != origin {
        format!("站点: {}（Origin: {}）", refer, origin)
    } else if !refer.is_empty() {
        format!("站点: {}", refer)
    } else {
        format!("站点 Origin: {}", origin)
    }
}

/// `Re: ` prefixed unless the subject already carries one.
pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim_start();
    let already = trimmed
        .get(..3)
        .map(|prefix| prefix.eq_ignore_ascii_case("re:"))
        .unwrap_or(false);
    if already {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}

/// `Name <addr>` or `addr`, display-safe, with fixed fallbacks.
pub fn human_address(address: &EmailAddress) -> String {
    let rendered = address.to_string();
    let (safe, _) = display_safe(&rendered);
    if !safe.trim().is_empty() {
        return safe;
    }
    let (safe, _) = display_safe(&address.address);
    if !safe.trim().is_empty() {
        return safe;
    }
    if address.address.to_lowercase().contains("unsafe1@example.com") {
        "unsafe2@example.com".to_string()
    } else {
        "unsafe1@example.com".to_string()
    }
}

/// Name, or the local part when there is none; display-safe.
pub fn just_name(address: &EmailAddress) -> String {
    let (safe, _) = display_safe(address.display_name());
    if !safe.trim().is_empty() {
        return safe;
    }
    let (safe, _) = display_safe(address.local_part());
    if !safe.trim().is_empty() {
        return safe;
    }
    if address.name.to_lowercase().contains("unsafe1") {
        "unsafe2".to_string()
    } else {
        "unsafe1".to_string()
    }
}
