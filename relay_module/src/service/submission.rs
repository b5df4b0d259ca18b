use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use send_notifications_module::EmailAddress;

use crate::event::{MessageEvent, WebSubmission};
use crate::filter::{normalize, FieldError, FieldRule, Overflow};
use crate::mailer::REJECTION_SUBJECT;
use crate::rate_limit::RateVerdict;

use super::state::RelayContext;

pub const ANONYMOUS_NAME: &str = "匿名（Anonymous User）";

const NAME_RULE: FieldRule = FieldRule::chars(30);
const REFER_RULE: FieldRule = FieldRule::chars(50);

/// JSON body of a web submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmissionFields {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub refer: String,
}

/// Request facts the HTTP boundary passes along with the body.
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub client_ip: String,
    pub host: String,
    pub origin: String,
}

/// Stable outcome codes of a web submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success = 1,
    SuccessFiltered = 2,
    BadRequest = -1,
    InvalidEmail = -2,
    IpRateLimited = -3,
    NameTooLong = -4,
    NameUnsafe = -5,
    MessageEmpty = -6,
    MessageUnsafe = -7,
    ReferTooLong = -9,
    ReferUnsafe = -10,
    EmailRateLimited = -11,
    IpAndEmailRateLimited = -12,
}

impl ResponseCode {
    pub fn value(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self.value() > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionResult {
    pub code: i32,
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Id of the launched event; never sent to the client.
    #[serde(skip)]
    pub event_id: Option<String>,
}

struct Refusal {
    code: ResponseCode,
    message: &'static str,
    error: String,
}

impl Refusal {
    fn new(code: ResponseCode, message: &'static str, error: impl Into<String>) -> Self {
        Self {
            code,
            message,
            error: error.into(),
        }
    }
}

const MSG_BAD_REQUEST: &str = "留言信息错误，请通过电子邮件留言。";
const MSG_INVALID_EMAIL: &str = "邮箱错误。";
const MSG_RATE_LIMITED: &str = "留言太频繁，请稍后再留言。";
const MSG_NAME_TOO_LONG: &str = "名字太长啦，请控制在30个字符以内。";
const MSG_UNSAFE: &str = "留言存在编码（例如非UTF-8编码或包含控制符合）或不安全问题，留言失败。";
const MSG_EMPTY: &str = "留言消息不能为空哦。";
const MSG_SUCCESS: &str = "留言成功！";
const MSG_SUCCESS_FILTERED: &str =
    "留言存在编码（例如非UTF-8编码或包含控制符合）或不安全问题，留言信息已被处理，留言成功！";

impl RelayContext {
    /// Validates a web submission, and on acceptance launches its fan-out
    /// without waiting for any channel.
    pub fn process_web_submission(&self, body: &[u8], meta: &RequestMeta) -> SubmissionResult {
        let fields = match serde_json::from_slice::<SubmissionFields>(body) {
            Ok(fields) => fields,
            Err(err) => {
                return self.refuse(
                    None,
                    Refusal::new(ResponseCode::BadRequest, MSG_BAD_REQUEST, err.to_string()),
                )
            }
        };

        let email = match fields.email.trim() {
            "" => None,
            raw => match EmailAddress::parse(raw).filter(|address| address.name.is_empty()) {
                Some(address) => Some(address),
                None => {
                    return self.refuse(
                        None,
                        Refusal::new(ResponseCode::InvalidEmail, MSG_INVALID_EMAIL, "邮箱格式错误"),
                    )
                }
            },
        };

        match self.limits.check_submission(&meta.client_ip, email.as_ref()) {
            RateVerdict::Allowed => {}
            verdict => {
                let (code, error) = match verdict {
                    RateVerdict::IpLimited => (ResponseCode::IpRateLimited, "IP限制"),
                    RateVerdict::EmailLimited => (ResponseCode::EmailRateLimited, "邮箱限制"),
                    _ => (ResponseCode::IpAndEmailRateLimited, "IP和Email限制"),
                };
                info!(
                    "submission from {} refused: {}",
                    meta.client_ip, error
                );
                return self.refuse(email.as_ref(), Refusal::new(code, MSG_RATE_LIMITED, error));
            }
        }

        match self.build_submission(fields, email.clone(), meta) {
            Ok(submission) => {
                let altered = submission.message_altered;
                let event = MessageEvent::web(submission, Utc::now());
                let launched = self.dispatch(event);
                info!("accepted web submission {}", launched.event_id);
                let code = if altered {
                    ResponseCode::SuccessFiltered
                } else {
                    ResponseCode::Success
                };
                succeed(code, launched.event_id)
            }
            Err(refusal) => self.refuse(email.as_ref(), refusal),
        }
    }

    fn build_submission(
        &self,
        fields: SubmissionFields,
        email: Option<EmailAddress>,
        meta: &RequestMeta,
    ) -> Result<WebSubmission, Refusal> {
        let original_name_len = fields.name.len();
        let (name, anonymous, name_altered) = if fields.name.trim().is_empty() {
            (ANONYMOUS_NAME.to_string(), true, false)
        } else {
            match normalize(&fields.name, &NAME_RULE) {
                Ok(normalized) => (normalized.text, false, normalized.altered),
                Err(FieldError::TooLong { .. }) => {
                    return Err(Refusal::new(
                        ResponseCode::NameTooLong,
                        MSG_NAME_TOO_LONG,
                        "名字超过30个字符",
                    ))
                }
                Err(_) => {
                    return Err(Refusal::new(ResponseCode::NameUnsafe, MSG_UNSAFE, "名字不安全"))
                }
            }
        };

        let message_rule = FieldRule::bytes(
            self.settings.message_max_bytes,
            Overflow::CompressThenTruncate,
        );
        let original_message_len = fields.message.len();
        let message = match normalize(&fields.message, &message_rule) {
            Ok(normalized) => normalized,
            Err(FieldError::Empty) => {
                return Err(Refusal::new(ResponseCode::MessageEmpty, MSG_EMPTY, "消息为空"))
            }
            Err(_) => {
                return Err(Refusal::new(ResponseCode::MessageUnsafe, MSG_UNSAFE, "消息不安全"))
            }
        };

        let raw_refer = if fields.refer.trim().is_empty() {
            meta.origin.as_str()
        } else {
            fields.refer.as_str()
        };
        let refer = match normalize(raw_refer, &REFER_RULE) {
            Ok(normalized) if !normalized.altered => normalized.text,
            Ok(_) | Err(FieldError::Unsafe) => {
                return Err(Refusal::new(ResponseCode::ReferUnsafe, MSG_BAD_REQUEST, "Refer不安全"))
            }
            Err(FieldError::TooLong { .. }) => {
                return Err(Refusal::new(
                    ResponseCode::ReferTooLong,
                    MSG_BAD_REQUEST,
                    "Refer超过50个字符",
                ))
            }
            Err(FieldError::Empty) => String::new(),
        };

        Ok(WebSubmission {
            name,
            email,
            message: message.text,
            refer,
            origin: meta.origin.clone(),
            host: meta.host.clone(),
            client_ip: meta.client_ip.clone(),
            anonymous,
            name_altered,
            original_name_len,
            message_altered: message.altered,
            original_message_len,
        })
    }

    fn refuse(&self, email: Option<&EmailAddress>, refusal: Refusal) -> SubmissionResult {
        if let Some(to) = email {
            self.send_web_rejection(to, refusal.message);
        }
        SubmissionResult {
            code: refusal.code.value(),
            success: false,
            message: refusal.message.to_string(),
            error: self.settings.debug.then_some(refusal.error),
            event_id: None,
        }
    }

    fn send_web_rejection(&self, to: &EmailAddress, message: &str) {
        if !self.mailer.is_configured() {
            return;
        }
        let mailer = self.mailer.clone();
        let to = to.clone();
        let reason = message.trim_end_matches(['。', '！']).to_string();
        self.fanout.spawn_detached("web rejection", move || {
            if let Err(err) = mailer.send_rejection(&to, REJECTION_SUBJECT, None, &reason, Utc::now())
            {
                warn!("rejection mail to {} failed: {}", to.address, err);
            }
        });
    }
}

fn succeed(code: ResponseCode, event_id: String) -> SubmissionResult {
    let message = match code {
        ResponseCode::SuccessFiltered => MSG_SUCCESS_FILTERED,
        _ => MSG_SUCCESS,
    };
    SubmissionResult {
        code: code.value(),
        success: true,
        message: message.to_string(),
        error: None,
        event_id: Some(event_id),
    }
}
