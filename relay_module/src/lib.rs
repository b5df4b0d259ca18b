pub mod event;
pub mod fanout;
pub mod filter;
pub mod formatter;
pub mod identity;
pub mod mailer;
pub mod rate_limit;
pub mod service;
pub mod store;

pub use event::{EventBody, EventKind, InboundEmail, MessageEvent, SystemNotice, WebSubmission};
pub use fanout::{Branch, BranchOutcome, Fanout, FanoutReport, InFlight, Launched};
pub use formatter::{Audience, Envelope, Formatter, ReplyModel, TimeZoneSetting};
pub use mailer::Mailer;
pub use rate_limit::{FixedWindowLimiter, RateLimits, RateSettings, RateVerdict, SendType};
pub use store::{EventStore, RecordStore, StoreError, StoredAttempt};
