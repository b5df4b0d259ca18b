mod background;
mod config;
mod dispatch;
mod inbound;
mod mailbox;
mod notice;
mod server;
mod state;
mod submission;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use background::BackgroundControl;
pub use config::{
    ServiceConfig, DEFAULT_BODY_MAX_BYTES, DEFAULT_MESSAGE_MAX_BYTES, DEFAULT_RELAY_NAME,
};
pub use inbound::{
    InboundDocument, InboundOutcome, ParsedMail, REJECT_EMPTY, REJECT_TOO_FAST,
    REJECT_TOO_LARGE, REJECT_UNSAFE,
};
pub use mailbox::{
    run_mailbox_loop, start_mailbox, InboxQueue, MailboxError, MailboxExit, MailboxSource,
    MailboxTiming,
};
pub use server::{run_server, run_service, serve};
pub use state::{RelayContext, RelayParts, RelaySettings};
pub use submission::{
    RequestMeta, ResponseCode, SubmissionFields, SubmissionResult, ANONYMOUS_NAME,
};
