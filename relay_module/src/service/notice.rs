use chrono::Utc;
use tracing::info;

use crate::event::{MessageEvent, SystemNotice};

use super::state::RelayContext;

impl RelayContext {
    /// Operational alert to the chat group and the notice list. Returns the
    /// event id; delivery continues in the background.
    pub fn send_system_notice(&self, subject: &str, body: &str) -> String {
        let notice = SystemNotice {
            subject: subject.to_string(),
            content: body.to_string(),
        };
        let launched = self.dispatch(MessageEvent::system(notice, Utc::now()));
        info!("system notice {} queued: {}", launched.event_id, subject);
        launched.event_id
    }
}
