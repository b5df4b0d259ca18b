use std::sync::Arc;

use send_notifications_module::{
    ChannelKind, OversizePolicy, WebhookFailure, WebhookSender, FRAGMENT_LIMIT_BYTES,
};

use crate::event::{EventKind, MessageEvent};
use crate::fanout::{Branch, Launched};
use crate::formatter::{Audience, Envelope};

use super::state::RelayContext;

const FILE_NOTICE: &str = "以下消息以文件的形式发送";

impl RelayContext {
    /// Persists `event` and fans it out to every configured channel.
    pub(super) fn dispatch(&self, event: MessageEvent) -> Launched {
        let branches = self.branches_for(&event);
        self.fanout.launch(event, branches)
    }

    fn branches_for(&self, event: &MessageEvent) -> Vec<Branch> {
        let mut branches = Vec::with_capacity(3);

        if self.webhook.is_configured() {
            let webhook = self.webhook.clone();
            let envelope = self.formatter.render(event, Audience::Webhook);
            let policy = self.settings.webhook_oversize;
            let notice = event.kind() == EventKind::System;
            let event_id = event.id.clone();
            branches.push(Branch::new(ChannelKind::Webhook, move || {
                deliver_webhook(&webhook, &envelope, policy, &event_id, notice)?;
                Ok(())
            }));
        }

        if self.mail.is_configured() {
            let mail = self.mail.clone();
            let subject = self.formatter.subject(event);
            let body = self.formatter.render(event, Audience::Email).full();
            let date = event.received_at;
            let event_id = event.id.clone();
            branches.push(Branch::new(ChannelKind::Email, move || {
                mail.send_to_self(&subject, &body, date, Some(&event_id))?;
                Ok(())
            }));
        }

        if self.mailer.wants_thank_you(event) {
            let mailer = self.mailer.clone();
            let event = event.clone();
            branches.push(Branch::new(ChannelKind::ThankYou, move || {
                mailer.send_thank_you(&event)?;
                Ok(())
            }));
        }

        branches
    }
}

/// Ships one envelope to the chat group, choosing between a single text,
/// a file attachment, split fragments, or a pointer to the mailbox.
pub(super) fn deliver_webhook(
    webhook: &Arc<WebhookSender>,
    envelope: &Envelope,
    policy: OversizePolicy,
    event_id: &str,
    notice: bool,
) -> Result<(), WebhookFailure> {
    let full = envelope.full();
    if notice {
        if full.len() <= FRAGMENT_LIMIT_BYTES {
            webhook.send_notice_text(&full, Some(event_id))?;
        } else {
            webhook.send_split(&full, event_id)?;
        }
        return Ok(());
    }

    if full.len() <= FRAGMENT_LIMIT_BYTES {
        webhook.send_text(&full, Some(event_id))?;
        return Ok(());
    }

    match policy {
        OversizePolicy::File => {
            let text = format!("{}{}", envelope.head, FILE_NOTICE);
            if text.len() <= FRAGMENT_LIMIT_BYTES {
                webhook.send_with_file(&text, &envelope.content, Some(event_id))?;
                return Ok(());
            }
        }
        OversizePolicy::Split => {
            if envelope.head.len() <= FRAGMENT_LIMIT_BYTES {
                webhook.send_head_and_split(&envelope.head, &envelope.content, event_id)?;
                return Ok(());
            }
        }
    }

    let pointer = format!(
        "消息 [{}] 过长，无法在企业微信发送，请查看邮箱。",
        event_id
    );
    webhook.send_text(&pointer, Some(event_id))?;
    Ok(())
}
