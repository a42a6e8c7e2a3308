use anyhow::{Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, Message, MultiPart};
use lettre::transport::smtp::{authentication::Credentials, AsyncSmtpTransport};
use lettre::{AsyncTransport, Tokio1Executor};

use super::{Channel, ChannelSender, NotificationPayload};
use crate::config::SmtpConfig;
use crate::error::NotifyError;

pub struct EmailSender {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailSender {
    pub fn from_config(cfg: &SmtpConfig) -> Result<Self> {
        let creds = Credentials::new(cfg.user.clone(), cfg.pass.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
            .with_context(|| format!("invalid SMTP host {}", cfg.host))?
            .port(cfg.port)
            .credentials(creds)
            .build();
        let from = cfg
            .from
            .parse()
            .with_context(|| format!("invalid sender address {}", cfg.from))?;
        Ok(Self { mailer, from })
    }
}

/// Parses a recipient mailbox; malformed addresses are permanent failures.
pub fn parse_recipient(addr: &str) -> Result<Mailbox, NotifyError> {
    addr.trim()
        .parse::<Mailbox>()
        .map_err(|e| NotifyError::InvalidRecipient(format!("bad email address: {e}")))
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn deliver(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let to = parse_recipient(recipient)?;
        let msg = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(payload.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                payload.text.clone(),
                payload.html.clone(),
            ))
            .map_err(|e| NotifyError::InvalidRecipient(format!("build email: {e}")))?;

        match self.mailer.send(msg).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(NotifyError::InvalidRecipient(e.to_string())),
            Err(e) => Err(NotifyError::ChannelUnavailable(format!("smtp: {e}"))),
        }
    }
}
