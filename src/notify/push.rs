//! PushPlus-style webhook: POST `{token, title, content, template}` and expect `{code: 200}`.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Channel, ChannelSender, NotificationPayload};
use crate::error::NotifyError;

#[derive(Clone)]
pub struct PushSender {
    endpoint: String,
    client: Client,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    token: &'a str,
    title: &'a str,
    content: &'a str,
    template: &'a str,
}

#[derive(Deserialize)]
struct PushResponse {
    code: i64,
    #[serde(default)]
    msg: String,
}

impl PushSender {
    pub fn new(endpoint: &str) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(4))
            .build()
            .context("building push http client")?;
        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
        })
    }
}

#[async_trait]
impl ChannelSender for PushSender {
    fn channel(&self) -> Channel {
        Channel::Push
    }

    async fn deliver(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> Result<(), NotifyError> {
        let token = recipient.trim();
        if token.is_empty() {
            return Err(NotifyError::InvalidRecipient("empty push token".into()));
        }
        let body = PushRequest {
            token,
            title: &payload.subject,
            content: &payload.html,
            template: "html",
        };

        let rsp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::ChannelUnavailable(format!("push request failed: {e}")))?;

        let status = rsp.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(NotifyError::InvalidRecipient(format!("push http {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(NotifyError::ChannelUnavailable(format!("push http {}", status.as_u16())));
        }
        let ack: PushResponse = rsp
            .json()
            .await
            .map_err(|e| NotifyError::ChannelUnavailable(format!("push response: {e}")))?;
        if ack.code != 200 {
            return Err(NotifyError::ChannelUnavailable(format!(
                "push rejected (code {}): {}",
                ack.code, ack.msg
            )));
        }
        Ok(())
    }
}
