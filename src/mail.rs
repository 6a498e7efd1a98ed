use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as _};

use crate::config::AppConfig;
use crate::formats::MailAttachment;

pub const DEFAULT_BODY: &str = "Sent with easy-kindle.";

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(
        &self,
        subject: &str,
        body: &str,
        attachments: &[MailAttachment],
    ) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SmtpMailer {
    sender: String,
    receiver: String,
    password: String,
    server: String,
    port: u16,
}

impl SmtpMailer {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            sender: config.sender.clone(),
            receiver: config.receiver.clone(),
            password: config.password.clone(),
            server: config.server.clone(),
            port: config.port,
        }
    }

    fn build_message(
        &self,
        subject: &str,
        body: &str,
        attachments: &[MailAttachment],
    ) -> anyhow::Result<Message> {
        let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(body.to_owned()));
        for attachment in attachments {
            let bytes = std::fs::read(&attachment.path)
                .with_context(|| format!("read attachment: {}", attachment.path.display()))?;
            let content_type = ContentType::parse(content_type_for(&attachment.path))
                .with_context(|| format!("content type for: {}", attachment.filename))?;
            multipart = multipart
                .singlepart(Attachment::new(attachment.filename.clone()).body(bytes, content_type));
        }

        Message::builder()
            .from(self.sender.parse().context("parse sender address")?)
            .to(self.receiver.parse().context("parse receiver address")?)
            .subject(subject)
            .multipart(multipart)
            .context("build mail message")
    }

    fn transport(&self) -> anyhow::Result<SmtpTransport> {
        let builder = if self.port == 465 {
            SmtpTransport::relay(&self.server)
        } else {
            SmtpTransport::starttls_relay(&self.server)
        }
        .with_context(|| format!("smtp relay: {}", self.server))?;

        Ok(builder
            .port(self.port)
            .credentials(Credentials::new(self.sender.clone(), self.password.clone()))
            .build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn deliver(
        &self,
        subject: &str,
        body: &str,
        attachments: &[MailAttachment],
    ) -> anyhow::Result<()> {
        if attachments.is_empty() {
            anyhow::bail!("no attachments to send");
        }

        let message = self.build_message(subject, body, attachments)?;
        let transport = self.transport()?;
        let server = self.server.clone();
        let receiver = self.receiver.clone();

        tracing::info!(
            server = %server,
            to = %receiver,
            attachments = attachments.len(),
            "sending mail"
        );
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .context("join smtp send task")?
            .with_context(|| format!("send mail via {server}"))?;
        tracing::info!(to = %receiver, subject = %subject, "mail delivered");
        Ok(())
    }
}

pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "epub" => "application/epub+zip",
        "pdf" => "application/pdf",
        "mobi" => "application/x-mobipocket-ebook",
        "azw3" => "application/vnd.amazon.ebook",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
