/// Email sink — MIME message delivered over SMTP(S) by curl
///
/// The message is built in-process (multipart/mixed, base64 attachment) and
/// streamed to `curl --upload-file -`, which handles TLS and AUTH. Endpoint,
/// sender, recipient and credentials all come from `EmailConfig`.
///
/// Credentials never reach curl's argv (visible in `ps`): they go into a
/// temporary curl config file, owner-only, passed with `--config` and
/// removed once curl exits.

use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::{debug, info};

use super::{AlertMessage, Notifier};
use crate::config::EmailConfig;
use crate::error::DispatchError;

const CHANNEL: &str = "email";

pub struct EmailNotifier {
    cfg: EmailConfig,
}

impl EmailNotifier {
    pub fn new(cfg: EmailConfig) -> Self {
        Self { cfg }
    }

    /// RFC 5322 message with an optional attachment part.
    pub fn build_mime(&self, message: &AlertMessage, boundary: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!("From: {}\r\n", self.cfg.from));
        out.push_str(&format!("To: {}\r\n", self.cfg.to));
        out.push_str(&format!("Subject: {}\r\n", encode_header(&message.subject)));
        out.push_str(&format!("Date: {}\r\n", Utc::now().to_rfc2822()));
        out.push_str("MIME-Version: 1.0\r\n");

        let Some(att) = &message.attachment else {
            out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
            out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
            out.push_str(&message.body);
            out.push_str("\r\n");
            return out;
        };

        out.push_str(&format!(
            "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
            boundary
        ));

        // Body part
        out.push_str(&format!("--{}\r\n", boundary));
        out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        out.push_str("Content-Transfer-Encoding: 8bit\r\n\r\n");
        out.push_str(&message.body);
        out.push_str("\r\n");

        // Attachment part
        out.push_str(&format!("--{}\r\n", boundary));
        out.push_str(&format!(
            "Content-Type: {}; name=\"{}\"\r\n",
            att.content_type, att.filename
        ));
        out.push_str("Content-Transfer-Encoding: base64\r\n");
        out.push_str(&format!(
            "Content-Disposition: attachment; filename=\"{}\"\r\n\r\n",
            att.filename
        ));

        // Split base64 into 76-char lines
        let b64 = base64::engine::general_purpose::STANDARD.encode(&att.bytes);
        for chunk in b64.as_bytes().chunks(76) {
            out.push_str(&String::from_utf8_lossy(chunk));
            out.push_str("\r\n");
        }

        out.push_str(&format!("--{}--\r\n", boundary));
        out
    }

    /// Curl config holding `user = "name:password"`, or `None` when no
    /// username is configured. The file is deleted on drop.
    fn credentials_file(&self) -> std::io::Result<Option<NamedTempFile>> {
        let cfg = &self.cfg;
        if cfg.username.is_empty() {
            return Ok(None);
        }
        let password = cfg.password.as_deref().unwrap_or_default();
        let mut file = tempfile::Builder::new().prefix("helmet-watch-curl-").tempfile()?;
        writeln!(file, "user = \"{}\"", curl_quote(&format!("{}:{}", cfg.username, password)))?;
        file.flush()?;
        Ok(Some(file))
    }

    fn curl_command(&self, credentials: Option<&Path>) -> Command {
        let cfg = &self.cfg;
        let mut cmd = Command::new(&cfg.curl_binary);
        cmd.arg("--silent")
            .arg("--show-error")
            .arg("--ssl-reqd")
            .arg("--max-time")
            .arg(cfg.timeout_seconds.to_string())
            .arg("--url")
            .arg(&cfg.smtp_url)
            .arg("--mail-from")
            .arg(&cfg.from)
            .arg("--mail-rcpt")
            .arg(&cfg.to)
            .arg("--upload-file")
            .arg("-");
        if let Some(path) = credentials {
            cmd.arg("--config").arg(path);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Escape for a double-quoted curl config value.
fn curl_quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// RFC 2047 encoded-word for non-ASCII subjects.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!(
            "=?utf-8?B?{}?=",
            base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
        )
    }
}

fn transport(reason: impl ToString) -> DispatchError {
    DispatchError::Transport {
        channel: CHANNEL.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        CHANNEL
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), DispatchError> {
        let boundary = format!("helmet-watch-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let mime = self.build_mime(message, &boundary);

        let credentials = self
            .credentials_file()
            .map_err(|e| transport(format!("cannot write curl credentials: {}", e)))?;
        let mut child = self
            .curl_command(credentials.as_ref().map(|f| f.path()))
            .spawn()
            .map_err(|e| transport(format!("cannot start {}: {}", self.cfg.curl_binary, e)))?;

        let write_result = match child.stdin.take() {
            Some(mut stdin) => {
                let r = stdin.write_all(mime.as_bytes()).await;
                // EOF for curl
                drop(stdin);
                r
            }
            None => Ok(()),
        };
        if let Err(e) = &write_result {
            debug!("Email body write interrupted: {}", e);
        }

        let grace = Duration::from_secs(self.cfg.timeout_seconds + 5);
        let output = tokio::time::timeout(grace, child.wait_with_output())
            .await
            .map_err(|_| transport("timed out waiting for curl"))?
            .map_err(transport)?;
        drop(credentials);

        if !output.status.success() {
            return Err(DispatchError::Rejected {
                channel: CHANNEL.to_string(),
                reason: format!(
                    "{} ({})",
                    String::from_utf8_lossy(&output.stderr).trim(),
                    output.status
                ),
            });
        }
        write_result.map_err(transport)?;

        info!(
            source = %message.source_id,
            to = %self.cfg.to,
            attachments = message.attachment.is_some() as u8,
            "Email sent"
        );
        Ok(())
    }
}
