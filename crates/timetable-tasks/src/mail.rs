//! SMTP delivery for the `SendMail` builtin.
//!
//! The parameter row is a JSON object describing the server, the recipients
//! and the content, including optional file attachments and inline
//! attachment data. TLS is opportunistic: used when the server offers
//! STARTTLS, plain otherwise.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use tracing::debug;

use crate::{Result, TaskError};

/// Inline attachment carried in the payload itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EmailAttachment {
    /// File name presented to the recipient
    pub name: String,
    /// Base64-encoded attachment content
    pub base64data: String,
}

/// `SendMail` parameter payload
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EmailConn {
    /// SMTP user
    pub username: String,
    /// SMTP password
    pub password: String,
    /// SMTP server host
    pub serverhost: String,
    /// SMTP server port
    pub serverport: u16,
    /// From address
    pub senderaddr: String,
    /// Carbon-copy recipients
    pub ccaddr: Vec<String>,
    /// Blind-carbon-copy recipients
    pub bccaddr: Vec<String>,
    /// Primary recipients
    pub toaddr: Vec<String>,
    /// Subject line
    pub subject: String,
    /// Message body
    pub msgbody: String,
    /// Paths of files to attach
    #[serde(rename = "attachment")]
    pub attachments: Vec<String>,
    /// Inline attachments
    #[serde(rename = "attachmentdata")]
    pub attachment_data: Vec<EmailAttachment>,
    /// Body content type, `text/plain` when empty
    pub contenttype: String,
}

impl EmailConn {
    /// Reject payloads that cannot possibly be delivered
    pub fn validate(&self) -> Result<()> {
        if self.serverhost.is_empty() {
            return Err(TaskError::Invalid("mail server host not specified".into()));
        }
        if self.serverport == 0 {
            return Err(TaskError::Invalid("mail server port not specified".into()));
        }
        if self.username.is_empty() {
            return Err(TaskError::Invalid("mail server username not specified".into()));
        }
        if self.password.is_empty() {
            return Err(TaskError::Invalid("mail server password not specified".into()));
        }
        if self.senderaddr.is_empty() {
            return Err(TaskError::Invalid("sender address not specified".into()));
        }
        if self.toaddr.is_empty() && self.ccaddr.is_empty() && self.bccaddr.is_empty() {
            return Err(TaskError::Invalid("recipient address not specified".into()));
        }
        Ok(())
    }

    fn body_content_type(&self) -> Result<ContentType> {
        if self.contenttype.is_empty() {
            return Ok(ContentType::TEXT_PLAIN);
        }
        ContentType::parse(&self.contenttype)
            .map_err(|e| TaskError::Invalid(format!("bad content type {:?}: {e}", self.contenttype)))
    }
}

/// Validate the payload and deliver the message
pub async fn send_mail(conn: &EmailConn) -> Result<()> {
    conn.validate()?;
    let message = build_message(conn)?;
    let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&conn.serverhost)
        .port(conn.serverport)
        .credentials(Credentials::new(conn.username.clone(), conn.password.clone()))
        .tls(Tls::Opportunistic(TlsParameters::new(
            conn.serverhost.clone(),
        )?))
        .build();
    transport.send(message).await?;
    debug!(
        server = %conn.serverhost,
        recipients = conn.toaddr.len() + conn.ccaddr.len() + conn.bccaddr.len(),
        "Mail delivered"
    );
    Ok(())
}

fn build_message(conn: &EmailConn) -> Result<Message> {
    let mut builder = Message::builder()
        .from(conn.senderaddr.parse::<Mailbox>()?)
        .subject(&conn.subject);
    for to in &conn.toaddr {
        builder = builder.to(to.parse()?);
    }
    for cc in &conn.ccaddr {
        builder = builder.cc(cc.parse()?);
    }
    for bcc in &conn.bccaddr {
        builder = builder.bcc(bcc.parse()?);
    }

    let mut multipart = MultiPart::mixed().singlepart(
        SinglePart::builder()
            .header(conn.body_content_type()?)
            .body(conn.msgbody.clone()),
    );
    for path in &conn.attachments {
        let content = std::fs::read(path)?;
        multipart = multipart.singlepart(
            Attachment::new(attachment_name(path)).body(content, ContentType::parse("application/octet-stream").map_err(
                |e| TaskError::Invalid(format!("attachment content type: {e}")),
            )?),
        );
    }
    for inline in &conn.attachment_data {
        let content = BASE64.decode(&inline.base64data).map_err(|e| {
            TaskError::Invalid(format!("attachment {:?} is not valid base64: {e}", inline.name))
        })?;
        multipart = multipart.singlepart(
            Attachment::new(inline.name.clone()).body(
                content,
                ContentType::parse("application/octet-stream")
                    .map_err(|e| TaskError::Invalid(format!("attachment content type: {e}")))?,
            ),
        );
    }
    Ok(builder.multipart(multipart)?)
}

fn attachment_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_conn() -> EmailConn {
        EmailConn {
            username: "scheduler".into(),
            password: "secret".into(),
            serverhost: "smtp.example.org".into(),
            serverport: 587,
            senderaddr: "batch@example.org".into(),
            toaddr: vec!["ops@example.org".into()],
            subject: "nightly report".into(),
            msgbody: "all chains green".into(),
            ..EmailConn::default()
        }
    }

    #[test]
    fn test_payload_parses_wire_names() {
        let conn: EmailConn = serde_json::from_str(
            r#"{"username":"u","password":"p","serverhost":"h","serverport":25,
                "senderaddr":"a@b.c","toaddr":["x@y.z"],"subject":"s","msgbody":"m",
                "attachment":["/tmp/report.csv"],
                "attachmentdata":[{"name":"inline.txt","base64data":"hello"}],
                "contenttype":"text/html"}"#,
        )
        .unwrap();
        assert_eq!(conn.serverport, 25);
        assert_eq!(conn.attachments, vec!["/tmp/report.csv"]);
        assert_eq!(conn.attachment_data[0].name, "inline.txt");
        assert_eq!(conn.contenttype, "text/html");
    }

    #[test]
    fn test_validation_messages() {
        let mut conn = valid_conn();
        conn.serverhost.clear();
        assert!(conn.validate().unwrap_err().to_string().contains("server host"));

        let mut conn = valid_conn();
        conn.serverport = 0;
        assert!(conn.validate().unwrap_err().to_string().contains("server port"));

        let mut conn = valid_conn();
        conn.username.clear();
        assert!(conn.validate().unwrap_err().to_string().contains("username"));

        let mut conn = valid_conn();
        conn.password.clear();
        assert!(conn.validate().unwrap_err().to_string().contains("password"));

        let mut conn = valid_conn();
        conn.senderaddr.clear();
        assert!(conn.validate().unwrap_err().to_string().contains("sender"));

        let mut conn = valid_conn();
        conn.toaddr.clear();
        assert!(conn.validate().unwrap_err().to_string().contains("recipient"));

        // any one recipient list is enough
        let mut conn = valid_conn();
        conn.toaddr.clear();
        conn.bccaddr = vec!["audit@example.org".into()];
        assert!(conn.validate().is_ok());
    }

    #[test]
    fn test_build_message_with_attachments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "id,value").unwrap();

        let mut conn = valid_conn();
        conn.attachments = vec![file.path().to_string_lossy().into_owned()];
        conn.attachment_data = vec![EmailAttachment {
            name: "notes.txt".into(),
            base64data: BASE64.encode("see run 42 for details"),
        }];

        let message = build_message(&conn).unwrap();
        let rendered = String::from_utf8_lossy(&message.formatted()).into_owned();
        assert!(rendered.contains("nightly report"));
        assert!(rendered.contains("notes.txt"));
    }

    #[test]
    fn test_build_message_rejects_bad_inline_data() {
        let mut conn = valid_conn();
        conn.attachment_data = vec![EmailAttachment {
            name: "notes.txt".into(),
            base64data: "not base64!".into(),
        }];
        let err = build_message(&conn).unwrap_err();
        assert!(err.to_string().contains("not valid base64"));
    }

    #[test]
    fn test_build_message_rejects_bad_address() {
        let mut conn = valid_conn();
        conn.toaddr = vec!["definitely not an address".into()];
        assert!(build_message(&conn).is_err());
    }

    #[test]
    fn test_attachment_name_strips_directories() {
        assert_eq!(attachment_name("/var/reports/out.csv"), "out.csv");
        assert_eq!(attachment_name("plain.txt"), "plain.txt");
    }
}
