//! SMTP email transport via async lettre.
//!
//! Bodies go out as multipart/alternative: the rendered HTML plus a plain
//! text part derived with [`strip_html`].

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use regex::Regex;
use secrecy::ExposeSecret;

use super::{Delivery, SendRequest, Transport};
use crate::config::SmtpSettings;
use crate::error::TransportError;

/// SMTP sender. The session is built once and rebuilt after a failure.
pub struct SmtpMailer {
    settings: SmtpSettings,
    from: Mailbox,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    /// Build the sender. No connection is made until the first send or
    /// [`SmtpMailer::verify`].
    pub fn new(settings: SmtpSettings) -> Result<Self, TransportError> {
        let address: Address =
            settings
                .from_address
                .trim()
                .parse()
                .map_err(|e| TransportError::StartupFailed {
                    name: "smtp".into(),
                    reason: format!("invalid from address '{}': {e}", settings.from_address),
                })?;
        let from = Mailbox::new(settings.from_name.clone(), address);
        let transport = build_transport(&settings)?;

        Ok(Self {
            settings,
            from,
            transport,
        })
    }

    /// Open a session and authenticate, failing fast on bad settings.
    pub async fn verify(&self) -> Result<(), TransportError> {
        match self.transport.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::StartupFailed {
                name: "smtp".into(),
                reason: format!("{} did not accept the connection", self.settings.host),
            }),
            Err(e) => Err(TransportError::StartupFailed {
                name: "smtp".into(),
                reason: e.to_string(),
            }),
        }
    }

    fn build_message(&self, request: &SendRequest<'_>) -> Result<Message, TransportError> {
        let to: Mailbox = request
            .recipient
            .parse()
            .map_err(|e| TransportError::InvalidMessage {
                name: "smtp".into(),
                reason: format!("invalid recipient '{}': {e}", request.recipient),
            })?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(request.subject.unwrap_or_default())
            .multipart(MultiPart::alternative_plain_html(
                strip_html(request.body),
                request.body.to_string(),
            ))
            .map_err(|e| TransportError::InvalidMessage {
                name: "smtp".into(),
                reason: format!("failed to build email: {e}"),
            })
    }
}

fn build_transport(
    settings: &SmtpSettings,
) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
    let host = settings.host.trim();
    let builder = if settings.use_tls {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(|e| {
            TransportError::StartupFailed {
                name: "smtp".into(),
                reason: format!("SMTP relay error: {e}"),
            }
        })?
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
    };

    let mut builder = builder
        .port(settings.port)
        .timeout(Some(settings.timeout));
    if !settings.username.is_empty() {
        builder = builder.credentials(Credentials::new(
            settings.username.clone(),
            settings.password.expose_secret().to_string(),
        ));
    }
    Ok(builder.build())
}

#[async_trait]
impl Transport for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    /// The session credential is fixed at build time from [`SmtpSettings`];
    /// `request.credential` is not consulted.
    async fn send(
        &mut self,
        request: &SendRequest<'_>,
        _timeout: Duration,
    ) -> Result<Delivery, TransportError> {
        let message = self.build_message(request)?;

        match self.transport.send(message).await {
            Ok(response) => Ok(Delivery {
                ok: response.is_positive(),
                status_code: response.code().to_string().parse().ok(),
                response: response.message().collect::<Vec<_>>().join(" "),
            }),
            Err(e) => match e.status() {
                Some(code) => Ok(Delivery {
                    ok: false,
                    status_code: code.to_string().parse().ok(),
                    response: e.to_string(),
                }),
                None => Err(TransportError::SendFailed {
                    name: "smtp".into(),
                    reason: e.to_string(),
                }),
            },
        }
    }

    async fn reset(&mut self) -> Result<(), TransportError> {
        self.transport = build_transport(&self.settings)?;
        tracing::debug!(host = %self.settings.host, "SMTP session rebuilt");
        Ok(())
    }
}

// ── HTML to text ────────────────────────────────────────────────────

static SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").expect("valid regex"));
static STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b[^>]*>.*?</style\s*>").expect("valid regex"));
static BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").expect("valid regex"));
static PARAGRAPH_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)</p\s*>").expect("valid regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s+\n").expect("valid regex"));
static SPACE_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]{2,}").expect("valid regex"));

/// Plain-text fallback for an HTML body.
///
/// Drops scripts and styles, turns `<br>` into a newline and `</p>` into a
/// blank line, removes remaining tags, decodes `&nbsp; &amp; &lt; &gt;`,
/// and collapses runs of blank lines and spaces.
pub fn strip_html(html: &str) -> String {
    let text = SCRIPT.replace_all(html, "");
    let text = STYLE.replace_all(&text, "");
    let text = BREAK.replace_all(&text, "\n");
    let text = PARAGRAPH_END.replace_all(&text, "\n\n");
    let text = TAG.replace_all(&text, "");
    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">");
    let text = BLANK_LINES.replace_all(&text, "\n\n");
    let text = SPACE_RUNS.replace_all(&text, " ");
    text.trim().to_string()
}
