//! Mailbox access façade (spec §6: "IMAP protocol handling" is an external
//! collaborator with a defined interface only). The `imap` crate is blocking,
//! so [`ImapMailboxClient`] runs each poll on a blocking thread via
//! `tokio::task::spawn_blocking`.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{FetcherError, Result};

/// One unread message's plain-text body, ready for URL extraction by
/// [`crate::email_source::EmailSource`].
#[derive(Debug, Clone)]
pub struct UnseenMessage {
    pub uid: u32,
    pub body: String,
}

/// Polls a single mailbox for unread messages.
#[async_trait]
pub trait MailboxClient: Send + Sync {
    /// Fetch and return all currently-unseen messages without marking them
    /// read — [`EmailSource`][crate::email_source::EmailSource] marks them
    /// seen only after successful URL extraction, so a crash mid-poll
    /// re-processes rather than silently drops mail.
    async fn fetch_unseen(&self) -> Result<Vec<UnseenMessage>>;

    /// Mark a message as seen after it has been fully processed.
    async fn mark_seen(&self, uid: u32) -> Result<()>;
}

/// Walks a parsed MIME tree collecting decoded `text/*` bodies. `get_body`
/// undoes the part's content-transfer-encoding (quoted-printable, base64)
/// and charset, which a raw byte scan of the wire body would miss —
/// multipart/alternative mail commonly carries its only `text/plain` part
/// quoted-printable-encoded.
fn decoded_text(part: &mailparse::ParsedMail) -> String {
    if part.subparts.is_empty() {
        return if part.ctype.mimetype.starts_with("text/") {
            part.get_body().unwrap_or_default()
        } else {
            String::new()
        };
    }
    part.subparts
        .iter()
        .map(decoded_text)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Real [`MailboxClient`] backed by the `imap` crate over implicit TLS,
/// grounded on the blocking-thread-plus-channel shape of
/// `idlemail`'s `ImapIdleSource` (see examples/other_examples).
pub struct ImapMailboxClient {
    server: String,
    port: u16,
    username: String,
    password: String,
    mailbox: String,
}

impl ImapMailboxClient {
    pub fn new(
        server: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        mailbox: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            port,
            username: username.into(),
            password: password.into(),
            mailbox: mailbox.into(),
        }
    }

    fn connect(&self) -> Result<imap::Session<native_tls::TlsStream<std::net::TcpStream>>> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| FetcherError::Mailbox(format!("tls connector: {e}")))?;
        let client = imap::connect((self.server.as_str(), self.port), &self.server, &tls)
            .map_err(|e| FetcherError::Mailbox(format!("connect to {}: {e}", self.server)))?;
        client
            .login(&self.username, &self.password)
            .map_err(|(e, _client)| FetcherError::Mailbox(format!("login failed: {e}")))
    }
}

#[async_trait]
impl MailboxClient for ImapMailboxClient {
    async fn fetch_unseen(&self) -> Result<Vec<UnseenMessage>> {
        let server = self.server.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();
        let mailbox = self.mailbox.clone();

        tokio::task::spawn_blocking(move || -> Result<Vec<UnseenMessage>> {
            let client = ImapMailboxClient::new(server, port, username, password, mailbox.clone());
            let mut session = client.connect()?;
            session
                .select(&mailbox)
                .map_err(|e| FetcherError::Mailbox(format!("select {mailbox}: {e}")))?;

            let uids = session
                .uid_search("UNSEEN")
                .map_err(|e| FetcherError::Mailbox(format!("search UNSEEN: {e}")))?;

            let mut messages = Vec::with_capacity(uids.len());
            for uid in uids {
                let fetched = session
                    .uid_fetch(uid.to_string(), "BODY.PEEK[]")
                    .map_err(|e| FetcherError::Mailbox(format!("fetch uid {uid}: {e}")))?;
                let Some(msg) = fetched.iter().next() else {
                    continue;
                };
                let Some(raw) = msg.body() else {
                    continue;
                };
                let parsed = mailparse::parse_mail(raw)
                    .map_err(|e| FetcherError::Mailbox(format!("parse uid {uid}: {e}")))?;
                let body = decoded_text(&parsed);
                messages.push(UnseenMessage { uid, body });
            }

            let _ = session.logout();
            debug!(count = messages.len(), "fetched unseen messages");
            Ok(messages)
        })
        .await
        .map_err(|e| FetcherError::Mailbox(format!("blocking task join: {e}")))?
    }

    async fn mark_seen(&self, uid: u32) -> Result<()> {
        let server = self.server.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();
        let mailbox = self.mailbox.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let client = ImapMailboxClient::new(server, port, username, password, mailbox.clone());
            let mut session = client.connect()?;
            session
                .select(&mailbox)
                .map_err(|e| FetcherError::Mailbox(format!("select {mailbox}: {e}")))?;
            session
                .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
                .map_err(|e| FetcherError::Mailbox(format!("store seen flag: {e}")))?;
            let _ = session.logout();
            Ok(())
        })
        .await
        .map_err(|e| FetcherError::Mailbox(format!("blocking task join: {e}")))?
    }
}
