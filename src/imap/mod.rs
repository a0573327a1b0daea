//! Narrow facade over the IMAP connection
//!
//! Exposes exactly the operations the scan engine needs: connect,
//! iterate a mailbox, upload a file, move messages and monitor a
//! mailbox for changes. At most one caller may use the facade at a
//! time; while a monitor is active no other operation may be issued
//! until [`ImapClient::stop_monitor`] has returned.

mod connection;
mod message;
mod monitor;

use std::path::Path;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::debug;

pub use connection::{ImapSession, ImapStream};
pub use message::{Envelope, Message};
pub use monitor::{MailboxMonitor, NewMessages};

use crate::error::{Error, Result};

/// IMAP connection parameters.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    /// `host:port` address of the IMAP server. Port 993 or "imaps"
    /// selects implicit TLS, everything else STARTTLS.
    pub address: String,
    pub user: String,
    pub password: String,
    /// Fall back to an unencrypted connection when the server does not
    /// support STARTTLS, and skip certificate verification.
    pub allow_insecure: bool,
    /// Log instead of executing the operations that modify mailboxes.
    pub dry_run: bool,
}

/// A connected, authenticated IMAP client.
pub struct ImapClient {
    // None while a monitor owns the session or after logout
    session: Option<ImapSession>,
    dry_run: bool,
}

impl ImapClient {
    /// Establish a connection with the IMAP server and authenticate.
    pub async fn connect(cfg: &ImapConfig) -> Result<Self> {
        let session =
            connection::connect(&cfg.address, &cfg.user, &cfg.password, cfg.allow_insecure).await?;

        Ok(Self {
            session: Some(session),
            dry_run: cfg.dry_run,
        })
    }

    fn session_mut(&mut self) -> Result<&mut ImapSession> {
        self.session.as_mut().ok_or(Error::NotConnected)
    }

    pub(crate) fn take_session(&mut self) -> Result<ImapSession> {
        self.session.take().ok_or(Error::NotConnected)
    }

    pub(crate) fn put_session(&mut self, session: ImapSession) {
        self.session = Some(session);
    }

    /// Fetch all messages of `mailbox` in UID order, as delivered by
    /// the server.
    ///
    /// Malformed fetch results are returned as
    /// [`Error::MalformedMessage`] entries so the caller can skip them;
    /// transport errors abort the whole call. The fetch response is
    /// drained before returning, the bodies are held in memory.
    pub async fn messages(&mut self, mailbox: &str) -> Result<Vec<Result<Message>>> {
        let session = self.session_mut()?;

        let mbox = session.select(mailbox).await.map_err(|err| Error::Select {
            mailbox: mailbox.to_string(),
            source: err,
        })?;

        if mbox.exists == 0 {
            debug!(mailbox, "mailbox is empty");
            return Ok(Vec::new());
        }

        debug!(mailbox, count = mbox.exists, "new messages found");

        let mut result = Vec::with_capacity(mbox.exists as usize);
        let mut fetch_err = None;

        {
            let mut stream = session
                .uid_fetch("1:*", "(UID ENVELOPE INTERNALDATE BODY.PEEK[])")
                .await
                .map_err(|err| Error::Fetch {
                    mailbox: mailbox.to_string(),
                    source: err,
                })?;

            while let Some(item) = stream.next().await {
                match item {
                    Ok(fetch) => result.push(message::message_from_fetch(&fetch)),
                    Err(err) => {
                        fetch_err = Some(Error::Fetch {
                            mailbox: mailbox.to_string(),
                            source: err,
                        });
                        break;
                    }
                }
            }
        }

        match fetch_err {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Read a message from `path` and append it to `mailbox` with the
    /// server-side internal date set to `ts`.
    pub async fn upload(&mut self, path: &Path, mailbox: &str, ts: DateTime<Utc>) -> Result<()> {
        if self.dry_run {
            debug!(
                mailbox,
                filepath = %path.display(),
                "dry-run: skipping uploading mail to mailbox"
            );
            return Ok(());
        }

        let data = tokio::fs::read(path).await?;
        // RFC 3501 date-time, quoted
        let internal_date = format!("\"{}\"", ts.format("%d-%b-%Y %H:%M:%S %z"));

        let session = self.session_mut()?;
        session
            .append(mailbox, None, Some(internal_date.as_str()), &data)
            .await
            .map_err(|err| Error::Upload {
                mailbox: mailbox.to_string(),
                source: err,
            })?;

        debug!(mailbox, filepath = %path.display(), "uploaded message to imap mailbox");
        Ok(())
    }

    /// Server-side move of the messages with the given UIDs to
    /// `mailbox`. The source mailbox must be the one last selected.
    pub async fn move_messages(&mut self, uids: &[u32], mailbox: &str) -> Result<()> {
        if uids.is_empty() {
            return Err(Error::EmptyUidSet);
        }

        if self.dry_run {
            debug!(
                mailbox,
                count = uids.len(),
                "dry-run: skipping moving messages to mailbox"
            );
            return Ok(());
        }

        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let session = self.session_mut()?;
        session.uid_mv(&set, mailbox).await.map_err(|err| Error::Move {
            mailbox: mailbox.to_string(),
            source: err,
        })?;

        debug!(mailbox, count = uids.len(), "moved imap messages");
        Ok(())
    }

    /// Log out and drop the session.
    pub async fn logout(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            session.logout().await.map_err(Error::Logout)?;
        }

        Ok(())
    }
}
