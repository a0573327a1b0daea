//! Fetched messages and their envelopes

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// A message fetched from a mailbox, with its body fully materialized.
#[derive(Debug, Clone)]
pub struct Message {
    pub uid: u32,
    pub envelope: Envelope,
    /// The raw RFC 5322 bytes.
    pub body: Vec<u8>,
}

/// Structured view of the key message headers, taken from the IMAP
/// ENVELOPE fetch item.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub date: DateTime<Utc>,
    pub subject: String,
    pub from: Vec<String>,
    /// The To, Cc and Bcc addresses.
    pub recipients: Vec<String>,
    pub message_id: String,
}

/// Maps a raw fetch result to a [`Message`].
///
/// Incomplete results (missing UID, envelope or body) are reported as
/// [`Error::MalformedMessage`] so the caller can skip them and keep
/// iterating.
pub(crate) fn message_from_fetch(fetch: &async_imap::types::Fetch) -> Result<Message> {
    let uid = fetch.uid.unwrap_or(0);
    if uid == 0 {
        return Err(Error::MalformedMessage {
            uid: 0,
            reason: "message uid is 0",
        });
    }

    let env = fetch.envelope().ok_or(Error::MalformedMessage {
        uid,
        reason: "message envelope is missing",
    })?;

    let body = fetch.body().ok_or(Error::MalformedMessage {
        uid,
        reason: "message is missing a body section",
    })?;

    if body.is_empty() {
        return Err(Error::MalformedMessage {
            uid,
            reason: "message body is empty",
        });
    }

    let date = env
        .date
        .as_deref()
        .and_then(parse_envelope_date)
        .or_else(|| fetch.internal_date().map(|d| d.with_timezone(&Utc)))
        .unwrap_or(DateTime::UNIX_EPOCH);

    let mut recipients = addresses(env.to.as_deref());
    recipients.extend(addresses(env.cc.as_deref()));
    recipients.extend(addresses(env.bcc.as_deref()));

    Ok(Message {
        uid,
        envelope: Envelope {
            date,
            subject: text(env.subject.as_deref()),
            from: addresses(env.from.as_deref()),
            recipients,
            message_id: text(env.message_id.as_deref()),
        },
        body: body.to_vec(),
    })
}

fn parse_envelope_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let raw = std::str::from_utf8(raw).ok()?;
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn text(raw: Option<&[u8]>) -> String {
    raw.map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

/// Flattens an ENVELOPE address list to `mailbox@host` strings.
fn addresses(list: Option<&[async_imap::imap_proto::Address<'_>]>) -> Vec<String> {
    let Some(list) = list else {
        return Vec::new();
    };

    list.iter()
        .filter_map(|addr| {
            let mailbox = addr.mailbox.as_deref()?;
            let host = addr.host.as_deref()?;
            Some(format!(
                "{}@{}",
                String::from_utf8_lossy(mailbox),
                String::from_utf8_lossy(host)
            ))
        })
        .collect()
}
