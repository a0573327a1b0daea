//! Error types for rspamd-iscan

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("establishing imap server connection failed")]
    Connect(#[source] async_imap::error::Error),

    #[error("login at imap server failed")]
    Login(#[source] async_imap::error::Error),

    #[error("closing imap session failed")]
    Logout(#[source] async_imap::error::Error),

    #[error("selecting mailbox {mailbox} failed")]
    Select {
        mailbox: String,
        #[source]
        source: async_imap::error::Error,
    },

    #[error("fetching messages from mailbox {mailbox} failed")]
    Fetch {
        mailbox: String,
        #[source]
        source: async_imap::error::Error,
    },

    #[error("uploading mail to mailbox {mailbox} failed")]
    Upload {
        mailbox: String,
        #[source]
        source: async_imap::error::Error,
    },

    #[error("moving messages to mailbox {mailbox} failed")]
    Move {
        mailbox: String,
        #[source]
        source: async_imap::error::Error,
    },

    #[error("idle on mailbox {mailbox} failed")]
    Idle {
        mailbox: String,
        #[source]
        source: async_imap::error::Error,
    },

    #[error("no uids were given")]
    EmptyUidSet,

    #[error("not connected to an imap server")]
    NotConnected,

    #[error("monitor task terminated abnormally: {0}")]
    MonitorTask(String),

    #[error("mail UID {uid}: {reason}")]
    MalformedMessage { uid: u32, reason: &'static str },

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("header end not found")]
    HeaderEndNotFound,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("analyzer request failed")]
    AnalyzerTransport(#[from] reqwest::Error),

    #[error("analyzer request failed with status: {0}")]
    AnalyzerStatus(String),

    #[error("analyzer response has content-type {0:?}, expecting application/json")]
    AnalyzerContentType(String),

    #[error("retryable: {0}")]
    Retryable(#[source] Box<Error>),

    #[error("max. number of retries ({retries}) exceeded: {source}")]
    MaxRetriesExceeded {
        retries: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("{}", join_messages(.0))]
    Aggregate(Vec<Error>),
}

impl Error {
    /// Collapse a list of accumulated errors into a single result:
    /// no errors is success, one error is returned as-is, more are
    /// joined into [`Error::Aggregate`].
    pub(crate) fn join(mut errs: Vec<Error>) -> Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Error::Aggregate(errs)),
        }
    }
}

fn join_messages(errs: &[Error]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
