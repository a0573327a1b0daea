//! IMAP spam-scanning daemon library
//!
//! Watches a *scan mailbox* on an IMAP server, submits every new message
//! to an [Rspamd](https://rspamd.com)-compatible analyzer, inserts the
//! verdict as `X-rspamd-iscan-*` headers into a copy of the message,
//! archives the original to a *backup mailbox* and files the annotated
//! copy into the inbox or spam destination. Messages placed into the
//! *ham* and *undetected* mailboxes are periodically fed to the
//! analyzer's training endpoints and then moved to their canonical
//! destinations.
//!
//! The building blocks are exposed separately:
//!
//! - [`ImapClient`] -- narrow facade over the IMAP connection
//! - [`Analyzer`] -- HTTP client for the analysis service
//! - [`Scanner`] -- the scan/learn/monitor orchestration engine
//! - [`retry`] -- transient-error classification and the retry runner

pub mod analyzer;
pub mod config;
mod error;
pub mod imap;
pub mod mail;
pub mod retry;
mod scanner;

pub use analyzer::{Analyzer, CheckResult, MessageHints, Symbol};
pub use config::Config;
pub use error::{Error, Result};
pub use imap::{Envelope, ImapClient, ImapConfig, MailboxMonitor, Message, NewMessages};
pub use scanner::Scanner;
