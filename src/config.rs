//! Daemon configuration
//!
//! Loaded from a TOML file; passwords can alternatively be provided as
//! files in a credentials directory (systemd `LoadCredential` style).

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_learn_interval() -> u64 {
    30 * 60
}

/// Runtime configuration, deserialized from TOML.
///
/// Mailbox options reference folders on the IMAP server:
/// messages in `ScanMailbox` are scanned and their originals archived
/// to `BackupMailbox`; the annotated copies land in `InboxMailbox` or
/// `SpamMailbox` depending on the score. `HamMailbox` and
/// `UndetectedMailbox` feed the analyzer's training endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "AnalyzerURL", default)]
    pub analyzer_url: String,
    #[serde(rename = "AnalyzerPassword", default)]
    pub analyzer_password: String,

    #[serde(rename = "ImapAddress", default)]
    pub imap_address: String,
    #[serde(rename = "ImapUser", default)]
    pub imap_user: String,
    #[serde(rename = "ImapPassword", default)]
    pub imap_password: String,
    /// Allow falling back to an unencrypted connection when the server
    /// does not support STARTTLS, and skip TLS certificate
    /// verification.
    #[serde(rename = "AllowInsecure", default)]
    pub allow_insecure: bool,

    #[serde(rename = "ScanMailbox", default)]
    pub scan_mailbox: String,
    #[serde(rename = "InboxMailbox", default)]
    pub inbox_mailbox: String,
    #[serde(rename = "SpamMailbox", default)]
    pub spam_mailbox: String,
    #[serde(rename = "HamMailbox", default)]
    pub ham_mailbox: String,
    /// Source mailbox for spam training, an empty string disables it.
    #[serde(rename = "UndetectedMailbox", default)]
    pub undetected_mailbox: String,
    #[serde(rename = "BackupMailbox", default)]
    pub backup_mailbox: String,

    #[serde(rename = "TempDir", default)]
    pub temp_dir: PathBuf,
    #[serde(rename = "KeepTempFiles", default)]
    pub keep_temp_files: bool,

    /// Messages with a score >= the threshold are classified as spam.
    #[serde(rename = "SpamThreshold", default)]
    pub spam_threshold: f32,

    /// Pause between training runs, in seconds.
    #[serde(rename = "LearnInterval", default = "default_learn_interval")]
    pub learn_interval_secs: u64,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&raw)
            .map_err(|err| Error::Config(format!("parsing {} failed: {err}", path.display())))?;

        Ok(cfg)
    }

    pub fn set_defaults(&mut self) {
        if self.temp_dir.as_os_str().is_empty() {
            self.temp_dir = std::env::temp_dir();
        }
    }

    /// Overrides the passwords with the content of `ImapPassword` /
    /// `AnalyzerPassword` files in `dir`, when they exist.
    pub fn apply_credentials_dir(&mut self, dir: &Path) -> Result<()> {
        for (name, target) in [
            ("ImapPassword", &mut self.imap_password),
            ("AnalyzerPassword", &mut self.analyzer_password),
        ] {
            let path = dir.join(name);
            if !path.is_file() {
                continue;
            }

            let raw = std::fs::read_to_string(&path)?;
            *target = raw.trim_end_matches(['\r', '\n']).to_string();
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.analyzer_url.is_empty() {
            return Err(Error::Config("AnalyzerURL can not be empty".into()));
        }

        if self.imap_address.is_empty() {
            return Err(Error::Config("ImapAddress can not be empty".into()));
        }

        if self.imap_user.is_empty() {
            return Err(Error::Config("ImapUser can not be empty".into()));
        }

        if self.spam_threshold <= 0.0 {
            return Err(Error::Config("SpamThreshold must be >0".into()));
        }

        if self.scan_mailbox == self.inbox_mailbox {
            return Err(Error::Config(
                "ScanMailbox and InboxMailbox must differ".into(),
            ));
        }

        if self.scan_mailbox == self.undetected_mailbox {
            return Err(Error::Config(
                "ScanMailbox and UndetectedMailbox must differ".into(),
            ));
        }

        if self.scan_mailbox == self.ham_mailbox {
            return Err(Error::Config(
                "ScanMailbox and HamMailbox must differ".into(),
            ));
        }

        if self.backup_mailbox.is_empty() {
            return Err(Error::Config("BackupMailbox can not be empty".into()));
        }

        if self.backup_mailbox == self.inbox_mailbox {
            return Err(Error::Config(
                "BackupMailbox and InboxMailbox must differ".into(),
            ));
        }

        // Using the same mailbox for Spam, Ham and/or Backup would be
        // weird but should work fine!
        let meta = std::fs::metadata(&self.temp_dir).map_err(|err| {
            Error::Config(format!(
                "invalid TempDir ({}): {err}",
                self.temp_dir.display()
            ))
        })?;

        if !meta.is_dir() {
            return Err(Error::Config(format!(
                "specified TempDir ({}) is not a directory",
                self.temp_dir.display()
            )));
        }

        Ok(())
    }

    /// Human readable summary with passwords redacted, logged once at
    /// startup.
    pub fn summary(&self) -> String {
        const UNSET: &str = "UNSET";
        const HIDDEN: &str = "***";

        fn kv(out: &mut String, key: &str, value: impl std::fmt::Display) {
            let _ = writeln!(out, "{:<30}{value}", format!("{key}:"));
        }

        fn password(value: &str) -> &str {
            if value.is_empty() {
                UNSET
            } else {
                HIDDEN
            }
        }

        let mut out = String::from("Configuration:\n");
        kv(&mut out, "Analyzer URL", &self.analyzer_url);
        kv(&mut out, "Analyzer Password", password(&self.analyzer_password));
        kv(&mut out, "IMAP Server Address", &self.imap_address);
        kv(&mut out, "IMAP User", &self.imap_user);
        kv(&mut out, "IMAP Password", password(&self.imap_password));
        kv(&mut out, "Spam Threshold", self.spam_threshold);
        kv(&mut out, "Scan Mailbox", &self.scan_mailbox);
        kv(&mut out, "Inbox Mailbox", &self.inbox_mailbox);
        kv(&mut out, "Spam Mailbox", &self.spam_mailbox);
        kv(&mut out, "Undetected Mailbox", &self.undetected_mailbox);
        kv(&mut out, "Ham Mailbox", &self.ham_mailbox);
        kv(&mut out, "Backup Mailbox", &self.backup_mailbox);
        kv(&mut out, "Temporary Directory", self.temp_dir.display());
        kv(&mut out, "Keep Temporary Files", self.keep_temp_files);
        kv(&mut out, "Learn Interval (secs)", self.learn_interval_secs);

        out.push('\n');
        let _ = writeln!(
            out,
            "Mails in {:?} are scanned and backed up to {:?}.",
            self.scan_mailbox, self.backup_mailbox
        );
        let _ = writeln!(
            out,
            "Mails with a spam score of >={} are moved to {:?}, others are moved to {:?}.",
            self.spam_threshold, self.spam_mailbox, self.inbox_mailbox
        );
        if !self.undetected_mailbox.is_empty() {
            let _ = writeln!(
                out,
                "Mails in {:?} are learned as spam and moved to {:?}.",
                self.undetected_mailbox, self.spam_mailbox
            );
        }
        if !self.ham_mailbox.is_empty() {
            let _ = writeln!(
                out,
                "Mails in {:?} are learned as ham and moved to {:?}.",
                self.ham_mailbox, self.inbox_mailbox
            );
        }

        out
    }
}
