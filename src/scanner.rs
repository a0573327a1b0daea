//! The scan/learn orchestration engine
//!
//! Composes the IMAP facade, the analyzer client and the header
//! insertion engine into the externally visible behavior: scanning the
//! scan mailbox, replacing messages with annotated copies, feeding the
//! training mailboxes to the analyzer and reacting to mailbox change
//! notifications.
//!
//! The replace operation is at-least-once by construction: the
//! original is moved to the backup mailbox *before* the annotated copy
//! is uploaded. A crash in between leaves the original retrievable at
//! the cost of a possible duplicate annotated upload on the next run.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::{Analyzer, CheckResult, MessageHints};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::imap::{Envelope, ImapClient, Message};
use crate::mail::{self, Header};
use crate::retry::into_retryable;

const HDR_PREFIX: &str = "X-rspamd-iscan-";
const HDR_SCORE: &str = "X-rspamd-iscan-Score";

/// Pause after a scan pass that could not process anything. A message
/// the pass skips (e.g. a malformed one) stays in the scan mailbox and
/// would re-trigger a synthetic change event immediately.
const STUCK_MAIL_PAUSE: Duration = Duration::from_secs(10);

/// A scanned message awaiting its replace-with-annotated-copy step.
struct ScannedMail {
    path: PathBuf,
    uid: u32,
    envelope: Envelope,
    verdict: CheckResult,
}

enum LearnKind {
    Ham,
    Spam,
}

/// The daemon engine. Owns the IMAP connection and drives the
/// scan/learn/monitor state machine.
pub struct Scanner {
    imap: ImapClient,
    analyzer: Analyzer,

    scan_mailbox: String,
    inbox_mailbox: String,
    spam_mailbox: String,
    ham_mailbox: String,
    undetected_mailbox: String,
    backup_mailbox: String,
    spam_threshold: f32,

    temp_dir: PathBuf,
    keep_temp_files: bool,

    learn_interval: Duration,

    stop: CancellationToken,

    // counts messages processed in the scan, ham and undetected
    // mailboxes; tests use it to await quiescence
    processed_mails: Arc<AtomicU64>,
}

impl Scanner {
    pub fn new(cfg: &Config, imap: ImapClient, analyzer: Analyzer, stop: CancellationToken) -> Self {
        Self {
            imap,
            analyzer,
            scan_mailbox: cfg.scan_mailbox.clone(),
            inbox_mailbox: cfg.inbox_mailbox.clone(),
            spam_mailbox: cfg.spam_mailbox.clone(),
            ham_mailbox: cfg.ham_mailbox.clone(),
            undetected_mailbox: cfg.undetected_mailbox.clone(),
            backup_mailbox: cfg.backup_mailbox.clone(),
            spam_threshold: cfg.spam_threshold,
            temp_dir: cfg.temp_dir.clone(),
            keep_temp_files: cfg.keep_temp_files,
            learn_interval: Duration::from_secs(cfg.learn_interval_secs),
            stop,
            processed_mails: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Token that unblocks [`Scanner::monitor`] when cancelled.
    /// Cancelling is idempotent.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Handle to the processed-mail counter.
    pub fn processed_mails(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.processed_mails)
    }

    /// Override the pause between training runs.
    pub fn set_learn_interval(&mut self, interval: Duration) {
        self.learn_interval = interval;
    }

    /// Log out from the IMAP server.
    pub async fn close(&mut self) -> Result<()> {
        self.imap.logout().await
    }

    /// Process the ham, undetected and scan mailboxes once.
    pub async fn run_once(&mut self) -> Result<()> {
        self.process_ham().await?;
        self.process_spam().await?;
        self.process_scan_box().await
    }

    /// Learn the messages in the ham mailbox and move them to the
    /// inbox. A no-op when no ham mailbox is configured.
    pub async fn process_ham(&mut self) -> Result<()> {
        if self.ham_mailbox.is_empty() {
            return Ok(());
        }

        let src = self.ham_mailbox.clone();
        let dest = self.inbox_mailbox.clone();
        self.learn(&src, &dest, LearnKind::Ham).await
    }

    /// Learn the messages in the undetected mailbox as spam and move
    /// them to the spam mailbox. A no-op when no undetected mailbox is
    /// configured.
    pub async fn process_spam(&mut self) -> Result<()> {
        if self.undetected_mailbox.is_empty() {
            return Ok(());
        }

        let src = self.undetected_mailbox.clone();
        let dest = self.spam_mailbox.clone();
        self.learn(&src, &dest, LearnKind::Spam).await
    }

    async fn learn(&mut self, src_mailbox: &str, dest_mailbox: &str, kind: LearnKind) -> Result<()> {
        info!(
            mailbox.source = src_mailbox,
            "checking mailbox for new messages to learn"
        );

        let mut learned: Vec<u32> = Vec::new();

        for item in self.imap.messages(src_mailbox).await? {
            let msg = match item {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, "skipping malformed message");
                    continue;
                }
            };

            debug!(
                mail.subject = %msg.envelope.subject,
                mail.uid = msg.uid,
                "fetched message"
            );

            let hints = hints_from_envelope(&msg.envelope);
            let res = match kind {
                LearnKind::Ham => self.analyzer.learn_ham(msg.body, &hints).await,
                LearnKind::Spam => self.analyzer.learn_spam(msg.body, &hints).await,
            };

            if let Err(err) = res {
                // learning is best-effort, a failing analyzer must not
                // wedge the monitor loop
                warn!(error = %err, mail.uid = msg.uid, "learning message failed");
                return Ok(());
            }

            info!(mail.uid = msg.uid, "learned message");
            learned.push(msg.uid);
        }

        if learned.is_empty() {
            return Ok(());
        }

        self.imap.move_messages(&learned, dest_mailbox).await?;
        self.processed_mails
            .fetch_add(learned.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    fn is_spam(&self, verdict: &CheckResult) -> bool {
        verdict.score >= self.spam_threshold
    }

    /// Scan all messages in the scan mailbox, then replace each with
    /// its annotated copy.
    pub async fn process_scan_box(&mut self) -> Result<()> {
        info!(mailbox.source = %self.scan_mailbox, "processing scan box");

        let mut scanned: Vec<ScannedMail> = Vec::new();
        let mut errs: Vec<Error> = Vec::new();

        let scan_mailbox = self.scan_mailbox.clone();
        for item in self.imap.messages(&scan_mailbox).await? {
            let msg = match item {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, "skipping malformed message");
                    continue;
                }
            };

            match self.download_and_scan(msg).await {
                Ok(mail) => scanned.push(mail),
                Err(err) => {
                    // a tmpfile or analyzer failure would hit every
                    // following message of this pass too
                    errs.push(err);
                    break;
                }
            }
        }

        let count = scanned.len() as u64;
        if let Err(err) = self.replace_with_modified(scanned).await {
            errs.push(err);
        }
        self.processed_mails.fetch_add(count, Ordering::Relaxed);

        Error::join(errs)
    }

    /// Spool the message body to a temp file, scan it and insert the
    /// verdict headers.
    async fn download_and_scan(&mut self, msg: Message) -> Result<ScannedMail> {
        let tmp = tempfile::Builder::new()
            .prefix(&format!("rspamd-iscan-mail-{}-", msg.uid))
            .tempfile_in(&self.temp_dir)?;
        let (mut file, path) = tmp.keep().map_err(|err| Error::Io(err.error))?;

        if let Err(err) = file.write_all(&msg.body).and_then(|()| file.flush()) {
            self.discard_temp_file(&path);
            return Err(err.into());
        }
        drop(file);

        debug!(
            mail.subject = %msg.envelope.subject,
            mail.uid = msg.uid,
            mail.envelope.message_id = %msg.envelope.message_id,
            path = %path.display(),
            "downloaded imap message"
        );

        let hints = hints_from_envelope(&msg.envelope);
        let verdict = match self.analyzer.check(msg.body, &hints).await {
            Ok(verdict) => verdict,
            Err(err) => {
                self.discard_temp_file(&path);
                return Err(err);
            }
        };

        let headers = match scan_result_headers(&verdict) {
            Ok(headers) => headers,
            Err(err) => {
                self.discard_temp_file(&path);
                return Err(err);
            }
        };

        if let Err(err) = mail::insert_headers(&path, &headers) {
            self.discard_temp_file(&path);
            return Err(err);
        }

        info!(
            mail.uid = msg.uid,
            scan.score = verdict.score,
            scan.is_spam = self.is_spam(&verdict),
            "message scanned"
        );

        Ok(ScannedMail {
            path,
            uid: msg.uid,
            envelope: msg.envelope,
            verdict,
        })
    }

    fn discard_temp_file(&self, path: &std::path::Path) {
        if self.keep_temp_files {
            return;
        }

        if let Err(err) = std::fs::remove_file(path) {
            error!(
                error = %err,
                path = %path.display(),
                "deleting temporary file failed"
            );
        }
    }

    /// Move the originals to the backup mailbox and upload the
    /// annotated copies to the spam or inbox mailbox.
    ///
    /// Per-mail failures are accumulated; a failed backup move skips
    /// the mail entirely (the original stays in the scan mailbox and
    /// is picked up by the next pass).
    async fn replace_with_modified(&mut self, mails: Vec<ScannedMail>) -> Result<()> {
        let mut errs: Vec<Error> = Vec::new();
        let backup_mailbox = self.backup_mailbox.clone();

        for mail in mails {
            if let Err(err) = self.imap.move_messages(&[mail.uid], &backup_mailbox).await {
                errs.push(err);
                continue;
            }

            let dest = if self.is_spam(&mail.verdict) {
                self.spam_mailbox.clone()
            } else {
                self.inbox_mailbox.clone()
            };

            if let Err(err) = self.imap.upload(&mail.path, &dest, mail.envelope.date).await {
                warn!(
                    mail.uid = mail.uid,
                    mail.subject = %mail.envelope.subject,
                    filepath = %mail.path.display(),
                    "uploading scanned email failed, please find the original email in the backup mailbox!"
                );
                errs.push(err);
                continue;
            }

            if !self.keep_temp_files {
                if let Err(err) = std::fs::remove_file(&mail.path) {
                    warn!(
                        error = %err,
                        filepath = %mail.path.display(),
                        "deleting email file failed"
                    );
                }
            }

            info!(
                mail.uid = mail.uid,
                mailbox.destination = %dest,
                "moved message to backup mailbox and uploaded annotated copy"
            );
        }

        Error::join(errs)
    }

    /// Monitor the scan mailbox for new messages and process them
    /// continuously; periodically run the training passes.
    ///
    /// Blocks until the stop token is cancelled or a fatal error
    /// occurs. Transport errors are marked retryable for the outer
    /// retry runner. Call [`Scanner::close`] afterwards to release the
    /// IMAP connection.
    pub async fn monitor(&mut self) -> Result<()> {
        self.run_once().await.map_err(into_retryable)?;

        let stop = self.stop.clone();
        let mut last_learn = Instant::now();

        loop {
            let scan_mailbox = self.scan_mailbox.clone();
            let mut monitor = self
                .imap
                .monitor(&scan_mailbox)
                .await
                .map_err(into_retryable)?;

            debug!("waiting for mailbox update events");
            let learn_in = self.learn_interval.saturating_sub(last_learn.elapsed());

            tokio::select! {
                () = tokio::time::sleep(learn_in) => {
                    debug!("learn timer expired, checking mailboxes for new messages");
                    self.imap.stop_monitor(monitor).await.map_err(into_retryable)?;

                    // monitoring has been observed to stall without
                    // delivering updates, the periodic re-scan works
                    // around it
                    self.process_scan_box().await.map_err(into_retryable)?;
                    self.process_ham().await.map_err(into_retryable)?;
                    self.process_spam().await.map_err(into_retryable)?;

                    last_learn = Instant::now();
                }

                event = monitor.recv() => {
                    match event {
                        None => {
                            debug!("event channel was closed");
                            self.imap.stop_monitor(monitor).await.map_err(into_retryable)?;
                            return Ok(());
                        }
                        Some(event) => {
                            self.imap.stop_monitor(monitor).await.map_err(into_retryable)?;

                            if event.count == 0 {
                                debug!("ignoring mailbox update, no new messages");
                                continue;
                            }

                            let before = self.processed_mails.load(Ordering::Relaxed);
                            self.process_scan_box().await.map_err(into_retryable)?;

                            if self.processed_mails.load(Ordering::Relaxed) == before {
                                warn!("scan pass made no progress, pausing before monitoring again");
                                tokio::select! {
                                    () = tokio::time::sleep(STUCK_MAIL_PAUSE) => {}
                                    () = stop.cancelled() => return Ok(()),
                                }
                            }
                        }
                    }
                }

                () = stop.cancelled() => {
                    self.imap.stop_monitor(monitor).await.map_err(into_retryable)?;
                    return Ok(());
                }
            }
        }
    }
}

fn hints_from_envelope(env: &Envelope) -> MessageHints {
    MessageHints {
        deliver_to: None,
        from: env.from.clone(),
        recipients: env.recipients.clone(),
        subject: env.subject.clone(),
    }
}

/// Render the header block for a verdict: one symbol header per
/// non-zero score plus the total score, sorted by name with the score
/// header last.
fn scan_result_headers(verdict: &CheckResult) -> Result<Vec<u8>> {
    let mut headers: Vec<Header> = verdict
        .symbols
        .values()
        .filter(|sym| sym.score != 0.0)
        .map(|sym| Header::new(format!("{HDR_PREFIX}Symbol-{}", sym.name), sym.score.to_string()))
        .collect();

    headers.push(Header::new(HDR_SCORE, verdict.score.to_string()));
    sort_headers(&mut headers);

    mail::render_headers(&headers)
}

fn sort_headers(headers: &mut [Header]) {
    use std::cmp::Ordering;

    headers.sort_by(|a, b| {
        if a.name == HDR_SCORE {
            return Ordering::Greater;
        }
        if b.name == HDR_SCORE {
            return Ordering::Less;
        }

        a.name.cmp(&b.name).then_with(|| a.body.cmp(&b.body))
    });
}
