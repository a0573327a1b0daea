//! Mailbox change monitoring via IMAP IDLE
//!
//! The monitor is a level-triggered hint, not a queue: events are
//! delivered with a non-blocking send into a single-slot channel and
//! dropped when the slot is full. One delivered notification means
//! "recheck the mailbox", coalescing bursts is intended.
//!
//! While the IDLE task runs it owns the session; no other IMAP command
//! may be issued until [`ImapClient::stop_monitor`] has returned the
//! session to the client.

use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use super::connection::ImapSession;
use super::ImapClient;
use crate::error::{Error, Result};

/// Re-issue IDLE before the RFC 2177 30 minute inactivity limit.
const IDLE_REFRESH: Duration = Duration::from_secs(29 * 60);

/// Notification that the monitored mailbox changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewMessages {
    /// Number of messages in the mailbox; 0 marks a spurious update.
    pub count: u32,
}

/// Handle to an active mailbox monitor.
///
/// Receive events with [`MailboxMonitor::recv`]; `None` means the
/// monitor terminated on its own. Always pass the handle back to
/// [`ImapClient::stop_monitor`] before issuing other IMAP operations.
pub struct MailboxMonitor {
    events: mpsc::Receiver<NewMessages>,
    state: MonitorState,
}

enum MonitorState {
    /// The mailbox already contained messages, a single event was
    /// synthesized and no IDLE is running.
    Synthesized,
    /// An IDLE task owns the session.
    Idling {
        stop: oneshot::Sender<()>,
        task: JoinHandle<Result<ImapSession>>,
    },
}

impl MailboxMonitor {
    pub async fn recv(&mut self) -> Option<NewMessages> {
        self.events.recv().await
    }
}

impl ImapClient {
    /// Start monitoring `mailbox` for new messages.
    ///
    /// When the mailbox already has messages no IDLE is started: a
    /// single event is synthesized and the returned monitor's channel
    /// is already closed.
    pub async fn monitor(&mut self, mailbox: &str) -> Result<MailboxMonitor> {
        debug!(mailbox, "starting to monitor mailbox for changes");

        let mut session = self.take_session()?;

        let mbox = match session.examine(mailbox).await {
            Ok(mbox) => mbox,
            Err(err) => {
                self.put_session(session);
                return Err(Error::Select {
                    mailbox: mailbox.to_string(),
                    source: err,
                });
            }
        };

        let (events_tx, events_rx) = mpsc::channel(1);

        if mbox.exists != 0 {
            debug!(
                mailbox,
                count = mbox.exists,
                "mailbox already has messages, skipping idle"
            );
            let _ = events_tx.try_send(NewMessages { count: mbox.exists });
            self.put_session(session);
            // dropping events_tx closes the channel behind the
            // buffered event
            return Ok(MailboxMonitor {
                events: events_rx,
                state: MonitorState::Synthesized,
            });
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(idle_task(
            session,
            mailbox.to_string(),
            events_tx,
            stop_rx,
        ));

        Ok(MailboxMonitor {
            events: events_rx,
            state: MonitorState::Idling {
                stop: stop_tx,
                task,
            },
        })
    }

    /// Terminate the monitor and reclaim the session.
    ///
    /// Must complete before any other IMAP operation is issued.
    pub async fn stop_monitor(&mut self, monitor: MailboxMonitor) -> Result<()> {
        match monitor.state {
            MonitorState::Synthesized => Ok(()),
            MonitorState::Idling { stop, task } => {
                debug!("stopping idle");
                // send fails when the task already terminated on its
                // own, the join result reports why
                let _ = stop.send(());

                let session = task
                    .await
                    .map_err(|err| Error::MonitorTask(err.to_string()))??;
                self.put_session(session);

                debug!("idle stopped");
                Ok(())
            }
        }
    }
}

/// Runs IDLE until stopped, pushing change events into `events`.
///
/// Owns the session for the whole task lifetime and hands it back on
/// return. IDLE is restarted after every server notification and
/// refreshed periodically.
async fn idle_task(
    mut session: ImapSession,
    mailbox: String,
    events: mpsc::Sender<NewMessages>,
    mut stop: oneshot::Receiver<()>,
) -> Result<ImapSession> {
    let idle_err = |err| Error::Idle {
        mailbox: mailbox.clone(),
        source: err,
    };

    loop {
        let mut idle = session.idle();
        idle.init().await.map_err(idle_err)?;

        let (wait, _interrupt) = idle.wait_with_timeout(IDLE_REFRESH);
        let outcome = tokio::select! {
            res = wait => Some(res.map_err(idle_err)?),
            _ = &mut stop => None,
        };

        session = idle.done().await.map_err(idle_err)?;

        match outcome {
            None | Some(IdleResponse::ManualInterrupt) => return Ok(session),
            Some(IdleResponse::Timeout) => {
                debug!(mailbox = %mailbox, "refreshing idle");
            }
            Some(IdleResponse::NewData(_)) => {
                let mbox = session.examine(&mailbox).await.map_err(|err| Error::Select {
                    mailbox: mailbox.clone(),
                    source: err,
                })?;

                debug!(mailbox = %mailbox, count = mbox.exists, "received mailbox update");
                let _ = events.try_send(NewMessages { count: mbox.exists });
            }
        }
    }
}
