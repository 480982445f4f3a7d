use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{Envelope, ReplyType, Result};

/// Where a command sits in its lifecycle, as seen by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    /// SENT observed, no receipt yet
    Pending,
    /// Addressee confirmed receipt, work in progress
    Running,
    /// Terminal ACK or ERR observed
    Finished,
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
        };
        f.write_str(s)
    }
}

/// One tracked command.
///
/// `envelope` starts as the SENT message; the terminal reply payload and
/// type are folded into it so a snapshot row shows the outcome.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub envelope: Envelope,
    pub status: CommandStatus,
    /// Wall-clock time the SENT message was observed
    pub added_at: DateTime<Utc>,
    /// Set when the command finishes; drives eviction
    pub finished_at: Option<Instant>,
}

impl LedgerEntry {
    fn new(envelope: Envelope) -> Self {
        Self {
            envelope,
            status: CommandStatus::Pending,
            added_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// In-memory registry of every command's lifecycle state, keyed by
/// correlation id.
///
/// All interior state sits behind one mutex; clones share it, so the relay
/// loop and monitoring surfaces can each hold a handle. Reply traffic is
/// monotonic per id: a status never moves backwards, and stale or repeated
/// replies are ignored rather than rejected. Only a fresh SENT restarts a
/// row.
#[derive(Debug, Clone, Default)]
pub struct CommandLedger {
    entries: Arc<Mutex<HashMap<String, LedgerEntry>>>,
}

impl CommandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one observed envelope into the ledger. This is the relay's
    /// single entry point; every lifecycle role is handled explicitly.
    pub fn apply(&self, envelope: &Envelope) -> Result<()> {
        // A message without a correlation id still flows through the bus,
        // but there is nothing to track it under.
        if envelope.correlation_id.is_empty() {
            return Ok(());
        }
        match envelope.reply_type {
            ReplyType::Sent => self.record_sent(envelope),
            ReplyType::Rcv => self.record_received(&envelope.correlation_id),
            // Progress reports are informational; they never change status.
            ReplyType::Fdb => Ok(()),
            ReplyType::Ack | ReplyType::Err => self.record_terminal(envelope),
        }
    }

    /// Register a command as PENDING. A repeated SENT under the same id
    /// starts the row over; conforming senders never reuse an id, so this
    /// only shows up when traffic is replayed.
    pub fn record_sent(&self, envelope: &Envelope) -> Result<()> {
        let mut entries = self.entries.lock()?;
        entries.insert(
            envelope.correlation_id.clone(),
            LedgerEntry::new(envelope.clone()),
        );
        Ok(())
    }

    /// Move a PENDING command to RUNNING. Unknown ids and commands already
    /// past PENDING are left untouched.
    pub fn record_received(&self, correlation_id: &str) -> Result<()> {
        let mut entries = self.entries.lock()?;
        if let Some(entry) = entries.get_mut(correlation_id) {
            if entry.status == CommandStatus::Pending {
                entry.status = CommandStatus::Running;
            }
        }
        Ok(())
    }

    /// Close a command with its terminal reply. The outcome payload and
    /// type are folded into the stored envelope. A second terminal for the
    /// same id is ignored, and an unknown id is not reconstructed.
    pub fn record_terminal(&self, envelope: &Envelope) -> Result<()> {
        let mut entries = self.entries.lock()?;
        if let Some(entry) = entries.get_mut(&envelope.correlation_id) {
            if entry.status != CommandStatus::Finished {
                entry.status = CommandStatus::Finished;
                entry.envelope.reply = envelope.reply.clone();
                entry.envelope.reply_type = envelope.reply_type;
                entry.finished_at = Some(Instant::now());
            }
        }
        Ok(())
    }

    /// Point-in-time copy of every row, ordered by send time then
    /// correlation id so repeated snapshots render stably.
    pub fn snapshot(&self) -> Result<Vec<LedgerEntry>> {
        let entries = self.entries.lock()?;
        let mut rows: Vec<LedgerEntry> = entries.values().cloned().collect();
        rows.sort_by(|a, b| {
            a.envelope
                .tick_count
                .cmp(&b.envelope.tick_count)
                .then_with(|| a.envelope.correlation_id.cmp(&b.envelope.correlation_id))
        });
        Ok(rows)
    }

    pub fn get(&self, correlation_id: &str) -> Result<Option<LedgerEntry>> {
        let entries = self.entries.lock()?;
        Ok(entries.get(correlation_id).cloned())
    }

    /// Drop FINISHED rows older than `grace`. PENDING and RUNNING rows are
    /// never evicted here, a stuck command stays visible until someone
    /// deals with it. Returns the number of rows removed.
    pub fn evict_expired(&self, grace: Duration) -> Result<usize> {
        let mut entries = self.entries.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| match entry.finished_at {
            Some(finished_at) => finished_at.elapsed() <= grace,
            None => true,
        });
        Ok(before - entries.len())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.entries.lock()?.is_empty())
    }
}
