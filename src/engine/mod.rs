mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{Buckets, bucketize, complement, merge_overlapping};
pub use error::{ConflictReason, Entity, EngineError};
pub use store::{IdKind, InMemoryStore, SharedCalendarState};

use std::io;
use std::path::PathBuf;

use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends for group commit: block for the first
/// append, drain whatever else is already queued, fsync once, answer everyone.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                // Commit what we have before compaction or stats see the log.
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    wal.commit(batch.iter().map(|(event, _)| event))
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The scheduling engine: users, personal calendars, slots and meetings,
/// persisted through a group-commit WAL.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared from first lookup to apply; compaction holds it
    /// exclusively so its snapshot matches the log it replaces. Always taken
    /// before any calendar lock.
    pub(super) commit_gate: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            commit_gate: RwLock::new(()),
        };

        for event in &events {
            engine.replay_event(event)?;
        }

        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            users = engine.store.user_count(),
            calendars = engine.store.calendar_count(),
            "engine state restored"
        );
        Ok(engine)
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::UserCreated { user, calendar } => {
                self.store.apply_user_created(user, calendar);
                return Ok(());
            }
            Event::IdsIssued(w) => {
                self.store.observe_watermarks(w);
                return Ok(());
            }
            _ => {}
        }
        let Some(calendar_id) = event.calendar_id() else {
            return Ok(());
        };
        let Some(cs) = self.store.get_calendar(calendar_id) else {
            tracing::warn!(calendar_id, "replay: event for unknown calendar skipped");
            return Ok(());
        };
        // Nothing else can hold these locks yet; never block here since we
        // may already be inside the runtime.
        let mut guard = cs
            .try_write()
            .map_err(|_| io::Error::other("replay: calendar lock contended"))?;
        self.store.apply_event(&mut guard, event);
        Ok(())
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Make `event` durable, then apply it. Caller holds the calendar write lock.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CalendarState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(cs, event);
        Ok(())
    }

    pub(super) fn calendar_for_owner(&self, user_id: Id) -> Result<SharedCalendarState, EngineError> {
        self.store
            .calendar_for_owner(user_id)
            .ok_or(EngineError::NotFound(Entity::Calendar, user_id))
    }

    /// Lookup slot → calendar and take the calendar's write lock. The slot is
    /// re-checked under the lock since a concurrent delete may have won.
    pub(super) async fn resolve_slot_write(
        &self,
        slot_id: Id,
    ) -> Result<OwnedRwLockWriteGuard<CalendarState>, EngineError> {
        let calendar_id = self
            .store
            .calendar_for_slot(slot_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        let cs = self
            .store
            .get_calendar(calendar_id)
            .ok_or(EngineError::NotFound(Entity::Slot, slot_id))?;
        let guard = cs.write_owned().await;
        if guard.slot(slot_id).is_none() {
            return Err(EngineError::NotFound(Entity::Slot, slot_id));
        }
        Ok(guard)
    }
}
