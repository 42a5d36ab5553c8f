use std::io;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::model::*;
use crate::observability;
use crate::wal::Wal;

use super::{Engine, EngineError};

type Ack = oneshot::Sender<io::Result<()>>;

pub(crate) enum WalCommand {
    Append { event: Event, response: Ack },
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the WAL and turns bursts of appends into one fsync.
///
/// Blocks for the first append, then drains whatever else is already queued
/// before flushing. A non-append command ends the batch early; the batch is
/// flushed before that command runs so ordering is preserved.
pub(crate) async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, Ack)>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't leak
    // into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }

    for (_, ack) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = ack.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

fn storage(e: impl std::fmt::Display) -> EngineError {
    EngineError::Storage(e.to_string())
}

impl Engine {
    /// Write an event through the group-commit writer and wait for fsync.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| storage("WAL writer shut down"))?;
        rx.await
            .map_err(|_| storage("WAL writer dropped response"))?
            .map_err(storage)
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    ///
    /// Cancelled reservations, invalidated grants and past grants are kept;
    /// only superseded intermediate events disappear.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.write_gate.write().await;

        let mut events = Vec::new();

        let facilities: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        let mut ledgers = Vec::with_capacity(facilities.len());
        for facility in &facilities {
            let guard = facility.read().await;
            events.push(Event::FacilityConfigured {
                config: guard.config.clone(),
            });
            ledgers.push(guard);
        }

        for plan in self.plans.iter() {
            events.push(Event::PlanDefined {
                plan: plan.value().clone(),
            });
        }

        let members: Vec<_> = self.members.iter().map(|e| e.value().clone()).collect();
        let mut member_guards = Vec::with_capacity(members.len());
        for member in &members {
            let guard = member.read().await;
            events.push(Event::MemberRegistered {
                id: guard.id,
                name: guard.name.clone(),
            });
            for grant in &guard.grants {
                events.push(Event::GrantIssued {
                    grant: grant.clone(),
                    reset: AllowanceReset {
                        member_id: guard.id,
                        allowed_reservations: guard.allowed_reservations,
                    },
                });
            }
            member_guards.push(guard);
        }

        for ledger in &ledgers {
            for reservation in ledger.reservations() {
                events.push(Event::ReservationBooked {
                    reservation: reservation.clone(),
                });
            }
        }

        // Counters last: they override whatever the replayed grants and
        // bookings did to them.
        for guard in &member_guards {
            events.push(Event::AllowanceSet {
                member_id: guard.id,
                allowed: guard.allowed_reservations,
                used: guard.used_reservations,
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| storage("WAL writer shut down"))?;
        rx.await
            .map_err(|_| storage("WAL writer dropped response"))?
            .map_err(storage)?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
