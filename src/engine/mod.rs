mod client;
mod push;

pub use client::BenchClient;

use crate::error::ApiError;
use crate::model::{
    parse_push_message, InfoEvent, RunConfig, RunOutcome, StatusUpdate, SyncEvent, WireUpdate,
};
use crate::sync::{Applied, PollOutcome, SyncState};
use push::PushFrame;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const PUSH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum MonitorControl {
    /// Stop following the run. The server-side run keeps going.
    Cancel,
}

/// Follows one run until it is fully scored, goes silent, or is cancelled.
///
/// All `SyncState` mutation happens on this task: push frames and poll
/// responses arrive over channels and are applied one at a time, so no lock
/// is needed around the state.
pub struct RunMonitor {
    client: BenchClient,
    cfg: RunConfig,
    state: SyncState,
    awaiting_scores_reported: bool,
    stopped_inactive: bool,
}

/// Validate a status listing; malformed records are dropped with a warning.
fn validate_listing(listing: Vec<WireUpdate>) -> Vec<StatusUpdate> {
    listing
        .into_iter()
        .filter_map(|wire| match StatusUpdate::try_from(wire) {
            Ok(u) => Some(u),
            Err(e) => {
                warn!(error = %e, "discarding malformed status record");
                None
            }
        })
        .collect()
}

impl RunMonitor {
    pub fn new(client: BenchClient, cfg: RunConfig, state: SyncState) -> Self {
        Self {
            client,
            cfg,
            state,
            awaiting_scores_reported: false,
            stopped_inactive: false,
        }
    }

    pub async fn run(
        mut self,
        event_tx: UnboundedSender<SyncEvent>,
        mut control_rx: UnboundedReceiver<MonitorControl>,
    ) -> RunOutcome {
        let run_id = self.state.run_id().clone();

        let (push_tx, mut push_rx) = mpsc::unbounded_channel::<PushFrame>();
        let mut push_open = false;
        let mut push_target = String::new();
        let push_handle = if self.cfg.push_enabled {
            match self.client.push_url(&run_id) {
                Ok(url) => {
                    push_open = true;
                    push_target = url.to_string();
                    Some(tokio::spawn(push::listen(url, PUSH_CONNECT_TIMEOUT, push_tx)))
                }
                Err(e) => {
                    warn!(error = %e, "cannot build push channel url");
                    let _ = event_tx.send(SyncEvent::Info(InfoEvent::PushUnavailable {
                        reason: e.to_string(),
                    }));
                    None
                }
            }
        } else {
            None
        };

        let (poll_tx, mut poll_rx) = mpsc::unbounded_channel::<Result<Vec<WireUpdate>, ApiError>>();
        let mut in_flight = 0usize;
        let mut control_open = true;
        let mut cancelled = false;

        // First tick fires immediately, so the initial poll goes out right away.
        let mut ticker = tokio::time::interval(self.cfg.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.state.is_fully_scored() {
                break;
            }
            if !self.state.is_polling_active() && !push_open && in_flight == 0 {
                info!(run_id = %run_id, "no update source left, giving up on the run");
                break;
            }

            tokio::select! {
                _ = ticker.tick(), if self.state.is_polling_active() => {
                    in_flight += 1;
                    let client = self.client.clone();
                    let tx = poll_tx.clone();
                    let id = run_id.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(client.fetch_status(&id).await);
                    });
                }
                Some(res) = poll_rx.recv() => {
                    in_flight = in_flight.saturating_sub(1);
                    let out = match res {
                        Ok(listing) => {
                            debug!(entries = listing.len(), "poll received statuses");
                            self.state.reconcile_poll(validate_listing(listing), Instant::now())
                        }
                        Err(e) => {
                            warn!(error = %e, "polling error");
                            self.state.poll_failed()
                        }
                    };
                    self.emit_poll(&event_tx, out);
                }
                frame = push_rx.recv(), if push_open => {
                    match frame {
                        Some(PushFrame::Text(text)) => self.on_push_text(&text, &event_tx),
                        Some(PushFrame::Connected) => {
                            let _ = event_tx.send(SyncEvent::Info(InfoEvent::PushConnected {
                                url: push_target.clone(),
                            }));
                        }
                        Some(PushFrame::Unavailable(reason)) => {
                            push_open = false;
                            let _ = event_tx.send(SyncEvent::Info(InfoEvent::PushUnavailable { reason }));
                        }
                        Some(PushFrame::Closed(reason)) => {
                            push_open = false;
                            let _ = event_tx.send(SyncEvent::Info(InfoEvent::PushClosed { reason }));
                        }
                        None => push_open = false,
                    }
                }
                ctrl = control_rx.recv(), if control_open => {
                    match ctrl {
                        Some(MonitorControl::Cancel) => {
                            cancelled = true;
                            break;
                        }
                        None => control_open = false,
                    }
                }
            }
        }

        // Dropping a JoinHandle does not stop the task; abort the listener explicitly.
        if let Some(handle) = push_handle {
            handle.abort();
        }

        RunOutcome {
            timestamp_utc: time::OffsetDateTime::now_utc()
                .format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_else(|_| "now".into()),
            run_id,
            total_slots: self.state.total_slots(),
            scored: self.state.scored_count(),
            fully_scored: self.state.is_fully_scored(),
            polling_stopped_inactive: self.stopped_inactive,
            cancelled,
            config: self.cfg.clone(),
            slots: self.state.snapshot(),
        }
    }

    fn on_push_text(&mut self, text: &str, event_tx: &UnboundedSender<SyncEvent>) {
        let wire = match parse_push_message(text) {
            Ok(Some(wire)) => wire,
            Ok(None) => {
                debug!("ignoring non-update push message");
                return;
            }
            Err(e) => {
                warn!(error = %e, "push message parse error");
                return;
            }
        };
        let update = match StatusUpdate::try_from(wire) {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "discarding malformed push update");
                return;
            }
        };

        let previous = self.state.status_of(&update.slot).cloned();
        if let Applied::Accepted { completed_now } =
            self.state.apply_update(update.clone(), Instant::now())
        {
            debug!(slot = %update.slot, from = ?previous, to = %update.status, "push update");
            let _ = event_tx.send(SyncEvent::SlotUpdated {
                update,
                forced: false,
            });
            if completed_now {
                let _ = event_tx.send(SyncEvent::RunFullyScored {
                    run_id: self.state.run_id().clone(),
                });
            }
        }
    }

    fn emit_poll(&mut self, event_tx: &UnboundedSender<SyncEvent>, out: PollOutcome) {
        debug!(
            applied = out.applied.len(),
            idle_polls = self.state.no_update_polls(),
            "poll reconciled"
        );
        for applied in out.applied {
            let _ = event_tx.send(SyncEvent::SlotUpdated {
                update: applied.update,
                forced: applied.forced,
            });
        }
        if out.fully_scored_now {
            let _ = event_tx.send(SyncEvent::RunFullyScored {
                run_id: self.state.run_id().clone(),
            });
        }
        if out.polling_stopped {
            self.stopped_inactive = true;
            let _ = event_tx.send(SyncEvent::PollingStoppedInactive {
                run_id: self.state.run_id().clone(),
            });
        }
        if out.all_completed && !self.state.is_fully_scored() && !self.awaiting_scores_reported {
            self.awaiting_scores_reported = true;
            let _ = event_tx.send(SyncEvent::Info(InfoEvent::AwaitingScores));
        }
    }
}

#[cfg(test)]
pub(crate) fn test_config(base_url: &str) -> RunConfig {
    RunConfig {
        base_url: base_url.to_string(),
        push_url: None,
        user_agent: "swapbench-test".into(),
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(20),
        stale_after: crate::sync::DEFAULT_STALE_AFTER,
        max_idle_polls: crate::sync::DEFAULT_MAX_IDLE_POLLS,
        staleness: crate::model::StalenessScope::Slot,
        push_enabled: false,
    }
}
