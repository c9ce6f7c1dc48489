//! Run status synchronizer.
//!
//! Merges status updates arriving from the push channel and from the poll loop
//! into one view of a run. Decides when polling has gone quiet for good and
//! when the run is fully scored. Transport-free: callers pass in the current
//! instant, so every transition is deterministic.

use crate::model::{
    RunConfig, RunId, SlotKey, SlotStatus, SlotView, StalenessScope, StatusUpdate,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_IDLE_POLLS: u32 = 20;

#[derive(Debug, Clone, Copy)]
pub struct SyncPolicy {
    /// A slot still `queued` after this long gets its polled value force-applied.
    pub stale_after: Duration,
    /// Polling stops once more than this many consecutive polls found nothing.
    pub max_idle_polls: u32,
    pub staleness: StalenessScope,
}

impl SyncPolicy {
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            stale_after: cfg.stale_after,
            max_idle_polls: cfg.max_idle_polls,
            staleness: cfg.staleness,
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            stale_after: DEFAULT_STALE_AFTER,
            max_idle_polls: DEFAULT_MAX_IDLE_POLLS,
            staleness: StalenessScope::Slot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discarded {
    /// Belongs to another run; dropped silently.
    ForeignRun,
    /// Names a (case, tool) pair that is not part of this run.
    UnknownSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Discarded(Discarded),
    Accepted {
        /// This update made the run fully scored.
        completed_now: bool,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppliedUpdate {
    pub update: StatusUpdate,
    pub forced: bool,
}

/// What one poll round changed.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub applied: Vec<AppliedUpdate>,
    pub found_update: bool,
    /// Polling stopped for inactivity during this round.
    pub polling_stopped: bool,
    /// Every slot is evaluating or scored.
    pub all_completed: bool,
    pub fully_scored_now: bool,
}

#[derive(Debug)]
struct SlotEntry {
    latest: Option<StatusUpdate>,
    touched_at: Instant,
}

impl SlotEntry {
    /// A slot with no update yet is presented as queued.
    fn shows_queued(&self) -> bool {
        self.latest.as_ref().map_or(true, |u| u.status.is_queued())
    }

    fn status(&self) -> Option<&SlotStatus> {
        self.latest.as_ref().map(|u| &u.status)
    }
}

/// Per-run synchronization state. One instance per run, never shared across runs.
#[derive(Debug)]
pub struct SyncState {
    run_id: RunId,
    slots: BTreeMap<SlotKey, SlotEntry>,
    total_slots: usize,
    scored_count: usize,
    last_update: Instant,
    no_update_polls: u32,
    polling_active: bool,
    completion_signaled: bool,
    policy: SyncPolicy,
}

impl SyncState {
    pub fn new(
        run_id: RunId,
        case_ids: &[String],
        tool_ids: &[String],
        policy: SyncPolicy,
        now: Instant,
    ) -> Self {
        let mut slots = BTreeMap::new();
        for case_id in case_ids {
            for tool_id in tool_ids {
                slots.insert(
                    SlotKey::new(case_id.as_str(), tool_id.as_str()),
                    SlotEntry {
                        latest: None,
                        touched_at: now,
                    },
                );
            }
        }
        let total_slots = slots.len();
        Self {
            run_id,
            slots,
            total_slots,
            scored_count: 0,
            last_update: now,
            no_update_polls: 0,
            polling_active: true,
            completion_signaled: false,
            policy,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    pub fn scored_count(&self) -> usize {
        self.scored_count
    }

    pub fn is_polling_active(&self) -> bool {
        self.polling_active
    }

    pub fn is_fully_scored(&self) -> bool {
        self.total_slots > 0 && self.scored_count == self.total_slots
    }

    pub fn no_update_polls(&self) -> u32 {
        self.no_update_polls
    }

    pub fn status_of(&self, slot: &SlotKey) -> Option<&SlotStatus> {
        self.slots.get(slot).and_then(SlotEntry::status)
    }

    /// Every slot has reached `evaluating` or `scored`.
    pub fn all_completed(&self) -> bool {
        !self.slots.is_empty()
            && self
                .slots
                .values()
                .all(|e| e.status().is_some_and(SlotStatus::is_completed))
    }

    /// Apply an update from either source. Last write wins per slot.
    pub fn apply_update(&mut self, update: StatusUpdate, now: Instant) -> Applied {
        self.apply(update, now, true)
    }

    fn apply(&mut self, update: StatusUpdate, now: Instant, touch: bool) -> Applied {
        if update.run_id != self.run_id {
            debug!(run_id = %update.run_id, "discarding update for another run");
            return Applied::Discarded(Discarded::ForeignRun);
        }
        let Some(entry) = self.slots.get_mut(&update.slot) else {
            warn!(slot = %update.slot, "discarding update for a slot outside this run");
            return Applied::Discarded(Discarded::UnknownSlot);
        };

        debug!(slot = %update.slot, status = %update.status, touch, "status update");
        let was_scored = entry.status().is_some_and(SlotStatus::is_scored);
        let now_scored = update.status.is_scored();
        entry.latest = Some(update);
        if touch {
            entry.touched_at = now;
            self.last_update = now;
        }

        match (was_scored, now_scored) {
            (false, true) => self.scored_count += 1,
            (true, false) => self.scored_count -= 1,
            _ => {}
        }

        let completed_now = self.is_fully_scored() && self.signal_completion();
        Applied::Accepted { completed_now }
    }

    /// Reconcile a full status listing fetched by one poll.
    pub fn reconcile_poll(&mut self, updates: Vec<StatusUpdate>, now: Instant) -> PollOutcome {
        // A response can land after polling stopped; it still feeds the view
        // but no longer drives the idle counter or forced refreshes.
        let late = !self.polling_active;
        let mut out = PollOutcome::default();

        for update in updates {
            if late && self.would_unscore(&update) {
                debug!(slot = %update.slot, status = %update.status, "ignoring stale late poll entry");
                continue;
            }
            let forced = if !update.status.is_queued() {
                false
            } else if !late && self.is_stale_queued(&update, now) {
                true
            } else {
                continue;
            };

            if let Applied::Accepted { completed_now } = self.apply(update.clone(), now, !forced) {
                if !forced {
                    out.found_update = true;
                }
                out.fully_scored_now |= completed_now;
                out.applied.push(AppliedUpdate { update, forced });
            }
        }

        if !late {
            if out.found_update {
                self.no_update_polls = 0;
                self.last_update = now;
            } else {
                out.polling_stopped = self.count_idle_round();
            }
        }

        out.all_completed = self.all_completed();
        if out.all_completed && self.is_fully_scored() {
            out.fully_scored_now |= self.signal_completion();
        }
        out
    }

    /// A poll request failed; counts as a round without updates.
    pub fn poll_failed(&mut self) -> PollOutcome {
        let mut out = PollOutcome::default();
        if self.polling_active {
            out.polling_stopped = self.count_idle_round();
        }
        out.all_completed = self.all_completed();
        out
    }

    pub fn snapshot(&self) -> Vec<SlotView> {
        self.slots
            .iter()
            .map(|(key, entry)| SlotView {
                case_id: key.case_id.clone(),
                tool_id: key.tool_id.clone(),
                status: entry.status().cloned(),
                score: entry.latest.as_ref().and_then(|u| u.score),
                image_url: entry.latest.as_ref().and_then(|u| u.image_url.clone()),
                run_item_id: entry.latest.as_ref().and_then(|u| u.run_item_id),
            })
            .collect()
    }

    fn is_stale_queued(&self, update: &StatusUpdate, now: Instant) -> bool {
        if update.run_id != self.run_id {
            return false;
        }
        let Some(entry) = self.slots.get(&update.slot) else {
            return false;
        };
        if !entry.shows_queued() {
            return false;
        }
        let since = match self.policy.staleness {
            StalenessScope::Slot => entry.touched_at,
            StalenessScope::Run => self.last_update,
        };
        now.saturating_duration_since(since) > self.policy.stale_after
    }

    /// The update would take a slot out of `scored`.
    fn would_unscore(&self, update: &StatusUpdate) -> bool {
        !update.status.is_scored()
            && self
                .slots
                .get(&update.slot)
                .and_then(SlotEntry::status)
                .is_some_and(SlotStatus::is_scored)
    }

    fn count_idle_round(&mut self) -> bool {
        self.no_update_polls += 1;
        if self.polling_active && self.no_update_polls > self.policy.max_idle_polls {
            self.polling_active = false;
            info!(run_id = %self.run_id, polls = self.no_update_polls, "polling stopped due to inactivity");
            return true;
        }
        false
    }

    /// Edge-triggered: true only the first time the run is seen fully scored.
    fn signal_completion(&mut self) -> bool {
        if self.completion_signaled {
            return false;
        }
        self.completion_signaled = true;
        self.polling_active = false;
        info!(run_id = %self.run_id, "all items scored, polling stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn update(run: &str, case: &str, tool: &str, status: SlotStatus) -> StatusUpdate {
        StatusUpdate {
            run_id: RunId::new(run),
            slot: SlotKey::new(case, tool),
            status,
            image_url: None,
            score: None,
            run_item_id: None,
        }
    }

    fn scored(case: &str, tool: &str) -> StatusUpdate {
        StatusUpdate {
            score: Some(0.9),
            image_url: Some(format!("/runs/abc/{tool}/{case}.png")),
            ..update("abc", case, tool, SlotStatus::Scored)
        }
    }

    fn two_by_two(t0: Instant) -> SyncState {
        SyncState::new(
            RunId::new("abc"),
            &ids(&["c1", "c2"]),
            &ids(&["t1", "t2"]),
            SyncPolicy::default(),
            t0,
        )
    }

    fn queued_listing(state: &SyncState) -> Vec<StatusUpdate> {
        state
            .snapshot()
            .iter()
            .map(|v| update("abc", &v.case_id, &v.tool_id, SlotStatus::Queued))
            .collect()
    }

    #[test]
    fn slot_count_is_cases_times_tools() {
        let state = two_by_two(Instant::now());
        assert_eq!(state.total_slots(), 4);
        assert_eq!(state.snapshot().len(), 4);
        assert!(state.is_polling_active());
    }

    #[test]
    fn last_write_wins_per_slot() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        let key = SlotKey::new("c1", "t1");
        for status in [
            SlotStatus::Evaluating,
            SlotStatus::Queued,
            SlotStatus::Other("generating".into()),
        ] {
            state.apply_update(update("abc", "c1", "t1", status.clone()), t0);
            assert_eq!(state.status_of(&key), Some(&status));
        }
    }

    #[test]
    fn duplicate_scored_updates_count_once() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        state.apply_update(scored("c1", "t1"), t0);
        state.apply_update(scored("c1", "t1"), t0);
        let listing = vec![scored("c1", "t1")];
        state.reconcile_poll(listing, t0 + Duration::from_secs(3));
        assert_eq!(state.scored_count(), 1);
    }

    #[test]
    fn scored_count_tracks_slots_leaving_scored() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        state.apply_update(scored("c1", "t1"), t0);
        state.apply_update(update("abc", "c1", "t1", SlotStatus::Evaluating), t0);
        assert_eq!(state.scored_count(), 0);
    }

    #[test]
    fn foreign_run_update_is_discarded() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        let res = state.apply_update(update("other", "c1", "t1", SlotStatus::Scored), t0);
        assert_eq!(res, Applied::Discarded(Discarded::ForeignRun));
        assert_eq!(state.status_of(&SlotKey::new("c1", "t1")), None);
        assert_eq!(state.scored_count(), 0);
    }

    #[test]
    fn unknown_slot_is_discarded() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        let res = state.apply_update(update("abc", "c9", "t1", SlotStatus::Scored), t0);
        assert_eq!(res, Applied::Discarded(Discarded::UnknownSlot));
        assert_eq!(state.scored_count(), 0);
    }

    #[test]
    fn completion_fires_once_via_push() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        let mut fired = 0;
        for (c, t) in [("c1", "t1"), ("c1", "t2"), ("c2", "t1"), ("c2", "t2"), ("c2", "t2")] {
            if let Applied::Accepted { completed_now: true } = state.apply_update(scored(c, t), t0) {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert!(state.is_fully_scored());
        assert!(!state.is_polling_active());
    }

    #[test]
    fn completion_fires_once_when_push_and_poll_both_deliver() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        for (c, t) in [("c1", "t1"), ("c1", "t2"), ("c2", "t1")] {
            state.apply_update(scored(c, t), t0);
        }
        let push = state.apply_update(scored("c2", "t2"), t0);
        assert_eq!(push, Applied::Accepted { completed_now: true });

        let listing = vec![
            scored("c1", "t1"),
            scored("c1", "t2"),
            scored("c2", "t1"),
            scored("c2", "t2"),
        ];
        let out = state.reconcile_poll(listing, t0 + Duration::from_secs(3));
        assert!(!out.fully_scored_now);
        assert!(out.all_completed);
        assert_eq!(state.scored_count(), 4);
    }

    #[test]
    fn completion_fires_once_via_poll() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        let listing = vec![
            scored("c1", "t1"),
            scored("c1", "t2"),
            scored("c2", "t1"),
            scored("c2", "t2"),
        ];
        let out = state.reconcile_poll(listing.clone(), t0 + Duration::from_secs(3));
        assert!(out.fully_scored_now);
        assert!(!state.is_polling_active());

        let again = state.reconcile_poll(listing, t0 + Duration::from_secs(6));
        assert!(!again.fully_scored_now);
    }

    #[test]
    fn all_completed_but_not_scored_keeps_polling() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        let listing = vec![
            scored("c1", "t1"),
            update("abc", "c1", "t2", SlotStatus::Evaluating),
            scored("c2", "t1"),
            scored("c2", "t2"),
        ];
        let out = state.reconcile_poll(listing, t0 + Duration::from_secs(3));
        assert!(out.all_completed);
        assert!(!out.fully_scored_now);
        assert!(state.is_polling_active());
    }

    #[test]
    fn unknown_status_is_neither_queued_nor_complete() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        let mut listing = queued_listing(&state);
        listing[0].status = SlotStatus::Other("generating".into());
        let out = state.reconcile_poll(listing, t0 + Duration::from_secs(3));
        assert!(out.found_update);
        assert!(!out.all_completed);
        assert_eq!(state.no_update_polls(), 0);
    }

    #[test]
    fn polling_stops_after_more_than_max_idle_polls() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        let mut t = t0;
        for _ in 0..DEFAULT_MAX_IDLE_POLLS {
            t += Duration::from_millis(100);
            let out = state.reconcile_poll(queued_listing(&state), t);
            assert!(!out.polling_stopped);
        }
        assert!(state.is_polling_active());

        let out = state.reconcile_poll(queued_listing(&state), t + Duration::from_millis(100));
        assert!(out.polling_stopped);
        assert!(!state.is_polling_active());

        // A late push update is still accepted but never restarts polling.
        state.apply_update(update("abc", "c1", "t1", SlotStatus::Evaluating), t);
        assert!(!state.is_polling_active());
    }

    #[test]
    fn found_update_resets_idle_counter() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        for i in 1..=5 {
            state.reconcile_poll(queued_listing(&state), t0 + Duration::from_millis(i));
        }
        assert_eq!(state.no_update_polls(), 5);
        let mut listing = queued_listing(&state);
        listing[1].status = SlotStatus::Evaluating;
        state.reconcile_poll(listing, t0 + Duration::from_millis(10));
        assert_eq!(state.no_update_polls(), 0);
    }

    #[test]
    fn failed_polls_count_toward_inactivity() {
        let t0 = Instant::now();
        let mut state = SyncState::new(
            RunId::new("abc"),
            &ids(&["c1"]),
            &ids(&["t1"]),
            SyncPolicy {
                max_idle_polls: 2,
                ..SyncPolicy::default()
            },
            t0,
        );
        assert!(!state.poll_failed().polling_stopped);
        assert!(!state.poll_failed().polling_stopped);
        assert!(state.poll_failed().polling_stopped);
        assert!(!state.is_polling_active());
        assert!(!state.poll_failed().polling_stopped);
    }

    #[test]
    fn late_poll_response_is_applied_without_touching_counter() {
        let t0 = Instant::now();
        let mut state = SyncState::new(
            RunId::new("abc"),
            &ids(&["c1"]),
            &ids(&["t1", "t2"]),
            SyncPolicy {
                max_idle_polls: 0,
                ..SyncPolicy::default()
            },
            t0,
        );
        assert!(state.poll_failed().polling_stopped);
        let out = state.reconcile_poll(vec![scored("c1", "t1")], t0 + Duration::from_secs(1));
        assert_eq!(out.applied.len(), 1);
        assert!(!out.polling_stopped);
        assert_eq!(state.no_update_polls(), 1);
        assert_eq!(state.scored_count(), 1);
    }

    #[test]
    fn late_poll_response_cannot_unscore_a_slot() {
        let t0 = Instant::now();
        let mut state = SyncState::new(
            RunId::new("abc"),
            &ids(&["c1"]),
            &ids(&["t1", "t2"]),
            SyncPolicy {
                max_idle_polls: 0,
                ..SyncPolicy::default()
            },
            t0,
        );
        assert!(state.poll_failed().polling_stopped);
        state.apply_update(scored("c1", "t1"), t0 + Duration::from_secs(1));
        assert_eq!(state.scored_count(), 1);

        let out = state.reconcile_poll(
            vec![
                update("abc", "c1", "t1", SlotStatus::Evaluating),
                update("abc", "c1", "t2", SlotStatus::Evaluating),
            ],
            t0 + Duration::from_secs(2),
        );
        assert_eq!(out.applied.len(), 1);
        assert_eq!(out.applied[0].update.slot, SlotKey::new("c1", "t2"));
        assert_eq!(state.scored_count(), 1);
        assert_eq!(
            state.status_of(&SlotKey::new("c1", "t1")),
            Some(&SlotStatus::Scored)
        );
    }

    #[test]
    fn stuck_queued_slot_is_force_refreshed_after_threshold() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);

        let early = state.reconcile_poll(queued_listing(&state), t0 + Duration::from_secs(29));
        assert!(early.applied.is_empty());

        let late = state.reconcile_poll(queued_listing(&state), t0 + Duration::from_secs(31));
        assert_eq!(late.applied.len(), 4);
        assert!(late.applied.iter().all(|a| a.forced));
        assert!(!late.found_update);
        assert_eq!(
            state.status_of(&SlotKey::new("c1", "t1")),
            Some(&SlotStatus::Queued)
        );
    }

    #[test]
    fn forced_refresh_skips_slots_that_moved_on() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        state.apply_update(update("abc", "c1", "t1", SlotStatus::Evaluating), t0);
        // The poll lags behind the push channel and still says queued.
        let out = state.reconcile_poll(queued_listing(&state), t0 + Duration::from_secs(40));
        assert!(out.applied.iter().all(|a| a.update.slot != SlotKey::new("c1", "t1")));
        assert_eq!(
            state.status_of(&SlotKey::new("c1", "t1")),
            Some(&SlotStatus::Evaluating)
        );
    }

    #[test]
    fn slot_scope_sees_stall_masked_by_run_scope() {
        let t0 = Instant::now();
        let run_policy = SyncPolicy {
            staleness: StalenessScope::Run,
            ..SyncPolicy::default()
        };
        let mut by_run = SyncState::new(
            RunId::new("abc"),
            &ids(&["c1"]),
            &ids(&["t1", "t2"]),
            run_policy,
            t0,
        );
        let mut by_slot = SyncState::new(
            RunId::new("abc"),
            &ids(&["c1"]),
            &ids(&["t1", "t2"]),
            SyncPolicy::default(),
            t0,
        );

        // t1 keeps getting fresh updates; t2 is stuck.
        let t = t0 + Duration::from_secs(35);
        for state in [&mut by_run, &mut by_slot] {
            state.apply_update(update("abc", "c1", "t1", SlotStatus::Evaluating), t);
        }
        let listing = vec![
            update("abc", "c1", "t1", SlotStatus::Evaluating),
            update("abc", "c1", "t2", SlotStatus::Queued),
        ];
        let run_out = by_run.reconcile_poll(listing.clone(), t + Duration::from_secs(1));
        let slot_out = by_slot.reconcile_poll(listing, t + Duration::from_secs(1));

        assert!(!run_out.applied.iter().any(|a| a.forced));
        assert!(slot_out
            .applied
            .iter()
            .any(|a| a.forced && a.update.slot == SlotKey::new("c1", "t2")));
    }

    #[test]
    fn two_by_two_run_finishes_over_push_after_forced_refresh() {
        let t0 = Instant::now();
        let mut state = two_by_two(t0);
        for (c, t) in [("c1", "t1"), ("c1", "t2"), ("c2", "t1")] {
            state.apply_update(scored(c, t), t0);
        }

        let listing = vec![
            scored("c1", "t1"),
            scored("c1", "t2"),
            scored("c2", "t1"),
            update("abc", "c2", "t2", SlotStatus::Queued),
        ];
        let out = state.reconcile_poll(listing, t0 + Duration::from_secs(35));
        assert!(out
            .applied
            .iter()
            .any(|a| a.forced && a.update.slot == SlotKey::new("c2", "t2")));
        assert_eq!(
            state.status_of(&SlotKey::new("c2", "t2")),
            Some(&SlotStatus::Queued)
        );
        assert!(!out.fully_scored_now);
        assert!(state.is_polling_active());

        let res = state.apply_update(scored("c2", "t2"), t0 + Duration::from_secs(36));
        assert_eq!(res, Applied::Accepted { completed_now: true });
        assert_eq!(state.scored_count(), 4);
        assert!(!state.is_polling_active());
    }
}
