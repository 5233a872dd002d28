//! Master-session recovery: the soft/hard/nuclear ladder under single-flight
//!
//! When many jobs discover an expired session at once, exactly one of them
//! leads a recovery attempt and every other caller joins the in-flight
//! attempt, observing the same outcome. Level budgets (`soft 3, hard 2,
//! nuclear 1`) are consumed across consecutive failed recoveries and reset
//! the moment any level succeeds; when every budget is spent the coordinator
//! fires the critical hook and reports exhaustion.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Tunables;

/// Bounded ring of ladder attempts kept for the critical hook and `/stats`
const HISTORY_CAP: usize = 32;

/// The three restoration techniques, in escalation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryLevel {
    /// Re-login on the existing master driver
    Soft,
    /// Relaunch the master driver on the same profile, then login
    Hard,
    /// Back up and wipe the master profile, relaunch, fresh login
    Nuclear,
}

impl std::fmt::Display for RecoveryLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
            Self::Nuclear => write!(f, "nuclear"),
        }
    }
}

/// One ladder attempt as recorded in the history ring
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub level: RecoveryLevel,
    pub success: bool,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of one recovery request, shared by leader and joiners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// A level succeeded; the master session is logged in again
    Recovered(RecoveryLevel),
    /// This attempt failed but budget remains for a later attempt
    Failed,
    /// Every level budget is spent; the critical hook has fired
    Exhausted,
}

impl RecoveryOutcome {
    #[must_use]
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::Recovered(_))
    }
}

/// The concrete restoration actions, implemented against the master session.
///
/// Each step returns `Err(reason)` on failure; the coordinator owns ordering,
/// budgets and bookkeeping.
#[async_trait]
pub trait RecoverySteps: Send + Sync {
    async fn soft(&self) -> Result<(), String>;
    async fn hard(&self) -> Result<(), String>;
    async fn nuclear(&self) -> Result<(), String>;
}

/// Fired once per full exhaustion with the recent attempt window
pub trait CriticalHook: Send + Sync {
    fn recovery_exhausted(&self, history: &[HistoryEntry]);
}

/// Default hook: an error-level log line per history entry
pub struct LogCriticalHook;

impl CriticalHook for LogCriticalHook {
    fn recovery_exhausted(&self, history: &[HistoryEntry]) {
        error!("Session recovery exhausted after {} attempts", history.len());
        for entry in history {
            error!(
                "  [{}] {} {}: {}",
                entry.timestamp,
                entry.level,
                if entry.success { "ok" } else { "failed" },
                entry.reason
            );
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LevelBudgets {
    soft: u32,
    hard: u32,
    nuclear: u32,
}

#[derive(Debug, Default)]
struct Counters {
    soft_used: u32,
    hard_used: u32,
    nuclear_used: u32,
}

impl Counters {
    /// Consume one unit of `level` budget; false when the level is spent
    fn try_consume(&mut self, level: RecoveryLevel, budgets: LevelBudgets) -> bool {
        let (used, max) = match level {
            RecoveryLevel::Soft => (&mut self.soft_used, budgets.soft),
            RecoveryLevel::Hard => (&mut self.hard_used, budgets.hard),
            RecoveryLevel::Nuclear => (&mut self.nuclear_used, budgets.nuclear),
        };
        if *used >= max {
            return false;
        }
        *used += 1;
        true
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn exhausted(&self, budgets: LevelBudgets) -> bool {
        self.soft_used >= budgets.soft
            && self.hard_used >= budgets.hard
            && self.nuclear_used >= budgets.nuclear
    }
}

type OutcomeCell = watch::Receiver<Option<RecoveryOutcome>>;

struct CoordinatorState {
    /// Present while a ladder is executing; joiners wait on it
    in_flight: Option<OutcomeCell>,
    counters: Counters,
    history: VecDeque<HistoryEntry>,
}

enum Role {
    Leader(watch::Sender<Option<RecoveryOutcome>>),
    Joiner(OutcomeCell),
}

// =============================================================================
// RecoveryCoordinator
// =============================================================================

/// Single-flight coordinator over a [`RecoverySteps`] implementation
pub struct RecoveryCoordinator {
    steps: Arc<dyn RecoverySteps>,
    hook: Arc<dyn CriticalHook>,
    budgets: LevelBudgets,
    state: parking_lot::Mutex<CoordinatorState>,
}

impl RecoveryCoordinator {
    pub fn new(
        steps: Arc<dyn RecoverySteps>,
        tunables: &Tunables,
        hook: Arc<dyn CriticalHook>,
    ) -> Self {
        Self {
            steps,
            hook,
            budgets: LevelBudgets {
                soft: tunables.soft_max(),
                hard: tunables.hard_max(),
                nuclear: tunables.nuclear_max(),
            },
            state: parking_lot::Mutex::new(CoordinatorState {
                in_flight: None,
                counters: Counters::default(),
                history: VecDeque::with_capacity(HISTORY_CAP),
            }),
        }
    }

    /// Recover the master session, or join the recovery already in flight.
    ///
    /// Exactly one caller leads; the lock guards only the check-and-set, not
    /// the ladder itself. The leader clears `in_flight` before broadcasting
    /// so no joiner can observe a result while the flag is still set. Exit
    /// happens on every leader path including panic of a step.
    pub async fn recover(&self) -> RecoveryOutcome {
        let role = {
            let mut state = self.state.lock();
            if let Some(cell) = &state.in_flight {
                Role::Joiner(cell.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                state.in_flight = Some(rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Joiner(mut cell) => {
                debug!("Joining in-flight session recovery");
                match cell.wait_for(Option::is_some).await {
                    Ok(value) => (*value).expect("wait_for guarantees a set outcome"),
                    // Leader dropped without broadcasting: process shutdown
                    Err(_) => RecoveryOutcome::Failed,
                }
            }
            Role::Leader(tx) => {
                info!("Leading session recovery");
                let outcome = match std::panic::AssertUnwindSafe(self.run_ladder())
                    .catch_unwind()
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!("Recovery ladder panicked");
                        RecoveryOutcome::Failed
                    }
                };

                self.state.lock().in_flight = None;
                let _ = tx.send(Some(outcome));
                outcome
            }
        }
    }

    /// Run the ladder: each level attempted at most once, in order, skipping
    /// levels whose budget is already spent.
    async fn run_ladder(&self) -> RecoveryOutcome {
        for level in [
            RecoveryLevel::Soft,
            RecoveryLevel::Hard,
            RecoveryLevel::Nuclear,
        ] {
            let allowed = self.state.lock().counters.try_consume(level, self.budgets);
            if !allowed {
                debug!("Skipping {level} recovery: budget spent");
                continue;
            }

            let result = match level {
                RecoveryLevel::Soft => self.steps.soft().await,
                RecoveryLevel::Hard => self.steps.hard().await,
                RecoveryLevel::Nuclear => self.steps.nuclear().await,
            };

            match result {
                Ok(()) => {
                    self.push_history(level, true, "recovered".to_string());
                    self.state.lock().counters.reset();
                    info!("Session recovered at {level} level");
                    return RecoveryOutcome::Recovered(level);
                }
                Err(reason) => {
                    warn!("{level} recovery failed: {reason}");
                    self.push_history(level, false, reason);
                }
            }
        }

        let exhausted = self.state.lock().counters.exhausted(self.budgets);
        if exhausted {
            let snapshot = self.history();
            self.hook.recovery_exhausted(&snapshot);
            RecoveryOutcome::Exhausted
        } else {
            RecoveryOutcome::Failed
        }
    }

    fn push_history(&self, level: RecoveryLevel, success: bool, reason: String) {
        let mut state = self.state.lock();
        if state.history.len() == HISTORY_CAP {
            state.history.pop_front();
        }
        state.history.push_back(HistoryEntry {
            level,
            success,
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Snapshot of the attempt window, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// True while a ladder is executing
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.state.lock().in_flight.is_some()
    }

    /// Current `(soft, hard, nuclear)` consumption, for observability
    #[must_use]
    pub fn counter_snapshot(&self) -> (u32, u32, u32) {
        let state = self.state.lock();
        (
            state.counters.soft_used,
            state.counters.hard_used,
            state.counters.nuclear_used,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Steps rig: per-level scripted results, counts invocations
    struct Rig {
        soft_ok: bool,
        hard_ok: bool,
        nuclear_ok: bool,
        soft_calls: AtomicU32,
        hard_calls: AtomicU32,
        nuclear_calls: AtomicU32,
    }

    impl Rig {
        fn new(soft_ok: bool, hard_ok: bool, nuclear_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                soft_ok,
                hard_ok,
                nuclear_ok,
                soft_calls: AtomicU32::new(0),
                hard_calls: AtomicU32::new(0),
                nuclear_calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RecoverySteps for Rig {
        async fn soft(&self) -> Result<(), String> {
            self.soft_calls.fetch_add(1, Ordering::SeqCst);
            self.soft_ok.then_some(()).ok_or_else(|| "rigged".into())
        }
        async fn hard(&self) -> Result<(), String> {
            self.hard_calls.fetch_add(1, Ordering::SeqCst);
            self.hard_ok.then_some(()).ok_or_else(|| "rigged".into())
        }
        async fn nuclear(&self) -> Result<(), String> {
            self.nuclear_calls.fetch_add(1, Ordering::SeqCst);
            self.nuclear_ok.then_some(()).ok_or_else(|| "rigged".into())
        }
    }

    fn coordinator(rig: Arc<Rig>) -> RecoveryCoordinator {
        RecoveryCoordinator::new(rig, &Tunables::default(), Arc::new(LogCriticalHook))
    }

    #[tokio::test]
    async fn soft_success_short_circuits_ladder() {
        let rig = Rig::new(true, true, true);
        let coordinator = coordinator(Arc::clone(&rig));

        let outcome = coordinator.recover().await;
        assert_eq!(outcome, RecoveryOutcome::Recovered(RecoveryLevel::Soft));
        assert_eq!(rig.soft_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rig.hard_calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.counter_snapshot(), (0, 0, 0));
    }

    #[tokio::test]
    async fn escalates_to_nuclear_and_records_history() {
        let rig = Rig::new(false, false, true);
        let coordinator = coordinator(Arc::clone(&rig));

        let outcome = coordinator.recover().await;
        assert_eq!(outcome, RecoveryOutcome::Recovered(RecoveryLevel::Nuclear));

        let history = coordinator.history();
        assert_eq!(history.len(), 3);
        assert!(!history[0].success);
        assert_eq!(history[0].level, RecoveryLevel::Soft);
        assert!(!history[1].success);
        assert_eq!(history[1].level, RecoveryLevel::Hard);
        assert!(history[2].success);
        assert_eq!(history[2].level, RecoveryLevel::Nuclear);

        // success resets every counter
        assert_eq!(coordinator.counter_snapshot(), (0, 0, 0));
    }

    #[tokio::test]
    async fn budgets_exhaust_across_consecutive_failures() {
        let rig = Rig::new(false, false, false);
        let coordinator = coordinator(Arc::clone(&rig));

        // First run consumes one of each level
        assert_eq!(coordinator.recover().await, RecoveryOutcome::Failed);
        assert_eq!(coordinator.counter_snapshot(), (1, 1, 1));

        // Second run: nuclear is spent, soft/hard retry
        assert_eq!(coordinator.recover().await, RecoveryOutcome::Failed);
        assert_eq!(coordinator.counter_snapshot(), (2, 2, 1));

        // Third run drains soft; the ladder is now fully spent
        assert_eq!(coordinator.recover().await, RecoveryOutcome::Exhausted);
        assert_eq!(coordinator.counter_snapshot(), (3, 2, 1));

        // Nothing left to attempt
        assert_eq!(coordinator.recover().await, RecoveryOutcome::Exhausted);
        assert_eq!(rig.soft_calls.load(Ordering::SeqCst), 3);
        assert_eq!(rig.hard_calls.load(Ordering::SeqCst), 2);
        assert_eq!(rig.nuclear_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn in_flight_flag_clears_after_run() {
        let rig = Rig::new(true, false, false);
        let coordinator = coordinator(rig);
        assert!(!coordinator.is_in_flight());
        coordinator.recover().await;
        assert!(!coordinator.is_in_flight());
    }
}
