use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::battle::{BattleReport, BattleVariant, CancellationToken, RunLock, RunPermit};
use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    /// Stop requested, worker not yet returned.
    Stopping,
}

/// Handed to the worker that executes a run.
pub struct RunTicket {
    pub token: CancellationToken,
    pub permit: RunPermit,
}

pub struct AppStateInner {
    pub phase: RunPhase,
    pub active_variant: Option<BattleVariant>,
    pub started_at: Option<DateTime<Utc>>,
    pub token: Option<CancellationToken>,
    pub runner_handle: Option<JoinHandle<()>>,
    pub last_report: Option<BattleReport>,
    pub config: Config,
    run_lock: RunLock,
}

pub type AppState = Arc<Mutex<AppStateInner>>;

impl AppStateInner {
    pub fn new(config: Config) -> Self {
        Self {
            phase: RunPhase::Idle,
            active_variant: None,
            started_at: None,
            token: None,
            runner_handle: None,
            last_report: None,
            config,
            run_lock: RunLock::new(),
        }
    }

    /// Claims the single run slot. `None` while another run still holds it,
    /// including one that is stopping.
    pub fn begin_run(&mut self, variant: BattleVariant) -> Option<RunTicket> {
        if self.phase != RunPhase::Idle {
            return None;
        }
        let permit = self.run_lock.try_acquire()?;
        let token = CancellationToken::new();

        self.phase = RunPhase::Running;
        self.active_variant = Some(variant);
        self.started_at = Some(Utc::now());
        self.token = Some(token.clone());
        Some(RunTicket { token, permit })
    }

    /// Signals the active run. Returns false when nothing was running.
    pub fn request_stop(&mut self) -> bool {
        match (&self.phase, &self.token) {
            (RunPhase::Running, Some(token)) => {
                token.cancel();
                self.phase = RunPhase::Stopping;
                true
            }
            (RunPhase::Stopping, _) => true,
            _ => false,
        }
    }

    /// Called by the worker once the controller has returned.
    pub fn finish_run(&mut self, report: Option<BattleReport>) {
        self.phase = RunPhase::Idle;
        self.active_variant = None;
        self.started_at = None;
        self.token = None;
        self.runner_handle = None;
        if report.is_some() {
            self.last_report = report;
        }
    }

    pub fn is_running(&self) -> bool {
        self.phase != RunPhase::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::StopReason;

    fn report(variant: BattleVariant, stop_reason: StopReason) -> BattleReport {
        BattleReport {
            variant,
            rounds_completed: 2,
            wins: 1,
            losses: 1,
            timeouts: 0,
            fail_count: 1,
            stop_reason,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut state = AppStateInner::new(Config::default());
        let ticket = state.begin_run(BattleVariant::Fight);
        assert!(ticket.is_some());
        assert_eq!(state.phase, RunPhase::Running);
        assert_eq!(state.active_variant, Some(BattleVariant::Fight));

        assert!(state.begin_run(BattleVariant::Faction).is_none());
        assert_eq!(state.active_variant, Some(BattleVariant::Fight));
    }

    #[test]
    fn test_stop_cancels_the_run_token() {
        let mut state = AppStateInner::new(Config::default());
        let ticket = state.begin_run(BattleVariant::Friends).unwrap();
        assert!(!ticket.token.is_cancelled());

        assert!(state.request_stop());
        assert!(ticket.token.is_cancelled());
        assert_eq!(state.phase, RunPhase::Stopping);
        assert!(state.request_stop(), "repeated stop is accepted");
    }

    #[test]
    fn test_stop_when_idle() {
        let mut state = AppStateInner::new(Config::default());
        assert!(!state.request_stop());
        assert_eq!(state.phase, RunPhase::Idle);
    }

    #[test]
    fn test_stopping_run_blocks_new_start_until_finished() {
        let mut state = AppStateInner::new(Config::default());
        let ticket = state.begin_run(BattleVariant::PFight).unwrap();
        state.request_stop();
        assert!(state.begin_run(BattleVariant::Fight).is_none());

        drop(ticket.permit);
        state.finish_run(Some(report(BattleVariant::PFight, StopReason::Cancelled)));
        assert_eq!(state.phase, RunPhase::Idle);
        assert!(state.token.is_none());
        assert_eq!(
            state.last_report.as_ref().map(|r| r.stop_reason),
            Some(StopReason::Cancelled)
        );

        let next = state.begin_run(BattleVariant::Fight).unwrap();
        assert!(!next.token.is_cancelled(), "each run gets a fresh token");
    }

    #[test]
    fn test_held_permit_blocks_start_after_finish() {
        let mut state = AppStateInner::new(Config::default());
        let ticket = state.begin_run(BattleVariant::Fight).unwrap();
        state.finish_run(None);
        // worker still holds the permit
        assert!(state.begin_run(BattleVariant::Fight).is_none());
        drop(ticket);
        assert!(state.begin_run(BattleVariant::Fight).is_some());
    }

    #[test]
    fn test_finish_without_report_keeps_previous() {
        let mut state = AppStateInner::new(Config::default());
        let _ = state.begin_run(BattleVariant::Fight);
        state.finish_run(Some(report(BattleVariant::Fight, StopReason::RoundsExhausted)));
        let _ = state.begin_run(BattleVariant::Faction);
        state.finish_run(None);
        assert_eq!(
            state.last_report.as_ref().map(|r| r.variant),
            Some(BattleVariant::Fight)
        );
    }
}
