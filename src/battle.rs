//! Battle automation: one parameterised state machine driving every variant.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interaction::{Interaction, UNFILTERED};

pub mod templates {
    pub const RECORD: &str = "record.png";
    pub const NEXT: &str = "next.png";
    pub const ADOPT_TEAM: &str = "adoptTeam.png";
    pub const CHECK_MARK: &str = "checkMark.png";
    pub const FIGHT: &str = "fight.png";
    pub const FIGHT_AGAIN: &str = "fightAgain.png";
    pub const CHALLENGE: &str = "challenge.png";
    pub const CHALLENGE3: &str = "challenge3.png";
    pub const NEXT_LEVEL: &str = "nextLevel.png";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BattleVariant {
    Fight,
    PFight,
    Friends,
    PFriends,
    Faction,
}

impl BattleVariant {
    pub const ALL: [BattleVariant; 5] = [
        BattleVariant::Fight,
        BattleVariant::PFight,
        BattleVariant::Friends,
        BattleVariant::PFriends,
        BattleVariant::Faction,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            BattleVariant::Fight => "fight",
            BattleVariant::PFight => "p-fight",
            BattleVariant::Friends => "friends",
            BattleVariant::PFriends => "p-friends",
            BattleVariant::Faction => "faction",
        }
    }
}

impl fmt::Display for BattleVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown battle variant: {0}")]
pub struct UnknownVariant(pub String);

impl FromStr for BattleVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BattleVariant::ALL
            .into_iter()
            .find(|v| v.slug() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

/// When the team-selection phase runs at the start of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamReselect {
    EveryRound,
    /// Only when the failure count is a multiple of the failure threshold.
    OnThresholdBoundary,
}

/// Scripted waits between actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delays {
    pub record: Duration,
    pub next: Duration,
    pub adopt: Duration,
    pub check_mark: Duration,
    /// Wait before the second confirmation in double-confirm variants.
    pub double_confirm: Duration,
    pub battle_wait: Duration,
    pub result_check: Duration,
    pub end_round: Duration,
    pub win_transition: Duration,
}

impl Delays {
    pub fn none() -> Self {
        Self {
            record: Duration::ZERO,
            next: Duration::ZERO,
            adopt: Duration::ZERO,
            check_mark: Duration::ZERO,
            double_confirm: Duration::ZERO,
            battle_wait: Duration::ZERO,
            result_check: Duration::ZERO,
            end_round: Duration::ZERO,
            win_transition: Duration::ZERO,
        }
    }

    fn standard() -> Self {
        Self {
            record: Duration::from_secs(1),
            next: Duration::from_millis(500),
            adopt: Duration::from_secs(1),
            check_mark: Duration::from_secs(1),
            double_confirm: Duration::from_secs(2),
            battle_wait: Duration::from_secs(5),
            result_check: Duration::from_secs(2),
            end_round: Duration::from_secs(4),
            win_transition: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BattleConfig {
    pub variant: BattleVariant,
    pub rounds: u32,
    pub max_fails: u32,
    pub fail_threshold: u32,
    pub result_checks: u32,
    pub team_reselect: TeamReselect,
    pub double_confirm: bool,
    pub win_template: &'static str,
    /// Clicked after a win, once `win_transition` has elapsed.
    pub post_win: Option<&'static str>,
    pub delays: Delays,
}

impl BattleConfig {
    pub fn for_variant(variant: BattleVariant) -> Self {
        let standard = Delays::standard();
        let slow_checks = Delays {
            result_check: Duration::from_secs(3),
            ..standard
        };
        match variant {
            BattleVariant::Fight => Self {
                variant,
                rounds: 5000,
                max_fails: 60,
                fail_threshold: 6,
                result_checks: 100,
                team_reselect: TeamReselect::OnThresholdBoundary,
                double_confirm: false,
                win_template: templates::CHALLENGE,
                post_win: None,
                delays: standard,
            },
            BattleVariant::PFight => Self {
                variant,
                rounds: 5000,
                max_fails: 60,
                fail_threshold: 3,
                result_checks: 100,
                team_reselect: TeamReselect::OnThresholdBoundary,
                double_confirm: true,
                win_template: templates::CHALLENGE3,
                post_win: None,
                delays: Delays {
                    battle_wait: Duration::ZERO,
                    end_round: Duration::from_secs(5),
                    ..slow_checks
                },
            },
            BattleVariant::Friends | BattleVariant::PFriends => Self {
                variant,
                rounds: 500,
                max_fails: 15,
                fail_threshold: 2,
                result_checks: 100,
                team_reselect: TeamReselect::EveryRound,
                double_confirm: false,
                win_template: templates::NEXT_LEVEL,
                post_win: Some(if variant == BattleVariant::Friends {
                    templates::CHALLENGE
                } else {
                    templates::CHALLENGE3
                }),
                delays: slow_checks,
            },
            BattleVariant::Faction => Self {
                variant,
                rounds: 5000,
                max_fails: 15,
                fail_threshold: 2,
                result_checks: 100,
                team_reselect: TeamReselect::EveryRound,
                double_confirm: true,
                win_template: templates::NEXT_LEVEL,
                post_win: None,
                delays: Delays {
                    battle_wait: Duration::ZERO,
                    end_round: Duration::from_secs(2),
                    ..slow_checks
                },
            },
        }
    }

    pub fn with_delays(mut self, delays: Delays) -> Self {
        self.delays = delays;
        self
    }

    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    fn selects_team(&self, fail_count: u32) -> bool {
        match self.team_reselect {
            TeamReselect::EveryRound => true,
            TeamReselect::OnThresholdBoundary => {
                self.fail_threshold == 0 || fail_count % self.fail_threshold == 0
            }
        }
    }

    /// How far to page through saved teams: one step per full threshold of
    /// consecutive failures.
    pub fn navigation_clicks(&self, fail_count: u32) -> u32 {
        fail_count.checked_div(self.fail_threshold).unwrap_or(0)
    }
}

/// Marker returned through `?` when a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Shared stop signal. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

const SLEEP_SLICE: Duration = Duration::from_millis(50);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps in short slices so a stop request cuts the wait short.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.checkpoint()?;
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
            self.checkpoint()?;
        }
    }
}

/// Admits a single automation run at a time.
#[derive(Debug, Clone, Default)]
pub struct RunLock(Arc<AtomicBool>);

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<RunPermit> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunPermit(self.0.clone()))
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Releases the run lock when dropped.
#[derive(Debug)]
pub struct RunPermit(Arc<AtomicBool>);

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Won,
    Lost,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    RoundsExhausted,
    FailureBudget,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct BattleReport {
    pub variant: BattleVariant,
    pub rounds_completed: u32,
    pub wins: u32,
    pub losses: u32,
    pub timeouts: u32,
    pub fail_count: u32,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct RoundLogEntry {
    timestamp: DateTime<Utc>,
    variant: BattleVariant,
    round: u32,
    outcome: Outcome,
    fail_count: u32,
}

fn log_round(path: &Path, entry: &RoundLogEntry) {
    use std::fs::OpenOptions;
    use std::io::Write;

    let line = match serde_json::to_string(entry) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("failed to serialize battle log entry: {e}");
            return;
        }
    };

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut f) => {
            if let Err(e) = writeln!(f, "{line}") {
                tracing::warn!("failed to write to {}: {e}", path.display());
            }
        }
        Err(e) => {
            tracing::warn!("failed to open {}: {e}", path.display());
        }
    }
}

/// Per-run mutable state.
#[derive(Debug)]
struct BattleSession {
    rounds_left: u32,
    fail_count: u32,
    round: u32,
    wins: u32,
    losses: u32,
    timeouts: u32,
}

impl BattleSession {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Won => {
                self.wins += 1;
                self.fail_count = 0;
            }
            Outcome::Lost => {
                self.losses += 1;
                self.fail_count += 1;
            }
            Outcome::Timeout => {
                self.timeouts += 1;
                self.fail_count += 1;
            }
        }
    }
}

pub struct BattleController {
    config: BattleConfig,
    screen: Arc<dyn Interaction>,
    token: CancellationToken,
    outcome_log: Option<PathBuf>,
}

impl BattleController {
    pub fn new(config: BattleConfig, screen: Arc<dyn Interaction>, token: CancellationToken) -> Self {
        Self {
            config,
            screen,
            token,
            outcome_log: None,
        }
    }

    pub fn with_outcome_log(mut self, path: Option<PathBuf>) -> Self {
        self.outcome_log = path;
        self
    }

    /// Runs cycles until the round budget is spent, the failure budget is
    /// reached, or the token is cancelled.
    pub fn run(&self) -> BattleReport {
        let started_at = Utc::now();
        let variant = self.config.variant;
        let mut session = BattleSession {
            rounds_left: self.config.rounds,
            fail_count: 0,
            round: 0,
            wins: 0,
            losses: 0,
            timeouts: 0,
        };
        tracing::info!(
            "starting {variant}: {} rounds, {} max fails",
            self.config.rounds,
            self.config.max_fails
        );

        let stop_reason = match self.run_cycles(&mut session) {
            Ok(reason) => reason,
            Err(Cancelled) => {
                tracing::info!("{variant} stopped by user");
                StopReason::Cancelled
            }
        };

        tracing::info!(
            "{variant} finished after {} rounds ({} won, {} lost, {} timed out): {stop_reason:?}",
            session.round,
            session.wins,
            session.losses,
            session.timeouts
        );
        BattleReport {
            variant,
            rounds_completed: session.round,
            wins: session.wins,
            losses: session.losses,
            timeouts: session.timeouts,
            fail_count: session.fail_count,
            stop_reason,
            started_at,
            finished_at: Utc::now(),
        }
    }

    fn run_cycles(&self, session: &mut BattleSession) -> Result<StopReason, Cancelled> {
        let cfg = &self.config;
        while session.rounds_left > 0 && session.fail_count < cfg.max_fails {
            self.token.checkpoint()?;

            if cfg.selects_team(session.fail_count) {
                self.select_team(session.fail_count)?;
            }
            self.confirm()?;
            if cfg.double_confirm {
                self.token.sleep(cfg.delays.double_confirm)?;
                self.confirm()?;
            }
            self.token.sleep(cfg.delays.battle_wait)?;

            let outcome = self.await_result()?;
            session.record(outcome);
            session.round += 1;
            tracing::info!(
                "{} round {}: {outcome:?}, fail count {}",
                cfg.variant,
                session.round,
                session.fail_count
            );
            if let Some(path) = &self.outcome_log {
                log_round(
                    path,
                    &RoundLogEntry {
                        timestamp: Utc::now(),
                        variant: cfg.variant,
                        round: session.round,
                        outcome,
                        fail_count: session.fail_count,
                    },
                );
            }

            self.token.sleep(cfg.delays.end_round)?;
            session.rounds_left -= 1;
        }

        Ok(if session.rounds_left == 0 {
            StopReason::RoundsExhausted
        } else {
            StopReason::FailureBudget
        })
    }

    fn click(&self, template: &str, focus: bool) -> Result<bool, Cancelled> {
        self.token.checkpoint()?;
        Ok(self.screen.detect_and_click(template, UNFILTERED, UNFILTERED, focus))
    }

    fn select_team(&self, fail_count: u32) -> Result<(), Cancelled> {
        let delays = &self.config.delays;
        self.click(templates::RECORD, true)?;
        self.token.sleep(delays.record)?;

        let steps = self.config.navigation_clicks(fail_count);
        if steps > 0 {
            self.token.checkpoint()?;
            match self.screen.locate_on_screen(templates::NEXT) {
                Some(point) => {
                    tracing::debug!("paging {steps} team(s) forward");
                    for _ in 0..steps {
                        self.token.checkpoint()?;
                        self.screen.click_at(point, false);
                        self.token.sleep(delays.next)?;
                    }
                }
                None => tracing::warn!("next button not found, skipping team navigation"),
            }
        }

        self.click(templates::ADOPT_TEAM, false)?;
        self.token.sleep(delays.adopt)
    }

    fn confirm(&self) -> Result<(), Cancelled> {
        self.click(templates::CHECK_MARK, false)?;
        self.token.sleep(self.config.delays.check_mark)?;
        self.click(templates::FIGHT, false)?;
        Ok(())
    }

    /// Polls for the loss visual before the win visual on every check.
    fn await_result(&self) -> Result<Outcome, Cancelled> {
        let cfg = &self.config;
        for _ in 0..cfg.result_checks {
            if self.click(templates::FIGHT_AGAIN, false)? {
                return Ok(Outcome::Lost);
            }
            if self.click(cfg.win_template, false)? {
                if let Some(next) = cfg.post_win {
                    self.token.sleep(cfg.delays.win_transition)?;
                    self.click(next, false)?;
                }
                return Ok(Outcome::Won);
            }
            self.token.sleep(cfg.delays.result_check)?;
        }
        Ok(Outcome::Timeout)
    }
}
