//! Risk classification for an occupied cabin.
//!
//! The engine is a three-level automaton with hysteresis: escalation is
//! immediate, de-escalation waits until every trigger has been absent for a
//! cooldown period, and CRITICAL only ever steps down to WARNING.

use crate::error::{ProcessingError, Result};
use crate::estimator::VitalSignEstimate;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Warning,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Warning => "WARNING",
            RiskLevel::Critical => "CRITICAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCause {
    /// State the engine starts in
    Initial,
    LowConfidence,
    ImplausibleRates,
    BreathingDecline,
    Unattended,
    HotCabin,
    VitalsAbsent,
    UnattendedLimit,
    CabinDanger,
    /// A warning condition persisted past the escalation delay
    PersistentWarning,
    /// Every trigger stayed absent for the cooldown
    Cleared,
}

/// The live risk level of a channel and why it was entered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    pub level: RiskLevel,
    pub entered_at: DateTime<Utc>,
    pub cause: RiskCause,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskTransition {
    pub from: RiskLevel,
    pub to: RiskLevel,
    pub at: DateTime<Utc>,
    pub cause: RiskCause,
}

/// Acceptable range of a rate, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateRange {
    pub min_bpm: f64,
    pub max_bpm: f64,
}

impl RateRange {
    pub fn contains(&self, bpm: f64) -> bool {
        bpm >= self.min_bpm && bpm <= self.max_bpm
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Per-window confidence below which a reading counts as unreliable
    pub min_confidence: f64,
    /// Consecutive unreliable windows that raise a warning
    pub low_confidence_windows: usize,
    pub heart_plausible: RateRange,
    pub breathing_plausible: RateRange,
    /// Breathing slowing faster than this (bpm per minute) raises a warning
    pub breathing_decline_bpm_per_min: Option<f64>,
    /// Band confidence below which a vital sign counts as absent
    pub absence_confidence: f64,
    pub absence_windows: usize,
    pub warning_after_secs: f64,
    pub critical_after_secs: f64,
    pub escalate_after_secs: f64,
    pub cooldown_secs: f64,
    pub cabin_warning_c: f64,
    pub cabin_danger_c: f64,
    /// Transitions kept in the log
    pub log_capacity: usize,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            low_confidence_windows: 3,
            heart_plausible: RateRange {
                min_bpm: 40.0,
                max_bpm: 180.0,
            },
            breathing_plausible: RateRange {
                min_bpm: 4.0,
                max_bpm: 40.0,
            },
            breathing_decline_bpm_per_min: Some(4.0),
            absence_confidence: 0.2,
            absence_windows: 3,
            warning_after_secs: 10.0 * 60.0,
            critical_after_secs: 30.0 * 60.0,
            escalate_after_secs: 5.0 * 60.0,
            cooldown_secs: 2.0 * 60.0,
            cabin_warning_c: 26.0,
            cabin_danger_c: 40.0,
            log_capacity: 1024,
        }
    }
}

impl RiskConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("min_confidence", self.min_confidence),
            ("absence_confidence", self.absence_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ProcessingError::config(format!(
                    "{} must be in [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.low_confidence_windows == 0 || self.absence_windows == 0 {
            return Err(ProcessingError::config(
                "window counts for low confidence and absence must be at least 1",
            ));
        }
        for (name, secs) in [
            ("warning_after_secs", self.warning_after_secs),
            ("critical_after_secs", self.critical_after_secs),
            ("escalate_after_secs", self.escalate_after_secs),
            ("cooldown_secs", self.cooldown_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(ProcessingError::config(format!(
                    "{} must be positive, got {}",
                    name, secs
                )));
            }
        }
        if self.warning_after_secs >= self.critical_after_secs {
            return Err(ProcessingError::config(
                "warning_after_secs must be shorter than critical_after_secs",
            ));
        }
        if !(self.cabin_warning_c < self.cabin_danger_c) {
            return Err(ProcessingError::config(
                "cabin_warning_c must be below cabin_danger_c",
            ));
        }
        for (name, range) in [
            ("heart_plausible", self.heart_plausible),
            ("breathing_plausible", self.breathing_plausible),
        ] {
            if !(range.min_bpm >= 0.0 && range.min_bpm < range.max_bpm) {
                return Err(ProcessingError::config(format!(
                    "{} range {}-{} is empty",
                    name, range.min_bpm, range.max_bpm
                )));
            }
        }
        if let Some(decline) = self.breathing_decline_bpm_per_min {
            if !(decline > 0.0) {
                return Err(ProcessingError::config(
                    "breathing_decline_bpm_per_min must be positive",
                ));
            }
        }
        if self.log_capacity == 0 {
            return Err(ProcessingError::config("log_capacity must be at least 1"));
        }
        Ok(())
    }

    fn cooldown(&self) -> Duration {
        secs(self.cooldown_secs)
    }

    fn escalate_after(&self) -> Duration {
        secs(self.escalate_after_secs)
    }
}

fn secs(value: f64) -> Duration {
    Duration::milliseconds((value * 1000.0).round() as i64)
}

/// Everything one evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct RiskInputs<'a> {
    /// Reading of the window just processed
    pub estimate: &'a VitalSignEstimate,
    /// Smoothed reading, if any valid estimate is retained
    pub aggregated: Option<&'a VitalSignEstimate>,
    /// bpm per minute
    pub breathing_trend: Option<f64>,
    pub occupied: bool,
    pub unattended: std::time::Duration,
    pub cabin_temperature: Option<f64>,
    pub now: DateTime<Utc>,
}

/// Triggers that hold for one evaluation, strongest cause first.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Triggers {
    warning: Option<RiskCause>,
    critical: Option<RiskCause>,
}

impl Triggers {
    fn any(&self) -> Option<RiskCause> {
        self.critical.or(self.warning)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Safe,
    Warning {
        since: DateTime<Utc>,
        /// Start of the current run of warning-condition evaluations
        condition_since: Option<DateTime<Utc>>,
        /// Start of the current run of trigger-free evaluations
        clear_since: Option<DateTime<Utc>>,
    },
    Critical {
        since: DateTime<Utc>,
        clear_since: Option<DateTime<Utc>>,
    },
}

impl Phase {
    fn level(&self) -> RiskLevel {
        match self {
            Phase::Safe => RiskLevel::Safe,
            Phase::Warning { .. } => RiskLevel::Warning,
            Phase::Critical { .. } => RiskLevel::Critical,
        }
    }

    fn warning(now: DateTime<Utc>, triggers: &Triggers) -> Self {
        Phase::Warning {
            since: now,
            condition_since: triggers.warning.map(|_| now),
            clear_since: None,
        }
    }
}

enum Step {
    Stay(Phase),
    Move(Phase, RiskCause),
}

pub struct RiskEngine {
    config: RiskConfig,
    phase: Phase,
    state: RiskState,
    low_confidence_run: usize,
    absence_run: usize,
    log: VecDeque<RiskTransition>,
    states: VecDeque<RiskState>,
}

impl RiskEngine {
    pub fn new(config: RiskConfig, started_at: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let state = RiskState {
            level: RiskLevel::Safe,
            entered_at: started_at,
            cause: RiskCause::Initial,
        };
        let mut states = VecDeque::with_capacity(config.log_capacity + 1);
        states.push_back(state);
        Ok(Self {
            config,
            phase: Phase::Safe,
            state,
            low_confidence_run: 0,
            absence_run: 0,
            log: VecDeque::new(),
            states,
        })
    }

    pub fn state(&self) -> RiskState {
        self.state
    }

    pub fn level(&self) -> RiskLevel {
        self.state.level
    }

    /// Transitions in the order they happened, oldest first.
    pub fn transitions(&self) -> impl Iterator<Item = &RiskTransition> {
        self.log.iter()
    }

    /// The initial state followed by every state entered since, oldest first.
    pub fn history(&self) -> Vec<RiskState> {
        self.states.iter().copied().collect()
    }

    /// Feed one evaluation. Returns the transitions it caused.
    pub fn evaluate(&mut self, inputs: &RiskInputs<'_>) -> Vec<RiskTransition> {
        let triggers = self.triggers(inputs);
        let now = inputs.now;
        debug!("Risk triggers at {}: {:?}", now, triggers);

        let mut made = Vec::new();
        if let Some(t) = self.step(&triggers, now) {
            made.push(t);
            // a critical trigger seen from SAFE escalates twice in one evaluation
            if t.from == RiskLevel::Safe && triggers.critical.is_some() {
                if let Some(t) = self.step(&triggers, now) {
                    made.push(t);
                }
            }
        }
        made
    }

    fn step(&mut self, triggers: &Triggers, now: DateTime<Utc>) -> Option<RiskTransition> {
        let from = self.phase.level();
        let step = match self.phase {
            Phase::Safe => self.from_safe(triggers, now),
            Phase::Warning {
                since,
                condition_since,
                clear_since,
            } => self.from_warning(since, condition_since, clear_since, triggers, now),
            Phase::Critical { since, clear_since } => {
                self.from_critical(since, clear_since, triggers, now)
            }
        };

        match step {
            Step::Stay(phase) => {
                self.phase = phase;
                None
            }
            Step::Move(phase, cause) => {
                self.phase = phase;
                Some(self.record(from, phase.level(), now, cause))
            }
        }
    }

    fn from_safe(&self, triggers: &Triggers, now: DateTime<Utc>) -> Step {
        match triggers.any() {
            Some(cause) => Step::Move(Phase::warning(now, triggers), cause),
            None => Step::Stay(Phase::Safe),
        }
    }

    fn from_warning(
        &self,
        since: DateTime<Utc>,
        condition_since: Option<DateTime<Utc>>,
        clear_since: Option<DateTime<Utc>>,
        triggers: &Triggers,
        now: DateTime<Utc>,
    ) -> Step {
        match (triggers.critical, triggers.warning) {
            (Some(cause), _) => Step::Move(
                Phase::Critical {
                    since: now,
                    clear_since: None,
                },
                cause,
            ),
            (None, Some(_)) => {
                let condition_since = condition_since.unwrap_or(now);
                if now - condition_since >= self.config.escalate_after() {
                    Step::Move(
                        Phase::Critical {
                            since: now,
                            clear_since: None,
                        },
                        RiskCause::PersistentWarning,
                    )
                } else {
                    Step::Stay(Phase::Warning {
                        since,
                        condition_since: Some(condition_since),
                        clear_since: None,
                    })
                }
            }
            (None, None) => {
                let clear_since = clear_since.unwrap_or(now);
                if now - clear_since >= self.config.cooldown() {
                    Step::Move(Phase::Safe, RiskCause::Cleared)
                } else {
                    Step::Stay(Phase::Warning {
                        since,
                        condition_since: None,
                        clear_since: Some(clear_since),
                    })
                }
            }
        }
    }

    fn from_critical(
        &self,
        since: DateTime<Utc>,
        clear_since: Option<DateTime<Utc>>,
        triggers: &Triggers,
        now: DateTime<Utc>,
    ) -> Step {
        if triggers.any().is_some() {
            return Step::Stay(Phase::Critical {
                since,
                clear_since: None,
            });
        }
        let clear_since = clear_since.unwrap_or(now);
        if now - clear_since >= self.config.cooldown() {
            // WARNING must sit out its own cooldown before SAFE
            Step::Move(
                Phase::Warning {
                    since: now,
                    condition_since: None,
                    clear_since: Some(now),
                },
                RiskCause::Cleared,
            )
        } else {
            Step::Stay(Phase::Critical {
                since,
                clear_since: Some(clear_since),
            })
        }
    }

    fn triggers(&mut self, inputs: &RiskInputs<'_>) -> Triggers {
        let config = &self.config;
        let estimate = inputs.estimate;

        if estimate.confidence < config.min_confidence {
            self.low_confidence_run += 1;
        } else {
            self.low_confidence_run = 0;
        }
        if estimate.heart_confidence < config.absence_confidence
            && estimate.breathing_confidence < config.absence_confidence
        {
            self.absence_run += 1;
        } else {
            self.absence_run = 0;
        }

        if !inputs.occupied {
            return Triggers::default();
        }

        let unattended = inputs.unattended.as_secs_f64();
        let temperature = inputs.cabin_temperature;

        let critical = if self.absence_run >= config.absence_windows {
            Some(RiskCause::VitalsAbsent)
        } else if unattended >= config.critical_after_secs {
            Some(RiskCause::UnattendedLimit)
        } else if temperature.map_or(false, |t| t >= config.cabin_danger_c) {
            Some(RiskCause::CabinDanger)
        } else {
            None
        };

        let implausible = inputs.aggregated.map_or(false, |agg| {
            agg.heart_rate_bpm
                .map_or(false, |hr| !config.heart_plausible.contains(hr))
                || agg
                    .breathing_rate_bpm
                    .map_or(false, |br| !config.breathing_plausible.contains(br))
        });
        let declining = match (config.breathing_decline_bpm_per_min, inputs.breathing_trend) {
            (Some(limit), Some(slope)) => slope <= -limit,
            _ => false,
        };

        let warning = if self.low_confidence_run >= config.low_confidence_windows {
            Some(RiskCause::LowConfidence)
        } else if implausible {
            Some(RiskCause::ImplausibleRates)
        } else if declining {
            Some(RiskCause::BreathingDecline)
        } else if unattended >= config.warning_after_secs {
            Some(RiskCause::Unattended)
        } else if temperature.map_or(false, |t| t >= config.cabin_warning_c) {
            Some(RiskCause::HotCabin)
        } else {
            None
        };

        Triggers { warning, critical }
    }

    fn record(
        &mut self,
        from: RiskLevel,
        to: RiskLevel,
        at: DateTime<Utc>,
        cause: RiskCause,
    ) -> RiskTransition {
        let transition = RiskTransition {
            from,
            to,
            at,
            cause,
        };
        if to == RiskLevel::Critical {
            warn!("Risk {} -> {} at {} ({:?})", from, to, at, cause);
        } else {
            info!("Risk {} -> {} at {} ({:?})", from, to, at, cause);
        }

        if self.log.len() == self.config.log_capacity {
            self.log.pop_front();
        }
        self.log.push_back(transition);

        self.state = RiskState {
            level: to,
            entered_at: at,
            cause,
        };
        if self.states.len() == self.config.log_capacity + 1 {
            self.states.pop_front();
        }
        self.states.push_back(self.state);
        transition
    }
}

/// Time spent in each level, from a state history up to `until`.
pub fn time_in_levels(
    history: &[RiskState],
    until: DateTime<Utc>,
) -> HashMap<RiskLevel, Duration> {
    let mut totals = HashMap::new();
    for (i, state) in history.iter().enumerate() {
        let end = history.get(i + 1).map_or(until, |next| next.entered_at);
        if end > state.entered_at {
            *totals.entry(state.level).or_insert_with(Duration::zero) += end - state.entered_at;
        }
    }
    totals
}
