//! Respawn pacing
//!
//! Respawns are counted in a rolling `restart_window`; once `max_restarts`
//! of them fall inside it the supervisor gives up. The delay before each
//! attempt doubles (by `backoff_multiplier`) for as long as workers keep
//! dying young, and drops back to `initial_backoff` once a session has
//! stayed up for a whole window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub restart_window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            restart_window: Duration::from_secs(300),
        }
    }
}

impl RestartPolicy {
    /// Delay before the attempt that follows `streak` quick failures
    fn delay_after(&self, streak: u32) -> Duration {
        let exponent = i32::try_from(streak).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if secs.is_finite() {
            Duration::from_secs_f64(secs.min(self.max_backoff.as_secs_f64()))
        } else {
            self.max_backoff
        }
    }
}

/// Respawn bookkeeping for one supervisor, keyed by session generation
#[derive(Debug)]
pub struct RespawnBudget {
    policy: RestartPolicy,
    attempts: VecDeque<Instant>,
    streak: u32,
    running: Option<(u64, Instant)>,
}

impl RespawnBudget {
    pub fn new(policy: RestartPolicy) -> Self {
        Self {
            policy,
            attempts: VecDeque::new(),
            streak: 0,
            running: None,
        }
    }

    /// Session `generation` finished its handshake
    pub fn session_started(&mut self, generation: u64) {
        self.running = Some((generation, Instant::now()));
    }

    /// Session `generation` has to be replaced. Returns the delay before
    /// the next launch, or `None` once the window's budget is spent.
    ///
    /// Called again with the same generation while launches keep failing;
    /// only the first call can credit the session's uptime.
    pub fn next_attempt(&mut self, generation: u64) -> Option<Duration> {
        let now = Instant::now();
        if let Some((running, started)) = self.running.take() {
            if running == generation && now.duration_since(started) >= self.policy.restart_window {
                self.streak = 0;
            }
        }

        while let Some(&oldest) = self.attempts.front() {
            if now.duration_since(oldest) < self.policy.restart_window {
                break;
            }
            self.attempts.pop_front();
        }
        if self.attempts.len() >= self.policy.max_restarts as usize {
            return None;
        }
        self.attempts.push_back(now);

        let delay = self.policy.delay_after(self.streak);
        self.streak = self.streak.saturating_add(1);
        Some(delay)
    }
}
