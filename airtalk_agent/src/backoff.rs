use std::time::Duration;

/// Reconnection schedule: a fixed list of delays and how far into it we are
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    delays: Vec<Duration>,
    attempt: usize,
}

impl Backoff {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once the budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.delays.get(self.attempt).copied()?;
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts handed out since the last reset
    pub fn attempts(&self) -> usize {
        self.attempt
    }

    pub fn budget(&self) -> usize {
        self.delays.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.delays.len()
    }
}
