use serde::{Deserialize, Serialize};
use tg_types::UnixMillis;

/// Why an evaluation ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalTrigger {
    Count,
    Elapsed,
    Forced,
}

/// Count-or-elapsed evaluation schedule. A zero or backwards timestamp
/// permanently disables the elapsed trigger (until reset); the count trigger
/// never depends on timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EvalCadence {
    every: usize,
    interval_ms: u64,
    since_eval: usize,
    last_timestamp: Option<UnixMillis>,
    last_eval_ms: Option<UnixMillis>,
    time_trigger_enabled: bool,
}

impl EvalCadence {
    pub(crate) fn new(every: usize, interval_ms: u64) -> Self {
        Self {
            every,
            interval_ms,
            since_eval: 0,
            last_timestamp: None,
            last_eval_ms: None,
            time_trigger_enabled: true,
        }
    }

    pub(crate) fn observe(&mut self, timestamp_ms: UnixMillis) -> Option<EvalTrigger> {
        self.since_eval += 1;
        let elapsed_due = self.observe_timestamp(timestamp_ms);
        if self.since_eval >= self.every {
            Some(EvalTrigger::Count)
        } else if elapsed_due {
            Some(EvalTrigger::Elapsed)
        } else {
            None
        }
    }

    fn observe_timestamp(&mut self, timestamp_ms: UnixMillis) -> bool {
        if !self.time_trigger_enabled {
            return false;
        }
        let backwards = self.last_timestamp.is_some_and(|last| timestamp_ms < last);
        if timestamp_ms == 0 || backwards {
            self.time_trigger_enabled = false;
            return false;
        }
        self.last_timestamp = Some(timestamp_ms);
        let anchor = *self.last_eval_ms.get_or_insert(timestamp_ms);
        timestamp_ms.saturating_sub(anchor) >= self.interval_ms
    }

    pub(crate) fn mark_evaluated(&mut self) {
        self.since_eval = 0;
        if self.time_trigger_enabled {
            self.last_eval_ms = self.last_timestamp;
        }
    }

    pub(crate) fn since_eval(&self) -> usize {
        self.since_eval
    }

    pub(crate) fn time_trigger_enabled(&self) -> bool {
        self.time_trigger_enabled
    }

    pub(crate) fn reset(&mut self) {
        *self = Self::new(self.every, self.interval_ms);
    }
}
