//! Cron schedules and the queue of upcoming fires.

use crate::error::ScheduleError;
use chrono::{DateTime, Utc};
use croner::Cron;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tessera_core::TriggerId;

/// A parsed 5-field cron schedule, evaluated in UTC.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    cron: Cron,
}

impl CronSchedule {
    /// Parses a cron expression.
    ///
    /// # Errors
    ///
    /// Returns an error unless the expression has exactly five fields and
    /// parses.
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields = expression.split_whitespace().count();
        if fields != 5 {
            return Err(ScheduleError::InvalidCronExpression {
                expression: expression.to_string(),
                reason: format!("expected 5 fields, got {fields}"),
            });
        }
        let cron = expression
            .parse::<Cron>()
            .map_err(|e| ScheduleError::InvalidCronExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            expression: expression.to_string(),
            cron,
        })
    }

    /// Returns the expression this schedule was parsed from.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Returns the first occurrence strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.iter_after(after).next()
    }
}

/// Min-heap of the next fire time of every scheduled trigger.
#[derive(Debug, Default)]
pub struct FireQueue {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, TriggerId)>>,
    schedules: HashMap<TriggerId, CronSchedule>,
}

impl FireQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a trigger, scheduling its first occurrence after `now`.
    ///
    /// Occurrences before `now` are never fired.
    pub fn insert(&mut self, trigger_id: TriggerId, schedule: CronSchedule, now: DateTime<Utc>) {
        if let Some(next) = schedule.next_after(now) {
            self.heap.push(Reverse((next, trigger_id)));
        }
        self.schedules.insert(trigger_id, schedule);
    }

    /// Returns the earliest upcoming fire time.
    #[must_use]
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse((at, _))| *at)
    }

    /// Removes and returns every entry due at or before `now`, earliest
    /// first, and schedules each trigger's following occurrence.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, TriggerId)> {
        let mut due = Vec::new();
        while let Some(Reverse((at, trigger_id))) = self.heap.peek().copied() {
            if at > now {
                break;
            }
            self.heap.pop();
            due.push((at, trigger_id));
        }
        for (at, trigger_id) in &due {
            // a slow fire must not cause a burst of catch-up fires
            let after = (*at).max(now);
            if let Some(next) = self
                .schedules
                .get(trigger_id)
                .and_then(|schedule| schedule.next_after(after))
            {
                self.heap.push(Reverse((next, *trigger_id)));
            }
        }
        due
    }

    /// Returns the number of scheduled triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.schedules.len()
    }

    /// Returns true if nothing is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }
}
