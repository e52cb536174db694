// Misfire policy: decides what happens to each fire that came due

use crate::errors::ScheduleError;
use crate::models::Trigger;
use crate::schedule::{backlog, ScheduleTrigger};
use chrono::{DateTime, Duration, Utc};

/// Upper bound on fires examined in one backlog walk
pub const MAX_BACKLOG_FIRES: usize = 1000;

/// Due fires of one job split by lateness
#[derive(Debug, Clone)]
pub struct FirePlan {
    /// Fires late by no more than the grace time, ascending
    pub runnable: Vec<DateTime<Utc>>,
    /// Fires late by more than the grace time, ascending
    pub missed: Vec<DateTime<Utc>>,
    /// First fire of a stretch skipped without being examined
    pub elided_from: Option<DateTime<Utc>>,
    /// First fire strictly after `now`
    pub next: Result<Option<DateTime<Utc>>, ScheduleError>,
}

/// What the scheduler does with one fire
#[derive(Debug, Clone, PartialEq)]
pub enum FireAction {
    Submit(DateTime<Utc>),
    Misfire {
        fire_time: DateTime<Utc>,
        reason: String,
    },
}

/// Walk the fires from `first` up to `now` and sort them by lateness
///
/// A fire is missed when `now - fire > grace`; exactly `grace` late still runs.
pub fn plan_fires(
    trigger: &Trigger,
    first: DateTime<Utc>,
    now: DateTime<Utc>,
    grace_seconds: u64,
    limit: usize,
) -> FirePlan {
    let grace = Duration::seconds(grace_seconds.min(i64::MAX as u64 / 1000) as i64);
    let deadline = now.checked_sub_signed(grace).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let walk = backlog(trigger, first, now, limit);
    let mut fires = walk.due;
    let mut elided_from = None;

    if walk.truncated {
        if let Some(&last) = fires.last() {
            let elided = trigger.next_fire(last).ok().flatten();
            // Fires at or after the deadline are still on time; pick them up
            let just_before_deadline = deadline
                .checked_sub_signed(Duration::nanoseconds(1))
                .unwrap_or(deadline);
            let resume_after = last.max(just_before_deadline);
            let tail = match trigger.next_fire(resume_after) {
                Ok(Some(start)) if start <= now => backlog(trigger, start, now, limit).due,
                _ => Vec::new(),
            };
            if let Some(elided) = elided {
                if elided <= now && tail.first().map_or(true, |t| elided < *t) {
                    elided_from = Some(elided);
                }
            }
            fires.extend(tail);
        }
    }

    let (runnable, missed): (Vec<_>, Vec<_>) = fires.into_iter().partition(|t| *t >= deadline);

    FirePlan {
        runnable,
        missed,
        elided_from,
        next: walk.next,
    }
}

impl FirePlan {
    /// Total fires accounted for, including an elided stretch as one
    pub fn len(&self) -> usize {
        self.runnable.len() + self.missed.len() + usize::from(self.elided_from.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Turn the plan into actions
    ///
    /// With `coalesce` the whole backlog yields exactly one action: the
    /// latest runnable fire is submitted, or, when none is runnable, a single
    /// misfire stands for everything that was missed.
    pub fn actions(&self, coalesce: bool, now: DateTime<Utc>, grace_seconds: u64) -> Vec<FireAction> {
        let late_reason = |fire_time: DateTime<Utc>| {
            format!(
                "missed by {}s (grace {}s)",
                (now - fire_time).num_seconds(),
                grace_seconds
            )
        };

        if coalesce {
            if let Some(&latest) = self.runnable.last() {
                return vec![FireAction::Submit(latest)];
            }
            let Some(&latest) = self.missed.last() else {
                return Vec::new();
            };
            let total = self.len();
            let reason = if total > 1 {
                format!("{}; coalesced {} missed fires", late_reason(latest), total)
            } else {
                late_reason(latest)
            };
            return vec![FireAction::Misfire {
                fire_time: latest,
                reason,
            }];
        }

        let mut actions: Vec<FireAction> = self
            .missed
            .iter()
            .map(|&fire_time| FireAction::Misfire {
                fire_time,
                reason: late_reason(fire_time),
            })
            .collect();

        if let Some(fire_time) = self.elided_from {
            actions.push(FireAction::Misfire {
                fire_time,
                reason: format!(
                    "backlog exceeded {} fires; later missed fires skipped",
                    MAX_BACKLOG_FIRES
                ),
            });
        }

        actions.extend(self.runnable.iter().map(|&t| FireAction::Submit(t)));
        actions
    }
}
