// Dispatch queue: jobs ordered by their next fire time

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// Ordered set of eligible jobs keyed by next fire time
///
/// Each job appears at most once. Ties on the fire time are broken by job id
/// so wake order is deterministic.
#[derive(Debug, Default)]
pub struct DispatchQueue {
    ordered: BTreeSet<(DateTime<Utc>, Uuid)>,
    index: HashMap<Uuid, DateTime<Utc>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job or move it to a new fire time
    pub fn upsert(&mut self, job_id: Uuid, fire_time: DateTime<Utc>) {
        if let Some(previous) = self.index.insert(job_id, fire_time) {
            self.ordered.remove(&(previous, job_id));
        }
        self.ordered.insert((fire_time, job_id));
    }

    /// Remove a job, returning the time it was queued for
    pub fn remove(&mut self, job_id: Uuid) -> Option<DateTime<Utc>> {
        let fire_time = self.index.remove(&job_id)?;
        self.ordered.remove(&(fire_time, job_id));
        Some(fire_time)
    }

    pub fn peek_earliest(&self) -> Option<(DateTime<Utc>, Uuid)> {
        self.ordered.first().copied()
    }

    /// Take every entry due at or before `now`, earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, Uuid)> {
        let mut due = Vec::new();
        while let Some(&(fire_time, job_id)) = self.ordered.first() {
            if fire_time > now {
                break;
            }
            self.ordered.pop_first();
            self.index.remove(&job_id);
            due.push((fire_time, job_id));
        }
        due
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.index.contains_key(&job_id)
    }

    pub fn fire_time_of(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        self.index.get(&job_id).copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn clear(&mut self) {
        self.ordered.clear();
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    #[test]
    fn test_upsert_moves_existing_entry() {
        let mut queue = DispatchQueue::new();
        let job = Uuid::new_v4();

        queue.upsert(job, at(30));
        queue.upsert(job, at(10));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek_earliest(), Some((at(10), job)));
        assert_eq!(queue.fire_time_of(job), Some(at(10)));
    }

    #[test]
    fn test_pop_due_takes_only_due_entries_in_order() {
        let mut queue = DispatchQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        queue.upsert(a, at(20));
        queue.upsert(b, at(5));
        queue.upsert(c, at(40));

        let due = queue.pop_due(at(20));
        assert_eq!(due, vec![(at(5), b), (at(20), a)]);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(c));
        assert!(!queue.contains(a));
    }

    #[test]
    fn test_ties_break_on_job_id() {
        let mut queue = DispatchQueue::new();
        let mut ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.upsert(*id, at(0));
        }
        ids.sort();

        let popped: Vec<Uuid> = queue.pop_due(at(0)).into_iter().map(|(_, id)| id).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_remove_returns_time() {
        let mut queue = DispatchQueue::new();
        let job = Uuid::new_v4();
        queue.upsert(job, at(3));

        assert_eq!(queue.remove(job), Some(at(3)));
        assert_eq!(queue.remove(job), None);
        assert!(queue.is_empty());
        assert_eq!(queue.peek_earliest(), None);
    }
}
