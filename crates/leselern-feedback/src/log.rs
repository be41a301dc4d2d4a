//! Storage for impressions and actions.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use time::OffsetDateTime;

use crate::error::{FeedbackError, Result};
use crate::signals::{Action, Impression};

/// Append-mostly log of recommendation signals.
///
/// Impressions change only through [`SignalLog::set_reward`] and
/// [`SignalLog::clear_reward`]; actions never change. Range queries are
/// inclusive on both ends and ordered by time.
pub trait SignalLog: Send + Sync + fmt::Debug {
    fn append_impression(&self, impression: &Impression) -> Result<()>;
    fn append_action(&self, action: &Action) -> Result<()>;
    fn impression(&self, id: &str) -> Result<Option<Impression>>;
    fn impressions_for(
        &self,
        identity: &str,
        book_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Impression>>;
    /// Overwrites the reward of an impression.
    fn set_reward(&self, impression_id: &str, reward: f64, at: OffsetDateTime) -> Result<()>;
    /// Marks an impression as unattributed again.
    fn clear_reward(&self, impression_id: &str) -> Result<()>;
    fn actions_between(&self, from: OffsetDateTime, to: OffsetDateTime) -> Result<Vec<Action>>;
    /// Re-keys every impression and action of `from` to `to`; returns the number of records.
    fn rename_identity(&self, from: &str, to: &str) -> Result<usize>;
}

#[derive(Debug, Default)]
struct Records {
    impressions: Vec<Impression>,
    actions: Vec<Action>,
}

#[derive(Debug, Default)]
pub struct MemorySignalLog {
    records: Mutex<Records>,
}

impl MemorySignalLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn find_mut<'a>(impressions: &'a mut [Impression], id: &str) -> Result<&'a mut Impression> {
    impressions
        .iter_mut()
        .find(|i| i.id == id)
        .ok_or_else(|| FeedbackError::UnknownImpression(id.to_string()))
}

impl SignalLog for MemorySignalLog {
    fn append_impression(&self, impression: &Impression) -> Result<()> {
        self.records().impressions.push(impression.clone());
        Ok(())
    }

    fn append_action(&self, action: &Action) -> Result<()> {
        self.records().actions.push(action.clone());
        Ok(())
    }

    fn impression(&self, id: &str) -> Result<Option<Impression>> {
        Ok(self.records().impressions.iter().find(|i| i.id == id).cloned())
    }

    fn impressions_for(
        &self,
        identity: &str,
        book_id: &str,
        from: OffsetDateTime,
        to: OffsetDateTime,
    ) -> Result<Vec<Impression>> {
        let mut found: Vec<Impression> = self
            .records()
            .impressions
            .iter()
            .filter(|i| i.identity == identity && i.book_id == book_id)
            .filter(|i| i.shown_at >= from && i.shown_at <= to)
            .cloned()
            .collect();
        found.sort_by_key(|i| i.shown_at);
        Ok(found)
    }

    fn set_reward(&self, impression_id: &str, reward: f64, at: OffsetDateTime) -> Result<()> {
        let mut records = self.records();
        let imp = find_mut(&mut records.impressions, impression_id)?;
        imp.reward = Some(reward);
        imp.attributed_at = Some(at);
        Ok(())
    }

    fn clear_reward(&self, impression_id: &str) -> Result<()> {
        let mut records = self.records();
        let imp = find_mut(&mut records.impressions, impression_id)?;
        imp.reward = None;
        imp.attributed_at = None;
        Ok(())
    }

    fn actions_between(&self, from: OffsetDateTime, to: OffsetDateTime) -> Result<Vec<Action>> {
        let mut found: Vec<Action> = self
            .records()
            .actions
            .iter()
            .filter(|a| a.timestamp >= from && a.timestamp <= to)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.timestamp);
        Ok(found)
    }

    fn rename_identity(&self, from: &str, to: &str) -> Result<usize> {
        let mut records = self.records();
        let records = &mut *records;
        let mut moved = 0;
        for imp in records.impressions.iter_mut().filter(|i| i.identity == from) {
            imp.identity = to.to_string();
            moved += 1;
        }
        for action in records.actions.iter_mut().filter(|a| a.identity == from) {
            action.identity = to.to_string();
            moved += 1;
        }
        Ok(moved)
    }
}
