//! Flüchtiges Backend für Tests und Simulationen.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::error::Result;
use crate::store::ModelBackend;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModelBackend for MemoryBackend {
    fn get(&self, identity: &str, arm_id: &str) -> Result<Option<String>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .get(&(identity.to_string(), arm_id.to_string()))
            .cloned())
    }

    fn upsert(&self, identity: &str, arm_id: &str, record: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((identity.to_string(), arm_id.to_string()), record.to_string());
        Ok(())
    }

    fn arms_for(&self, identity: &str) -> Result<Vec<String>> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .keys()
            .filter(|(id, _)| id == identity)
            .map(|(_, arm)| arm.clone())
            .collect())
    }

    fn delete(&self, identity: &str, arm_id: Option<&str>) -> Result<usize> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|(id, arm), _| id != identity || arm_id.is_some_and(|a| a != arm));
        Ok(before - records.len())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn delete_single_arm_or_whole_identity() {
        let b = MemoryBackend::new();
        b.upsert("u", "a", "1").expect("upsert");
        b.upsert("u", "b", "2").expect("upsert");
        b.upsert("v", "a", "3").expect("upsert");
        b.upsert("u", "a", "4").expect("upsert");
        assert_eq!(b.get("u", "a").expect("get").as_deref(), Some("4"));

        assert_eq!(b.delete("u", Some("a")).expect("delete"), 1);
        assert_eq!(b.arms_for("u").expect("arms"), vec!["b".to_string()]);
        assert_eq!(b.delete("u", None).expect("delete"), 1);
        assert_eq!(b.len(), 1);
        assert!(b.get("u", "b").expect("get").is_none());
    }
}
