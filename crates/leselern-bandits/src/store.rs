//! Persistenz der Banditenmodelle pro (Identität, Arm).
//!
//! Das Backend speichert opake JSON-Datensätze; Dekodierung und
//! Load-or-Default passieren hier. Updates werden pro Schlüssel serialisiert,
//! damit parallele Lernschritte keinen Rang-1-Beitrag verlieren.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use leselern_core::{ArmSet, Clock, EngineEvent, Observer, TtlCache};
use serde::{Deserialize, Serialize};
use time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::BanditModel;

type ModelKey = (String, String);

/// Schlüssel-Wert-Backend mit zusammengesetztem Schlüssel (Identität, Arm).
pub trait ModelBackend: Send + Sync + fmt::Debug {
    fn get(&self, identity: &str, arm_id: &str) -> Result<Option<String>>;
    /// Idempotenter Upsert.
    fn upsert(&self, identity: &str, arm_id: &str, record: &str) -> Result<()>;
    fn arms_for(&self, identity: &str) -> Result<Vec<String>>;
    /// Löscht einen Arm oder (bei `None`) alle Arme einer Identität.
    fn delete(&self, identity: &str, arm_id: Option<&str>) -> Result<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Lebensdauer gecachter Modelle in Sekunden; 0 deaktiviert den Cache.
    pub cache_ttl_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 30 }
    }
}

#[derive(Debug)]
pub struct ModelStore {
    backend: Arc<dyn ModelBackend>,
    lambda: f64,
    cache: TtlCache<ModelKey, BanditModel>,
    locks: Mutex<HashMap<ModelKey, Arc<Mutex<()>>>>,
    observer: Arc<dyn Observer>,
}

impl ModelStore {
    pub fn new(
        backend: Arc<dyn ModelBackend>,
        lambda: f64,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let ttl = Duration::seconds(i64::try_from(config.cache_ttl_secs).unwrap_or(i64::MAX));
        Self {
            backend,
            lambda,
            cache: TtlCache::new(ttl, clock),
            locks: Mutex::new(HashMap::new()),
            observer,
        }
    }

    /// Lädt ein Modell oder liefert ein frisches.
    ///
    /// Lesefehler und defekte Datensätze werden gemeldet, aber nie an den
    /// Aufrufer weitergegeben.
    pub fn load(&self, identity: &str, arm_id: &str) -> BanditModel {
        let key = (identity.to_string(), arm_id.to_string());
        if let Some(model) = self.cache.get(&key) {
            return model;
        }
        let model = self.load_uncached(identity, arm_id);
        self.cache.insert(key, model.clone());
        model
    }

    pub fn load_all(&self, identity: &str, arms: &ArmSet) -> Vec<BanditModel> {
        arms.ids().map(|arm_id| self.load(identity, arm_id)).collect()
    }

    fn load_uncached(&self, identity: &str, arm_id: &str) -> BanditModel {
        match self.backend.get(identity, arm_id) {
            Ok(Some(record)) => match BanditModel::from_json(&record) {
                Ok(mut model) if model.arm_id == arm_id => {
                    model.identity = identity.to_string();
                    model
                }
                Ok(model) => {
                    self.degraded(
                        identity,
                        arm_id,
                        format!("record belongs to arm '{}'", model.arm_id),
                    );
                    self.fresh(identity, arm_id)
                }
                Err(e) => {
                    self.degraded(identity, arm_id, e.to_string());
                    self.fresh(identity, arm_id)
                }
            },
            Ok(None) => self.fresh(identity, arm_id),
            Err(e) => {
                self.degraded(identity, arm_id, e.to_string());
                self.fresh(identity, arm_id)
            }
        }
    }

    fn fresh(&self, identity: &str, arm_id: &str) -> BanditModel {
        BanditModel::fresh(identity, arm_id, self.lambda)
    }

    fn degraded(&self, identity: &str, arm_id: &str, reason: String) {
        self.observer.on_event(&EngineEvent::ModelLoadDegraded {
            identity: identity.to_string(),
            arm_id: arm_id.to_string(),
            reason,
        });
    }

    /// Speichert das Modell unter seinem eigenen Schlüssel.
    pub fn save(&self, model: &BanditModel) -> Result<()> {
        let key = (model.identity.clone(), model.arm_id.clone());
        self.cache.invalidate(&key);
        let record = model.to_json()?;
        if let Err(e) = self.backend.upsert(&model.identity, &model.arm_id, &record) {
            self.observer.on_event(&EngineEvent::PersistenceFailed {
                identity: model.identity.clone(),
                arm_id: model.arm_id.clone(),
                reason: e.to_string(),
            });
            return Err(e);
        }
        self.cache.insert(key, model.clone());
        Ok(())
    }

    /// Lesen, verändern, schreiben unter der Sperre des Schlüssels.
    ///
    /// Liefert `f` einen Fehler, wird nichts gespeichert.
    pub fn update_with<T>(
        &self,
        identity: &str,
        arm_id: &str,
        f: impl FnOnce(&mut BanditModel) -> Result<T>,
    ) -> Result<T> {
        let key = (identity.to_string(), arm_id.to_string());
        self.with_key_locks(&[key], || {
            let mut model = self.load(identity, arm_id);
            let out = f(&mut model)?;
            self.save(&model)?;
            Ok(out)
        })
    }

    /// Setzt einen Arm oder alle Arme einer Identität zurück.
    ///
    /// Läuft unter denselben Sperren wie [`ModelStore::update_with`], ein
    /// laufender Lernschritt kann das gelöschte Modell also nicht zurückschreiben.
    pub fn reset(&self, identity: &str, arm_id: Option<&str>) -> Result<usize> {
        let keys: Vec<ModelKey> = match arm_id {
            Some(arm) => vec![(identity.to_string(), arm.to_string())],
            None => {
                let mut keys: Vec<ModelKey> = self
                    .backend
                    .arms_for(identity)?
                    .into_iter()
                    .map(|arm| (identity.to_string(), arm))
                    .collect();
                // Schlüssel mit laufendem Update, die noch nicht im Backend stehen.
                keys.extend(
                    self.locks
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .keys()
                        .filter(|(id, _)| id == identity)
                        .cloned(),
                );
                keys
            }
        };
        let removed = self.with_key_locks(&keys, || {
            let removed = self.backend.delete(identity, arm_id)?;
            match arm_id {
                Some(arm) => self.cache.invalidate(&(identity.to_string(), arm.to_string())),
                None => self.cache.invalidate_where(|(id, _)| id == identity),
            }
            Ok(removed)
        })?;
        self.observer.on_event(&EngineEvent::ModelReset {
            identity: identity.to_string(),
            arm_id: arm_id.map(str::to_string),
        });
        Ok(removed)
    }

    /// Überträgt alle Modelle von `from` auf `to`.
    ///
    /// Besitzt `to` bereits ein Modell für denselben Arm, werden die
    /// suffizienten Statistiken addiert (siehe [`BanditModel::merged_with`]).
    /// Scheitert das Löschen der Quelle, wird das Ziel auf seinen alten Stand
    /// zurückgesetzt; ein erneuter Aufruf addiert die Quelle daher nie doppelt.
    /// Liefert die Anzahl übertragener Modelle.
    pub fn migrate_identity(&self, from: &str, to: &str) -> Result<usize> {
        if from == to {
            return Ok(0);
        }
        let mut moved = 0;
        for arm_id in self.backend.arms_for(from)? {
            let keys = [
                (from.to_string(), arm_id.clone()),
                (to.to_string(), arm_id.clone()),
            ];
            self.with_key_locks(&keys, || {
                let source = self.load_uncached(from, &arm_id);
                let previous = self.backend.get(to, &arm_id)?;
                let target = match previous {
                    Some(_) => {
                        let existing = self.load_uncached(to, &arm_id);
                        existing.merged_with(&source, self.lambda)?
                    }
                    None => BanditModel {
                        identity: to.to_string(),
                        ..source
                    },
                };
                self.save(&target)?;
                if let Err(e) = self.backend.delete(from, Some(&arm_id)) {
                    self.cache.invalidate(&keys[1]);
                    let restored = match &previous {
                        Some(record) => self.backend.upsert(to, &arm_id, record),
                        None => self.backend.delete(to, Some(&arm_id)).map(|_| ()),
                    };
                    if let Err(restore_err) = restored {
                        warn!(
                            from,
                            to,
                            arm_id = %arm_id,
                            error = %restore_err,
                            "migration target could not be restored"
                        );
                    }
                    return Err(e);
                }
                self.cache.invalidate(&keys[0]);
                debug!(from, to, arm_id = %arm_id, "bandit model migrated");
                Ok(())
            })?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Hält die Sperren der Schlüssel (in sortierter Reihenfolge) während `f`.
    fn with_key_locks<T>(&self, keys: &[ModelKey], f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut sorted: Vec<&ModelKey> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();
        let handles: Vec<Arc<Mutex<()>>> = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            sorted
                .iter()
                .map(|k| Arc::clone(locks.entry((*k).clone()).or_default()))
                .collect()
        };
        let out = {
            let _guards: Vec<_> = handles
                .iter()
                .map(|h| h.lock().unwrap_or_else(PoisonError::into_inner))
                .collect();
            f()
        };
        // Nicht mehr benutzte Sperren aufräumen; Klone entstehen nur unter `locks`.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for (key, handle) in sorted.iter().zip(handles) {
            if Arc::strong_count(&handle) == 2 {
                locks.remove(*key);
            }
        }
        out
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
