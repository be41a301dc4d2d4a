//! LinUCB-Strategieauswahl für Buchempfehlungen.
//!
//! Pro (Identität, Arm) wird ein lineares Modell `A`, `b`, `θ` gepflegt.
//! [`LinUcb`] wählt den Arm mit der höchsten oberen Konfidenzschranke und
//! lernt per Sherman-Morrison-Update aus zugewiesenen Belohnungen.
//! [`ModelStore`] lädt und speichert die Modelle über ein austauschbares
//! [`ModelBackend`] (Speicher oder SQLite).

#![warn(clippy::unwrap_used, clippy::expect_used)]

mod error;
pub mod linalg;
mod linucb;
mod memory;
mod model;
mod sqlite;
mod store;

pub use error::{BanditError, Result};
pub use linalg::{LinalgError, Matrix};
pub use linucb::{
    sample_confidence, BanditConfig, LinUcb, Prediction, Selection, UpdateOutcome,
    CONFIDENCE_SAMPLE_SIZE_PLATEAU,
};
pub use memory::MemoryBackend;
pub use model::BanditModel;
pub use sqlite::SqliteBackend;
pub use store::{ModelBackend, ModelStore, StoreConfig};
