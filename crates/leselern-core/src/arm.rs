//! Empfehlungsstrategien ("Arme") und ihre kanonische Reihenfolge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Eine Empfehlungsstrategie mit stabiler ID und Anzeige-Metadaten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arm {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Arm {
    pub fn new(id: impl Into<String>, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: description.into(),
        }
    }
}

/// Statische Armkonfiguration: Liste in kanonischer Reihenfolge, Alias-Tabelle
/// für Legacy-IDs und der Fallback-Arm.
///
/// Die Reihenfolge ist gleichzeitig die Tie-Break-Reihenfolge bei der Auswahl.
/// Fehlt `fallback` in der Konfiguration, ist der erste Arm der Fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ArmSetRepr")]
pub struct ArmSet {
    pub arms: Vec<Arm>,
    pub aliases: BTreeMap<String, String>,
    pub fallback: String,
}

#[derive(Deserialize)]
struct ArmSetRepr {
    arms: Vec<Arm>,
    #[serde(default)]
    aliases: BTreeMap<String, String>,
    fallback: Option<String>,
}

impl From<ArmSetRepr> for ArmSet {
    fn from(repr: ArmSetRepr) -> Self {
        let fallback = repr
            .fallback
            .or_else(|| repr.arms.first().map(|a| a.id.clone()))
            .unwrap_or_default();
        Self {
            arms: repr.arms,
            aliases: repr.aliases,
            fallback,
        }
    }
}

impl Default for ArmSet {
    fn default() -> Self {
        let arms = vec![
            Arm::new(
                "mood_match",
                "Mood match",
                "Books whose tone fits the current mood and goal",
            ),
            Arm::new(
                "similar_readers",
                "Readers like you",
                "Favourites of readers with a similar history",
            ),
            Arm::new("trending", "Trending", "What many readers pick up right now"),
            Arm::new(
                "hidden_gems",
                "Hidden gems",
                "Well-rated books that are rarely shown",
            ),
            Arm::new(
                "author_affinity",
                "More from your authors",
                "Other books by authors the reader liked",
            ),
        ];
        let aliases = [
            ("content_based", "mood_match"),
            ("semantic", "mood_match"),
            ("collaborative", "similar_readers"),
            ("popular", "trending"),
            ("popularity", "trending"),
            ("serendipity", "hidden_gems"),
            ("diversity", "hidden_gems"),
            ("author", "author_affinity"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            arms,
            aliases,
            fallback: "trending".to_string(),
        }
    }
}

impl ArmSet {
    /// Armset ohne Aliase; der erste Arm ist Fallback.
    pub fn from_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let arms: Vec<Arm> = ids
            .into_iter()
            .map(|id| {
                let id = id.into();
                Arm::new(id.clone(), id, "")
            })
            .collect();
        let fallback = arms.first().map(|a| a.id.clone()).unwrap_or_default();
        Self {
            arms,
            aliases: BTreeMap::new(),
            fallback,
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.arms.iter().map(|a| a.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.arms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.arms.iter().any(|a| a.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Arm> {
        self.arms.iter().find(|a| a.id == id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.arms.iter().position(|a| a.id == id)
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Übersetzt eine (ggf. veraltete) Arm-ID auf den aktuellen Armsatz.
    pub fn resolve<'a>(&'a self, id: &'a str) -> Option<&'a str> {
        if self.contains(id) {
            return Some(id);
        }
        self.aliases
            .get(id)
            .map(String::as_str)
            .filter(|target| self.contains(target))
    }
}
