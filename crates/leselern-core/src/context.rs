//! Semantischer Lesekontext einer einzelnen Anfrage.
//!
//! Ein [`Context`] wird pro Anfrage erzeugt und nie unverändert persistiert;
//! gespeichert werden nur seine Kodierung und eine Kopie in der Impression.

use serde::{Deserialize, Serialize};

/// Situationsbeschreibung: Stimmung, Situation, Ziel und optionale Zeitangaben.
///
/// Alle Felder sind optional. Unbekannte Werte sind kein Fehler, sie werden
/// vom Encoder neutral (als Nullvektor) behandelt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub situation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    /// Überschreibt den aus der Uhrzeit abgeleiteten Tagesabschnitt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_day: Option<String>,
    /// Wochentag, 0 = Sonntag. Werte ab 7 werden ignoriert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_text: Option<String>,
}

impl Context {
    pub fn with_mood(mood: impl Into<String>) -> Self {
        Self {
            mood: Some(mood.into()),
            ..Self::default()
        }
    }

    /// Kurzbeschreibung der gesetzten Deskriptoren, z. B. `mood=curious, goal=learn`.
    pub fn describe(&self) -> String {
        let parts: Vec<String> = [
            ("mood", self.mood.as_deref()),
            ("situation", self.situation.as_deref()),
            ("goal", self.goal.as_deref()),
            ("timeOfDay", self.time_of_day.as_deref()),
        ]
        .iter()
        .filter_map(|(k, v)| v.filter(|s| !s.trim().is_empty()).map(|s| format!("{k}={s}")))
        .collect();
        if parts.is_empty() {
            "neutral context".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Tagesabschnitt für den One-Hot-Anteil des Zeitblocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    pub const ALL: [TimeOfDay; 4] = [
        TimeOfDay::Morning,
        TimeOfDay::Afternoon,
        TimeOfDay::Evening,
        TimeOfDay::Night,
    ];

    pub fn index(self) -> usize {
        match self {
            TimeOfDay::Morning => 0,
            TimeOfDay::Afternoon => 1,
            TimeOfDay::Evening => 2,
            TimeOfDay::Night => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TimeOfDay::Morning => "morning",
            TimeOfDay::Afternoon => "afternoon",
            TimeOfDay::Evening => "evening",
            TimeOfDay::Night => "night",
        }
    }

    /// Tolerantes Parsen; unbekannte Werte ergeben `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "morning" | "early_morning" => Some(TimeOfDay::Morning),
            "afternoon" | "midday" | "noon" => Some(TimeOfDay::Afternoon),
            "evening" => Some(TimeOfDay::Evening),
            "night" | "late_night" => Some(TimeOfDay::Night),
            _ => None,
        }
    }
}

/// Zusammenfassung der Lesehistorie eines Nutzers, alle Werte in `[0, 1]`.
///
/// Fehlende Felder werden im Encoder durch den neutralen Wert ersetzt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFeatures {
    #[serde(default)]
    pub preference_strength: Option<f64>,
    #[serde(default)]
    pub engagement: Option<f64>,
    #[serde(default)]
    pub diversity_seeking: Option<f64>,
    /// Anzahl bisheriger Interaktionen; steuert den Bonus für neue Identitäten.
    #[serde(default)]
    pub interaction_count: Option<u64>,
}
