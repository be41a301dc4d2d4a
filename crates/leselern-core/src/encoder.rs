//! Kodierung eines Lesekontexts in einen festen 44-dimensionalen Vektor.
//!
//! Layout in fester Reihenfolge: Stimmung (8), Situation (8), Ziel (8),
//! Zeit (12), Nutzer (8). Der Gesamtvektor wird L2-normalisiert, ein
//! Nullvektor bleibt unverändert. Der Encoder liest keine globale Uhr: der
//! Zeitpunkt wird explizit übergeben.

use std::collections::HashMap;
use std::f64::consts::TAU;
use std::ops::Range;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::context::{Context, TimeOfDay, UserFeatures};

/// Breite der kategorialen Blöcke und des Nutzerblocks.
pub const BLOCK_DIM: usize = 8;
/// Breite des Zeitblocks.
pub const TEMPORAL_DIM: usize = 12;
/// Gesamtdimension eines [`EncodedContext`].
pub const CONTEXT_DIM: usize = 3 * BLOCK_DIM + TEMPORAL_DIM + BLOCK_DIM;

type Row = [f64; BLOCK_DIM];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Block {
    Mood,
    Situation,
    Goal,
    Temporal,
    User,
}

impl Block {
    pub const ALL: [Block; 5] = [
        Block::Mood,
        Block::Situation,
        Block::Goal,
        Block::Temporal,
        Block::User,
    ];

    pub fn range(self) -> Range<usize> {
        match self {
            Block::Mood => 0..8,
            Block::Situation => 8..16,
            Block::Goal => 16..24,
            Block::Temporal => 24..36,
            Block::User => 36..44,
        }
    }
}

/// Kodierter Kontext; die Länge ist immer [`CONTEXT_DIM`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct EncodedContext(Vec<f64>);

impl EncodedContext {
    pub fn zeros() -> Self {
        Self(vec![0.0; CONTEXT_DIM])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn block(&self, block: Block) -> &[f64] {
        &self.0[block.range()]
    }

    pub fn norm(&self) -> f64 {
        l2_norm(&self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0.0)
    }
}

impl AsRef<[f64]> for EncodedContext {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

impl TryFrom<Vec<f64>> for EncodedContext {
    type Error = String;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        if values.len() != CONTEXT_DIM {
            return Err(format!(
                "encoded context must have {CONTEXT_DIM} entries, got {}",
                values.len()
            ));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err("encoded context contains non-finite values".to_string());
        }
        Ok(Self(values))
    }
}

impl From<EncodedContext> for Vec<f64> {
    fn from(ctx: EncodedContext) -> Self {
        ctx.0
    }
}

/// Einstellbare Grenzen des Zeit- und Nutzerblocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Stunde, ab der `morning` gilt.
    pub morning_start: u8,
    pub afternoon_start: u8,
    pub evening_start: u8,
    pub night_start: u8,
    /// Wert für fehlende Historienmerkmale.
    pub neutral_user_value: f64,
    /// Ab dieser Interaktionszahl entfällt der Bonus für neue Identitäten.
    pub new_identity_threshold: u64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            morning_start: 5,
            afternoon_start: 12,
            evening_start: 17,
            night_start: 21,
            neutral_user_value: 0.5,
            new_identity_threshold: 20,
        }
    }
}

impl EncoderConfig {
    pub fn bucket(&self, hour: u8) -> TimeOfDay {
        if hour >= self.morning_start && hour < self.afternoon_start {
            TimeOfDay::Morning
        } else if hour >= self.afternoon_start && hour < self.evening_start {
            TimeOfDay::Afternoon
        } else if hour >= self.evening_start && hour < self.night_start {
            TimeOfDay::Evening
        } else {
            TimeOfDay::Night
        }
    }
}

// Stimmung: [Energie, Positivität, Neugier, Ruhe, Eskapismus, emotionale Tiefe, Antrieb, Abenteuer]
const MOODS: &[(&str, Row)] = &[
    ("happy", [0.6, 1.0, 0.2, 0.3, 0.0, 0.0, 0.2, 0.2]),
    ("sad", [0.0, 0.0, 0.0, 0.2, 0.6, 1.0, 0.0, 0.0]),
    ("excited", [1.0, 0.7, 0.3, 0.0, 0.0, 0.0, 0.6, 0.7]),
    ("calm", [0.0, 0.4, 0.1, 1.0, 0.2, 0.2, 0.0, 0.0]),
    ("relaxed", [0.0, 0.5, 0.1, 0.9, 0.3, 0.1, 0.0, 0.0]),
    ("curious", [0.3, 0.3, 1.0, 0.2, 0.0, 0.0, 0.3, 0.4]),
    ("anxious", [0.4, 0.0, 0.0, 0.0, 0.8, 0.5, 0.0, 0.0]),
    ("stressed", [0.3, 0.0, 0.0, 0.0, 0.9, 0.3, 0.1, 0.0]),
    ("motivated", [0.7, 0.5, 0.3, 0.0, 0.0, 0.0, 1.0, 0.2]),
    ("adventurous", [0.8, 0.5, 0.5, 0.0, 0.3, 0.0, 0.3, 1.0]),
    ("romantic", [0.3, 0.7, 0.0, 0.3, 0.4, 0.8, 0.0, 0.1]),
    ("nostalgic", [0.0, 0.4, 0.1, 0.4, 0.3, 0.8, 0.0, 0.0]),
    ("reflective", [0.0, 0.2, 0.5, 0.6, 0.0, 0.7, 0.1, 0.0]),
    ("bored", [0.2, 0.0, 0.3, 0.0, 0.7, 0.0, 0.0, 0.5]),
    ("inspired", [0.6, 0.7, 0.6, 0.0, 0.0, 0.3, 0.8, 0.3]),
];

// Situation: [kurze Sitzung, lange Sitzung, geringe Aufmerksamkeit, Ruhe, unterwegs, Ausklingen, sozial, Fokus]
const SITUATIONS: &[(&str, Row)] = &[
    ("commute", [1.0, 0.0, 0.6, 0.0, 1.0, 0.0, 0.0, 0.2]),
    ("bedtime", [0.3, 0.4, 0.3, 1.0, 0.0, 1.0, 0.0, 0.0]),
    ("vacation", [0.0, 1.0, 0.0, 0.4, 0.3, 0.3, 0.3, 0.3]),
    ("travel", [0.2, 0.8, 0.3, 0.0, 1.0, 0.0, 0.0, 0.2]),
    ("lunch_break", [1.0, 0.0, 0.4, 0.2, 0.0, 0.0, 0.3, 0.1]),
    ("weekend", [0.0, 0.8, 0.0, 0.5, 0.0, 0.3, 0.3, 0.3]),
    ("studying", [0.2, 0.6, 0.0, 0.6, 0.0, 0.0, 0.0, 1.0]),
    ("waiting", [1.0, 0.0, 0.8, 0.0, 0.3, 0.0, 0.0, 0.0]),
    ("rainy_day", [0.0, 0.9, 0.0, 0.8, 0.0, 0.5, 0.0, 0.2]),
    ("book_club", [0.0, 0.6, 0.0, 0.0, 0.0, 0.0, 1.0, 0.5]),
];

// Ziel: [Wissen, Unterhaltung, Entspannung, Inspiration, Emotion, Humor, Perspektive, Spannung]
const GOALS: &[(&str, Row)] = &[
    ("learn", [1.0, 0.0, 0.0, 0.3, 0.0, 0.0, 0.5, 0.0]),
    ("escape", [0.0, 0.8, 0.5, 0.0, 0.3, 0.0, 0.0, 0.6]),
    ("relax", [0.0, 0.4, 1.0, 0.0, 0.2, 0.3, 0.0, 0.0]),
    ("be_inspired", [0.3, 0.0, 0.0, 1.0, 0.4, 0.0, 0.5, 0.0]),
    ("laugh", [0.0, 0.7, 0.3, 0.0, 0.0, 1.0, 0.0, 0.0]),
    ("grow", [0.6, 0.0, 0.0, 0.6, 0.3, 0.0, 0.8, 0.0]),
    ("explore", [0.5, 0.4, 0.0, 0.3, 0.0, 0.0, 0.6, 0.4]),
    ("feel", [0.0, 0.2, 0.0, 0.3, 1.0, 0.0, 0.3, 0.0]),
    ("thrill", [0.0, 0.6, 0.0, 0.0, 0.2, 0.0, 0.0, 1.0]),
];

const GOAL_ALIASES: &[(&str, &str)] = &[("inspire", "be_inspired"), ("inspiration", "be_inspired")];

/// Handgepflegte Nachschlagetabellen für die kategorialen Blöcke.
///
/// Verwandte Begriffe teilen sich Koordinaten ungleich null (z. B. überlappt
/// `excited` mit `motivated` und `adventurous`).
#[derive(Debug, Clone)]
pub struct LookupTables {
    moods: HashMap<String, Row>,
    situations: HashMap<String, Row>,
    goals: HashMap<String, Row>,
}

impl Default for LookupTables {
    fn default() -> Self {
        let table = |rows: &[(&str, Row)]| {
            rows.iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect::<HashMap<_, _>>()
        };
        let mut goals = table(GOALS);
        for (alias, target) in GOAL_ALIASES {
            if let Some(row) = goals.get(*target).copied() {
                goals.insert((*alias).to_string(), row);
            }
        }
        Self {
            moods: table(MOODS),
            situations: table(SITUATIONS),
            goals,
        }
    }
}

impl LookupTables {
    pub fn insert_mood(&mut self, name: &str, row: Row) {
        self.moods.insert(normalize_key(name), row);
    }

    pub fn insert_situation(&mut self, name: &str, row: Row) {
        self.situations.insert(normalize_key(name), row);
    }

    pub fn insert_goal(&mut self, name: &str, row: Row) {
        self.goals.insert(normalize_key(name), row);
    }

    fn lookup(table: &HashMap<String, Row>, raw: Option<&str>) -> Row {
        raw.and_then(|r| table.get(&normalize_key(r)).copied())
            .unwrap_or([0.0; BLOCK_DIM])
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == ' ' || c == '-' { '_' } else { c })
        .collect()
}

/// Wandelt einen [`Context`] in einen [`EncodedContext`] um.
///
/// Der Encoder wirft nie: inkonsistente Teilblöcke (z. B. nicht-endliche
/// Werte) werden durch einen Nullblock ersetzt.
#[derive(Debug, Clone, Default)]
pub struct ContextEncoder {
    config: EncoderConfig,
    tables: LookupTables,
}

impl ContextEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self {
            config,
            tables: LookupTables::default(),
        }
    }

    pub fn with_tables(config: EncoderConfig, tables: LookupTables) -> Self {
        Self { config, tables }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Kodiert `ctx` zum Zeitpunkt `at`.
    ///
    /// Ohne Zeitpunkt enthält der Zeitblock nur die im Kontext explizit
    /// gesetzten Angaben. Ohne Identität und ohne Nutzermerkmale bleibt der
    /// Nutzerblock bis auf das Freitext-Flag leer.
    pub fn encode(
        &self,
        ctx: &Context,
        identity: Option<&str>,
        user: Option<&UserFeatures>,
        at: Option<OffsetDateTime>,
    ) -> EncodedContext {
        let mut raw = Vec::with_capacity(CONTEXT_DIM);
        raw.extend(sanitize(LookupTables::lookup(&self.tables.moods, ctx.mood.as_deref())));
        raw.extend(sanitize(LookupTables::lookup(
            &self.tables.situations,
            ctx.situation.as_deref(),
        )));
        raw.extend(sanitize(LookupTables::lookup(&self.tables.goals, ctx.goal.as_deref())));
        raw.extend(sanitize(self.temporal_block(ctx, at)));
        raw.extend(sanitize(self.user_block(ctx, identity, user)));
        debug_assert_eq!(raw.len(), CONTEXT_DIM);

        let norm = l2_norm(&raw);
        if norm > 0.0 {
            for v in &mut raw {
                *v /= norm;
            }
        }
        EncodedContext(raw)
    }

    fn temporal_block(&self, ctx: &Context, at: Option<OffsetDateTime>) -> [f64; TEMPORAL_DIM] {
        let mut out = [0.0; TEMPORAL_DIM];
        let hour = at.map(|t| t.hour());
        let weekday = ctx
            .day_of_week
            .filter(|d| *d < 7)
            .or_else(|| at.map(|t| t.weekday().number_days_from_sunday()));
        let bucket = ctx
            .time_of_day
            .as_deref()
            .and_then(TimeOfDay::parse)
            .or_else(|| hour.map(|h| self.config.bucket(h)));

        if let Some(h) = hour {
            let angle = TAU * f64::from(h) / 24.0;
            out[0] = angle.sin();
            out[1] = angle.cos();
            out[10] = f64::from(h) / 23.0;
        }
        if let Some(d) = weekday {
            let angle = TAU * f64::from(d) / 7.0;
            out[2] = angle.sin();
            out[3] = angle.cos();
            out[8] = if d == 0 || d == 6 { 1.0 } else { 0.0 };
            out[11] = f64::from(d) / 6.0;
        }
        if let Some(b) = bucket {
            out[4 + b.index()] = 1.0;
        }
        if let Some(t) = at {
            out[9] = (TAU * f64::from(t.ordinal()) / 365.0).sin();
        }
        out
    }

    fn user_block(
        &self,
        ctx: &Context,
        identity: Option<&str>,
        user: Option<&UserFeatures>,
    ) -> Row {
        let mut out = [0.0; BLOCK_DIM];
        let has_identity = identity.is_some_and(|id| !id.trim().is_empty());
        if has_identity || user.is_some() {
            let neutral = self.config.neutral_user_value;
            let feature = |v: Option<f64>| match v {
                Some(x) if x.is_finite() => x.clamp(0.0, 1.0),
                _ => neutral,
            };
            let features = user.cloned().unwrap_or_default();
            out[0] = feature(features.preference_strength);
            out[1] = feature(features.engagement);
            out[2] = feature(features.diversity_seeking);
            out[3] = match features.interaction_count {
                Some(n) if self.config.new_identity_threshold > 0 => {
                    #[allow(clippy::cast_precision_loss)]
                    let ratio = n as f64 / self.config.new_identity_threshold as f64;
                    (1.0 - ratio).max(0.0)
                }
                Some(_) => 0.0,
                None => neutral,
            };
            out[4] = if has_identity { 1.0 } else { 0.0 };
        }
        if ctx.custom_text.as_deref().is_some_and(|t| !t.trim().is_empty()) {
            out[5] = 1.0;
        }
        out
    }
}

fn sanitize<const N: usize>(block: [f64; N]) -> [f64; N] {
    if block.iter().all(|v| v.is_finite()) {
        block
    } else {
        [0.0; N]
    }
}

fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Kosinus-Ähnlichkeit zweier Vektoren.
///
/// Liefert `0.0` bei ungleicher Länge oder wenn einer der Vektoren null ist.
pub fn similarity(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let na = l2_norm(a);
    let nb = l2_norm(b);
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    (dot / (na * nb)).clamp(-1.0, 1.0)
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn encoder() -> ContextEncoder {
        ContextEncoder::default()
    }

    #[test]
    fn neutral_input_encodes_to_exact_zero_vector() {
        let v = encoder().encode(&Context::default(), None, None, None);
        assert_eq!(v.as_slice().len(), CONTEXT_DIM);
        assert!(v.is_zero());
    }

    #[test]
    fn encoded_vectors_have_unit_norm() {
        let enc = encoder();
        let contexts = [
            Context::with_mood("curious"),
            Context {
                situation: Some("commute".into()),
                goal: Some("learn".into()),
                ..Context::default()
            },
            Context {
                mood: Some("unknown-mood".into()),
                ..Context::default()
            },
        ];
        for ctx in &contexts {
            let v = enc.encode(ctx, Some("user-1"), None, Some(datetime!(2024-03-09 20:15 UTC)));
            assert_eq!(v.as_slice().len(), CONTEXT_DIM);
            assert!((v.norm() - 1.0).abs() < 1e-12, "norm={}", v.norm());
        }
    }

    #[test]
    fn unknown_categories_map_to_zero_blocks() {
        let ctx = Context {
            mood: Some("grumpy-ish".into()),
            situation: Some("on the moon".into()),
            goal: Some("???".into()),
            ..Context::default()
        };
        let v = encoder().encode(&ctx, None, None, None);
        assert!(v.is_zero());
    }

    #[test]
    fn keys_are_normalized_before_lookup() {
        let enc = encoder();
        let a = enc.encode(
            &Context {
                situation: Some("Lunch Break".into()),
                ..Context::default()
            },
            None,
            None,
            None,
        );
        let b = enc.encode(
            &Context {
                situation: Some("lunch-break".into()),
                ..Context::default()
            },
            None,
            None,
            None,
        );
        assert!(!a.is_zero());
        assert_eq!(a, b);
    }

    #[test]
    fn related_moods_overlap() {
        let enc = encoder();
        let mood = |m: &str| enc.encode(&Context::with_mood(m), None, None, None);
        let excited = mood("excited");
        assert!(similarity(excited.as_slice(), mood("motivated").as_slice()) > 0.5);
        assert!(similarity(excited.as_slice(), mood("adventurous").as_slice()) > 0.5);
        assert!(
            similarity(excited.as_slice(), mood("sad").as_slice())
                < similarity(excited.as_slice(), mood("motivated").as_slice())
        );
    }

    #[test]
    fn identical_contexts_under_pinned_clock_have_similarity_one() {
        let enc = encoder();
        let at = datetime!(2024-06-01 08:30 UTC);
        let ctx = Context {
            mood: Some("calm".into()),
            situation: Some("bedtime".into()),
            goal: Some("relax".into()),
            time_of_day: Some("night".into()),
            ..Context::default()
        };
        let a = enc.encode(&ctx, Some("u"), None, Some(at));
        let b = enc.encode(&ctx.clone(), Some("u"), None, Some(at));
        assert!((similarity(a.as_slice(), b.as_slice()) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn temporal_block_reflects_clock_and_overrides() {
        let enc = encoder();
        // Samstag, 20:00 -> evening, Wochenende
        let at = datetime!(2024-03-09 20:00 UTC);
        let v = enc.encode(&Context::default(), None, None, Some(at));
        let t = v.block(Block::Temporal);
        assert!(t[4 + TimeOfDay::Evening.index()] > 0.0);
        assert_eq!(t[4 + TimeOfDay::Morning.index()], 0.0);
        assert!(t[8] > 0.0, "weekend flag should be set");

        let ctx = Context {
            time_of_day: Some("morning".into()),
            day_of_week: Some(3),
            ..Context::default()
        };
        let v = enc.encode(&ctx, None, None, Some(at));
        let t = v.block(Block::Temporal);
        assert!(t[4 + TimeOfDay::Morning.index()] > 0.0);
        assert_eq!(t[4 + TimeOfDay::Evening.index()], 0.0);
        assert_eq!(t[8], 0.0);
    }

    #[test]
    fn bucket_boundaries_follow_config() {
        let cfg = EncoderConfig::default();
        assert_eq!(cfg.bucket(4), TimeOfDay::Night);
        assert_eq!(cfg.bucket(5), TimeOfDay::Morning);
        assert_eq!(cfg.bucket(12), TimeOfDay::Afternoon);
        assert_eq!(cfg.bucket(17), TimeOfDay::Evening);
        assert_eq!(cfg.bucket(21), TimeOfDay::Night);
    }

    #[test]
    fn user_block_defaults_to_neutral_and_flags_identity() {
        let v = encoder().encode(&Context::default(), Some("reader-7"), None, None);
        let u = v.block(Block::User);
        // vor der Normalisierung: [0.5, 0.5, 0.5, 0.5, 1, 0, 0, 0]
        assert!((u[0] - u[1]).abs() < 1e-12);
        assert!((u[4] / u[0] - 2.0).abs() < 1e-9);
        assert_eq!(u[5], 0.0);
    }

    #[test]
    fn user_features_are_clamped_and_new_identity_bonus_decays() {
        let enc = encoder();
        let veteran = UserFeatures {
            preference_strength: Some(4.0),
            engagement: Some(f64::NAN),
            diversity_seeking: Some(0.2),
            interaction_count: Some(500),
        };
        let v = enc.encode(&Context::default(), Some("u"), Some(&veteran), None);
        let u = v.block(Block::User);
        assert_eq!(u[3], 0.0, "no new-identity bonus after the threshold");
        // preference 1.0 (geklemmt) gegenüber engagement 0.5 (neutral)
        assert!((u[0] / u[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_handles_degenerate_inputs() {
        assert_eq!(similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert!((similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn encoded_context_rejects_wrong_length() {
        let err = EncodedContext::try_from(vec![0.0; 3]).expect_err("length check");
        assert!(err.contains("44"));
        let ok: EncodedContext =
            serde_json::from_value(serde_json::json!(vec![0.0; CONTEXT_DIM])).expect("valid");
        assert!(ok.is_zero());
    }
}
