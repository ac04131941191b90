#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset, Weekday};
use ulid::Ulid;

/// Floor applied to `cycle_mean_days` on every write.
pub const MIN_CYCLE_MEAN_DAYS: f64 = 0.5;
/// Shortest elapsed interval that counts as a natural cycle close.
pub const MIN_OBSERVED_CYCLE_DAYS: f64 = 0.5;
/// `days_left / cycle_mean_days` at or above which stock is FULL.
pub const FULL_RATIO: f64 = 0.70;
/// `days_left / cycle_mean_days` at or above which stock is MEDIUM.
pub const MEDIUM_RATIO: f64 = 0.30;
/// Below this ratio the residual is treated as EMPTY.
pub const EMPTY_RATIO: f64 = 0.02;
/// Multiplicative step for MORE/LESS feedback on a stocked item.
pub const FEEDBACK_STEP: f64 = 0.15;
/// Fraction of a cycle granted when MORE feedback restarts an empty item.
pub const EMPTY_RESTART_RATIO: f64 = 0.15;
/// Consumption fraction assumed when a CONSUME event carries no amount.
pub const DEFAULT_CONSUME_RATIO: f64 = 0.10;
/// Blend weight of the observed value in a TRASH/RAN_OUT weak update.
pub const TRASH_WEAK_WEIGHT: f64 = 0.20;
/// Blend weight of the observed value in a weekly-tick weak update.
pub const WEEKLY_TICK_WEIGHT: f64 = 0.10;
/// Minimum open-cycle age before a weekly tick updates the mean.
pub const WEEKLY_TICK_MIN_ELAPSED_DAYS: f64 = 1.0;
/// Recency decay time constant for the confidence estimator.
pub const RECENCY_TAU_DAYS: f64 = 60.0;
/// Events older than the last applied timestamp by more than this are stale.
pub const STALE_WINDOW_HOURS: i64 = 24;
/// Forecast decay: one real day of stock per real day elapsed.
pub const FORECAST_DECAY_RATE: f64 = 1.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum PredictorError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("stale event: {0}")]
    StaleEvent(String),
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("idempotency conflict: {0}")]
    Conflict(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("internal invariant violation: {0}")]
    Internal(String),
}

impl PredictorError {
    /// Stable machine-readable code surfaced to callers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_) => "invalid_event",
            Self::StaleEvent(_) => "stale_event",
            Self::UnknownEntity(_) => "unknown_entity",
            Self::Conflict(_) => "conflict",
            Self::StorageFailure(_) => "storage_failure",
            Self::Internal(_) => "internal",
        }
    }

    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::StorageFailure(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HouseholdId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProductId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CategoryId(pub String);

impl Display for HouseholdId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ProductId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for CategoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventId(pub Ulid);

impl EventId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-household per-product key the predictor serialises on.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PantryKey {
    pub household_id: HouseholdId,
    pub product_id: ProductId,
}

impl Display for PantryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.household_id, self.product_id)
    }
}

// ---------------------------------------------------------------------------
// Clock & time utilities
// ---------------------------------------------------------------------------

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Elapsed days from `earlier` to `later`, clamped at zero.
#[must_use]
pub fn days_between(later: OffsetDateTime, earlier: OffsetDateTime) -> f64 {
    if later <= earlier {
        return 0.0;
    }
    (later - earlier).as_seconds_f64() / Duration::DAY.as_seconds_f64()
}

const NAIVE_TIMESTAMP: &[time::format_description::BorrowedFormatItem<'static>] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"
);

/// Parses an RFC3339 timestamp, tolerating 1-9 fractional-second digits and
/// a missing offset (assumed UTC). Historical logs carry 5-digit fractions.
///
/// # Errors
/// Returns [`PredictorError::InvalidEvent`] when the value parses under
/// neither form.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, PredictorError> {
    let trimmed = value.trim();
    if let Ok(parsed) = OffsetDateTime::parse(trimmed, &Rfc3339) {
        return Ok(parsed.to_offset(UtcOffset::UTC));
    }
    PrimitiveDateTime::parse(trimmed, NAIVE_TIMESTAMP)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|err| PredictorError::InvalidEvent(format!("invalid timestamp {trimmed:?}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PredictorError::Internal`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, PredictorError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| PredictorError::Internal(format!("failed to format timestamp: {err}")))
}

// ---------------------------------------------------------------------------
// Category priors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CategoryPrior {
    pub mean_days: f64,
    pub mad_days: f64,
}

/// Prior when the category is unknown or unmapped.
pub const DEFAULT_PRIOR: CategoryPrior = CategoryPrior { mean_days: 7.0, mad_days: 2.0 };

/// Immutable category-id -> prior lookup, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryPriorTable {
    priors: BTreeMap<CategoryId, CategoryPrior>,
}

impl CategoryPriorTable {
    /// Builds a table after validating every prior.
    ///
    /// # Errors
    /// Returns [`PredictorError::Internal`] when a prior violates
    /// `mean_days >= 0.5` or `mad_days >= 0`.
    pub fn new(priors: BTreeMap<CategoryId, CategoryPrior>) -> Result<Self, PredictorError> {
        for (category, prior) in &priors {
            if !prior.mean_days.is_finite() || prior.mean_days < MIN_CYCLE_MEAN_DAYS {
                return Err(PredictorError::Internal(format!(
                    "prior for {category} has mean_days {} below {MIN_CYCLE_MEAN_DAYS}",
                    prior.mean_days
                )));
            }
            if !prior.mad_days.is_finite() || prior.mad_days < 0.0 {
                return Err(PredictorError::Internal(format!(
                    "prior for {category} has negative mad_days {}",
                    prior.mad_days
                )));
            }
        }
        Ok(Self { priors })
    }

    /// Canonical grocery priors, keyed by category name.
    #[must_use]
    pub fn canonical() -> Self {
        let table = [
            ("Dairy & Eggs", 5.0, 2.0),
            ("Bread & Bakery", 4.0, 1.5),
            ("Meat & Poultry", 4.0, 2.0),
            ("Fish & Seafood", 3.0, 1.5),
            ("Fruits", 6.0, 2.5),
            ("Vegetables", 5.0, 2.0),
            ("Grains & Pasta", 35.0, 10.0),
            ("Canned & Jarred", 75.0, 15.0),
            ("Condiments & Sauces", 45.0, 15.0),
            ("Snacks", 10.0, 5.0),
            ("Beverages", 7.0, 3.0),
            ("Frozen Foods", 45.0, 15.0),
            ("Spices & Seasonings", 75.0, 20.0),
        ];
        let priors = table
            .into_iter()
            .map(|(name, mean_days, mad_days)| {
                (CategoryId(name.to_string()), CategoryPrior { mean_days, mad_days })
            })
            .collect();
        Self { priors }
    }

    #[must_use]
    pub fn lookup(&self, category_id: Option<&CategoryId>) -> CategoryPrior {
        category_id
            .and_then(|id| self.priors.get(id).copied())
            .unwrap_or(DEFAULT_PRIOR)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.priors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.priors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Stock classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockState {
    Empty,
    Low,
    Medium,
    Full,
    Unknown,
}

impl StockState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "EMPTY",
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::Full => "FULL",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "EMPTY" => Some(Self::Empty),
            "LOW" => Some(Self::Low),
            "MEDIUM" => Some(Self::Medium),
            "FULL" => Some(Self::Full),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl Display for StockState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Maps `(days_left, cycle_mean_days)` onto the discrete stock scale.
/// Monotonic in `days_left` for a fixed positive mean.
#[must_use]
pub fn classify_stock(days_left: f64, cycle_mean_days: f64) -> StockState {
    if cycle_mean_days <= 0.0 {
        return StockState::Unknown;
    }
    let ratio = days_left / cycle_mean_days;
    if days_left <= 0.0 || ratio < EMPTY_RATIO {
        return StockState::Empty;
    }
    if ratio >= FULL_RATIO {
        return StockState::Full;
    }
    if ratio >= MEDIUM_RATIO {
        return StockState::Medium;
    }
    StockState::Low
}

// ---------------------------------------------------------------------------
// Predictor state & confidence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictorState {
    pub household_id: HouseholdId,
    pub product_id: ProductId,
    pub cycle_mean_days: f64,
    pub cycle_mad_days: f64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cycle_started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_purchase_at: Option<OffsetDateTime>,
    pub last_pred_days_left: f64,
    pub n_completed_cycles: u32,
    pub n_censored_cycles: u32,
    pub n_strong_updates: u32,
    pub n_total_updates: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_update_at: OffsetDateTime,
    pub category_id: Option<CategoryId>,
    pub confidence: f64,
}

impl PredictorState {
    #[must_use]
    pub fn key(&self) -> PantryKey {
        PantryKey {
            household_id: self.household_id.clone(),
            product_id: self.product_id.clone(),
        }
    }

    /// Stock state derived from the current estimate; never stored.
    #[must_use]
    pub fn stock_state(&self) -> StockState {
        classify_stock(self.last_pred_days_left, self.cycle_mean_days)
    }

    /// Checks the structural invariants and reports the first violation.
    ///
    /// # Errors
    /// Returns [`PredictorError::Internal`] naming the violated invariant.
    pub fn check_invariants(&self) -> Result<(), PredictorError> {
        if self.cycle_mean_days < MIN_CYCLE_MEAN_DAYS {
            return Err(PredictorError::Internal(format!(
                "cycle_mean_days {} below floor {MIN_CYCLE_MEAN_DAYS}",
                self.cycle_mean_days
            )));
        }
        if self.cycle_mad_days < 0.0 {
            return Err(PredictorError::Internal(format!(
                "cycle_mad_days {} negative",
                self.cycle_mad_days
            )));
        }
        if self.last_pred_days_left < 0.0 {
            return Err(PredictorError::Internal(format!(
                "last_pred_days_left {} negative",
                self.last_pred_days_left
            )));
        }
        if let (Some(purchase), Some(started)) = (self.last_purchase_at, self.cycle_started_at) {
            if purchase > started {
                return Err(PredictorError::Internal(format!(
                    "last_purchase_at {purchase} after cycle_started_at {started}"
                )));
            }
        }
        if self.n_total_updates < self.n_strong_updates + self.n_completed_cycles {
            return Err(PredictorError::Internal(format!(
                "n_total_updates {} below n_strong_updates {} + n_completed_cycles {}",
                self.n_total_updates, self.n_strong_updates, self.n_completed_cycles
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(PredictorError::Internal(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// Cold-start state from the category prior.
#[must_use]
pub fn init_state(
    household_id: HouseholdId,
    product_id: ProductId,
    category_id: Option<CategoryId>,
    priors: &CategoryPriorTable,
    now: OffsetDateTime,
) -> PredictorState {
    let prior = priors.lookup(category_id.as_ref());
    let mut state = PredictorState {
        household_id,
        product_id,
        cycle_mean_days: prior.mean_days.max(MIN_CYCLE_MEAN_DAYS),
        cycle_mad_days: prior.mad_days.max(0.0),
        cycle_started_at: None,
        last_purchase_at: None,
        last_pred_days_left: prior.mean_days.max(MIN_CYCLE_MEAN_DAYS),
        n_completed_cycles: 0,
        n_censored_cycles: 0,
        n_strong_updates: 0,
        n_total_updates: 0,
        last_update_at: now,
        category_id,
        confidence: 0.0,
    };
    state.confidence = compute_confidence(&state, now);
    state
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.min(max).max(min)
}

/// Confidence in the current estimate: evidence from completed cycles,
/// stability from MAD/mean, recency from time since the last update.
#[must_use]
pub fn compute_confidence(state: &PredictorState, now: OffsetDateTime) -> f64 {
    let evidence = sigmoid(f64::from(state.n_completed_cycles) / 2.0).max(0.3);
    let stability = clamp(
        1.0 - state.cycle_mad_days / state.cycle_mean_days.max(MIN_CYCLE_MEAN_DAYS),
        0.2,
        1.0,
    );
    let recency = (-days_between(now, state.last_update_at) / RECENCY_TAU_DAYS).exp().max(0.1);
    clamp(0.2 + 0.8 * evidence * stability * recency, 0.2, 1.0)
}

// ---------------------------------------------------------------------------
// Event taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrashReason {
    Taste,
    Expired,
    RanOut,
    Other,
}

impl TrashReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Taste => "TASTE",
            Self::Expired => "EXPIRED",
            Self::RanOut => "RAN_OUT",
            Self::Other => "OTHER",
        }
    }

    /// Accepts the canonical reason names plus the legacy EMPTY aliases.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TASTE" => Some(Self::Taste),
            "EXPIRED" => Some(Self::Expired),
            "RAN_OUT" | "EMPTY" | "OUT" => Some(Self::RanOut),
            "OTHER" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedbackDirection {
    More,
    Less,
}

impl FeedbackDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::More => "MORE",
            Self::Less => "LESS",
        }
    }
}

/// Normalises the UI's feedback spellings ("Will Last More", arrow "up",
/// bare "MORE") into the canonical direction.
///
/// # Errors
/// Returns [`PredictorError::InvalidEvent`] for unknown strings.
pub fn normalize_feedback(raw: &str) -> Result<FeedbackDirection, PredictorError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "more" | "up" | "arrow_up" | "will last more" | "will_last_more" | "lasts more" => {
            Ok(FeedbackDirection::More)
        }
        "less" | "down" | "arrow_down" | "will last less" | "will_last_less" | "lasts less" => {
            Ok(FeedbackDirection::Less)
        }
        other => Err(PredictorError::InvalidEvent(format!(
            "unknown feedback direction {other:?}"
        ))),
    }
}

/// Closed sum of predictor transitions. `Reset` is appended only by the
/// reset operation and is rejected on the submit surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Purchase,
    Repurchase,
    Empty,
    Trash { reason: TrashReason },
    AdjustFeedback { direction: FeedbackDirection },
    Consume { delta_days: Option<f64>, ratio: Option<f64> },
    ManualSet { days_left_target: f64 },
    WeeklyTick,
    Reset,
}

impl EventKind {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::Repurchase => "repurchase",
            Self::Empty => "empty",
            Self::Trash { .. } => "trash",
            Self::AdjustFeedback { .. } => "adjust_feedback",
            Self::Consume { .. } => "consume",
            Self::ManualSet { .. } => "manual_set",
            Self::WeeklyTick => "weekly_tick",
            Self::Reset => "reset",
        }
    }
}

/// Flat wire payload; `validate` lifts it into a typed [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventInput {
    pub idempotency_key: String,
    pub household_id: String,
    pub product_id: String,
    #[serde(default)]
    pub category_id: Option<String>,
    pub timestamp: String,
    pub kind: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub delta_days: Option<f64>,
    #[serde(default)]
    pub ratio: Option<f64>,
    #[serde(default)]
    pub days_left_target: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Validated event ready for the processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub idempotency_key: String,
    pub household_id: HouseholdId,
    pub product_id: ProductId,
    pub category_id: Option<CategoryId>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    pub kind: EventKind,
    pub note: Option<String>,
}

impl Event {
    #[must_use]
    pub fn key(&self) -> PantryKey {
        PantryKey {
            household_id: self.household_id.clone(),
            product_id: self.product_id.clone(),
        }
    }
}

impl EventInput {
    /// Validates the payload and resolves the discriminator.
    ///
    /// # Errors
    /// Returns [`PredictorError::InvalidEvent`] for empty ids, malformed
    /// timestamps, unknown kinds/reasons/directions, negative deltas,
    /// out-of-range ratios, or a `reset` kind on the submit surface.
    pub fn validate(&self) -> Result<Event, PredictorError> {
        if self.idempotency_key.trim().is_empty() {
            return Err(PredictorError::InvalidEvent(
                "idempotency_key MUST be non-empty".to_string(),
            ));
        }
        if self.household_id.trim().is_empty() {
            return Err(PredictorError::InvalidEvent(
                "household_id MUST be non-empty".to_string(),
            ));
        }
        if self.product_id.trim().is_empty() {
            return Err(PredictorError::InvalidEvent(
                "product_id MUST be non-empty".to_string(),
            ));
        }

        let occurred_at = parse_timestamp(&self.timestamp)?;

        let kind = match self.kind.trim().to_ascii_lowercase().as_str() {
            "purchase" => EventKind::Purchase,
            "repurchase" => EventKind::Repurchase,
            "empty" => EventKind::Empty,
            "trash" => {
                let raw = self.reason.as_deref().ok_or_else(|| {
                    PredictorError::InvalidEvent("trash events require a reason".to_string())
                })?;
                let reason = TrashReason::parse(raw).ok_or_else(|| {
                    PredictorError::InvalidEvent(format!("unknown trash reason {raw:?}"))
                })?;
                EventKind::Trash { reason }
            }
            "adjust_feedback" => {
                let raw = self.direction.as_deref().ok_or_else(|| {
                    PredictorError::InvalidEvent(
                        "adjust_feedback events require a direction".to_string(),
                    )
                })?;
                EventKind::AdjustFeedback { direction: normalize_feedback(raw)? }
            }
            "consume" => {
                if self.delta_days.is_some() && self.ratio.is_some() {
                    return Err(PredictorError::InvalidEvent(
                        "consume events accept delta_days or ratio, not both".to_string(),
                    ));
                }
                if let Some(delta) = self.delta_days {
                    if !delta.is_finite() || delta < 0.0 {
                        return Err(PredictorError::InvalidEvent(format!(
                            "delta_days MUST be finite and >= 0, got {delta}"
                        )));
                    }
                }
                if let Some(ratio) = self.ratio {
                    if !ratio.is_finite() || ratio <= 0.0 || ratio >= 1.0 {
                        return Err(PredictorError::InvalidEvent(format!(
                            "ratio MUST lie in (0, 1), got {ratio}"
                        )));
                    }
                }
                EventKind::Consume { delta_days: self.delta_days, ratio: self.ratio }
            }
            "manual_set" => {
                let target = self.days_left_target.ok_or_else(|| {
                    PredictorError::InvalidEvent(
                        "manual_set events require days_left_target".to_string(),
                    )
                })?;
                if !target.is_finite() || target < 0.0 {
                    return Err(PredictorError::InvalidEvent(format!(
                        "days_left_target MUST be finite and >= 0, got {target}"
                    )));
                }
                EventKind::ManualSet { days_left_target: target }
            }
            "weekly_tick" => EventKind::WeeklyTick,
            "reset" => {
                return Err(PredictorError::InvalidEvent(
                    "reset is appended by the reset operation, not submitted".to_string(),
                ));
            }
            other => {
                return Err(PredictorError::InvalidEvent(format!("unknown event kind {other:?}")));
            }
        };

        Ok(Event {
            idempotency_key: self.idempotency_key.clone(),
            household_id: HouseholdId(self.household_id.clone()),
            product_id: ProductId(self.product_id.clone()),
            category_id: self.category_id.clone().map(CategoryId),
            occurred_at,
            kind,
            note: self.note.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Outcome of one applied event: the new state plus the audit deltas the
/// log entry and forecast snapshot are built from.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub state: PredictorState,
    pub days_left_before: f64,
    pub days_left_after: f64,
    pub mean_before: f64,
    pub mean_after: f64,
    pub stock_before: StockState,
    pub stock_after: StockState,
    /// True when `days_left` or the classified state moved; gates the
    /// forecast snapshot.
    pub forecast_changed: bool,
}

fn close_cycle(state: &mut PredictorState, at: OffsetDateTime) {
    let Some(started) = state.cycle_started_at else {
        return;
    };
    let observed = days_between(at, started);
    if observed < MIN_OBSERVED_CYCLE_DAYS {
        return;
    }
    let old_mean = state.cycle_mean_days;
    let n = f64::from(state.n_completed_cycles);
    let new_mean = (old_mean * n + observed) / (n + 1.0);
    let deviation = (observed - old_mean).abs();
    let new_mad = if state.n_completed_cycles == 0 {
        deviation
    } else {
        (state.cycle_mad_days * n + deviation) / (n + 1.0)
    };
    state.cycle_mean_days = new_mean.max(MIN_CYCLE_MEAN_DAYS);
    state.cycle_mad_days = new_mad;
    state.n_completed_cycles += 1;
    state.n_strong_updates += 1;
    state.cycle_started_at = None;
}

fn weak_blend(state: &mut PredictorState, observed: f64, weight: f64) {
    let old_mean = state.cycle_mean_days;
    state.cycle_mean_days =
        ((1.0 - weight) * old_mean + weight * observed).max(MIN_CYCLE_MEAN_DAYS);
    state.cycle_mad_days =
        (1.0 - weight) * state.cycle_mad_days + weight * (observed - old_mean).abs();
    state.n_strong_updates += 1;
}

/// Applies one event to a state. Pure: the same `(state, event)` pair always
/// yields the same result, which is what makes log replay authoritative.
///
/// # Errors
/// Returns [`PredictorError::InvalidEvent`] when the event addresses a
/// different key than the state.
pub fn apply_event(
    state: &PredictorState,
    event: &Event,
    priors: &CategoryPriorTable,
) -> Result<Applied, PredictorError> {
    if state.household_id != event.household_id || state.product_id != event.product_id {
        return Err(PredictorError::InvalidEvent(format!(
            "event for {} applied to state {}",
            event.key(),
            state.key()
        )));
    }

    let at = event.occurred_at;
    let mut next = state.clone();

    // Adopt a category the state has not seen; never overwrite one.
    if next.category_id.is_none() && event.category_id.is_some() {
        next.category_id = event.category_id.clone();
    }

    let days_before = state.last_pred_days_left;
    let stock_before = classify_stock(days_before, state.cycle_mean_days);
    let mean_before = state.cycle_mean_days;
    let mut counts_as_update = true;

    let days_after = match event.kind {
        EventKind::Purchase | EventKind::Repurchase => {
            if next.cycle_started_at.is_some() {
                next.n_censored_cycles += 1;
            }
            next.cycle_started_at = Some(at);
            next.last_purchase_at = Some(at);
            next.cycle_mean_days
        }
        EventKind::Empty => {
            close_cycle(&mut next, at);
            0.0
        }
        EventKind::Trash { reason } => {
            match reason {
                TrashReason::RanOut => {
                    if let Some(started) = next.cycle_started_at {
                        weak_blend(&mut next, days_between(at, started), TRASH_WEAK_WEIGHT);
                    }
                }
                TrashReason::Taste | TrashReason::Expired | TrashReason::Other => {}
            }
            next.cycle_started_at = None;
            0.0
        }
        EventKind::AdjustFeedback { direction } => {
            let cur = days_before.max(0.0);
            if stock_before == StockState::Empty {
                match direction {
                    FeedbackDirection::More => {
                        next.cycle_started_at = Some(at);
                        EMPTY_RESTART_RATIO * next.cycle_mean_days
                    }
                    FeedbackDirection::Less => days_before,
                }
            } else {
                match direction {
                    FeedbackDirection::More => cur * (1.0 + FEEDBACK_STEP),
                    FeedbackDirection::Less => cur * (1.0 - FEEDBACK_STEP),
                }
            }
        }
        EventKind::Consume { delta_days, ratio } => {
            let cur = days_before.max(0.0);
            let remaining = match (delta_days, ratio) {
                (Some(delta), _) => (cur - delta).max(0.0),
                (None, Some(ratio)) => (cur * (1.0 - ratio)).max(0.0),
                (None, None) => (cur * (1.0 - DEFAULT_CONSUME_RATIO)).max(0.0),
            };
            if remaining == 0.0 && next.cycle_started_at.is_some() {
                close_cycle(&mut next, at);
            }
            remaining
        }
        EventKind::ManualSet { days_left_target } => {
            if next.cycle_started_at.is_none() && days_left_target > 0.0 {
                next.cycle_started_at = Some(at);
            }
            days_left_target
        }
        EventKind::WeeklyTick => {
            if let Some(started) = next.cycle_started_at {
                let elapsed = days_between(at, started);
                if elapsed >= WEEKLY_TICK_MIN_ELAPSED_DAYS {
                    weak_blend(&mut next, elapsed, WEEKLY_TICK_WEIGHT);
                }
            }
            days_before
        }
        EventKind::Reset => {
            next = init_state(
                next.household_id.clone(),
                next.product_id.clone(),
                next.category_id.clone(),
                priors,
                at,
            );
            counts_as_update = false;
            next.last_pred_days_left
        }
    };

    let days_after = days_after.max(0.0);
    next.last_pred_days_left = days_after;
    next.last_update_at = at;
    if counts_as_update {
        next.n_total_updates += 1;
    }
    next.confidence = compute_confidence(&next, at);

    let stock_after = classify_stock(days_after, next.cycle_mean_days);
    let mean_after = next.cycle_mean_days;

    next.check_invariants()?;

    Ok(Applied {
        state: next,
        days_left_before: days_before,
        days_left_after: days_after,
        mean_before,
        mean_after,
        stock_before,
        stock_after,
        forecast_changed: days_after != days_before || stock_after != stock_before,
    })
}

/// Folds an ordered per-key event stream from the empty state, the replay
/// path that makes the log authoritative. The first event initialises the
/// state from its category prior.
///
/// # Errors
/// Propagates transition errors; rejects streams that mix keys.
pub fn project_state(
    events: &[Event],
    priors: &CategoryPriorTable,
) -> Result<Option<PredictorState>, PredictorError> {
    let Some(first) = events.first() else {
        return Ok(None);
    };

    let mut state = init_state(
        first.household_id.clone(),
        first.product_id.clone(),
        first.category_id.clone(),
        priors,
        first.occurred_at,
    );

    for event in events {
        if event.household_id != first.household_id || event.product_id != first.product_id {
            return Err(PredictorError::Internal(
                "replay stream MUST contain a single (household, product) key".to_string(),
            ));
        }
        state = apply_event(&state, event, priors)?.state;
    }

    Ok(Some(state))
}

// ---------------------------------------------------------------------------
// Forecast reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forecast {
    pub expected_days_left: f64,
    pub predicted_state: StockState,
    pub confidence: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
}

/// Read-only forecast: decays the last estimate by elapsed real time and
/// reclassifies. Never mutates state.
#[must_use]
pub fn forecast_at(state: &PredictorState, now: OffsetDateTime) -> Forecast {
    let elapsed = days_between(now, state.last_update_at);
    let expected = (state.last_pred_days_left - elapsed * FORECAST_DECAY_RATE).max(0.0);
    Forecast {
        expected_days_left: expected,
        predicted_state: classify_stock(expected, state.cycle_mean_days),
        confidence: compute_confidence(state, now),
        generated_at: now,
    }
}

/// Weekday of a product's first log entry; weekly ticks fire on this day.
#[must_use]
pub fn anniversary_weekday(first_event_at: OffsetDateTime) -> Weekday {
    first_event_at.to_offset(UtcOffset::UTC).weekday()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const STATE_TOLERANCE: f64 = 1e-9;
    const DAYS_TOLERANCE: f64 = 1e-6;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn priors() -> CategoryPriorTable {
        CategoryPriorTable::canonical()
    }

    fn dairy() -> CategoryId {
        CategoryId("Dairy & Eggs".to_string())
    }

    fn fixture_event(kind: EventKind, at: OffsetDateTime) -> Event {
        Event {
            idempotency_key: format!("test-{}-{at}", kind.name()),
            household_id: HouseholdId("h1".to_string()),
            product_id: ProductId("p1".to_string()),
            category_id: Some(dairy()),
            occurred_at: at,
            kind,
            note: None,
        }
    }

    fn fresh_state(at: OffsetDateTime) -> PredictorState {
        init_state(
            HouseholdId("h1".to_string()),
            ProductId("p1".to_string()),
            Some(dairy()),
            &priors(),
            at,
        )
    }

    #[test]
    fn cold_start_purchase_matches_dairy_prior() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let state = fresh_state(t0);
        let applied =
            must_ok(apply_event(&state, &fixture_event(EventKind::Purchase, t0), &priors()));

        let next = applied.state;
        assert!((next.cycle_mean_days - 5.0).abs() < STATE_TOLERANCE);
        assert!((next.last_pred_days_left - 5.0).abs() < DAYS_TOLERANCE);
        assert_eq!(applied.stock_after, StockState::Full);
        assert_eq!(next.n_completed_cycles, 0);
        assert_eq!(next.cycle_started_at, Some(t0));
        // evidence 0.5, stability 0.6, recency 1.0 -> 0.2 + 0.8 * 0.3 = 0.44
        assert!((next.confidence - 0.44).abs() < 1e-4);
    }

    #[test]
    fn two_cycles_converge_to_cumulative_mean() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        let table = priors();

        for (kind, at) in [
            (EventKind::Purchase, t0),
            (EventKind::Empty, t0 + Duration::days(7)),
            (EventKind::Purchase, t0 + Duration::days(7)),
            (EventKind::Empty, t0 + Duration::days(12)),
        ] {
            state = must_ok(apply_event(&state, &fixture_event(kind, at), &table)).state;
        }

        assert!((state.cycle_mean_days - 6.0).abs() < STATE_TOLERANCE);
        assert_eq!(state.n_completed_cycles, 2);
        assert!(state.last_pred_days_left.abs() < DAYS_TOLERANCE);
        assert_eq!(state.stock_state(), StockState::Empty);
        assert_eq!(state.cycle_started_at, None);
    }

    #[test]
    fn first_cycle_mad_is_absolute_deviation() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        let table = priors();
        state = must_ok(apply_event(&state, &fixture_event(EventKind::Purchase, t0), &table)).state;
        state = must_ok(apply_event(
            &state,
            &fixture_event(EventKind::Empty, t0 + Duration::days(7)),
            &table,
        ))
        .state;
        // observed 7, old mean 5 -> mad |7 - 5| = 2
        assert!((state.cycle_mad_days - 2.0).abs() < STATE_TOLERANCE);
    }

    #[test]
    fn more_feedback_on_stocked_item_scales_days_left() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 7.0;
        state.last_pred_days_left = 6.0;
        state.cycle_started_at = Some(t0);
        state.last_purchase_at = Some(t0);

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(
                EventKind::AdjustFeedback { direction: FeedbackDirection::More },
                t0 + Duration::days(1),
            ),
            &priors(),
        ));

        assert!((applied.days_left_after - 6.9).abs() < DAYS_TOLERANCE);
        assert!((applied.state.cycle_mean_days - 7.0).abs() < STATE_TOLERANCE);
        assert_eq!(applied.stock_after, StockState::Full);
    }

    #[test]
    fn more_feedback_on_empty_restarts_cycle() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let t = t0 + Duration::days(3);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 10.0;
        state.last_pred_days_left = 0.0;
        state.cycle_started_at = None;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(EventKind::AdjustFeedback { direction: FeedbackDirection::More }, t),
            &priors(),
        ));

        assert_eq!(applied.state.cycle_started_at, Some(t));
        assert!((applied.days_left_after - 1.5).abs() < DAYS_TOLERANCE);
        assert_eq!(applied.stock_after, StockState::Low);
        assert_eq!(applied.state.n_completed_cycles, 0);
    }

    #[test]
    fn less_feedback_on_empty_is_noop_besides_timestamps() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let t = t0 + Duration::days(3);
        let mut state = fresh_state(t0);
        state.last_pred_days_left = 0.0;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(EventKind::AdjustFeedback { direction: FeedbackDirection::Less }, t),
            &priors(),
        ));

        assert!(applied.days_left_after.abs() < DAYS_TOLERANCE);
        assert_eq!(applied.state.cycle_started_at, None);
        assert_eq!(applied.state.last_update_at, t);
    }

    #[test]
    fn trash_expired_does_not_learn() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 5.0;
        state.cycle_started_at = Some(t0);
        state.last_purchase_at = Some(t0);
        state.last_pred_days_left = 2.0;
        state.n_total_updates = 1;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(
                EventKind::Trash { reason: TrashReason::Expired },
                t0 + Duration::days(1),
            ),
            &priors(),
        ));

        assert!((applied.state.cycle_mean_days - 5.0).abs() < STATE_TOLERANCE);
        assert_eq!(applied.state.cycle_started_at, None);
        assert!(applied.days_left_after.abs() < DAYS_TOLERANCE);
        assert_eq!(applied.state.n_completed_cycles, 0);
    }

    #[test]
    fn trash_ran_out_blends_weakly() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 5.0;
        state.cycle_started_at = Some(t0);
        state.last_purchase_at = Some(t0);
        state.last_pred_days_left = 1.0;
        state.n_total_updates = 1;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(
                EventKind::Trash { reason: TrashReason::RanOut },
                t0 + Duration::days(10),
            ),
            &priors(),
        ));

        // 0.8 * 5 + 0.2 * 10 = 6
        assert!((applied.state.cycle_mean_days - 6.0).abs() < STATE_TOLERANCE);
        assert_eq!(applied.state.n_completed_cycles, 0);
        assert_eq!(applied.state.n_strong_updates, 1);
        assert_eq!(applied.state.cycle_started_at, None);
    }

    #[test]
    fn consume_defaults_to_ten_percent_ratio() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 5.0;
        state.last_pred_days_left = 5.0;
        state.cycle_started_at = Some(t0);
        state.last_purchase_at = Some(t0);

        let table = priors();
        let consume = EventKind::Consume { delta_days: None, ratio: None };
        let first = must_ok(apply_event(
            &state,
            &fixture_event(consume, t0 + Duration::hours(1)),
            &table,
        ));
        assert!((first.days_left_after - 4.5).abs() < DAYS_TOLERANCE);

        let second = must_ok(apply_event(
            &first.state,
            &fixture_event(consume, t0 + Duration::hours(2)),
            &table,
        ));
        assert!((second.days_left_after - 4.05).abs() < DAYS_TOLERANCE);
        assert_eq!(second.stock_after, StockState::Full);
    }

    #[test]
    fn consume_to_zero_closes_open_cycle_as_ran_out() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 5.0;
        state.cycle_started_at = Some(t0);
        state.last_purchase_at = Some(t0);
        state.last_pred_days_left = 1.0;
        state.n_total_updates = 1;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(
                EventKind::Consume { delta_days: Some(2.0), ratio: None },
                t0 + Duration::days(4),
            ),
            &priors(),
        ));

        assert!(applied.days_left_after.abs() < DAYS_TOLERANCE);
        assert_eq!(applied.state.cycle_started_at, None);
        assert_eq!(applied.state.n_completed_cycles, 1);
        // observed 4, prior mean 5, n was 0 -> cumulative mean is 4
        assert!((applied.state.cycle_mean_days - 4.0).abs() < STATE_TOLERANCE);
    }

    #[test]
    fn consume_to_zero_without_open_cycle_only_zeroes() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.last_pred_days_left = 0.5;
        state.cycle_started_at = None;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(
                EventKind::Consume { delta_days: Some(3.0), ratio: None },
                t0 + Duration::days(1),
            ),
            &priors(),
        ));

        assert!(applied.days_left_after.abs() < DAYS_TOLERANCE);
        assert_eq!(applied.state.n_completed_cycles, 0);
    }

    #[test]
    fn empty_within_half_day_does_not_learn() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 5.0;
        state.cycle_started_at = Some(t0);
        state.last_purchase_at = Some(t0);
        state.last_pred_days_left = 5.0;
        state.n_total_updates = 1;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(EventKind::Empty, t0 + Duration::hours(6)),
            &priors(),
        ));

        assert!((applied.state.cycle_mean_days - 5.0).abs() < STATE_TOLERANCE);
        assert_eq!(applied.state.n_completed_cycles, 0);
        assert!(applied.days_left_after.abs() < DAYS_TOLERANCE);
    }

    #[test]
    fn repurchase_censors_open_cycle() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        let table = priors();
        state = must_ok(apply_event(&state, &fixture_event(EventKind::Purchase, t0), &table)).state;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(EventKind::Repurchase, t0 + Duration::days(2)),
            &table,
        ));

        assert_eq!(applied.state.n_censored_cycles, 1);
        assert_eq!(applied.state.n_completed_cycles, 0);
        assert_eq!(applied.state.cycle_started_at, Some(t0 + Duration::days(2)));
        assert!((applied.days_left_after - 5.0).abs() < DAYS_TOLERANCE);
    }

    #[test]
    fn manual_set_opens_cycle_when_needed() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let state = fresh_state(t0);
        let t = t0 + Duration::days(1);

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(EventKind::ManualSet { days_left_target: 3.0 }, t),
            &priors(),
        ));

        assert_eq!(applied.state.cycle_started_at, Some(t));
        assert!((applied.days_left_after - 3.0).abs() < DAYS_TOLERANCE);
    }

    #[test]
    fn weekly_tick_blends_toward_elapsed_without_closing() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 5.0;
        state.cycle_started_at = Some(t0);
        state.last_purchase_at = Some(t0);
        state.last_pred_days_left = 2.0;
        state.n_total_updates = 1;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(EventKind::WeeklyTick, t0 + Duration::days(7)),
            &priors(),
        ));

        // 0.9 * 5 + 0.1 * 7 = 5.2
        assert!((applied.state.cycle_mean_days - 5.2).abs() < STATE_TOLERANCE);
        assert_eq!(applied.state.cycle_started_at, Some(t0));
        assert_eq!(applied.state.n_completed_cycles, 0);
        assert_eq!(applied.state.n_strong_updates, 1);
        assert!((applied.days_left_after - 2.0).abs() < DAYS_TOLERANCE);
        assert!(!applied.forecast_changed);
    }

    #[test]
    fn weekly_tick_on_fresh_cycle_is_inert() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_started_at = Some(t0);
        state.last_purchase_at = Some(t0);
        state.n_total_updates = 1;

        let applied = must_ok(apply_event(
            &state,
            &fixture_event(EventKind::WeeklyTick, t0 + Duration::hours(12)),
            &priors(),
        ));

        assert!((applied.state.cycle_mean_days - 5.0).abs() < STATE_TOLERANCE);
        assert_eq!(applied.state.n_strong_updates, 0);
    }

    #[test]
    fn reset_reinitialises_from_prior() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        let table = priors();
        for (kind, at) in [
            (EventKind::Purchase, t0),
            (EventKind::Empty, t0 + Duration::days(9)),
            (EventKind::Purchase, t0 + Duration::days(9)),
        ] {
            state = must_ok(apply_event(&state, &fixture_event(kind, at), &table)).state;
        }

        let t = t0 + Duration::days(10);
        let applied =
            must_ok(apply_event(&state, &fixture_event(EventKind::Reset, t), &table));

        assert!((applied.state.cycle_mean_days - 5.0).abs() < STATE_TOLERANCE);
        assert_eq!(applied.state.n_completed_cycles, 0);
        assert_eq!(applied.state.n_total_updates, 0);
        assert_eq!(applied.state.cycle_started_at, None);
        assert_eq!(applied.state.category_id, Some(dairy()));
    }

    #[test]
    fn category_adopted_once_never_overwritten() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let table = priors();
        let state = init_state(
            HouseholdId("h1".to_string()),
            ProductId("p1".to_string()),
            None,
            &table,
            t0,
        );

        let mut event = fixture_event(EventKind::Purchase, t0);
        event.category_id = Some(dairy());
        let adopted = must_ok(apply_event(&state, &event, &table)).state;
        assert_eq!(adopted.category_id, Some(dairy()));

        let mut second = fixture_event(EventKind::Purchase, t0 + Duration::days(1));
        second.category_id = Some(CategoryId("Beverages".to_string()));
        let kept = must_ok(apply_event(&adopted, &second, &table)).state;
        assert_eq!(kept.category_id, Some(dairy()));
    }

    #[test]
    fn classifier_thresholds_and_tie_breaks() {
        assert_eq!(classify_stock(0.0, 5.0), StockState::Empty);
        assert_eq!(classify_stock(0.05, 5.0), StockState::Empty); // ratio 0.01
        assert_eq!(classify_stock(0.1, 5.0), StockState::Low); // ratio 0.02
        assert_eq!(classify_stock(1.4, 5.0), StockState::Low); // ratio 0.28
        assert_eq!(classify_stock(1.5, 5.0), StockState::Medium); // ratio 0.30
        assert_eq!(classify_stock(3.5, 5.0), StockState::Full); // ratio 0.70
        assert_eq!(classify_stock(3.0, 0.0), StockState::Unknown);
        assert_eq!(classify_stock(3.0, -1.0), StockState::Unknown);
    }

    #[test]
    fn forecast_decays_one_day_per_day() {
        let t0 = datetime!(2026-03-02 08:00:00 UTC);
        let mut state = fresh_state(t0);
        state.cycle_mean_days = 5.0;
        state.last_pred_days_left = 4.0;
        state.last_update_at = t0;

        let fc = forecast_at(&state, t0 + Duration::days(3));
        assert!((fc.expected_days_left - 1.0).abs() < DAYS_TOLERANCE);
        assert_eq!(fc.predicted_state, StockState::Low);

        let exhausted = forecast_at(&state, t0 + Duration::days(10));
        assert!(exhausted.expected_days_left.abs() < DAYS_TOLERANCE);
        assert_eq!(exhausted.predicted_state, StockState::Empty);
    }

    #[test]
    fn lenient_timestamp_parsing() {
        // canonical
        assert!(parse_timestamp("2026-03-02T08:00:00Z").is_ok());
        // 5-digit fractional seconds, explicit offset
        let with_fraction = must_ok(parse_timestamp("2025-12-27T16:45:25.52139+00:00"));
        assert_eq!(with_fraction.offset(), UtcOffset::UTC);
        // 9-digit fractional seconds
        assert!(parse_timestamp("2026-03-02T08:00:00.123456789Z").is_ok());
        // missing timezone assumed UTC
        let naive = must_ok(parse_timestamp("2026-03-02T08:00:00"));
        assert_eq!(naive.offset(), UtcOffset::UTC);
        let naive_fraction = must_ok(parse_timestamp("2026-03-02T08:00:00.5"));
        assert_eq!(naive_fraction.offset(), UtcOffset::UTC);
        // garbage rejected
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn feedback_normalisation_covers_ui_spellings() {
        for raw in ["MORE", "more", "Will Last More", "up", "lasts more"] {
            assert_eq!(must_ok(normalize_feedback(raw)), FeedbackDirection::More);
        }
        for raw in ["LESS", "less", "Will Last Less", "down", "lasts less"] {
            assert_eq!(must_ok(normalize_feedback(raw)), FeedbackDirection::Less);
        }
        assert!(normalize_feedback("sideways").is_err());
    }

    #[test]
    fn event_input_validation_rejects_malformed_payloads() {
        let base = EventInput {
            idempotency_key: "k1".to_string(),
            household_id: "h1".to_string(),
            product_id: "p1".to_string(),
            category_id: None,
            timestamp: "2026-03-02T08:00:00Z".to_string(),
            kind: "purchase".to_string(),
            reason: None,
            direction: None,
            delta_days: None,
            ratio: None,
            days_left_target: None,
            note: None,
        };
        assert!(base.validate().is_ok());

        let mut bad_ratio = base.clone();
        bad_ratio.kind = "consume".to_string();
        bad_ratio.ratio = Some(1.0);
        assert!(matches!(bad_ratio.validate(), Err(PredictorError::InvalidEvent(_))));

        let mut negative_delta = base.clone();
        negative_delta.kind = "consume".to_string();
        negative_delta.delta_days = Some(-1.0);
        assert!(negative_delta.validate().is_err());

        let mut unknown_kind = base.clone();
        unknown_kind.kind = "teleport".to_string();
        assert!(unknown_kind.validate().is_err());

        let mut trash_without_reason = base.clone();
        trash_without_reason.kind = "trash".to_string();
        assert!(trash_without_reason.validate().is_err());

        let mut reset_from_wire = base.clone();
        reset_from_wire.kind = "reset".to_string();
        assert!(reset_from_wire.validate().is_err());

        let mut empty_key = base;
        empty_key.idempotency_key = "  ".to_string();
        assert!(empty_key.validate().is_err());
    }

    #[test]
    fn category_prior_lookup_falls_back_to_default() {
        let table = priors();
        let prior = table.lookup(Some(&CategoryId("No Such Category".to_string())));
        assert!((prior.mean_days - 7.0).abs() < STATE_TOLERANCE);
        assert!((prior.mad_days - 2.0).abs() < STATE_TOLERANCE);
        let none = table.lookup(None);
        assert!((none.mean_days - 7.0).abs() < STATE_TOLERANCE);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_kind() -> impl Strategy<Value = EventKind> {
            prop_oneof![
                Just(EventKind::Purchase),
                Just(EventKind::Repurchase),
                Just(EventKind::Empty),
                prop_oneof![
                    Just(TrashReason::Taste),
                    Just(TrashReason::Expired),
                    Just(TrashReason::RanOut),
                    Just(TrashReason::Other),
                ]
                .prop_map(|reason| EventKind::Trash { reason }),
                prop_oneof![Just(FeedbackDirection::More), Just(FeedbackDirection::Less)]
                    .prop_map(|direction| EventKind::AdjustFeedback { direction }),
                (proptest::option::of(0.0f64..20.0), proptest::bool::ANY).prop_map(
                    |(delta, use_ratio)| {
                        if use_ratio {
                            EventKind::Consume { delta_days: None, ratio: Some(0.25) }
                        } else {
                            EventKind::Consume { delta_days: delta, ratio: None }
                        }
                    }
                ),
                (0.0f64..40.0).prop_map(|target| EventKind::ManualSet { days_left_target: target }),
                Just(EventKind::WeeklyTick),
            ]
        }

        fn arb_events() -> impl Strategy<Value = Vec<Event>> {
            proptest::collection::vec((arb_kind(), 0i64..72), 1..24).prop_map(|steps| {
                let mut at = datetime!(2026-03-02 00:00:00 UTC);
                steps
                    .into_iter()
                    .enumerate()
                    .map(|(index, (kind, advance_hours))| {
                        at += Duration::hours(advance_hours);
                        Event {
                            idempotency_key: format!("prop-{index}"),
                            household_id: HouseholdId("h1".to_string()),
                            product_id: ProductId("p1".to_string()),
                            category_id: Some(CategoryId("Dairy & Eggs".to_string())),
                            occurred_at: at,
                            kind,
                            note: None,
                        }
                    })
                    .collect()
            })
        }

        proptest! {
            #[test]
            fn replay_reproduces_incremental_state(events in arb_events()) {
                let table = CategoryPriorTable::canonical();
                let first = &events[0];
                let mut incremental = init_state(
                    first.household_id.clone(),
                    first.product_id.clone(),
                    first.category_id.clone(),
                    &table,
                    first.occurred_at,
                );
                for event in &events {
                    incremental = apply_event(&incremental, event, &table)
                        .expect("transition accepted")
                        .state;
                }
                let replayed = project_state(&events, &table)
                    .expect("replay accepted")
                    .expect("non-empty stream");
                prop_assert!((replayed.cycle_mean_days - incremental.cycle_mean_days).abs() < 1e-9);
                prop_assert!((replayed.cycle_mad_days - incremental.cycle_mad_days).abs() < 1e-9);
                prop_assert!(
                    (replayed.last_pred_days_left - incremental.last_pred_days_left).abs() < 1e-6
                );
                prop_assert_eq!(replayed.n_completed_cycles, incremental.n_completed_cycles);
                prop_assert_eq!(replayed.n_total_updates, incremental.n_total_updates);
                prop_assert_eq!(replayed.cycle_started_at, incremental.cycle_started_at);
            }

            #[test]
            fn state_invariants_hold_under_any_accepted_stream(events in arb_events()) {
                let table = CategoryPriorTable::canonical();
                if let Some(state) = project_state(&events, &table).expect("replay accepted") {
                    prop_assert!(state.cycle_mean_days >= MIN_CYCLE_MEAN_DAYS);
                    prop_assert!((0.2..=1.0).contains(&state.confidence));
                    prop_assert!(state.last_pred_days_left >= 0.0);
                    prop_assert!(
                        state.n_total_updates >= state.n_strong_updates + state.n_completed_cycles
                    );
                }
            }

            #[test]
            fn natural_close_mean_stays_between_old_and_observed(
                old_mean in 0.5f64..60.0,
                prior_cycles in 0u32..12,
                observed_days in 0.5f64..60.0,
            ) {
                let t0 = datetime!(2026-03-02 00:00:00 UTC);
                let table = CategoryPriorTable::canonical();
                let mut state = init_state(
                    HouseholdId("h1".to_string()),
                    ProductId("p1".to_string()),
                    None,
                    &table,
                    t0,
                );
                state.cycle_mean_days = old_mean;
                state.n_completed_cycles = prior_cycles;
                state.n_total_updates = prior_cycles * 2 + 1;
                state.n_strong_updates = prior_cycles;
                state.cycle_started_at = Some(t0);
                state.last_purchase_at = Some(t0);

                let event = Event {
                    idempotency_key: "close".to_string(),
                    household_id: state.household_id.clone(),
                    product_id: state.product_id.clone(),
                    category_id: None,
                    occurred_at: t0 + Duration::seconds_f64(observed_days * 86_400.0),
                    kind: EventKind::Empty,
                    note: None,
                };
                let next = apply_event(&state, &event, &table).expect("close accepted").state;
                let low = old_mean.min(observed_days);
                let high = old_mean.max(observed_days);
                prop_assert!(next.cycle_mean_days >= low - 1e-9);
                prop_assert!(next.cycle_mean_days <= high + 1e-9);
                prop_assert_eq!(next.n_completed_cycles, prior_cycles + 1);
            }

            #[test]
            fn classifier_is_monotonic_in_days_left(
                mean in 0.5f64..90.0,
                mut points in proptest::collection::vec(0.0f64..120.0, 2..16),
            ) {
                fn severity(state: StockState) -> u8 {
                    match state {
                        StockState::Empty => 0,
                        StockState::Low => 1,
                        StockState::Medium => 2,
                        StockState::Full => 3,
                        StockState::Unknown => u8::MAX,
                    }
                }
                points.sort_by(f64::total_cmp);
                let mut last = severity(classify_stock(points[0], mean));
                for point in &points[1..] {
                    let current = severity(classify_stock(*point, mean));
                    prop_assert!(current >= last);
                    last = current;
                }
            }

            #[test]
            fn confidence_always_in_band(
                mean in 0.5f64..90.0,
                mad in 0.0f64..50.0,
                cycles in 0u32..40,
                idle_days in 0.0f64..400.0,
            ) {
                let t0 = datetime!(2026-03-02 00:00:00 UTC);
                let table = CategoryPriorTable::canonical();
                let mut state = init_state(
                    HouseholdId("h1".to_string()),
                    ProductId("p1".to_string()),
                    None,
                    &table,
                    t0,
                );
                state.cycle_mean_days = mean;
                state.cycle_mad_days = mad;
                state.n_completed_cycles = cycles;
                let now = t0 + Duration::seconds_f64(idle_days * 86_400.0);
                let confidence = compute_confidence(&state, now);
                prop_assert!((0.2..=1.0).contains(&confidence));
            }
        }
    }
}
