use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Result of a rollup at any level. `NoData` means "not yet assessed" and is
/// never interchangeable with a score of zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Attainment {
    NoData,
    Scored(f64),
}

impl Attainment {
    pub fn value(self) -> Option<f64> {
        match self {
            Attainment::NoData => None,
            Attainment::Scored(v) => Some(v),
        }
    }

    pub fn is_no_data(self) -> bool {
        matches!(self, Attainment::NoData)
    }

    /// Wire shape shared by every report: `{ "score": number|null, "noData": bool }`.
    pub fn to_json(self) -> serde_json::Value {
        serde_json::json!({
            "score": self.value(),
            "noData": self.is_no_data(),
        })
    }
}

/// How mapped-but-unscored inputs are treated at the component → CPMK level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MissingPolicy {
    /// Renormalize over the weights of the scored inputs only.
    #[default]
    Exclude,
    /// Count unscored inputs as 0 once at least one input is scored.
    Zero,
}

impl MissingPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclude" => Some(Self::Exclude),
            "zero" => Some(Self::Zero),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclude => "exclude",
            Self::Zero => "zero",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ---------------------------------------------------------------------------
// Weight validation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WeightRule {
    /// Sum must equal the expected total (components of a class).
    Exact,
    /// Sum must not exceed the expected total (CPMKs of one course feeding one CPL).
    AtMost,
}

impl WeightRule {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Some(Self::Exact),
            "atmost" | "at_most" => Some(Self::AtMost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightEntry {
    pub label: String,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightCheck {
    pub sum: f64,
    pub expected: f64,
    pub rule: WeightRule,
    pub valid: bool,
    pub count: usize,
}

/// Sums the group in the given order and reports whether it matches the
/// expected total within `epsilon`. Never refuses; callers surface `valid`.
pub fn validate_weights(
    entries: &[WeightEntry],
    expected: f64,
    epsilon: f64,
    rule: WeightRule,
) -> WeightCheck {
    let sum: f64 = entries.iter().map(|e| e.weight).sum();
    // Slack keeps the boundary itself inside: 50 + 49.99 lands a hair past 0.01.
    let tolerance = epsilon.abs() + 1e-9;
    let valid = sum.is_finite()
        && match rule {
            WeightRule::Exact => (sum - expected).abs() <= tolerance,
            WeightRule::AtMost => sum <= expected + tolerance,
        };
    WeightCheck {
        sum,
        expected,
        rule,
        valid,
        count: entries.len(),
    }
}

// ---------------------------------------------------------------------------
// Weighted rollups
// ---------------------------------------------------------------------------

/// One weighted child of a rollup: a component under a CPMK, or a CPMK under a CPL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedInput {
    pub weight: f64,
    pub score: Option<f64>,
}

pub fn weighted_rollup<I>(inputs: I, policy: MissingPolicy) -> Attainment
where
    I: IntoIterator<Item = WeightedInput>,
{
    let mut sum = 0.0_f64;
    let mut present_weight = 0.0_f64;
    let mut missing_weight = 0.0_f64;
    let mut present = 0_usize;

    for input in inputs {
        match input.score {
            Some(score) => {
                sum += score * input.weight;
                present_weight += input.weight;
                present += 1;
            }
            None => missing_weight += input.weight,
        }
    }

    if present == 0 {
        return Attainment::NoData;
    }
    let denom = match policy {
        MissingPolicy::Exclude => present_weight,
        MissingPolicy::Zero => present_weight + missing_weight,
    };
    if denom == 0.0 || !denom.is_finite() {
        return Attainment::NoData;
    }
    let value = sum / denom;
    if value.is_finite() {
        Attainment::Scored(value)
    } else {
        Attainment::NoData
    }
}

/// A component mapped to the CPMK being rolled up, with the student's score if recorded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentInput {
    pub weight: f64,
    pub score: Option<f64>,
}

pub fn cpmk_score(components: &[ComponentInput], policy: MissingPolicy) -> Attainment {
    weighted_rollup(
        components.iter().map(|c| WeightedInput {
            weight: c.weight,
            score: c.score,
        }),
        policy,
    )
}

/// A CPMK declaring a weight toward the CPL being rolled up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpmkContribution {
    pub bobot_to_cpl: Option<f64>,
    pub score: Attainment,
}

/// CPMKs without a `bobot_to_cpl` are dropped entirely, and NO_DATA CPMKs never
/// enter the denominator regardless of the component-level policy.
pub fn cpl_score(cpmks: &[CpmkContribution]) -> Attainment {
    weighted_rollup(
        cpmks.iter().filter_map(|k| {
            let weight = k.bobot_to_cpl?;
            Some(WeightedInput {
                weight,
                score: k.score.value(),
            })
        }),
        MissingPolicy::Exclude,
    )
}

// ---------------------------------------------------------------------------
// Cohort aggregation
// ---------------------------------------------------------------------------

const DISTRIBUTION_BINS: [(&str, f64, f64); 6] = [
    ("0-49", 0.0, 50.0),
    ("50-59", 50.0, 60.0),
    ("60-69", 60.0, 70.0),
    ("70-79", 70.0, 80.0),
    ("80-89", 80.0, 90.0),
    ("90-100", 90.0, 100.0),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBin {
    pub label: String,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortStats {
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub scored_count: usize,
    pub total_count: usize,
    pub no_data_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pct_above_threshold: Option<f64>,
    pub distribution: Vec<DistributionBin>,
    pub out_of_range_count: usize,
}

fn compute_median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        Some(sorted[n / 2])
    } else {
        Some((sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0)
    }
}

/// NO_DATA students count toward `total_count` and `no_data_count` only; they
/// never enter the mean, median, threshold percentage or distribution.
pub fn cohort_stats<I>(scores: I, threshold: Option<f64>) -> CohortStats
where
    I: IntoIterator<Item = Attainment>,
{
    let mut values: Vec<f64> = Vec::new();
    let mut total_count = 0_usize;
    for s in scores {
        total_count += 1;
        if let Attainment::Scored(v) = s {
            values.push(v);
        }
    }

    let scored_count = values.len();
    let mean = if scored_count > 0 {
        Some(values.iter().sum::<f64>() / (scored_count as f64))
    } else {
        None
    };
    let pct_above_threshold = match threshold {
        Some(t) if scored_count > 0 => {
            let at_or_above = values.iter().filter(|v| **v >= t).count();
            Some(100.0 * (at_or_above as f64) / (scored_count as f64))
        }
        _ => None,
    };

    let last = DISTRIBUTION_BINS.len() - 1;
    let distribution = DISTRIBUTION_BINS
        .iter()
        .enumerate()
        .map(|(i, (label, min, max))| {
            let count = values
                .iter()
                .filter(|v| **v >= *min && (**v < *max || (i == last && **v <= *max)))
                .count();
            DistributionBin {
                label: label.to_string(),
                min: *min,
                max: *max,
                count,
            }
        })
        .collect();
    let out_of_range_count = values.iter().filter(|v| **v < 0.0 || **v > 100.0).count();

    CohortStats {
        mean,
        median: compute_median(&values),
        scored_count,
        total_count,
        no_data_count: total_count - scored_count,
        threshold,
        pct_above_threshold,
        distribution,
        out_of_range_count,
    }
}
