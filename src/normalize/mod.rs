//! Maps arbitrarily shaped result payloads onto [`NormalizedResult`].
//!
//! Normalization is total: absent or malformed fields fall back to defaults.
//! Numbers the backend did not report are tagged [`Figure::Missing`], and
//! derived stand-ins are tagged [`Figure::Estimated`], so nothing downstream
//! can mistake either for an authoritative value.

pub mod fields;

use fields::{resolve, CanonicalField};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const DEFAULT_ACTION: &str = "HOLD";
pub const DEFAULT_RISK_LEVEL: &str = "unknown";
/// Target price stand-in when the payload has none: current price plus 10%.
pub const TARGET_PRICE_ESTIMATE_MULTIPLIER: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Figure {
    Reported(f64),
    Estimated(f64),
    #[default]
    Missing,
}

impl Figure {
    pub fn value(self) -> Option<f64> {
        match self {
            Self::Reported(value) | Self::Estimated(value) => Some(value),
            Self::Missing => None,
        }
    }

    pub fn is_estimate(self) -> bool {
        matches!(self, Self::Estimated(_))
    }

    pub fn is_reported(self) -> bool {
        matches!(self, Self::Reported(_))
    }

    /// The zero-substituting reading of this figure.
    pub fn value_or_zero(self) -> f64 {
        self.value().unwrap_or(0.0)
    }
}

impl fmt::Display for Figure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reported(value) => write!(f, "{value:.2}"),
            Self::Estimated(value) => write!(f, "{value:.2} (est.)"),
            Self::Missing => f.write_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker_name: String,
    pub summary: String,
    pub score: Figure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub symbol: String,
    pub action: String,
    pub confidence: Figure,
    pub overall_score: Figure,
    pub current_price: Figure,
    pub target_price: Figure,
    pub risk_level: String,
    pub summary: String,
    pub key_factors: Vec<String>,
    pub risks: Vec<String>,
    pub reports: Vec<WorkerReport>,
    pub completed_at_ms: Option<i64>,
}

/// Caller-side knowledge used when the payload is silent.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NormalizeContext {
    pub subject: String,
    pub current_price: Option<f64>,
}

impl NormalizeContext {
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            current_price: None,
        }
    }
}

pub fn normalize(raw: &Value, context: &NormalizeContext) -> NormalizedResult {
    let payload = select_body(raw);

    let symbol = resolve(payload, CanonicalField::Symbol, coerce_text)
        .map(|symbol| symbol.to_ascii_uppercase())
        .unwrap_or_else(|| context.subject.trim().to_ascii_uppercase());
    let action = resolve(payload, CanonicalField::Action, coerce_action)
        .unwrap_or_else(|| DEFAULT_ACTION.to_string());
    let confidence = resolve(payload, CanonicalField::Confidence, coerce_confidence)
        .unwrap_or(Figure::Missing);
    let overall_score =
        resolve(payload, CanonicalField::OverallScore, coerce_figure).unwrap_or(Figure::Missing);

    let current_price = resolve(payload, CanonicalField::CurrentPrice, coerce_figure)
        .or_else(|| {
            context
                .current_price
                .filter(|price| price.is_finite())
                .map(Figure::Reported)
        })
        .unwrap_or(Figure::Missing);
    let target_price = resolve(payload, CanonicalField::TargetPrice, coerce_figure)
        .unwrap_or_else(|| estimate_target_price(current_price));

    let risk_level = resolve(payload, CanonicalField::RiskLevel, coerce_text)
        .map(|level| level.to_ascii_lowercase())
        .unwrap_or_else(|| DEFAULT_RISK_LEVEL.to_string());
    let summary = resolve(payload, CanonicalField::Summary, coerce_text).unwrap_or_default();
    let key_factors =
        resolve(payload, CanonicalField::KeyFactors, coerce_text_list).unwrap_or_default();
    let risks = resolve(payload, CanonicalField::Risks, coerce_text_list).unwrap_or_default();
    let reports = resolve(payload, CanonicalField::Reports, coerce_reports).unwrap_or_default();
    let completed_at_ms = resolve(payload, CanonicalField::CompletedAt, Value::as_i64);

    NormalizedResult {
        symbol,
        action,
        confidence,
        overall_score,
        current_price,
        target_price,
        risk_level,
        summary,
        key_factors,
        risks,
        reports,
        completed_at_ms,
    }
}

pub fn estimate_target_price(current_price: Figure) -> Figure {
    match current_price.value() {
        Some(price) if price > 0.0 => {
            Figure::Estimated(round_to_cents(price * TARGET_PRICE_ESTIMATE_MULTIPLIER))
        }
        _ => Figure::Missing,
    }
}

fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn select_body(raw: &Value) -> &Value {
    ["result", "data"]
        .iter()
        .find_map(|envelope| raw.get(*envelope).filter(|inner| inner.is_object()))
        .unwrap_or(raw)
}

fn coerce_text(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn coerce_action(value: &Value) -> Option<String> {
    let upper = value.as_str()?.trim().to_ascii_uppercase();
    ["BUY", "SELL", "HOLD"]
        .into_iter()
        .find(|action| upper.contains(action))
        .map(str::to_string)
}

fn coerce_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text
            .trim()
            .trim_start_matches('$')
            .replace(',', "")
            .parse::<f64>()
            .ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn coerce_figure(value: &Value) -> Option<Figure> {
    if value.get("kind").is_some() {
        return match serde_json::from_value::<Figure>(value.clone()) {
            Ok(Figure::Missing) | Err(_) => None,
            Ok(figure) => Some(figure),
        };
    }
    coerce_number(value).map(Figure::Reported)
}

fn coerce_confidence(value: &Value) -> Option<Figure> {
    let scale = |raw: f64| if raw > 1.0 && raw <= 100.0 { raw / 100.0 } else { raw };
    match coerce_figure(value)? {
        Figure::Reported(raw) => Some(Figure::Reported(scale(raw))),
        Figure::Estimated(raw) => Some(Figure::Estimated(scale(raw))),
        Figure::Missing => None,
    }
}

fn coerce_text_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::String(_) => coerce_text(value).map(|text| vec![text]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| {
                    coerce_text(item).or_else(|| {
                        ["description", "text", "title", "factor"]
                            .iter()
                            .find_map(|field| item.get(*field).and_then(coerce_text))
                    })
                })
                .collect(),
        ),
        _ => None,
    }
}

fn coerce_reports(value: &Value) -> Option<Vec<WorkerReport>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| {
                    let name = ["worker_name", "agent_name", "name"]
                        .iter()
                        .find_map(|field| item.get(*field).and_then(coerce_text))?;
                    Some(report_from(name, item))
                })
                .collect(),
        ),
        Value::Object(entries) => {
            let mut reports: Vec<WorkerReport> = entries
                .iter()
                .filter(|(_, body)| !body.is_null())
                .map(|(name, body)| report_from(name.clone(), body))
                .collect();
            reports.sort_by(|lhs, rhs| lhs.worker_name.cmp(&rhs.worker_name));
            Some(reports)
        }
        _ => None,
    }
}

fn report_from(worker_name: String, body: &Value) -> WorkerReport {
    let summary = coerce_text(body)
        .or_else(|| {
            ["summary", "analysis", "reasoning", "conclusion"]
                .iter()
                .find_map(|field| body.get(*field).and_then(coerce_text))
        })
        .unwrap_or_default();
    let score = ["score", "confidence"]
        .iter()
        .find_map(|field| body.get(*field).and_then(coerce_figure))
        .unwrap_or(Figure::Missing);

    WorkerReport {
        worker_name,
        summary,
        score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> NormalizeContext {
        NormalizeContext::for_subject("aapl")
    }

    #[test]
    fn empty_payload_yields_defaults() {
        let result = normalize(&json!({}), &context());

        assert_eq!(result.symbol, "AAPL");
        assert_eq!(result.action, DEFAULT_ACTION);
        assert_eq!(result.risk_level, DEFAULT_RISK_LEVEL);
        assert_eq!(result.confidence, Figure::Missing);
        assert_eq!(result.current_price, Figure::Missing);
        assert_eq!(result.target_price, Figure::Missing);
        assert!(result.key_factors.is_empty());
        assert!(result.reports.is_empty());
        assert_eq!(result.completed_at_ms, None);
    }

    #[test]
    fn non_object_payload_never_panics() {
        for raw in [json!(null), json!(12), json!("text"), json!([1, 2, 3])] {
            let result = normalize(&raw, &context());
            assert_eq!(result.action, DEFAULT_ACTION);
        }
    }

    #[test]
    fn missing_target_is_estimated_from_current_price() {
        let result = normalize(&json!({"current_price": 100}), &context());

        assert_eq!(result.current_price, Figure::Reported(100.0));
        assert_eq!(result.target_price, Figure::Estimated(110.0));
        assert!(result.target_price.is_estimate());
        assert_eq!(result.target_price.to_string(), "110.00 (est.)");
    }

    #[test]
    fn reported_target_is_kept_authoritative() {
        let result = normalize(
            &json!({"current_price": "$1,000.50", "recommendation": {"target_price": 1200}}),
            &context(),
        );
        assert_eq!(result.current_price, Figure::Reported(1000.5));
        assert_eq!(result.target_price, Figure::Reported(1200.0));
    }

    #[test]
    fn context_price_fills_missing_current_price() {
        let context = NormalizeContext {
            subject: "MSFT".to_string(),
            current_price: Some(400.0),
        };
        let result = normalize(&json!({}), &context);
        assert_eq!(result.current_price, Figure::Reported(400.0));
        assert_eq!(result.target_price, Figure::Estimated(440.0));
    }

    #[test]
    fn resolves_legacy_locations() {
        let raw = json!({
            "result": {
                "ticker": "nvda",
                "final_decision": {
                    "action": "strong buy",
                    "confidence": 85,
                    "reasoning": "Data center demand keeps accelerating.",
                    "key_factors": ["AI capex", {"description": "Pricing power"}]
                },
                "market_data": {"price": 120.0},
                "risk_assessment": {"level": "HIGH", "key_risks": "Export controls"},
                "agent_results": {
                    "technical": {"summary": "Uptrend intact", "score": 7.5},
                    "fundamental": "Margins expanding"
                }
            }
        });

        let result = normalize(&raw, &context());

        assert_eq!(result.symbol, "NVDA");
        assert_eq!(result.action, "BUY");
        assert_eq!(result.confidence, Figure::Reported(0.85));
        assert_eq!(result.summary, "Data center demand keeps accelerating.");
        assert_eq!(result.key_factors, vec!["AI capex", "Pricing power"]);
        assert_eq!(result.current_price, Figure::Reported(120.0));
        assert_eq!(result.target_price, Figure::Estimated(132.0));
        assert_eq!(result.risk_level, "high");
        assert_eq!(result.risks, vec!["Export controls"]);
        assert_eq!(
            result.reports,
            vec![
                WorkerReport {
                    worker_name: "fundamental".to_string(),
                    summary: "Margins expanding".to_string(),
                    score: Figure::Missing,
                },
                WorkerReport {
                    worker_name: "technical".to_string(),
                    summary: "Uptrend intact".to_string(),
                    score: Figure::Reported(7.5),
                },
            ]
        );
    }

    #[test]
    fn normalizing_canonical_output_is_idempotent() {
        let raw = json!({
            "symbol": "aapl",
            "recommendation": {"action": "sell", "confidence": 0.61},
            "price": 200,
            "score": 4.2,
            "risk": "Medium",
            "summary": "Valuation stretched",
            "key_points": ["Slowing iPhone sales"],
            "agent_reports": [{"agent_name": "news", "analysis": "Mixed headlines", "confidence": 0.4}],
            "completed_at_ms": 1_700_000_000_000_i64
        });

        let first = normalize(&raw, &context());
        let canonical = serde_json::to_value(&first).expect("result should serialize");
        let second = normalize(&canonical, &context());

        assert_eq!(first, second);
        assert_eq!(second.target_price, Figure::Estimated(220.0));
    }

    #[test]
    fn figure_display_distinguishes_sources() {
        assert_eq!(Figure::Reported(3.0).to_string(), "3.00");
        assert_eq!(Figure::Missing.to_string(), "N/A");
        assert_eq!(Figure::Missing.value_or_zero(), 0.0);
        assert!(Figure::Reported(1.0).is_reported());
    }
}
