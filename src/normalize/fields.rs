//! Lookup table of alternate payload locations per canonical field.
//!
//! The backend has emitted the same concept under different keys over time.
//! Each canonical field lists its locations in priority order; the canonical
//! key itself always comes first so an already-normalized result reads back
//! unchanged.

use serde_json::Value;

/// A path of object keys from the payload root.
pub type FieldPath = &'static [&'static str];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    Symbol,
    Action,
    Confidence,
    OverallScore,
    CurrentPrice,
    TargetPrice,
    RiskLevel,
    Summary,
    KeyFactors,
    Risks,
    Reports,
    CompletedAt,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 12] = [
        Self::Symbol,
        Self::Action,
        Self::Confidence,
        Self::OverallScore,
        Self::CurrentPrice,
        Self::TargetPrice,
        Self::RiskLevel,
        Self::Summary,
        Self::KeyFactors,
        Self::Risks,
        Self::Reports,
        Self::CompletedAt,
    ];

    pub fn paths(self) -> &'static [FieldPath] {
        match self {
            Self::Symbol => &[&["symbol"], &["ticker"], &["stock_symbol"], &["request", "symbol"]],
            Self::Action => &[
                &["action"],
                &["recommendation", "action"],
                &["final_decision", "action"],
                &["decision", "action"],
                &["trading_decision", "action"],
                &["recommendation"],
                &["decision"],
            ],
            Self::Confidence => &[
                &["confidence"],
                &["recommendation", "confidence"],
                &["final_decision", "confidence"],
                &["decision", "confidence"],
                &["confidence_score"],
            ],
            Self::OverallScore => &[
                &["overall_score"],
                &["score"],
                &["final_decision", "score"],
                &["analysis", "overall_score"],
                &["scores", "overall"],
            ],
            Self::CurrentPrice => &[
                &["current_price"],
                &["price"],
                &["market_data", "current_price"],
                &["market_data", "price"],
                &["quote", "price"],
            ],
            Self::TargetPrice => &[
                &["target_price"],
                &["recommendation", "target_price"],
                &["final_decision", "target_price"],
                &["price_target"],
                &["valuation", "target_price"],
            ],
            Self::RiskLevel => &[
                &["risk_level"],
                &["risk", "level"],
                &["risk_assessment", "level"],
                &["risk_assessment", "risk_level"],
                &["risk"],
            ],
            Self::Summary => &[
                &["summary"],
                &["final_decision", "reasoning"],
                &["recommendation", "reasoning"],
                &["reasoning"],
                &["analysis", "summary"],
            ],
            Self::KeyFactors => &[
                &["key_factors"],
                &["final_decision", "key_factors"],
                &["analysis", "key_points"],
                &["key_points"],
            ],
            Self::Risks => &[
                &["risks"],
                &["risk_assessment", "risks"],
                &["risk_assessment", "key_risks"],
                &["key_risks"],
            ],
            Self::Reports => &[&["reports"], &["agent_results"], &["agent_reports"], &["analyses"]],
            Self::CompletedAt => &[&["completed_at_ms"], &["completed_at"], &["timestamp"]],
        }
    }
}

/// Value at `path`, treating `null` as absent.
pub fn lookup_path<'a>(payload: &'a Value, path: FieldPath) -> Option<&'a Value> {
    let found = path
        .iter()
        .try_fold(payload, |node, segment| node.get(*segment))?;
    (!found.is_null()).then_some(found)
}

/// First location of `field` whose value `coerce` accepts.
pub fn resolve<T>(
    payload: &Value,
    field: CanonicalField,
    coerce: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    field
        .paths()
        .iter()
        .filter_map(|path| lookup_path(payload, *path))
        .find_map(coerce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn every_field_lists_its_canonical_key_first() {
        let canonical = [
            (CanonicalField::Symbol, "symbol"),
            (CanonicalField::Action, "action"),
            (CanonicalField::Confidence, "confidence"),
            (CanonicalField::OverallScore, "overall_score"),
            (CanonicalField::CurrentPrice, "current_price"),
            (CanonicalField::TargetPrice, "target_price"),
            (CanonicalField::RiskLevel, "risk_level"),
            (CanonicalField::Summary, "summary"),
            (CanonicalField::KeyFactors, "key_factors"),
            (CanonicalField::Risks, "risks"),
            (CanonicalField::Reports, "reports"),
            (CanonicalField::CompletedAt, "completed_at_ms"),
        ];
        assert_eq!(canonical.len(), CanonicalField::ALL.len());

        for (field, key) in canonical {
            assert_eq!(field.paths()[0], &[key][..], "{field:?}");
        }
    }

    #[test]
    fn lookup_skips_null_and_missing() {
        let payload = json!({"recommendation": {"action": null}, "decision": {"action": "SELL"}});
        assert!(lookup_path(&payload, &["recommendation", "action"]).is_none());
        assert!(lookup_path(&payload, &["missing", "action"]).is_none());
        assert_eq!(
            lookup_path(&payload, &["decision", "action"]),
            Some(&json!("SELL"))
        );
    }

    #[test]
    fn resolve_uses_priority_order() {
        let payload = json!({
            "final_decision": {"action": "BUY"},
            "trading_decision": {"action": "SELL"}
        });
        let action = resolve(&payload, CanonicalField::Action, |value| {
            value.as_str().map(str::to_string)
        });
        assert_eq!(action.as_deref(), Some("BUY"));
    }

    #[test]
    fn resolve_skips_values_of_the_wrong_shape() {
        let payload = json!({"recommendation": {"confidence": 0.7}, "decision": "hold"});
        let action = resolve(&payload, CanonicalField::Action, |value| {
            value.as_str().map(str::to_string)
        });
        assert_eq!(action.as_deref(), Some("hold"));
    }
}
