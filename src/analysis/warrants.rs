//! Engineering-study warrants (§4.6 step 3): four criteria evaluated per
//! junction to recommend installing, keeping, or removing a signal.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct JunctionMetrics {
    pub junction_id: String,
    pub primary_volume_vph: f64,
    pub secondary_volume_vph: f64,
    pub secondary_avg_delay_secs: f64,
    pub conflict_events: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Add,
    Remove,
    Keep,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarrantResult {
    pub min_primary_volume_met: bool,
    pub min_secondary_volume_met: bool,
    pub unacceptable_delay_met: bool,
    pub conflict_threshold_met: bool,
    pub recommendation: Recommendation,
    pub justification: String,
}

pub struct WarrantThresholds {
    pub min_primary_vph: f64,
    pub min_secondary_vph: f64,
    pub unacceptable_delay_secs: f64,
    pub conflict_threshold: u64,
}

/// Evaluates the four warrants for one junction's aggregated metrics and
/// derives a recommendation: any warrant met on a currently-unsignalized
/// approach argues for `Add`; with an existing signal, none of the
/// warrants being met argues for `Remove`; otherwise `Keep`.
pub fn evaluate_warrants(
    metrics: &JunctionMetrics,
    thresholds: &WarrantThresholds,
    currently_signalized: bool,
) -> WarrantResult {
    let min_primary_volume_met = metrics.primary_volume_vph >= thresholds.min_primary_vph;
    let min_secondary_volume_met = metrics.secondary_volume_vph >= thresholds.min_secondary_vph;
    let unacceptable_delay_met = metrics.secondary_avg_delay_secs >= thresholds.unacceptable_delay_secs;
    let conflict_threshold_met = metrics.conflict_events >= thresholds.conflict_threshold;

    let any_warrant_met = min_primary_volume_met
        || min_secondary_volume_met
        || unacceptable_delay_met
        || conflict_threshold_met;

    let recommendation = if currently_signalized {
        if any_warrant_met {
            Recommendation::Keep
        } else {
            Recommendation::Remove
        }
    } else if any_warrant_met {
        Recommendation::Add
    } else {
        Recommendation::Keep
    };

    let mut reasons = Vec::new();
    if min_primary_volume_met {
        reasons.push(format!(
            "primary volume {:.0} vph meets minimum {:.0} vph",
            metrics.primary_volume_vph, thresholds.min_primary_vph
        ));
    }
    if min_secondary_volume_met {
        reasons.push(format!(
            "secondary volume {:.0} vph meets minimum {:.0} vph",
            metrics.secondary_volume_vph, thresholds.min_secondary_vph
        ));
    }
    if unacceptable_delay_met {
        reasons.push(format!(
            "secondary delay {:.1}s exceeds threshold {:.1}s",
            metrics.secondary_avg_delay_secs, thresholds.unacceptable_delay_secs
        ));
    }
    if conflict_threshold_met {
        reasons.push(format!(
            "{} conflict events meets threshold {}",
            metrics.conflict_events, thresholds.conflict_threshold
        ));
    }
    if reasons.is_empty() {
        reasons.push("no warrant criteria met".to_string());
    }

    WarrantResult {
        min_primary_volume_met,
        min_secondary_volume_met,
        unacceptable_delay_met,
        conflict_threshold_met,
        recommendation,
        justification: reasons.join("; "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> WarrantThresholds {
        WarrantThresholds {
            min_primary_vph: 500.0,
            min_secondary_vph: 150.0,
            unacceptable_delay_secs: 35.0,
            conflict_threshold: 5,
        }
    }

    #[test]
    fn unsignalized_junction_meeting_a_warrant_recommends_add() {
        let metrics = JunctionMetrics {
            junction_id: "J1".to_string(),
            primary_volume_vph: 600.0,
            secondary_volume_vph: 50.0,
            secondary_avg_delay_secs: 10.0,
            conflict_events: 0,
        };
        let result = evaluate_warrants(&metrics, &thresholds(), false);
        assert_eq!(result.recommendation, Recommendation::Add);
        assert!(result.min_primary_volume_met);
    }

    #[test]
    fn signalized_junction_meeting_no_warrant_recommends_remove() {
        let metrics = JunctionMetrics {
            junction_id: "J1".to_string(),
            primary_volume_vph: 10.0,
            secondary_volume_vph: 5.0,
            secondary_avg_delay_secs: 2.0,
            conflict_events: 0,
        };
        let result = evaluate_warrants(&metrics, &thresholds(), true);
        assert_eq!(result.recommendation, Recommendation::Remove);
    }

    #[test]
    fn signalized_junction_meeting_a_warrant_recommends_keep() {
        let metrics = JunctionMetrics {
            junction_id: "J1".to_string(),
            primary_volume_vph: 10.0,
            secondary_volume_vph: 5.0,
            secondary_avg_delay_secs: 2.0,
            conflict_events: 9,
        };
        let result = evaluate_warrants(&metrics, &thresholds(), true);
        assert_eq!(result.recommendation, Recommendation::Keep);
        assert!(result.conflict_threshold_met);
    }
}
