use std::{collections::HashSet, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::fs;
use vigil_common::error::{Result, VigilError};

use crate::types::{AlertRule, Aggregation};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

pub async fn load_rules(path: &Path) -> Result<Vec<AlertRule>> {
    let raw = fs::read_to_string(path).await?;
    parse_rules(&raw).map_err(|err| match err {
        VigilError::InvalidArgument(message) => {
            VigilError::InvalidArgument(format!("{}: {message}", path.display()))
        }
        other => other,
    })
}

pub fn parse_rules(raw: &str) -> Result<Vec<AlertRule>> {
    let file: RuleFile = serde_json::from_str(raw)
        .map_err(|err| VigilError::InvalidArgument(format!("invalid alert rule file: {err}")))?;
    validate_rules(&file.rules)?;
    Ok(file.rules)
}

pub fn validate_rules(rules: &[AlertRule]) -> Result<()> {
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.name.trim().is_empty() {
            return Err(VigilError::InvalidArgument(
                "alert rule name is required".to_string(),
            ));
        }
        if !seen.insert(rule.name.as_str()) {
            return Err(VigilError::InvalidArgument(format!(
                "duplicate alert rule name: {}",
                rule.name
            )));
        }
        validate_rule(rule)?;
    }
    Ok(())
}

/// Rejects rules whose aggregation range cannot fit in a window that keeps
/// `retention` worth of buckets.
pub fn validate_ranges(rules: &[AlertRule], retention: Duration) -> Result<()> {
    for rule in rules {
        if let Some(over) = rule.expression.aggregation.range()
            && over > retention
        {
            return Err(VigilError::InvalidArgument(format!(
                "alert rule {} aggregation range {}s exceeds window retention {}s",
                rule.name,
                over.as_secs(),
                retention.as_secs()
            )));
        }
    }
    Ok(())
}

fn validate_rule(rule: &AlertRule) -> Result<()> {
    let expression = &rule.expression;
    if expression.series.metric.is_empty() {
        return Err(VigilError::InvalidArgument(format!(
            "alert rule {} has no metric",
            rule.name
        )));
    }
    if !expression.threshold.is_finite() {
        return Err(VigilError::InvalidArgument(format!(
            "alert rule {} threshold must be finite",
            rule.name
        )));
    }
    if let Aggregation::Quantile { q, .. } = expression.aggregation
        && !(0.0..=1.0).contains(&q)
    {
        return Err(VigilError::InvalidArgument(format!(
            "alert rule {} quantile must be within [0, 1], got {q}",
            rule.name
        )));
    }
    if expression.aggregation.range().is_some_and(|over| over.is_zero()) {
        return Err(VigilError::InvalidArgument(format!(
            "alert rule {} aggregation range must be positive",
            rule.name
        )));
    }
    Ok(())
}
