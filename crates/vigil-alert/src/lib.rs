pub mod evaluator;
pub mod rules;
pub mod sink;
pub mod types;

pub use evaluator::{AlertEvaluator, EvaluatorConfig};
pub use rules::{RuleFile, load_rules, parse_rules, validate_ranges, validate_rules};
pub use sink::{ChannelSink, LogSink, NotificationRouter, NotificationSink};
pub use types::{
    Aggregation, AlertExpression, AlertPhase, AlertRule, AlertState, Comparator, Notification,
    SeriesSelector, Severity,
};
