use courier_protocol::{TelemetryItem, tag_keys};

use crate::hash::score;

/// Percentage at which every item is kept.
const KEEP_ALL: f64 = 100.0;

/// Returns `true` if `percentage` is a usable sampling percentage.
///
/// Valid percentages are in `(0, 100]`. Zero is rejected, since it would discard all telemetry.
pub fn is_valid_percentage(percentage: f64) -> bool {
    percentage > 0.0 && percentage <= KEEP_ALL
}

/// Decides which items to keep for a sampling percentage.
///
/// Items are scored by a correlation key, preferring the user id and then the operation id. If
/// an item has neither, it is scored randomly. An item is kept if its score is below the
/// percentage. Metrics are always kept, since they are usually pre-aggregated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sampler {
    percentage: f64,
}

impl Sampler {
    /// Creates a sampler for the configured percentage.
    ///
    /// A missing percentage keeps all items. Invalid percentages are logged and replaced by 100.
    pub fn new(percentage: Option<f64>) -> Self {
        let percentage = match percentage {
            None => KEEP_ALL,
            Some(p) if is_valid_percentage(p) => p,
            Some(p) => {
                courier_log::warn!(
                    percentage = p,
                    "invalid sampling percentage, keeping all telemetry"
                );
                KEEP_ALL
            }
        };

        Self { percentage }
    }

    /// Returns the effective sampling percentage.
    pub fn percentage(&self) -> f64 {
        self.percentage
    }

    /// Returns `true` if this sampler keeps every item.
    pub fn keeps_all(&self) -> bool {
        self.percentage >= KEEP_ALL
    }

    /// Returns `true` if the item should be kept.
    pub fn is_sampled_in(&self, item: &TelemetryItem) -> bool {
        if self.keeps_all() || item.is_metric() {
            return true;
        }

        let score = match correlation_key(item) {
            Some(key) => score(key),
            None => rand::random::<f64>() * KEEP_ALL,
        };

        score < self.percentage
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Returns the key an item is sampled by.
///
/// The order of preference is the user id, the trace id and finally an `operation.id` tag.
pub fn correlation_key(item: &TelemetryItem) -> Option<&str> {
    let user_id = item.ext.user.as_ref().and_then(|user| user.id.as_deref());
    let trace_id = item.ext.trace.as_ref().and_then(|trace| trace.trace_id.as_deref());
    let operation_tag = item.tag(tag_keys::OPERATION_ID).and_then(|value| value.as_str());

    [user_id, trace_id, operation_tag]
        .into_iter()
        .flatten()
        .find(|key| !key.is_empty())
}

#[cfg(test)]
mod tests {
    use courier_protocol::{TraceExt, UserExt};

    use super::*;

    fn item_for_user(id: &str) -> TelemetryItem {
        let mut item = TelemetryItem::event("e");
        item.ext.user = Some(UserExt {
            id: Some(id.to_owned()),
            ..Default::default()
        });
        item
    }

    #[test]
    fn test_keep_all_when_unset_or_full() {
        let item = item_for_user("user");
        assert!(Sampler::new(None).is_sampled_in(&item));
        assert!(Sampler::new(Some(100.0)).is_sampled_in(&item));
    }

    #[test]
    fn test_invalid_percentages_fail_open() {
        courier_log::init_test!();

        for p in [0.0, -5.0, 100.5, f64::NAN] {
            let sampler = Sampler::new(Some(p));
            assert_eq!(sampler.percentage(), 100.0);
            assert!(sampler.is_sampled_in(&item_for_user("user")));
        }
    }

    #[test]
    fn test_deterministic_for_key() {
        let sampler = Sampler::new(Some(50.0));

        for id in ["alice", "bob", "carol", "dave", "a1b2c3d4-e5f6"] {
            let item = item_for_user(id);
            let expected = score(id) < 50.0;
            for _ in 0..10 {
                assert_eq!(sampler.is_sampled_in(&item), expected, "user {id}");
            }
        }
    }

    #[test]
    fn test_tiny_percentage_drops_scored_items() {
        let sampler = Sampler::new(Some(f64::MIN_POSITIVE));
        let item = item_for_user("alice");

        assert!(score("alice") > 0.0);
        assert!(!sampler.is_sampled_in(&item));
    }

    #[test]
    fn test_metrics_always_kept() {
        let sampler = Sampler::new(Some(f64::MIN_POSITIVE));
        let mut item = TelemetryItem::metric("cpu", 0.5);
        item.ext.user = Some(UserExt {
            id: Some("alice".to_owned()),
            ..Default::default()
        });

        assert!(sampler.is_sampled_in(&item));
    }

    #[test]
    fn test_correlation_key_preference() {
        let mut item = TelemetryItem::event("e");
        assert_eq!(correlation_key(&item), None);

        item.set_tag("operation.id", "from-tag");
        assert_eq!(correlation_key(&item), Some("from-tag"));

        item.ext.trace = Some(TraceExt {
            trace_id: Some("trace".to_owned()),
            ..Default::default()
        });
        assert_eq!(correlation_key(&item), Some("trace"));

        item.ext.user = Some(UserExt {
            id: Some(String::new()),
            ..Default::default()
        });
        assert_eq!(correlation_key(&item), Some("trace"));

        item.ext.user = Some(UserExt {
            id: Some("user".to_owned()),
            ..Default::default()
        });
        assert_eq!(correlation_key(&item), Some("user"));
    }
}
