use std::collections::HashSet;

use chrono::{DateTime, Utc};

/// Drops repeated identifiers while keeping first-seen order.
pub fn dedupe_ids<I>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Treats blank strings the same as an absent value.
pub fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Current time, never earlier than `floor`.
pub fn now_not_before(floor: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn dedupe_keeps_first_occurrence_order() {
        let ids = ["u2", "u1", "u2", "u3", "u1"].map(String::from);
        assert_eq!(dedupe_ids(ids), vec!["u2", "u1", "u3"]);
    }

    #[test]
    fn blank_values_are_absent() {
        assert_eq!(non_empty(Some("  ".into())), None);
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some("u1".into())), Some("u1".into()));
    }

    #[test]
    fn clock_never_moves_behind_floor() {
        let future = Utc::now() + Duration::hours(1);
        assert_eq!(now_not_before(future), future);
    }
}
