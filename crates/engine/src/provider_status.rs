//! Merging provider delivery-lifecycle facts into a notification payload.
//!
//! The merged object lives under `data.provider_status`:
//!
//! ```json
//! {
//!   "provider": "resend",
//!   "last_status": "opened",
//!   "last_event_at": "2026-01-01T00:00:00Z",
//!   "last_reason": null,
//!   "events": { "delivered": "...", "opened": "..." }
//! }
//! ```
//!
//! `events` keeps the first timestamp seen per status; `last_*` only moves
//! forward in event time, so late webhooks cannot roll the summary back.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value, json};

use courier_common::types::ProviderStatusUpdate;

pub const PROVIDER_STATUS_KEY: &str = "provider_status";

/// Statuses that count as the recipient having received or acted on the message.
pub const ENGAGED_STATUSES: [&str; 2] = ["delivered", "opened"];

/// Merge `update` into `data`, replacing a non-object payload with an object.
pub fn merge_provider_status(data: &mut Value, update: &ProviderStatusUpdate) {
    if !data.is_object() {
        *data = json!({});
    }
    let Some(root) = data.as_object_mut() else {
        return;
    };

    let entry = root
        .entry(PROVIDER_STATUS_KEY)
        .or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    let Some(summary) = entry.as_object_mut() else {
        return;
    };

    let status = update.status.trim().to_ascii_lowercase();

    let events = summary
        .entry("events")
        .or_insert_with(|| Value::Object(Map::new()));
    if !events.is_object() {
        *events = Value::Object(Map::new());
    }
    if let Some(events) = events.as_object_mut() {
        let keep_existing = events
            .get(&status)
            .and_then(parse_time)
            .is_some_and(|existing| existing <= update.event_at);
        if !keep_existing {
            events.insert(status.clone(), json!(update.event_at));
        }
    }

    let is_newer = summary
        .get("last_event_at")
        .and_then(parse_time)
        .is_none_or(|last| update.event_at >= last);
    if is_newer {
        summary.insert("provider".to_string(), json!(update.provider));
        summary.insert("last_status".to_string(), json!(status));
        summary.insert("last_event_at".to_string(), json!(update.event_at));
        summary.insert("last_reason".to_string(), json!(update.reason));
    }
}

/// Whether the merged provider history shows delivery or an open.
pub fn indicates_engagement(data: &Value) -> bool {
    data.get(PROVIDER_STATUS_KEY)
        .and_then(|summary| summary.get("events"))
        .and_then(Value::as_object)
        .is_some_and(|events| ENGAGED_STATUSES.iter().any(|s| events.contains_key(*s)))
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn update(status: &str, event_at: DateTime<Utc>) -> ProviderStatusUpdate {
        ProviderStatusUpdate {
            provider: "resend".to_string(),
            status: status.to_string(),
            event_at,
            reason: None,
        }
    }

    #[test]
    fn test_merge_into_empty_payload_keeps_renderer_fields() {
        let now = Utc::now();
        let mut data = json!({"link": "https://example.com/verify"});
        merge_provider_status(&mut data, &update("Delivered", now));

        assert_eq!(data["link"], "https://example.com/verify");
        assert_eq!(data[PROVIDER_STATUS_KEY]["last_status"], "delivered");
        assert_eq!(data[PROVIDER_STATUS_KEY]["provider"], "resend");
        assert!(indicates_engagement(&data));
    }

    #[test]
    fn test_out_of_order_event_does_not_roll_back_summary() {
        let now = Utc::now();
        let mut data = json!({});
        merge_provider_status(&mut data, &update("opened", now));
        merge_provider_status(&mut data, &update("delivered", now - Duration::minutes(5)));

        let summary = &data[PROVIDER_STATUS_KEY];
        assert_eq!(summary["last_status"], "opened");
        assert!(summary["events"].get("delivered").is_some());
        assert!(summary["events"].get("opened").is_some());
    }

    #[test]
    fn test_first_timestamp_per_status_is_kept() {
        let now = Utc::now();
        let mut data = json!({});
        merge_provider_status(&mut data, &update("opened", now));
        merge_provider_status(&mut data, &update("opened", now + Duration::hours(1)));

        let first = parse_time(&data[PROVIDER_STATUS_KEY]["events"]["opened"]).unwrap();
        assert_eq!(first, now);
        assert_eq!(
            parse_time(&data[PROVIDER_STATUS_KEY]["last_event_at"]).unwrap(),
            now + Duration::hours(1)
        );
    }

    #[test]
    fn test_bounce_is_not_engagement() {
        let mut data = json!({});
        let mut bounced = update("bounced", Utc::now());
        bounced.reason = Some("mailbox full".to_string());
        merge_provider_status(&mut data, &bounced);

        assert!(!indicates_engagement(&data));
        assert_eq!(data[PROVIDER_STATUS_KEY]["last_reason"], "mailbox full");
    }

    #[test]
    fn test_non_object_payload_is_replaced() {
        let mut data = json!("not an object");
        merge_provider_status(&mut data, &update("delivered", Utc::now()));
        assert!(indicates_engagement(&data));
    }
}
