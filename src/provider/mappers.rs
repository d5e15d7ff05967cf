//! Translation between local rows and Everflow network payloads.

use bigdecimal::ToPrimitive;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::core::shared::enums::EntityStatus;
use crate::entities::{EntityKind, MirroredEntity};

const DEFAULT_CURRENCY: &str = "USD";

/// Label written on every created row so a lost create can be found again.
pub fn reference_label(kind: EntityKind, entity_id: i64) -> String {
    format!("{}_id:{}", kind.as_str(), entity_id)
}

fn account_status(status: EntityStatus) -> &'static str {
    match status {
        EntityStatus::Active => "active",
        EntityStatus::Inactive | EntityStatus::Paused | EntityStatus::Archived => "inactive",
        EntityStatus::Rejected => "rejected",
        EntityStatus::Draft | EntityStatus::Pending => "pending",
    }
}

fn offer_status(status: EntityStatus) -> &'static str {
    match status {
        EntityStatus::Active => "active",
        EntityStatus::Paused => "paused",
        EntityStatus::Archived | EntityStatus::Inactive => "archived",
        _ => "pending",
    }
}

fn status_from_account(status: &str) -> Option<EntityStatus> {
    match status {
        "active" => Some(EntityStatus::Active),
        "pending" => Some(EntityStatus::Pending),
        "inactive" | "suspended" => Some(EntityStatus::Inactive),
        "rejected" => Some(EntityStatus::Rejected),
        _ => None,
    }
}

fn status_from_offer(status: &str) -> Option<EntityStatus> {
    match status {
        "active" => Some(EntityStatus::Active),
        "paused" => Some(EntityStatus::Paused),
        "archived" => Some(EntityStatus::Archived),
        "pending" => Some(EntityStatus::Pending),
        _ => None,
    }
}

/// Everflow ids are integers; ours are stored as text.
fn network_id(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(raw))
}

fn insert_opt(body: &mut Map<String, Value>, key: &str, value: Option<&String>) {
    if let Some(value) = value {
        body.insert(key.to_string(), Value::from(value.as_str()));
    }
}

/// Builds the create/update payload. `parents` holds provider ids of the
/// rows this one references, keyed by kind.
pub fn request_body(
    entity: &MirroredEntity,
    parents: &HashMap<EntityKind, String>,
) -> Result<Value, String> {
    let parent = |kind: EntityKind| {
        parents
            .get(&kind)
            .map(|id| network_id(id))
            .ok_or_else(|| format!("{} has no provider id yet", kind))
    };
    let label = reference_label(entity.kind(), entity.id());

    let mut body = Map::new();
    match entity {
        MirroredEntity::Advertiser(a) => {
            body.insert("name".into(), json!(a.name));
            body.insert("account_status".into(), json!(account_status(a.status)));
            body.insert(
                "default_currency_id".into(),
                json!(a.default_currency_id.as_deref().unwrap_or(DEFAULT_CURRENCY)),
            );
            insert_opt(&mut body, "internal_notes", a.internal_notes.as_ref());
            insert_opt(&mut body, "platform_name", a.platform_name.as_ref());
            insert_opt(&mut body, "accounting_contact_email", a.contact_email.as_ref());
            if let Some(billing) = &a.billing_details {
                body.insert("billing".into(), billing.clone());
            }
            body.insert("labels".into(), json!([label]));
        }
        MirroredEntity::Affiliate(a) => {
            body.insert("name".into(), json!(a.name));
            body.insert("account_status".into(), json!(account_status(a.status)));
            body.insert(
                "default_currency_id".into(),
                json!(a.default_currency_id.as_deref().unwrap_or(DEFAULT_CURRENCY)),
            );
            insert_opt(&mut body, "internal_notes", a.internal_notes.as_ref());
            if let Some(payment) = &a.payment_details {
                body.insert("payment".into(), payment.clone());
            }
            body.insert("labels".into(), json!([label]));
        }
        MirroredEntity::Campaign(c) => {
            body.insert("network_advertiser_id".into(), parent(EntityKind::Advertiser)?);
            body.insert("name".into(), json!(c.name));
            body.insert("offer_status".into(), json!(offer_status(c.status)));
            insert_opt(&mut body, "destination_url", c.destination_url.as_ref());
            insert_opt(&mut body, "internal_notes", c.internal_notes.as_ref());
            insert_opt(&mut body, "visibility", c.visibility.as_ref());
            body.insert(
                "currency_id".into(),
                json!(c.currency_id.as_deref().unwrap_or(DEFAULT_CURRENCY)),
            );
            if let Some(duration) = c.session_duration {
                body.insert("session_duration".into(), json!(duration));
            }
            if let Some(cap) = c.daily_conversion_cap {
                body.insert("is_caps_enabled".into(), json!(true));
                body.insert("daily_conversion_cap".into(), json!(cap));
            }
            if let Some(cap) = c.global_conversion_cap {
                body.insert("is_caps_enabled".into(), json!(true));
                body.insert("global_conversion_cap".into(), json!(cap));
            }
            body.insert(
                "payout_revenue".into(),
                json!([{
                    "is_default": true,
                    "payout_type": c.payout_type.as_deref().unwrap_or("cpa"),
                    "payout_amount": c.payout_amount.as_ref().and_then(|v| v.to_f64()).unwrap_or(0.0),
                    "revenue_type": c.revenue_type.as_deref().unwrap_or("rpa"),
                    "revenue_amount": c.revenue_amount.as_ref().and_then(|v| v.to_f64()).unwrap_or(0.0),
                }]),
            );
            body.insert("labels".into(), json!([label]));
        }
        MirroredEntity::TrackingLink(t) => {
            body.insert("network_offer_id".into(), parent(EntityKind::Campaign)?);
            body.insert("network_affiliate_id".into(), parent(EntityKind::Affiliate)?);
            insert_opt(&mut body, "source_id", t.source_id.as_ref());
            for (key, value) in [
                ("sub1", &t.sub1),
                ("sub2", &t.sub2),
                ("sub3", &t.sub3),
                ("sub4", &t.sub4),
                ("sub5", &t.sub5),
            ] {
                insert_opt(&mut body, key, value.as_ref());
            }
        }
    }
    Ok(Value::Object(body))
}

/// Provider id of the row described by `record`. Tracking links have no id
/// of their own on Everflow; the offer/affiliate pair identifies them.
pub fn provider_id_from(kind: EntityKind, record: &Value, body: &Value) -> Option<String> {
    let as_text = |v: &Value| match v {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    };
    match kind {
        EntityKind::Advertiser => record.get("network_advertiser_id").and_then(as_text),
        EntityKind::Affiliate => record.get("network_affiliate_id").and_then(as_text),
        EntityKind::Campaign => record.get("network_offer_id").and_then(as_text),
        EntityKind::TrackingLink => {
            let offer = body.get("network_offer_id").and_then(as_text)?;
            let affiliate = body.get("network_affiliate_id").and_then(as_text)?;
            Some(format!("{}:{}", offer, affiliate))
        }
    }
}

fn text(record: &Value, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn set_if_changed<T: PartialEq>(
    field: &mut T,
    value: Option<T>,
    name: &'static str,
    changed: &mut Vec<&'static str>,
) {
    if let Some(value) = value {
        if *field != value {
            *field = value;
            changed.push(name);
        }
    }
}

/// Copies mirrored fields from a provider record onto the local row and
/// returns the names of the fields that changed.
pub fn apply_record(entity: &mut MirroredEntity, record: &Value) -> Vec<&'static str> {
    let mut changed = Vec::new();
    match entity {
        MirroredEntity::Advertiser(a) => {
            set_if_changed(&mut a.name, text(record, "name"), "name", &mut changed);
            set_if_changed(
                &mut a.status,
                text(record, "account_status").and_then(|s| status_from_account(&s)),
                "status",
                &mut changed,
            );
            set_if_changed(
                &mut a.internal_notes,
                text(record, "internal_notes").map(Some),
                "internal_notes",
                &mut changed,
            );
            set_if_changed(
                &mut a.default_currency_id,
                text(record, "default_currency_id").map(Some),
                "default_currency_id",
                &mut changed,
            );
            set_if_changed(
                &mut a.platform_name,
                text(record, "platform_name").map(Some),
                "platform_name",
                &mut changed,
            );
        }
        MirroredEntity::Affiliate(a) => {
            set_if_changed(&mut a.name, text(record, "name"), "name", &mut changed);
            set_if_changed(
                &mut a.status,
                text(record, "account_status").and_then(|s| status_from_account(&s)),
                "status",
                &mut changed,
            );
            set_if_changed(
                &mut a.internal_notes,
                text(record, "internal_notes").map(Some),
                "internal_notes",
                &mut changed,
            );
            set_if_changed(
                &mut a.default_currency_id,
                text(record, "default_currency_id").map(Some),
                "default_currency_id",
                &mut changed,
            );
        }
        MirroredEntity::Campaign(c) => {
            set_if_changed(&mut c.name, text(record, "name"), "name", &mut changed);
            set_if_changed(
                &mut c.status,
                text(record, "offer_status").and_then(|s| status_from_offer(&s)),
                "status",
                &mut changed,
            );
            set_if_changed(
                &mut c.destination_url,
                text(record, "destination_url").map(Some),
                "destination_url",
                &mut changed,
            );
            set_if_changed(
                &mut c.internal_notes,
                text(record, "internal_notes").map(Some),
                "internal_notes",
                &mut changed,
            );
            set_if_changed(
                &mut c.currency_id,
                text(record, "currency_id").map(Some),
                "currency_id",
                &mut changed,
            );
            set_if_changed(
                &mut c.session_duration,
                record
                    .get("session_duration")
                    .and_then(Value::as_i64)
                    .and_then(|v| i32::try_from(v).ok())
                    .map(Some),
                "session_duration",
                &mut changed,
            );
        }
        MirroredEntity::TrackingLink(t) => {
            set_if_changed(
                &mut t.tracking_url,
                text(record, "url").map(Some),
                "tracking_url",
                &mut changed,
            );
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Advertiser, TrackingLink};
    use chrono::Utc;

    fn advertiser() -> Advertiser {
        let now = Utc::now();
        Advertiser {
            advertiser_id: 7,
            organization_id: 1,
            name: "Acme".into(),
            contact_email: Some("billing@acme.test".into()),
            status: EntityStatus::Active,
            internal_notes: None,
            default_currency_id: None,
            platform_name: None,
            billing_details: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn link() -> TrackingLink {
        let now = Utc::now();
        TrackingLink {
            tracking_link_id: 3,
            organization_id: 1,
            campaign_id: 12,
            affiliate_id: 9,
            name: "Newsletter".into(),
            description: None,
            status: EntityStatus::Active,
            tracking_url: None,
            source_id: Some("mail".into()),
            sub1: Some("spring".into()),
            sub2: None,
            sub3: None,
            sub4: None,
            sub5: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_advertiser_body_carries_reference_label() {
        let body = request_body(&MirroredEntity::Advertiser(advertiser()), &HashMap::new()).unwrap();
        assert_eq!(body["labels"][0], "advertiser_id:7");
        assert_eq!(body["account_status"], "active");
        assert_eq!(body["default_currency_id"], "USD");
    }

    #[test]
    fn test_tracking_link_needs_parent_ids() {
        let entity = MirroredEntity::TrackingLink(link());
        assert!(request_body(&entity, &HashMap::new()).is_err());

        let parents = HashMap::from([
            (EntityKind::Campaign, "55".to_string()),
            (EntityKind::Affiliate, "81".to_string()),
        ]);
        let body = request_body(&entity, &parents).unwrap();
        assert_eq!(body["network_offer_id"], 55);
        assert_eq!(body["sub1"], "spring");
        assert_eq!(
            provider_id_from(EntityKind::TrackingLink, &json!({"url": "x"}), &body).as_deref(),
            Some("55:81")
        );
    }

    #[test]
    fn test_provider_id_from_numeric_field() {
        let record = json!({ "network_advertiser_id": 991 });
        assert_eq!(
            provider_id_from(EntityKind::Advertiser, &record, &Value::Null).as_deref(),
            Some("991")
        );
        assert!(provider_id_from(EntityKind::Campaign, &record, &Value::Null).is_none());
    }

    #[test]
    fn test_apply_record_reports_changed_fields() {
        let mut entity = MirroredEntity::Advertiser(advertiser());
        let changed = apply_record(
            &mut entity,
            &json!({ "name": "Acme Corp", "account_status": "inactive", "default_currency_id": "" }),
        );
        assert_eq!(changed, vec!["name", "status"]);
        match entity {
            MirroredEntity::Advertiser(a) => {
                assert_eq!(a.name, "Acme Corp");
                assert_eq!(a.status, EntityStatus::Inactive);
                assert!(a.default_currency_id.is_none());
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_apply_record_sets_tracking_url() {
        let mut entity = MirroredEntity::TrackingLink(link());
        let changed = apply_record(&mut entity, &json!({ "url": "https://trk.example/abc" }));
        assert_eq!(changed, vec!["tracking_url"]);
    }
}
