//! Pure shaping of tracking payloads. Everything stateful about tracking
//! (the active journey context) stays with the controller.

use serde_json::{json, Map, Value};
use shared::domain::{decode_sku, Sku};

use crate::ControllerConfig;

/// Session-invariant tracking fields, computed once per controller.
pub fn base_tracking_fields(config: &ControllerConfig) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("category".to_string(), "reader-revenue".into());
    fields.insert("formType".to_string(), "reader-revenue.signup".into());
    fields.insert("production".to_string(), Value::Bool(!config.sandbox));
    fields.insert("paymentMethod".to_string(), "PLATFORM".into());
    fields.insert("system".to_string(), json!({ "source": "revenue-bridge" }));
    fields
}

/// Offer fields derived from a SKU list. Only a single-SKU journey is
/// decodable; anything else yields no fields. A foreign single SKU still
/// carries its id.
pub fn offer_fields_from_skus(skus: &[Sku], publisher_domain: &str) -> Map<String, Value> {
    let [sku] = skus else {
        return Map::new();
    };
    match decode_sku(sku, publisher_domain) {
        Some(offer) => match serde_json::to_value(&offer) {
            Ok(Value::Object(fields)) => fields,
            _ => Map::new(),
        },
        None => {
            let mut fields = Map::new();
            fields.insert("skuId".to_string(), Value::String(sku.as_str().to_string()));
            fields
        }
    }
}

/// Pull the `skus` list out of a tracking context.
pub fn skus_from_context(context: &Map<String, Value>) -> Vec<Sku> {
    let Some(Value::Array(entries)) = context.get("skus") else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| entry.as_str())
        .map(Sku::new)
        .collect()
}

/// Compose one flattened event from base fields, the active journey
/// context, the caller's context and the action, later entries winning.
pub fn compose_event(
    base: &Map<String, Value>,
    active: &Map<String, Value>,
    context: &Map<String, Value>,
    action: &str,
) -> Map<String, Value> {
    let mut event = base.clone();
    event.extend(active.clone());
    event.extend(context.clone());
    event.insert("action".to_string(), action.into());
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ControllerConfig {
        let endpoint = url::Url::parse("http://127.0.0.1:9/unused").expect("url");
        ControllerConfig::for_publisher("ft.com", endpoint.clone(), endpoint).expect("config")
    }

    #[test]
    fn base_fields_reflect_the_sandbox_flag() {
        let mut config = config();
        let fields = base_tracking_fields(&config);
        assert_eq!(fields["production"], Value::Bool(true));
        assert_eq!(fields["category"], json!("reader-revenue"));

        config.sandbox = true;
        let fields = base_tracking_fields(&config);
        assert_eq!(fields["production"], Value::Bool(false));
    }

    #[test]
    fn a_single_publisher_sku_decodes_to_offer_fields() {
        let skus = [Sku::new("ft.com_abcd38.efg89_p1m_premium.trial_31.05.18")];
        let fields = offer_fields_from_skus(&skus, "ft.com");
        assert_eq!(fields["offerId"], json!("abcd38-efg89"));
        assert_eq!(fields["term"], json!("trial"));
        assert_eq!(fields["isTrial"], json!(true));
        assert_eq!(fields["isPremium"], json!(true));
    }

    #[test]
    fn several_skus_yield_no_offer_fields() {
        let skus = [Sku::new("ft.com_a_p1m_x_1"), Sku::new("ft.com_b_p1y_y_1")];
        assert!(offer_fields_from_skus(&skus, "ft.com").is_empty());
        assert!(offer_fields_from_skus(&[], "ft.com").is_empty());
    }

    #[test]
    fn a_foreign_sku_falls_back_to_its_id() {
        let skus = [Sku::new("other.com_offer_p1m_basic_1")];
        let fields = offer_fields_from_skus(&skus, "ft.com");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["skuId"], json!("other.com_offer_p1m_basic_1"));
    }

    #[test]
    fn later_sources_win_during_composition() {
        let mut base = Map::new();
        base.insert("category".to_string(), json!("reader-revenue"));
        base.insert("shared".to_string(), json!("base"));
        let mut active = Map::new();
        active.insert("shared".to_string(), json!("active"));
        let mut context = Map::new();
        context.insert("stage".to_string(), json!("user-resolution"));

        let event = compose_event(&base, &active, &context, "retry");
        assert_eq!(event["shared"], json!("active"));
        assert_eq!(event["stage"], json!("user-resolution"));
        assert_eq!(event["action"], json!("retry"));
        assert_eq!(event["category"], json!("reader-revenue"));
    }
}
