//! Purchase trigger elements. Triggers are locked from construction until
//! the controller decides a purchase path exists, and re-lock for good once
//! a flow returns or errors.

use std::sync::Arc;

use revenue_sdk::RevenueSdk;
use serde_json::{json, Map};
use shared::domain::Sku;
use tracing::warn;

use crate::events::{EventBus, Signal, Topic, TrackRequest};

/// Host-side purchase trigger: a button element or its moral equivalent.
pub trait SubscribeTrigger: Send + Sync {
    fn set_enabled(&self, enabled: bool);
    /// Comma-separated SKU list attribute, if the element carries one.
    fn skus(&self) -> Option<String>;
}

pub struct SubscribeButtons {
    triggers: Vec<Arc<dyn SubscribeTrigger>>,
    sdk: Arc<dyn RevenueSdk>,
    bus: Arc<EventBus>,
}

impl SubscribeButtons {
    /// Triggers start disabled; nothing is clickable until `init`.
    pub fn new(
        sdk: Arc<dyn RevenueSdk>,
        bus: Arc<EventBus>,
        triggers: Vec<Arc<dyn SubscribeTrigger>>,
    ) -> Arc<Self> {
        let buttons = Arc::new(Self { triggers, sdk, bus });
        buttons.disable_all();
        buttons
    }

    /// Enable the triggers and re-lock on any purchase return or error
    /// broadcast; a finished or failed flow keeps the page locked until a
    /// fresh load.
    pub fn init(self: &Arc<Self>) {
        for topic in [Topic::SubscribeReturn, Topic::Error] {
            let buttons = Arc::downgrade(self);
            self.bus.listen(topic, move |_signal| {
                if let Some(buttons) = buttons.upgrade() {
                    buttons.disable_all();
                }
            });
        }
        self.enable_all();
    }

    pub fn disable_all(&self) {
        for trigger in &self.triggers {
            trigger.set_enabled(false);
        }
    }

    pub fn enable_all(&self) {
        for trigger in &self.triggers {
            trigger.set_enabled(true);
        }
    }

    /// Handle a click on one trigger. Malformed input is broadcast on the
    /// error topic, never thrown.
    pub fn click(&self, trigger: &dyn SubscribeTrigger) {
        let Some(raw) = trigger.skus() else {
            warn!("buttons: trigger clicked without a sku attribute");
            self.bus
                .signal_error("purchase trigger has no sku attribute", Map::new());
            return;
        };

        let skus: Vec<Sku> = raw
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Sku::new)
            .collect();

        let mut context = Map::new();
        context.insert("skus".to_string(), json!(skus));
        self.bus.signal(Signal::Track(TrackRequest {
            action: "landing".to_string(),
            context,
            journey_start: true,
        }));

        match skus.as_slice() {
            [] => self
                .bus
                .signal_error("purchase trigger sku attribute is empty", Map::new()),
            [sku] => self.sdk.subscribe(sku),
            many => self.sdk.show_offers(many),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use revenue_sdk::{EntitlementsOutcome, SdkError};
    use serde_json::Value;

    use super::*;
    use crate::lock;

    #[derive(Default)]
    struct RecordingSdk {
        subscribed: Mutex<Vec<Sku>>,
        offered: Mutex<Vec<Vec<Sku>>>,
    }

    #[async_trait::async_trait]
    impl RevenueSdk for RecordingSdk {
        fn init(&self, _publication: &str) {}

        async fn entitlements(&self) -> EntitlementsOutcome {
            Err(SdkError::Unavailable("test".to_string()))
        }

        fn start_entitlements_check(&self) {}

        fn subscribe(&self, sku: &Sku) {
            lock(&self.subscribed).push(sku.clone());
        }

        fn show_offers(&self, skus: &[Sku]) {
            lock(&self.offered).push(skus.to_vec());
        }
    }

    struct FakeTrigger {
        enabled: AtomicBool,
        skus: Option<&'static str>,
    }

    impl FakeTrigger {
        fn new(skus: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                enabled: AtomicBool::new(true),
                skus,
            })
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
    }

    impl SubscribeTrigger for FakeTrigger {
        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        fn skus(&self) -> Option<String> {
            self.skus.map(str::to_string)
        }
    }

    fn fixture(
        skus: Option<&'static str>,
    ) -> (Arc<SubscribeButtons>, Arc<RecordingSdk>, Arc<EventBus>, Arc<FakeTrigger>) {
        let sdk = Arc::new(RecordingSdk::default());
        let bus = Arc::new(EventBus::new());
        let trigger = FakeTrigger::new(skus);
        let buttons = SubscribeButtons::new(
            Arc::clone(&sdk) as Arc<dyn RevenueSdk>,
            Arc::clone(&bus),
            vec![Arc::clone(&trigger) as Arc<dyn SubscribeTrigger>],
        );
        (buttons, sdk, bus, trigger)
    }

    #[test]
    fn construction_disables_and_init_enables() {
        let (buttons, _sdk, _bus, trigger) = fixture(Some("ft.com_a_p1m_x_1"));
        assert!(!trigger.is_enabled());
        buttons.init();
        assert!(trigger.is_enabled());
    }

    #[test]
    fn a_single_sku_click_subscribes_after_a_landing_signal() {
        let (buttons, sdk, bus, trigger) = fixture(Some("ft.com_a_p1m_x_1"));
        let landings = Arc::new(Mutex::new(Vec::new()));
        {
            let landings = Arc::clone(&landings);
            bus.listen(Topic::Track, move |signal| {
                if let Signal::Track(request) = signal {
                    lock(&landings).push((request.action.clone(), request.journey_start));
                }
            });
        }

        buttons.init();
        buttons.click(trigger.as_ref());

        assert_eq!(*lock(&landings), vec![("landing".to_string(), true)]);
        assert_eq!(*lock(&sdk.subscribed), vec![Sku::new("ft.com_a_p1m_x_1")]);
        assert!(lock(&sdk.offered).is_empty());
    }

    #[test]
    fn several_skus_open_the_offer_carousel() {
        let (buttons, sdk, _bus, trigger) = fixture(Some("sku-one, sku-two"));
        buttons.init();
        buttons.click(trigger.as_ref());

        assert!(lock(&sdk.subscribed).is_empty());
        assert_eq!(
            *lock(&sdk.offered),
            vec![vec![Sku::new("sku-one"), Sku::new("sku-two")]]
        );
    }

    #[test]
    fn a_missing_attribute_is_broadcast_not_thrown() {
        let (buttons, sdk, bus, trigger) = fixture(None);
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            bus.listen(Topic::Error, move |signal| {
                if let Signal::Error(report) = signal {
                    lock(&errors).push(report.message.clone());
                }
            });
        }

        buttons.init();
        buttons.click(trigger.as_ref());

        assert_eq!(*lock(&errors), vec!["purchase trigger has no sku attribute"]);
        assert!(lock(&sdk.subscribed).is_empty());
    }

    #[test]
    fn an_empty_attribute_is_broadcast_after_the_landing_signal() {
        let (buttons, sdk, bus, trigger) = fixture(Some(" , "));
        let errors = Arc::new(Mutex::new(Vec::new()));
        {
            let errors = Arc::clone(&errors);
            bus.listen(Topic::Error, move |signal| {
                if let Signal::Error(report) = signal {
                    lock(&errors).push(report.message.clone());
                }
            });
        }

        buttons.init();
        buttons.click(trigger.as_ref());

        assert_eq!(
            *lock(&errors),
            vec!["purchase trigger sku attribute is empty"]
        );
        assert!(lock(&sdk.subscribed).is_empty());
        assert!(lock(&sdk.offered).is_empty());
    }

    #[test]
    fn return_and_error_broadcasts_relock() {
        let (buttons, _sdk, bus, trigger) = fixture(Some("sku"));
        buttons.init();
        assert!(trigger.is_enabled());

        bus.signal(Signal::SubscribeReturn(Value::Null));
        assert!(!trigger.is_enabled());

        trigger.set_enabled(true);
        bus.signal_error("flow failed", Map::new());
        assert!(!trigger.is_enabled());
    }
}
