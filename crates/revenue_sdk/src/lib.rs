//! Contract of the externally supplied, opaque reader-revenue client.
//!
//! The host page owns the client's lifetime; this crate only describes the
//! capability surface the orchestration layer relies on, plus the value and
//! error types that cross that boundary.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use shared::domain::Sku;
use thiserror::Error;

/// Failure raised by the external client itself.
#[derive(Debug, Clone, Error)]
pub enum SdkError {
    #[error("reader-revenue client unavailable: {0}")]
    Unavailable(String),
    #[error("entitlements check failed: {0}")]
    Entitlements(String),
}

/// Outcome attached by the external client to a rejected purchase flow.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityResult {
    pub code: Option<String>,
    pub data: Option<Value>,
}

/// A purchase flow that ended without a completed purchase: the user backed
/// out, or the external client failed.
#[derive(Debug, Clone, Error)]
#[error("purchase flow rejected: {message}")]
pub struct FlowRejection {
    pub message: String,
    pub activity_result: Option<ActivityResult>,
}

impl FlowRejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            activity_result: None,
        }
    }
}

/// Metadata the external client attaches to flow lifecycle callbacks.
#[derive(Debug, Clone, Default)]
pub struct FlowInfo {
    pub flow: String,
    pub sku: Option<Sku>,
}

/// Raw entitlements handle as surfaced by the external client.
pub trait EntitlementsHandle: Send + Sync {
    /// Whether the grants cover the exact content being requested.
    fn enables_this(&self) -> bool;
    /// Whether the user holds any grant at all.
    fn enables_any(&self) -> bool;
    /// Serialized grants, if the client exposes them.
    fn json(&self) -> Option<Value>;
    /// Acknowledge the check; suppresses the client's own notification.
    /// Callers invoke this exactly once per check.
    fn ack(&self);
}

/// Entitlements check result, derived once per check from the raw handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitlementsSummary {
    pub granted: bool,
    pub has_entitlements: bool,
    pub json: Option<Value>,
}

impl EntitlementsSummary {
    /// Derive the summary, acknowledging the check so the external client
    /// does not surface its own notification. The ack happens before any
    /// predicate is read and exactly once per handle.
    pub fn from_handle(handle: &dyn EntitlementsHandle) -> Self {
        handle.ack();
        Self {
            granted: handle.enables_this(),
            has_entitlements: handle.enables_any(),
            json: handle.json(),
        }
    }
}

/// A completed purchase as surfaced by the external client.
#[async_trait]
pub trait PurchaseResponse: Send + Sync {
    /// Raw purchase payload, forwarded verbatim to the backend.
    fn json(&self) -> Value;
    /// Tell the external client the flow is finished so its UI can settle.
    async fn complete(&self) -> anyhow::Result<()>;
}

pub type EntitlementsOutcome = Result<Arc<dyn EntitlementsHandle>, SdkError>;
pub type SubscribeOutcome = Result<Arc<dyn PurchaseResponse>, FlowRejection>;

pub type EntitlementsResponseCallback = Arc<dyn Fn(EntitlementsOutcome) + Send + Sync>;
pub type SubscribeResponseCallback = Arc<dyn Fn(SubscribeOutcome) + Send + Sync>;
pub type FlowEventCallback = Arc<dyn Fn(FlowInfo) + Send + Sync>;
pub type LoginRequestCallback = Arc<dyn Fn() + Send + Sync>;
pub type NativeSubscribeCallback = Arc<dyn Fn() + Send + Sync>;

/// Capability surface of the opaque reader-revenue client.
///
/// Registration points return `false` when the concrete client does not
/// expose that hook; callers skip the binding rather than treating it as an
/// error. The default bodies advertise nothing.
#[async_trait]
pub trait RevenueSdk: Send + Sync {
    /// Configure the client for a publication (manual-init mode).
    fn init(&self, publication: &str);

    /// Run an entitlements check and hand back the raw handle.
    async fn entitlements(&self) -> EntitlementsOutcome;

    /// Kick off an entitlements check whose result is delivered through the
    /// registered response callback. Manual-init mode does not auto-trigger
    /// the check, so the orchestrator fires this explicitly.
    fn start_entitlements_check(&self);

    /// Launch the purchase flow for a single SKU.
    fn subscribe(&self, sku: &Sku);

    /// Present an offer carousel for several SKUs.
    fn show_offers(&self, skus: &[Sku]);

    fn set_on_entitlements_response(&self, _callback: EntitlementsResponseCallback) -> bool {
        false
    }

    fn set_on_subscribe_response(&self, _callback: SubscribeResponseCallback) -> bool {
        false
    }

    fn set_on_flow_started(&self, _callback: FlowEventCallback) -> bool {
        false
    }

    fn set_on_flow_canceled(&self, _callback: FlowEventCallback) -> bool {
        false
    }

    fn set_on_login_request(&self, _callback: LoginRequestCallback) -> bool {
        false
    }

    fn set_on_native_subscribe_request(&self, _callback: NativeSubscribeCallback) -> bool {
        false
    }
}

/// Stand-in used when no real client reached the page.
pub struct MissingRevenueSdk;

#[async_trait]
impl RevenueSdk for MissingRevenueSdk {
    fn init(&self, _publication: &str) {}

    async fn entitlements(&self) -> EntitlementsOutcome {
        Err(SdkError::Unavailable(
            "no reader-revenue client loaded".to_string(),
        ))
    }

    fn start_entitlements_check(&self) {}

    fn subscribe(&self, _sku: &Sku) {}

    fn show_offers(&self, _skus: &[Sku]) {}
}

/// Provisions a ready client handle: script injection, sandbox switching,
/// whatever the host environment needs.
#[async_trait]
pub trait SdkProvider: Send + Sync {
    async fn load(&self, manual: bool, sandbox: bool) -> Result<Arc<dyn RevenueSdk>, SdkError>;
}
