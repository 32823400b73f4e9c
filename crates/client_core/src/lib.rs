//! Orchestration core for the reader-revenue purchase lifecycle.
//!
//! Sequences initialization, entitlement resolution, purchase handling and
//! backend user resolution around an externally supplied client, and keeps
//! the publisher's analytics decorated along the way. The host environment
//! (navigation, cookies, user notices, observability collectors) is reached
//! through ports so the core stays embeddable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use revenue_sdk::{
    EntitlementsOutcome, EntitlementsSummary, FlowInfo, FlowRejection, PurchaseResponse,
    RevenueSdk, SdkError, SdkProvider, SubscribeOutcome,
};
use serde_json::{json, Map, Value};
use shared::domain::UserScenario;
use shared::protocol::{EntitledCheckRequest, SessionResponse, UserResolution};
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

pub mod buttons;
pub mod events;
pub mod resolve;
pub mod tracking;

use buttons::{SubscribeButtons, SubscribeTrigger};
use events::{ErrorSignal, EventBus, Signal, Topic, TrackRequest};
use resolve::{FetchError, ResolutionClient};

const MAX_RETRIES: u32 = 2;
const CONTENT_ID_PARAM: &str = "content-uuid";
const CONTENT_PATH_SEGMENT: &str = "content";
const PRODUCT_SELECTOR_PREFIX: &str = "/products";

const UPGRADE_UNAVAILABLE_NOTICE: &str = "Your subscription does not cover this content, and \
    upgrading through your platform account is not available. Please contact customer services \
    to discuss your options.";
const AUTO_LOGIN_FAILED_NOTICE: &str = "We could not log you in automatically.";
const RESOLUTION_FAILED_NOTICE: &str = "Something went wrong while setting up your account. \
    Please contact customer services.";

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the page is and where to send it next.
pub trait Navigator: Send + Sync {
    fn current_url(&self) -> Option<Url>;
    fn redirect_to(&self, url: &Url);
}

/// Headless fallback; logs the redirects it swallows.
pub struct InertNavigator;

impl Navigator for InertNavigator {
    fn current_url(&self) -> Option<Url> {
        None
    }

    fn redirect_to(&self, url: &Url) {
        info!(%url, "navigation: redirect requested with no host navigator");
    }
}

/// Client-side cookie access. The new-subscriber marker is a hint for
/// onward-journey decisions, not a credential.
pub trait CookieStore: Send + Sync {
    fn set(&self, name: &str, value: &str, domain: &str);
    fn contains(&self, name: &str) -> bool;
}

#[derive(Default)]
pub struct MemoryCookieStore {
    cookies: Mutex<HashMap<String, String>>,
}

impl CookieStore for MemoryCookieStore {
    fn set(&self, name: &str, value: &str, _domain: &str) {
        lock(&self.cookies).insert(name.to_string(), value.to_string());
    }

    fn contains(&self, name: &str) -> bool {
        lock(&self.cookies).contains_key(name)
    }
}

/// A blocking user notice: wrong tier, unrecoverable failure, login prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct UserNotice {
    pub message: String,
    pub action: Option<NoticeAction>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoticeAction {
    pub label: String,
    pub url: Url,
}

pub trait MessagePresenter: Send + Sync {
    fn show(&self, notice: &UserNotice);
}

pub struct LoggingPresenter;

impl MessagePresenter for LoggingPresenter {
    fn show(&self, notice: &UserNotice) {
        warn!(message = %notice.message, "presenter: user notice");
    }
}

/// Flattened conversion events for the analytics collector.
pub trait TrackingSink: Send + Sync {
    fn tracking_event(&self, event: &Map<String, Value>);
}

pub struct LoggingTrackingSink;

impl TrackingSink for LoggingTrackingSink {
    fn tracking_event(&self, event: &Map<String, Value>) {
        info!(event = %serde_json::Value::Object(event.clone()), "tracking: event");
    }
}

/// Structured error reports for the error-aggregation collector.
pub trait ErrorSink: Send + Sync {
    fn report(&self, message: &str, info: &Map<String, Value>);
}

pub struct LoggingErrorSink;

impl ErrorSink for LoggingErrorSink {
    fn report(&self, message: &str, info: &Map<String, Value>) {
        error!(info = %serde_json::Value::Object(info.clone()), "error-report: {message}");
    }
}

/// Options bag for the controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Domain token SKUs are minted under; also scopes the marker cookie.
    pub publisher_domain: String,
    /// Backend endpoint resolving a completed purchase into a session.
    pub subscription_endpoint: Url,
    /// Backend endpoint reconciling an existing entitlement with a session.
    pub entitled_check_endpoint: Url,
    /// Consent form shown to newly created accounts.
    pub post_purchase_url: Url,
    pub login_url: Url,
    pub homepage_url: Url,
    /// Base joined with a content id to address requested content.
    pub content_base_url: Url,
    /// Publication id for manual-init mode; `None` lets the client
    /// configure itself at load time.
    pub manual_init_publication: Option<String>,
    pub sandbox: bool,
    /// Construct the button component around the supplied triggers.
    pub subscribe_from_buttons: bool,
    /// Suppress the default entitled onward journey; the host drives it.
    pub custom_onward_journey: bool,
    pub new_subscriber_cookie: String,
}

impl ControllerConfig {
    /// Conventional site URLs for a publisher domain. The resolution
    /// endpoints stay explicit because they live on the API origin, not the
    /// site origin.
    pub fn for_publisher(
        domain: &str,
        subscription_endpoint: Url,
        entitled_check_endpoint: Url,
    ) -> Result<Self, url::ParseError> {
        let site = format!("https://www.{domain}");
        Ok(Self {
            publisher_domain: domain.to_string(),
            subscription_endpoint,
            entitled_check_endpoint,
            post_purchase_url: Url::parse(&format!("{site}/profile?splash=checkout"))?,
            login_url: Url::parse(&format!("{site}/login"))?,
            homepage_url: Url::parse(&site)?,
            content_base_url: Url::parse(&format!("{site}/content/"))?,
            manual_init_publication: None,
            sandbox: false,
            subscribe_from_buttons: false,
            custom_onward_journey: false,
            new_subscriber_cookie: "revenueNewSubscriber".to_string(),
        })
    }
}

pub type EntitlementsResponseHandler = Arc<dyn Fn(EntitlementsOutcome) + Send + Sync>;
pub type SubscribeResponseHandler = Arc<dyn Fn(SubscribeOutcome) + Send + Sync>;
pub type FlowEventHandler = Arc<dyn Fn(FlowInfo) + Send + Sync>;
pub type LoginRequestHandler = Arc<dyn Fn() + Send + Sync>;
pub type NativeSubscribeHandler = Arc<dyn Fn() + Send + Sync>;
pub type ResolvedEntitlementsHandler = Arc<dyn Fn(ResolvedEntitlements) + Send + Sync>;
pub type ResolvedSubscribeHandler = Arc<dyn Fn(UserResolution) + Send + Sync>;

/// Pluggable consent rule: given the backend reply and whether the marker
/// cookie is present, decide if the consent form is still owed. The
/// business rule drifted across deployments, so embedders can pin one.
pub type ConsentRule = Arc<dyn Fn(&Value, bool) -> bool + Send + Sync>;

/// Per-hook overrides. Anything left `None` falls back to the default
/// behavior; the native-subscribe hook has no default and stays unbound.
#[derive(Clone, Default)]
pub struct HandlerOverrides {
    pub on_entitlements_response: Option<EntitlementsResponseHandler>,
    pub on_subscribe_response: Option<SubscribeResponseHandler>,
    pub on_flow_started: Option<FlowEventHandler>,
    pub on_flow_canceled: Option<FlowEventHandler>,
    pub on_login_request: Option<LoginRequestHandler>,
    pub on_native_subscribe_request: Option<NativeSubscribeHandler>,
    pub on_resolved_entitlements: Option<ResolvedEntitlementsHandler>,
    pub on_resolved_subscribe: Option<ResolvedSubscribeHandler>,
}

/// Host-environment ports plus trigger elements and handler overrides.
pub struct ControllerPorts {
    pub navigator: Arc<dyn Navigator>,
    pub cookies: Arc<dyn CookieStore>,
    pub presenter: Arc<dyn MessagePresenter>,
    pub tracking_sink: Arc<dyn TrackingSink>,
    pub error_sink: Arc<dyn ErrorSink>,
    pub triggers: Vec<Arc<dyn SubscribeTrigger>>,
    pub handlers: HandlerOverrides,
    pub consent_rule: Option<ConsentRule>,
}

impl Default for ControllerPorts {
    fn default() -> Self {
        Self {
            navigator: Arc::new(InertNavigator),
            cookies: Arc::new(MemoryCookieStore::default()),
            presenter: Arc::new(LoggingPresenter),
            tracking_sink: Arc::new(LoggingTrackingSink),
            error_sink: Arc::new(LoggingErrorSink),
            triggers: Vec::new(),
            handlers: HandlerOverrides::default(),
            consent_rule: None,
        }
    }
}

/// Outcome handed to the entitled onward journey.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEntitlements {
    /// No session could be established; the user must log in themselves.
    pub prompt_login: bool,
    pub resolution: Option<UserResolution>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Skip the initial entitlements branch and enable buttons directly.
    pub disable_entitlements_check: bool,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to load reader-revenue client: {0}")]
    Load(#[from] SdkError),
    #[error(transparent)]
    Http(#[from] FetchError),
}

/// Extract the content identifier a page is asking for: the query marker
/// wins, then a `/content/<id>` path segment.
pub fn content_id_from_url(url: &Url) -> Option<String> {
    if let Some((_, id)) = url
        .query_pairs()
        .find(|(key, _)| key == CONTENT_ID_PARAM)
    {
        if !id.is_empty() {
            return Some(id.into_owned());
        }
    }
    let mut segments = url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == CONTENT_PATH_SEGMENT {
            return segments
                .next()
                .filter(|id| !id.is_empty())
                .map(str::to_string);
        }
    }
    None
}

/// Drives the purchase/entitlement lifecycle around one external client
/// handle. Construct once per page.
pub struct RevenueController {
    sdk: Arc<dyn RevenueSdk>,
    config: ControllerConfig,
    bus: Arc<EventBus>,
    http: ResolutionClient,
    navigator: Arc<dyn Navigator>,
    cookies: Arc<dyn CookieStore>,
    presenter: Arc<dyn MessagePresenter>,
    tracking_sink: Arc<dyn TrackingSink>,
    error_sink: Arc<dyn ErrorSink>,
    handlers: HandlerOverrides,
    consent_rule: Option<ConsentRule>,
    buttons: Option<Arc<SubscribeButtons>>,
    base_tracking: Map<String, Value>,
    active_tracking: Mutex<Map<String, Value>>,
    // First response cached so a callback racing `init` cannot strand the
    // entitlements branch.
    initial_entitlements: Mutex<Option<EntitlementsSummary>>,
    initialised: AtomicBool,
}

impl RevenueController {
    pub fn new(
        sdk: Arc<dyn RevenueSdk>,
        config: ControllerConfig,
    ) -> Result<Arc<Self>, FetchError> {
        Self::new_with_ports(sdk, config, ControllerPorts::default())
    }

    pub fn new_with_ports(
        sdk: Arc<dyn RevenueSdk>,
        config: ControllerConfig,
        ports: ControllerPorts,
    ) -> Result<Arc<Self>, FetchError> {
        let bus = Arc::new(EventBus::new());
        let buttons = config.subscribe_from_buttons.then(|| {
            SubscribeButtons::new(Arc::clone(&sdk), Arc::clone(&bus), ports.triggers)
        });
        let base_tracking = tracking::base_tracking_fields(&config);

        let controller = Arc::new(Self {
            sdk,
            config,
            bus,
            http: ResolutionClient::new()?,
            navigator: ports.navigator,
            cookies: ports.cookies,
            presenter: ports.presenter,
            tracking_sink: ports.tracking_sink,
            error_sink: ports.error_sink,
            handlers: ports.handlers,
            consent_rule: ports.consent_rule,
            buttons,
            base_tracking,
            active_tracking: Mutex::new(Map::new()),
            initial_entitlements: Mutex::new(None),
            initialised: AtomicBool::new(false),
        });
        controller.register_sdk_hooks();
        Ok(controller)
    }

    /// Bind the handler table to whichever registration points the client
    /// exposes; unsupported points are skipped, not errors.
    fn register_sdk_hooks(self: &Arc<Self>) {
        let entitlements = self
            .handlers
            .on_entitlements_response
            .clone()
            .unwrap_or_else(|| {
                let controller = Arc::downgrade(self);
                Arc::new(move |outcome: EntitlementsOutcome| {
                    if let Some(controller) = controller.upgrade() {
                        controller.handle_entitlements_response(outcome);
                    }
                })
            });
        if !self.sdk.set_on_entitlements_response(entitlements) {
            info!("controller: client exposes no entitlements-response hook");
        }

        let subscribe = self
            .handlers
            .on_subscribe_response
            .clone()
            .unwrap_or_else(|| {
                let controller = Arc::downgrade(self);
                Arc::new(move |outcome: SubscribeOutcome| {
                    let Some(controller) = controller.upgrade() else {
                        return;
                    };
                    // The purchase pipeline awaits the backend; hop onto
                    // the runtime.
                    tokio::spawn(async move {
                        controller.handle_subscribe_response(outcome).await;
                    });
                })
            });
        if !self.sdk.set_on_subscribe_response(subscribe) {
            info!("controller: client exposes no subscribe-response hook");
        }

        let started = self.handlers.on_flow_started.clone().unwrap_or_else(|| {
            let controller = Arc::downgrade(self);
            Arc::new(move |flow: FlowInfo| {
                if let Some(controller) = controller.upgrade() {
                    controller.handle_flow_started(flow);
                }
            })
        });
        let _ = self.sdk.set_on_flow_started(started);

        let canceled = self.handlers.on_flow_canceled.clone().unwrap_or_else(|| {
            let controller = Arc::downgrade(self);
            Arc::new(move |flow: FlowInfo| {
                if let Some(controller) = controller.upgrade() {
                    controller.handle_flow_canceled(flow);
                }
            })
        });
        let _ = self.sdk.set_on_flow_canceled(canceled);

        let login = self.handlers.on_login_request.clone().unwrap_or_else(|| {
            let controller = Arc::downgrade(self);
            Arc::new(move || {
                if let Some(controller) = controller.upgrade() {
                    controller.handle_login_request();
                }
            })
        });
        let _ = self.sdk.set_on_login_request(login);

        // No default for native subscribe requests; bind only an override.
        if let Some(native) = self.handlers.on_native_subscribe_request.clone() {
            let _ = self.sdk.set_on_native_subscribe_request(native);
        }
    }

    /// Returns once the initial entitlements branch has settled. Safe to
    /// call repeatedly and concurrently; only the first call does anything.
    pub async fn init(self: &Arc<Self>, options: InitOptions) {
        if self.initialised.swap(true, Ordering::SeqCst) {
            return;
        }

        // Listener registration happens before the first await so nothing
        // can broadcast into an empty bus.
        let controller = Arc::downgrade(self);
        self.bus.listen(Topic::Track, move |signal| {
            if let Signal::Track(request) = signal {
                if let Some(controller) = controller.upgrade() {
                    controller.track(request.clone());
                }
            }
        });
        let controller = Arc::downgrade(self);
        self.bus.listen(Topic::Error, move |signal| {
            if let Signal::Error(report) = signal {
                if let Some(controller) = controller.upgrade() {
                    controller.handle_error_event(report.clone());
                }
            }
        });

        let first_response = self.bus.once(Topic::InitialEntitlements);

        if let Some(publication) = &self.config.manual_init_publication {
            self.sdk.init(publication);
            // Manual mode does not auto-run the check.
            self.sdk.start_entitlements_check();
        }

        if options.disable_entitlements_check {
            if let Some(buttons) = &self.buttons {
                buttons.init();
            }
            return;
        }

        let cached = lock(&self.initial_entitlements).clone();
        let summary = match cached {
            Some(summary) => summary,
            None => match first_response.await {
                Ok(Signal::InitialEntitlements(summary)) => summary,
                _ => {
                    warn!("controller: bus dropped before the first entitlements response");
                    return;
                }
            },
        };

        if summary.granted && summary.json.is_some() {
            info!("controller: user already entitled, reconciling with backend");
            self.run_entitled_resolution(&summary).await;
        } else if summary.has_entitlements {
            // Wrong tier: no purchase path to offer, just say so. The
            // product selector already covers its own messaging.
            info!("controller: user entitled to a different tier");
            if !self.on_product_selector() {
                self.presenter.show(&UserNotice {
                    message: UPGRADE_UNAVAILABLE_NOTICE.to_string(),
                    action: None,
                });
            }
        } else if let Some(buttons) = &self.buttons {
            buttons.init();
        }
    }

    /// Re-run the entitlements check outside the init branch.
    pub async fn check_entitlements(&self) -> Result<EntitlementsSummary, SdkError> {
        let handle = self.sdk.entitlements().await?;
        Ok(EntitlementsSummary::from_handle(handle.as_ref()))
    }

    /// Derive the summary (acknowledging the check) and broadcast it.
    pub fn handle_entitlements_response(&self, outcome: EntitlementsOutcome) {
        match outcome {
            Ok(handle) => {
                let summary = EntitlementsSummary::from_handle(handle.as_ref());
                {
                    let mut slot = lock(&self.initial_entitlements);
                    if slot.is_none() {
                        *slot = Some(summary.clone());
                    }
                }
                self.bus.signal(Signal::InitialEntitlements(summary));
            }
            Err(err) => self.bus.signal_error(err.to_string(), Map::new()),
        }
    }

    /// Purchase flow settled. Success walks the full resolution pipeline;
    /// rejection is reported and tracked, never thrown.
    pub async fn handle_subscribe_response(self: &Arc<Self>, outcome: SubscribeOutcome) {
        let response = match outcome {
            Ok(response) => response,
            Err(rejection) => {
                self.report_flow_exit(&rejection);
                return;
            }
        };

        if let Some(buttons) = &self.buttons {
            buttons.disable_all();
        }
        self.bus.signal(Signal::SubscribeReturn(response.json()));
        self.track(TrackRequest {
            action: "success".to_string(),
            context: Map::new(),
            journey_start: false,
        });
        // The consent form clears this again; until then every resolution
        // pass and reload knows consent is still pending.
        self.cookies.set(
            &self.config.new_subscriber_cookie,
            "true",
            &self.config.publisher_domain,
        );

        match self
            .resolve_user(UserScenario::NewUser, response.json(), true)
            .await
        {
            Ok(resolution) => {
                if let Err(err) = response.complete().await {
                    warn!("purchase: flow completion acknowledgement failed: {err}");
                }
                self.track(TrackRequest {
                    action: "confirmed".to_string(),
                    context: Map::new(),
                    journey_start: false,
                });
                self.dispatch_resolved_subscribe(resolution);
            }
            Err(err) => {
                // The external client must still hear the flow ended, or
                // its UI hangs on the confirmation step.
                if let Err(complete_err) = response.complete().await {
                    warn!("purchase: flow completion acknowledgement failed: {complete_err}");
                }
                let mut context = Map::new();
                context.insert("stage".to_string(), "user-resolution".into());
                self.track(TrackRequest {
                    action: "failure".to_string(),
                    context,
                    journey_start: false,
                });
                self.subscription_error_journey();
                // Re-raise so the exit path records it too.
                self.report_flow_exit(&FlowRejection::new(err.to_string()));
            }
        }
    }

    fn report_flow_exit(&self, rejection: &FlowRejection) {
        self.bus.signal_error(rejection.message.clone(), Map::new());
        let mut context = Map::new();
        if let Some(activity) = &rejection.activity_result {
            if let Some(code) = &activity.code {
                context.insert("errCode".to_string(), code.clone().into());
            }
            if let Some(data) = &activity.data {
                context.insert("errData".to_string(), data.clone());
            }
        }
        self.track(TrackRequest {
            action: "exit".to_string(),
            context,
            journey_start: false,
        });
    }

    /// Flow lifecycle callbacks map the purchase flow onto actions the
    /// analytics side already understands.
    pub fn handle_flow_started(&self, flow: FlowInfo) {
        self.track(flow_track_request(&flow, true));
    }

    pub fn handle_flow_canceled(&self, flow: FlowInfo) {
        self.track(flow_track_request(&flow, false));
    }

    pub fn handle_login_request(&self) {
        let content_id = self.content_id_from_location();
        self.navigator
            .redirect_to(&self.login_url(content_id.as_deref()));
    }

    /// Reconcile an external-client result with the backend session
    /// service. Failures retry up to `MAX_RETRIES` times, tracking each
    /// attempt; once the budget is spent the last error is returned.
    pub async fn resolve_user(
        &self,
        scenario: UserScenario,
        payload: Value,
        create_session: bool,
    ) -> Result<UserResolution, FetchError> {
        let (endpoint, body) = match scenario {
            UserScenario::NewUser => (&self.config.subscription_endpoint, payload),
            UserScenario::EntitledUser => (
                &self.config.entitled_check_endpoint,
                serde_json::to_value(EntitledCheckRequest {
                    create_session,
                    swg: payload,
                })
                .unwrap_or(Value::Null),
            ),
        };

        let mut retries = 0u32;
        loop {
            match self.http.post_json(endpoint, &body).await {
                Ok(fetched) => {
                    let session: SessionResponse =
                        serde_json::from_value(fetched.json.clone()).unwrap_or_default();
                    let newly_created = session
                        .user_info
                        .map(|info| info.newly_created)
                        .unwrap_or(false);
                    let marker_present =
                        self.cookies.contains(&self.config.new_subscriber_cookie);
                    let consent_required = match &self.consent_rule {
                        Some(rule) => rule(&fetched.json, marker_present),
                        None => newly_created || marker_present,
                    };
                    return Ok(UserResolution {
                        consent_required,
                        login_required: scenario == UserScenario::EntitledUser && !create_session,
                        raw: fetched.json,
                    });
                }
                Err(err) if retries == MAX_RETRIES => {
                    error!("resolution: giving up after {retries} retries: {err}");
                    return Err(err);
                }
                Err(err) => {
                    retries += 1;
                    warn!(retries, "resolution: retrying after failure: {err}");
                    let mut context = Map::new();
                    context.insert("stage".to_string(), "user-resolution".into());
                    context.insert("retries".to_string(), retries.into());
                    self.track(TrackRequest {
                        action: "retry".to_string(),
                        context,
                        journey_start: false,
                    });
                }
            }
        }
    }

    /// Decorate and forward one tracking event. A journey start replaces
    /// the active offer context; it never merges into it.
    pub fn track(&self, request: TrackRequest) {
        if request.journey_start {
            let skus = tracking::skus_from_context(&request.context);
            let offer = tracking::offer_fields_from_skus(&skus, &self.config.publisher_domain);
            *lock(&self.active_tracking) = offer;
        }
        let event = {
            let active = lock(&self.active_tracking);
            tracking::compose_event(&self.base_tracking, &active, &request.context, &request.action)
        };
        self.tracking_sink.tracking_event(&event);
    }

    /// Every caught error is reported twice, in this order: structured to
    /// the error sink, then flattened onto the tracking sink as an `error`
    /// action.
    pub fn handle_error_event(&self, report: ErrorSignal) {
        let decorated = {
            let active = lock(&self.active_tracking);
            let mut info = self.base_tracking.clone();
            info.extend(active.clone());
            info.extend(report.info.clone());
            info
        };
        self.error_sink.report(&report.message, &decorated);

        let mut event = decorated;
        event.insert("error".to_string(), report.message.clone().into());
        event.insert("action".to_string(), "error".into());
        self.tracking_sink.tracking_event(&event);
    }

    /// A granted user is sitting on a barrier: reconcile them with the
    /// backend straight away and hand the outcome to the onward journey.
    async fn run_entitled_resolution(self: &Arc<Self>, summary: &EntitlementsSummary) {
        let payload = summary.json.clone().unwrap_or(Value::Null);
        match self
            .resolve_user(UserScenario::EntitledUser, payload, true)
            .await
        {
            Ok(resolution) => self.dispatch_resolved_entitlements(ResolvedEntitlements {
                prompt_login: false,
                resolution: Some(resolution),
                error: None,
            }),
            Err(err) => {
                self.bus.signal_error(err.to_string(), Map::new());
                self.dispatch_resolved_entitlements(ResolvedEntitlements {
                    prompt_login: true,
                    resolution: None,
                    error: Some(err.to_string()),
                });
            }
        }
    }

    fn dispatch_resolved_entitlements(&self, resolved: ResolvedEntitlements) {
        if let Some(handler) = &self.handlers.on_resolved_entitlements {
            handler(resolved);
        } else if !self.config.custom_onward_journey {
            self.entitled_onward_journey(&resolved);
        }
    }

    fn dispatch_resolved_subscribe(&self, resolution: UserResolution) {
        if let Some(handler) = &self.handlers.on_resolved_subscribe {
            handler(resolution);
        } else {
            self.subscribed_onward_journey(&resolution);
        }
    }

    /// Route an entitled user: a login prompt when no session exists,
    /// otherwise the consent form or the content itself.
    fn entitled_onward_journey(&self, resolved: &ResolvedEntitlements) {
        let content_id = self.content_id_from_location();
        let needs_login = resolved.prompt_login
            || resolved
                .resolution
                .as_ref()
                .is_some_and(|resolution| resolution.login_required);
        if needs_login {
            self.presenter.show(&UserNotice {
                message: AUTO_LOGIN_FAILED_NOTICE.to_string(),
                action: Some(NoticeAction {
                    label: "Go to the login page".to_string(),
                    url: self.login_url(content_id.as_deref()),
                }),
            });
            return;
        }

        let consent_required = resolved
            .resolution
            .as_ref()
            .is_some_and(|resolution| resolution.consent_required);
        let target = if consent_required {
            self.consent_url(content_id.as_deref())
        } else {
            self.content_url(content_id.as_deref())
        };
        self.navigator.redirect_to(&target);
    }

    /// Route a new subscriber: the consent form unless the backend says the
    /// account needs none.
    fn subscribed_onward_journey(&self, resolution: &UserResolution) {
        let content_id = self.content_id_from_location();
        let target = if resolution.consent_required {
            self.consent_url(content_id.as_deref())
        } else {
            self.content_url(content_id.as_deref())
        };
        self.navigator.redirect_to(&target);
    }

    /// Terminal purchase failure: leave the user something actionable
    /// rather than an indeterminate page.
    fn subscription_error_journey(&self) {
        self.presenter.show(&UserNotice {
            message: RESOLUTION_FAILED_NOTICE.to_string(),
            action: None,
        });
    }

    fn content_id_from_location(&self) -> Option<String> {
        self.navigator
            .current_url()
            .as_ref()
            .and_then(content_id_from_url)
    }

    fn login_url(&self, content_id: Option<&str>) -> Url {
        let mut url = self.config.login_url.clone();
        if let Some(content) = content_id.and_then(|id| self.config.content_base_url.join(id).ok())
        {
            url.query_pairs_mut()
                .append_pair("location", content.as_str());
        }
        url
    }

    fn consent_url(&self, content_id: Option<&str>) -> Url {
        let mut url = self.config.post_purchase_url.clone();
        if let Some(id) = content_id {
            url.query_pairs_mut().append_pair(CONTENT_ID_PARAM, id);
        }
        url
    }

    fn content_url(&self, content_id: Option<&str>) -> Url {
        content_id
            .and_then(|id| self.config.content_base_url.join(id).ok())
            .unwrap_or_else(|| self.config.homepage_url.clone())
    }

    fn on_product_selector(&self) -> bool {
        self.navigator
            .current_url()
            .is_some_and(|url| url.path().starts_with(PRODUCT_SELECTOR_PREFIX))
    }
}

fn flow_track_request(flow: &FlowInfo, started: bool) -> TrackRequest {
    let mut context = Map::new();
    context.insert("flowName".to_string(), flow.flow.clone().into());
    if let Some(sku) = &flow.sku {
        context.insert("skus".to_string(), json!([sku]));
    }
    // The analytics side already understands landing/exit; keep the
    // purchase flow on those names.
    let action = match (flow.flow.as_str(), started) {
        ("subscribe", true) => "landing",
        ("subscribe", false) => "exit",
        (_, true) => "flowStarted",
        (_, false) => "flowCanceled",
    };
    TrackRequest {
        action: action.to_string(),
        context,
        journey_start: started,
    }
}

/// Load the external client and build a controller around it: the one-call
/// entry point for host pages.
pub async fn connect(
    provider: &dyn SdkProvider,
    config: ControllerConfig,
    ports: ControllerPorts,
) -> Result<Arc<RevenueController>, ConnectError> {
    let sdk = provider
        .load(config.manual_init_publication.is_some(), config.sandbox)
        .await?;
    Ok(RevenueController::new_with_ports(sdk, config, ports)?)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
