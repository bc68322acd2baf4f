//! In-memory stand-ins for the automation backend, the vision provider and
//! the collaborators. The fake app has four screens and reacts to clicks,
//! taps, swipes and deep links roughly the way the real one does.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{
    ArtifactRef, ArtifactRenderer, Collaborators, ContentExtractor, DeliveryAck, DeliveryService, StructuredContent,
};
use crate::config::{AgentConfig, ChainSettings, StrategyTimeouts, VerifierSettings};
use crate::driver::{
    AutomationDriver, Bounds, DriverFactory, Element, Locator, LocatorKind, Point, RelativePoint, Snapshot,
    SwipeDirection, TapOptions,
};
use crate::error::{AgentError, AgentResult, DriverError};
use crate::ledger::{Ledger, LedgerOutcome};
use crate::processor::{ProcessorSettings, ThreadProcessor, UiContext};
use crate::profile::{CoordinateHints, LoginProfile, UiProfile, VisionHints};
use crate::retry::RetryConfig;
use crate::vision::{ElementPrediction, UiUnderstandingProvider, VisionVerdict};

pub const LONG_CAPTION: &str = "Creamy tuscan pasta. You need 200g penne, 2 cloves garlic, \
a cup of cream, sun dried tomatoes and a handful of spinach. Cook the pasta, fry the garlic, \
add cream and tomatoes, stir in spinach and serve.";

const PASSWORD: &str = "hunter2";
const SESSION_COOKIE: &str = "fake";
const LONG_PRESS_MS: u64 = 500;

fn id(value: &str) -> Locator {
    Locator::accessibility_id(value)
}

pub fn test_profile() -> UiProfile {
    UiProfile {
        inbox_deep_link: "app://inbox".to_string(),
        inbox_signals: vec![id("inbox-marker")],
        thread_signals: vec![id("thread-input"), id("thread-back")],
        overlay_signals: vec![id("overlay-marker")],
        unread_thread_locators: vec![id("no-such-cell"), id("unread-cell")],
        thread_cell_locator: id("thread-cell"),
        excluded_thread_labels: vec!["video-call".to_string(), "audio-call".to_string()],
        message_text_locator: id("message-text"),
        shared_content_locators: vec![id("shared-post")],
        caption_expand_locators: vec![id("caption-more")],
        caption_script: "mobile: source".to_string(),
        dismiss_locators: vec![id("dismiss")],
        dismiss_swipe: SwipeDirection::Right,
        back_locators: vec![id("thread-back")],
        message_input: id("thread-input"),
        send_button: id("send"),
        interruption_locators: vec![id("popup-not-now")],
        login: LoginProfile {
            url: "app://login".to_string(),
            username_field: vec![id("username")],
            password_field: vec![id("password")],
            submit: vec![id("login-button")],
        },
        self_phrases: vec!["turning this post into a recipe card".to_string()],
        vision: VisionHints {
            inbox: "inbox".to_string(),
            thread_view: "thread".to_string(),
            overlay: "overlay".to_string(),
            shared_content: "shared post".to_string(),
            dismiss_control: "close".to_string(),
            back_control: "back".to_string(),
            send_control: "send".to_string(),
            caption: "caption".to_string(),
        },
        coordinates: CoordinateHints {
            dismiss: RelativePoint { x: 0.05, y: 0.075 },
            back: RelativePoint { x: 0.05, y: 0.075 },
            send: RelativePoint { x: 0.95, y: 0.95 },
        },
        open_tap_duration_ms: 100,
    }
}

pub fn verifier_settings() -> VerifierSettings {
    VerifierSettings {
        timeout: Duration::from_millis(30),
        poll_interval: Duration::from_millis(5),
        settle_timeout: Duration::ZERO,
    }
}

pub fn fast_config() -> AgentConfig {
    let timeout = Duration::from_millis(500);
    AgentConfig {
        scan_interval: Duration::from_millis(10),
        cycle_timeout: Duration::from_secs(30),
        max_retries_per_transition: 3,
        chain: ChainSettings {
            timeouts: StrategyTimeouts { structural: timeout, script: timeout, vision: timeout, coordinate: timeout },
            ..ChainSettings::default()
        },
        verifier: verifier_settings(),
        login_retry: RetryConfig { max_attempts: 2, base_delay_ms: 1, max_delay_ms: 5, backoff_multiplier: 2.0 },
        extraction_timeout: Duration::from_millis(50),
        extraction_retries: 1,
        min_caption_chars: 20,
        delivery_destination: "cards/{thread}".to_string(),
        ..AgentConfig::default()
    }
}

pub fn ui_with(driver: &Arc<FakeDriver>, verdict: VisionVerdict, chain: ChainSettings) -> UiContext {
    let mut config = fast_config();
    config.chain = ChainSettings { timeouts: config.chain.timeouts.clone(), ..chain };
    UiContext::new(driver.clone(), Arc::new(FakeVision::new(verdict)), Arc::new(test_profile()), &config)
}

// =====================================================
// Fake app
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Screen {
    Login,
    Inbox,
    Thread,
    Overlay,
}

#[derive(Debug, Clone)]
struct FakeThread {
    name: String,
    unread: bool,
    has_post: bool,
    latest: String,
}

#[derive(Debug)]
struct AppState {
    screen: Screen,
    logged_in: bool,
    password: String,
    popup_visible: bool,
    threads: Vec<FakeThread>,
    open_thread: Option<usize>,
    hide_back: bool,
    dismiss_works: bool,
    swipe_dismisses: bool,
    navigate_works: bool,
    send_works: bool,
    post_opens: bool,
    hide_overlay_marker: bool,
    /// Cancelled as soon as a matching action is recorded.
    cancel_on: Option<(String, CancellationToken)>,
    dead: bool,
    quit: bool,
    typed_password: Option<String>,
    input: String,
    /// Sent texts with the thread they went to.
    sent: Vec<(Option<usize>, String)>,
    typed: Vec<String>,
    actions: Vec<String>,
    long_presses: usize,
}

pub struct FakeDriver {
    state: Mutex<AppState>,
}

fn bounds(x: i32, y: i32, width: i32, height: i32) -> Option<Bounds> {
    Some(Bounds { x, y, width, height })
}

fn element(id: &str, text: &str, b: Option<Bounds>) -> Element {
    Element { id: id.to_string(), text: text.to_string(), bounds: b }
}

impl FakeDriver {
    /// Logged in, on the inbox.
    pub fn new() -> Self {
        let driver = Self::logged_out(PASSWORD);
        {
            let mut state = driver.state();
            state.logged_in = true;
            state.screen = Screen::Inbox;
        }
        driver
    }

    /// On the login screen; only `password` gets through.
    pub fn logged_out(password: &str) -> Self {
        Self {
            state: Mutex::new(AppState {
                screen: Screen::Login,
                logged_in: false,
                password: password.to_string(),
                popup_visible: false,
                threads: Vec::new(),
                open_thread: None,
                hide_back: false,
                dismiss_works: true,
                swipe_dismisses: true,
                navigate_works: true,
                send_works: true,
                post_opens: true,
                hide_overlay_marker: false,
                cancel_on: None,
                dead: false,
                quit: false,
                typed_password: None,
                input: String::new(),
                sent: Vec::new(),
                typed: Vec::new(),
                actions: Vec::new(),
                long_presses: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, AppState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_thread(&self, name: &str, unread: bool, has_post: bool) {
        self.state().threads.push(FakeThread {
            name: name.to_string(),
            unread,
            has_post,
            latest: "Check out this recipe!".to_string(),
        });
    }

    pub fn set_latest_message(&self, name: &str, text: &str) {
        if let Some(thread) = self.state().threads.iter_mut().find(|t| t.name == name) {
            thread.latest = text.to_string();
        }
    }

    pub fn set_screen(&self, screen: Screen) {
        self.state().screen = screen;
    }

    pub fn screen(&self) -> Screen {
        self.state().screen
    }

    pub fn hide_thread_back_button(&self, hidden: bool) {
        self.state().hide_back = hidden;
    }

    pub fn set_dismiss_works(&self, works: bool) {
        self.state().dismiss_works = works;
    }

    pub fn set_swipe_dismisses(&self, works: bool) {
        self.state().swipe_dismisses = works;
    }

    pub fn set_navigate_works(&self, works: bool) {
        self.state().navigate_works = works;
    }

    pub fn set_send_works(&self, works: bool) {
        self.state().send_works = works;
    }

    /// Tapping the shared post does nothing.
    pub fn set_post_opens(&self, opens: bool) {
        self.state().post_opens = opens;
    }

    /// The overlay opens without its marker, so it cannot be confirmed structurally.
    pub fn hide_overlay_marker(&self, hidden: bool) {
        self.state().hide_overlay_marker = hidden;
    }

    pub fn cancel_on(&self, pattern: &str, token: CancellationToken) {
        self.state().cancel_on = Some((pattern.to_string(), token));
    }

    /// A message already in the open thread, as if sent earlier.
    pub fn show_sent_message(&self, text: &str) {
        let mut state = self.state();
        let thread = state.open_thread;
        state.sent.push((thread, text.to_string()));
    }

    pub fn kill_session(&self) {
        self.state().dead = true;
    }

    pub fn actions(&self) -> Vec<String> {
        self.state().actions.clone()
    }

    /// Actions equal to `pattern` or starting with `pattern:`.
    pub fn count_actions(&self, pattern: &str) -> usize {
        let prefix = format!("{}:", pattern);
        self.state()
            .actions
            .iter()
            .filter(|a| a.as_str() == pattern || a.starts_with(&prefix))
            .count()
    }

    /// Clicks or taps that landed on the overlay's dismiss control.
    pub fn dismiss_clicks(&self) -> usize {
        self.count_actions("click:dismiss") + self.count_actions("tap:dismiss")
    }

    pub fn typed(&self) -> Vec<String> {
        self.state().typed.clone()
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.state().sent.iter().map(|(_, text)| text.clone()).collect()
    }

    pub fn long_presses(&self) -> usize {
        self.state().long_presses
    }

    pub fn quit_called(&self) -> bool {
        self.state().quit
    }

    pub fn unread_count(&self) -> usize {
        self.state().threads.iter().filter(|t| t.unread).count()
    }

    fn alive(&self) -> Result<MutexGuard<'_, AppState>, DriverError> {
        let state = self.state();
        if state.dead {
            return Err(DriverError::InvalidSession("session terminated".into()));
        }
        Ok(state)
    }
}

impl AppState {
    /// Everything on screen, front-most first.
    fn visible(&self) -> Vec<(&'static str, Element)> {
        let mut out = Vec::new();
        if self.popup_visible {
            out.push(("popup-not-now", element("popup-not-now", "Not Now", bounds(100, 400, 200, 40))));
        }
        match self.screen {
            Screen::Login => {
                out.push(("username", element("username", "", bounds(40, 200, 320, 40))));
                out.push(("password", element("password", "", bounds(40, 260, 320, 40))));
                out.push(("login-button", element("login-button", "Log in", bounds(40, 320, 320, 40))));
            }
            Screen::Inbox => {
                out.push(("inbox-marker", element("inbox-marker", "Chats", bounds(0, 0, 400, 40))));
                for (i, thread) in self.threads.iter().enumerate() {
                    let cell = element(&format!("cell-{}", i), &thread.name, bounds(0, 100 + i as i32 * 80, 400, 72));
                    if thread.unread {
                        out.push(("unread-cell", cell.clone()));
                    }
                    out.push(("thread-cell", cell));
                }
            }
            Screen::Thread => {
                if !self.hide_back {
                    out.push(("thread-back", element("thread-back", "Back", bounds(0, 40, 40, 40))));
                }
                out.push(("send", element("send", "Send", bounds(360, 740, 40, 40))));
                out.push(("thread-input", element("thread-input", &self.input, bounds(0, 740, 350, 40))));
                if let Some(thread) = self.open_thread.and_then(|i| self.threads.get(i)) {
                    out.push(("message-text", element("latest", &thread.latest, bounds(0, 480, 300, 20))));
                    if thread.has_post {
                        out.push(("shared-post", element("post", "Shared post", bounds(40, 520, 200, 120))));
                    }
                }
                let here = self.sent.iter().filter(|(thread, _)| *thread == self.open_thread);
                for (i, (_, text)) in here.enumerate() {
                    let y = 660 + i as i32 * 10;
                    out.push(("message-text", element(&format!("sent-{}", i), text, bounds(100, y, 300, 10))));
                }
            }
            Screen::Overlay => {
                out.push(("dismiss", element("dismiss", "Close", bounds(0, 40, 40, 40))));
                if !self.hide_overlay_marker {
                    out.push(("overlay-marker", element("overlay-marker", "More", bounds(300, 40, 100, 40))));
                }
                out.push(("caption-more", element("caption-more", "more", bounds(300, 700, 60, 20))));
                out.push(("message-text", element("caption", LONG_CAPTION, bounds(0, 600, 400, 100))));
                out.push(("message-text", element("likes", "Like", bounds(0, 720, 100, 20))));
            }
        }
        out
    }

    fn activate(&mut self, target: &str) {
        match target {
            "popup-not-now" => self.popup_visible = false,
            "login-button" => {
                if self.typed_password.as_deref() == Some(self.password.as_str()) {
                    self.logged_in = true;
                    self.screen = Screen::Inbox;
                    self.popup_visible = true;
                }
            }
            "thread-back" if self.screen == Screen::Thread => self.close_thread(),
            "dismiss" if self.screen == Screen::Overlay && self.dismiss_works => self.screen = Screen::Thread,
            "post" if self.screen == Screen::Thread && self.post_opens => self.screen = Screen::Overlay,
            "send" if self.send_works && !self.input.is_empty() => {
                let text = std::mem::take(&mut self.input);
                self.sent.push((self.open_thread, text));
            }
            other => {
                if let Some(index) = other.strip_prefix("cell-").and_then(|i| i.parse::<usize>().ok()) {
                    if index < self.threads.len() {
                        self.threads[index].unread = false;
                        self.open_thread = Some(index);
                        self.screen = Screen::Thread;
                    }
                }
            }
        }
    }

    fn record(&mut self, action: String) {
        if let Some((pattern, token)) = &self.cancel_on {
            if action == *pattern || action.starts_with(&format!("{}:", pattern)) {
                token.cancel();
            }
        }
        self.actions.push(action);
    }

    fn close_thread(&mut self) {
        self.screen = Screen::Inbox;
        self.open_thread = None;
    }
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AutomationDriver for FakeDriver {
    async fn locate(&self, locator: &Locator) -> Result<Vec<Element>, DriverError> {
        let state = self.alive()?;
        if locator.kind != LocatorKind::AccessibilityId {
            return Err(DriverError::Protocol(format!("unsupported locator {}", locator)));
        }
        Ok(state
            .visible()
            .into_iter()
            .filter(|(name, _)| *name == locator.value)
            .map(|(_, e)| e)
            .collect())
    }

    async fn click(&self, element: &Element) -> Result<(), DriverError> {
        let mut state = self.alive()?;
        state.record(format!("click:{}", element.id));
        state.activate(&element.id);
        Ok(())
    }

    async fn tap(&self, point: Point, options: TapOptions) -> Result<(), DriverError> {
        let mut state = self.alive()?;
        if options.duration_ms >= LONG_PRESS_MS {
            state.long_presses += 1;
            state.record(format!("tap:long@{},{}", point.x, point.y));
            return Ok(());
        }
        let hit = state
            .visible()
            .into_iter()
            .find(|(_, e)| e.bounds.map(|b| b.contains(point)).unwrap_or(false))
            .map(|(_, e)| e.id);
        match hit {
            Some(target) => {
                state.record(format!("tap:{}", target));
                state.activate(&target);
            }
            None => state.record(format!("tap:@{},{}", point.x, point.y)),
        }
        Ok(())
    }

    async fn type_text(&self, element: &Element, text: &str) -> Result<(), DriverError> {
        let mut state = self.alive()?;
        state.record(format!("type:{}", element.id));
        state.typed.push(text.to_string());
        match element.id.as_str() {
            "password" => state.typed_password = Some(text.to_string()),
            "thread-input" => state.input = text.to_string(),
            _ => {}
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str, _args: Vec<Value>) -> Result<Value, DriverError> {
        let mut state = self.alive()?;
        state.record(format!("evaluate:{}", script));
        if state.screen == Screen::Overlay {
            let escaped = LONG_CAPTION.replace('&', "&amp;");
            return Ok(Value::String(format!(
                r#"<AppRoot><Text name="Like" /><Text value="{}" /></AppRoot>"#,
                escaped
            )));
        }
        Ok(Value::Null)
    }

    async fn swipe(&self, direction: SwipeDirection) -> Result<(), DriverError> {
        let mut state = self.alive()?;
        state.record(format!("swipe:{}", direction.as_str()));
        if direction == SwipeDirection::Right {
            match state.screen {
                Screen::Overlay if state.swipe_dismisses => state.screen = Screen::Thread,
                Screen::Thread => state.close_thread(),
                _ => {}
            }
        }
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let mut state = self.alive()?;
        state.record(format!("navigate:{}", url));
        if !state.navigate_works {
            return Ok(());
        }
        if state.logged_in {
            state.close_thread();
        } else {
            state.screen = Screen::Login;
        }
        Ok(())
    }

    async fn viewport(&self) -> Result<Bounds, DriverError> {
        let _state = self.alive()?;
        Ok(Bounds { x: 0, y: 0, width: 400, height: 800 })
    }

    async fn screenshot(&self) -> Result<String, DriverError> {
        let _state = self.alive()?;
        Err(DriverError::Protocol("fake driver has no screen".into()))
    }

    async fn cookies(&self) -> Result<Vec<Value>, DriverError> {
        let state = self.alive()?;
        if state.logged_in {
            Ok(vec![json!({ "name": "sessionid", "value": SESSION_COOKIE })])
        } else {
            Ok(Vec::new())
        }
    }

    async fn set_cookies(&self, cookies: &[Value]) -> Result<(), DriverError> {
        let mut state = self.alive()?;
        let valid = cookies
            .iter()
            .any(|c| c["name"] == "sessionid" && c["value"] == SESSION_COOKIE);
        if valid {
            state.logged_in = true;
        }
        Ok(())
    }

    async fn quit(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        state.quit = true;
        state.dead = true;
        Ok(())
    }
}

/// Hands out logged-out fake drivers and keeps them for inspection.
pub struct FakeFactory {
    password: String,
    drivers: Mutex<Vec<Arc<FakeDriver>>>,
    threads: Mutex<Vec<(String, bool, bool)>>,
}

impl FakeFactory {
    pub fn new(password: &str) -> Self {
        Self { password: password.to_string(), drivers: Mutex::new(Vec::new()), threads: Mutex::new(Vec::new()) }
    }

    /// Threads every new driver starts with.
    pub fn with_thread(self, name: &str, unread: bool, has_post: bool) -> Self {
        self.threads.lock().unwrap_or_else(|p| p.into_inner()).push((name.to_string(), unread, has_post));
        self
    }

    pub fn created(&self) -> usize {
        self.drivers.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn driver(&self, index: usize) -> Option<Arc<FakeDriver>> {
        self.drivers.lock().unwrap_or_else(|p| p.into_inner()).get(index).cloned()
    }

    pub fn last(&self) -> Option<Arc<FakeDriver>> {
        self.drivers.lock().unwrap_or_else(|p| p.into_inner()).last().cloned()
    }
}

#[async_trait]
impl DriverFactory for FakeFactory {
    async fn create(&self) -> Result<Arc<dyn AutomationDriver>, DriverError> {
        let driver = Arc::new(FakeDriver::logged_out(&self.password));
        for (name, unread, has_post) in self.threads.lock().unwrap_or_else(|p| p.into_inner()).iter() {
            driver.add_thread(name, *unread, *has_post);
        }
        self.drivers.lock().unwrap_or_else(|p| p.into_inner()).push(driver.clone());
        Ok(driver)
    }
}

// =====================================================
// Fake vision
// =====================================================

pub struct FakeVision {
    verdict: VisionVerdict,
    point: Option<ElementPrediction>,
}

impl FakeVision {
    pub fn new(verdict: VisionVerdict) -> Self {
        Self { verdict, point: None }
    }

    pub fn pointing_at(verdict: VisionVerdict, point: Point, confidence: f32) -> Self {
        Self { verdict, point: Some(ElementPrediction { point, confidence }) }
    }
}

#[async_trait]
impl UiUnderstandingProvider for FakeVision {
    fn name(&self) -> &str {
        "fake"
    }

    async fn locate(&self, _snapshot: &Snapshot, _description: &str) -> AgentResult<Option<ElementPrediction>> {
        Ok(self.point)
    }

    async fn assess(&self, _snapshot: &Snapshot, _condition: &str) -> AgentResult<VisionVerdict> {
        Ok(self.verdict)
    }

    async fn read_text(&self, _snapshot: &Snapshot, _instruction: &str) -> AgentResult<Option<String>> {
        Ok(None)
    }
}

// =====================================================
// Fake collaborators
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExtractorMode {
    Succeed,
    Fail,
    Hang,
}

pub struct FakeExtractor {
    driver: Arc<FakeDriver>,
    mode: ExtractorMode,
    inputs: Mutex<Vec<String>>,
    screens: Mutex<Vec<Screen>>,
}

impl FakeExtractor {
    fn with_mode(driver: &Arc<FakeDriver>, mode: ExtractorMode) -> Self {
        Self { driver: driver.clone(), mode, inputs: Mutex::new(Vec::new()), screens: Mutex::new(Vec::new()) }
    }

    pub fn succeeding(driver: &Arc<FakeDriver>) -> Self {
        Self::with_mode(driver, ExtractorMode::Succeed)
    }

    pub fn failing(driver: &Arc<FakeDriver>) -> Self {
        Self::with_mode(driver, ExtractorMode::Fail)
    }

    pub fn hanging(driver: &Arc<FakeDriver>) -> Self {
        Self::with_mode(driver, ExtractorMode::Hang)
    }

    pub fn calls(&self) -> usize {
        self.inputs.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn raw_inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Screen the fake app showed when each call started.
    pub fn screens_at_call(&self) -> Vec<Screen> {
        self.screens.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl ContentExtractor for FakeExtractor {
    async fn extract(&self, raw_text: &str) -> AgentResult<Option<StructuredContent>> {
        self.inputs.lock().unwrap_or_else(|p| p.into_inner()).push(raw_text.to_string());
        self.screens.lock().unwrap_or_else(|p| p.into_inner()).push(self.driver.screen());
        match self.mode {
            ExtractorMode::Succeed => Ok(Some(StructuredContent {
                title: Some("Creamy tuscan pasta".into()),
                data: json!({ "ingredients": ["penne", "garlic", "cream"] }),
            })),
            ExtractorMode::Fail => Err(AgentError::Extraction("model refused".into())),
            ExtractorMode::Hang => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(None)
            }
        }
    }
}

#[derive(Default)]
pub struct FakeRenderer {
    rendered: Mutex<Vec<StructuredContent>>,
}

impl FakeRenderer {
    pub fn calls(&self) -> usize {
        self.rendered.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

#[async_trait]
impl ArtifactRenderer for FakeRenderer {
    async fn render(&self, content: &StructuredContent) -> AgentResult<ArtifactRef> {
        let mut rendered = self.rendered.lock().unwrap_or_else(|p| p.into_inner());
        rendered.push(content.clone());
        Ok(ArtifactRef { id: format!("card-{}", rendered.len()), url: None })
    }
}

#[derive(Default)]
pub struct FakeDelivery {
    delivered: Mutex<Vec<(String, String)>>,
}

impl FakeDelivery {
    pub fn calls(&self) -> usize {
        self.delivered.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn destinations(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(_, d)| d.clone())
            .collect()
    }
}

#[async_trait]
impl DeliveryService for FakeDelivery {
    async fn deliver(&self, artifact: &ArtifactRef, destination: &str) -> AgentResult<DeliveryAck> {
        self.delivered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((artifact.id.clone(), destination.to_string()));
        Ok(DeliveryAck { id: format!("ack-{}", artifact.id) })
    }
}

pub struct FakeCollaborators {
    pub extractor: Arc<FakeExtractor>,
    pub renderer: Arc<FakeRenderer>,
    pub delivery: Arc<FakeDelivery>,
}

impl FakeCollaborators {
    pub fn new(extractor: FakeExtractor) -> Self {
        Self {
            extractor: Arc::new(extractor),
            renderer: Arc::new(FakeRenderer::default()),
            delivery: Arc::new(FakeDelivery::default()),
        }
    }

    pub fn handles(&self) -> Collaborators {
        Collaborators {
            extractor: self.extractor.clone(),
            renderer: self.renderer.clone(),
            delivery: self.delivery.clone(),
        }
    }
}

/// A processor wired to a fake app, an in-memory ledger and fake collaborators.
pub struct Fixture {
    pub ui: UiContext,
    pub processor: ThreadProcessor,
    pub ledger: Arc<Ledger>,
    pub extractor: Arc<FakeExtractor>,
    pub renderer: Arc<FakeRenderer>,
    pub delivery: Arc<FakeDelivery>,
}

impl Fixture {
    pub fn new(driver: &Arc<FakeDriver>, verdict: VisionVerdict) -> Self {
        Self::build(driver, verdict, fast_config(), FakeExtractor::succeeding(driver))
    }

    pub fn with_extractor(driver: &Arc<FakeDriver>, verdict: VisionVerdict, extractor: FakeExtractor) -> Self {
        Self::build(driver, verdict, fast_config(), extractor)
    }

    pub fn with_config(driver: &Arc<FakeDriver>, verdict: VisionVerdict, config: AgentConfig) -> Self {
        Self::build(driver, verdict, config, FakeExtractor::succeeding(driver))
    }

    fn build(driver: &Arc<FakeDriver>, verdict: VisionVerdict, config: AgentConfig, extractor: FakeExtractor) -> Self {
        let ledger = Arc::new(Ledger::in_memory().expect("in-memory ledger"));
        let fakes = FakeCollaborators::new(extractor);
        let ui = UiContext::new(driver.clone(), Arc::new(FakeVision::new(verdict)), Arc::new(test_profile()), &config);
        let processor = ThreadProcessor::new(ledger.clone(), fakes.handles(), ProcessorSettings::from_config(&config));
        Self {
            ui,
            processor,
            ledger,
            extractor: fakes.extractor,
            renderer: fakes.renderer,
            delivery: fakes.delivery,
        }
    }

    pub fn ledger_outcomes(&self, thread_id: &str) -> Vec<LedgerOutcome> {
        self.ledger
            .thread_entries(thread_id)
            .expect("ledger readable")
            .into_iter()
            .map(|e| e.outcome)
            .collect()
    }
}
