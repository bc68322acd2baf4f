//! Target UI profile.
//!
//! Everything the engine knows about the target application lives here as
//! data: which locators prove which screen, where unread threads are, which
//! controls dismiss an overlay. The defaults describe the iOS messaging app
//! driven through Appium; a JSON file with the same shape replaces them.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::driver::{Locator, RelativePoint, SwipeDirection};
use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginProfile {
    pub url: String,
    pub username_field: Vec<Locator>,
    pub password_field: Vec<Locator>,
    pub submit: Vec<Locator>,
}

/// Plain-language descriptions handed to the vision provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionHints {
    pub inbox: String,
    pub thread_view: String,
    pub overlay: String,
    pub shared_content: String,
    pub dismiss_control: String,
    pub back_control: String,
    pub send_control: String,
    pub caption: String,
}

/// Last-resort tap targets, relative to the viewport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinateHints {
    pub dismiss: RelativePoint,
    pub back: RelativePoint,
    pub send: RelativePoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiProfile {
    pub inbox_deep_link: String,
    pub inbox_signals: Vec<Locator>,
    /// All must be present for the thread view to count as open.
    pub thread_signals: Vec<Locator>,
    pub overlay_signals: Vec<Locator>,
    /// Tried in order; the first locator that finds cells wins.
    pub unread_thread_locators: Vec<Locator>,
    pub thread_cell_locator: Locator,
    pub excluded_thread_labels: Vec<String>,
    pub message_text_locator: Locator,
    pub shared_content_locators: Vec<Locator>,
    pub caption_expand_locators: Vec<Locator>,
    pub caption_script: String,
    pub dismiss_locators: Vec<Locator>,
    pub dismiss_swipe: SwipeDirection,
    pub back_locators: Vec<Locator>,
    pub message_input: Locator,
    pub send_button: Locator,
    pub interruption_locators: Vec<Locator>,
    pub login: LoginProfile,
    /// Phrases that only ever appear in the agent's own replies.
    pub self_phrases: Vec<String>,
    pub vision: VisionHints,
    pub coordinates: CoordinateHints,
    /// Press duration for taps that open things; long presses open reaction menus.
    pub open_tap_duration_ms: u64,
}

impl UiProfile {
    pub fn load(path: &Path) -> AgentResult<Self> {
        let content = fs::read_to_string(path)?;
        let profile: UiProfile = serde_json::from_str(&content)?;
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> AgentResult<()> {
        if self.inbox_signals.is_empty() {
            return Err(AgentError::Config("profile needs at least one inbox signal".into()));
        }
        if self.thread_signals.is_empty() {
            return Err(AgentError::Config("profile needs at least one thread signal".into()));
        }
        if self.overlay_signals.is_empty() {
            return Err(AgentError::Config("profile needs at least one overlay signal".into()));
        }
        if self.unread_thread_locators.is_empty() {
            return Err(AgentError::Config("profile needs at least one unread thread locator".into()));
        }
        Ok(())
    }

    pub fn is_excluded_label(&self, label: &str) -> bool {
        let label = label.trim().to_lowercase();
        self.excluded_thread_labels.iter().any(|l| l.to_lowercase() == label)
    }
}

impl Default for UiProfile {
    fn default() -> Self {
        UiProfile {
            inbox_deep_link: "instagram://direct/inbox".to_string(),
            inbox_signals: vec![Locator::predicate("name == 'direct-inbox-view'")],
            thread_signals: vec![
                Locator::predicate("type == 'XCUIElementTypeTextView' AND visible == 1"),
                Locator::predicate("name == \"direct_thread_back_button\""),
            ],
            overlay_signals: vec![
                Locator::class_chain("**/XCUIElementTypeButton[`name == 'more-options-button'`]"),
                Locator::class_chain("**/XCUIElementTypeButton[`name == \"close-button\"`]"),
            ],
            unread_thread_locators: vec![
                Locator::xpath("//XCUIElementTypeCell[.//*[@name='Unseen']]"),
                Locator::class_chain("**/XCUIElementTypeCell[./**/XCUIElementTypeOther[`name CONTAINS \"Unseen\"`]]"),
            ],
            thread_cell_locator: Locator::class_chain(
                "**/XCUIElementTypeCell[./**/XCUIElementTypeStaticText[`name CONTAINS \"user-name-label\"`]]",
            ),
            excluded_thread_labels: vec![
                "audio-call".to_string(),
                "video-call".to_string(),
                "call".to_string(),
                "direct".to_string(),
            ],
            message_text_locator: Locator::class_name("XCUIElementTypeStaticText"),
            shared_content_locators: vec![
                Locator::class_chain("**/XCUIElementTypeCell[`name == \"ig-direct-portrait-xma-message-bubble-view\"`]"),
                Locator::class_chain("**/XCUIElementTypeCell[`name CONTAINS \"message-bubble\"`]"),
            ],
            caption_expand_locators: vec![
                Locator::class_chain("**/XCUIElementTypeLink[`name == \"…\"`]"),
                Locator::class_chain("**/XCUIElementTypeStaticText[`name CONTAINS \"More\"`]"),
            ],
            caption_script: "mobile: source".to_string(),
            dismiss_locators: vec![
                Locator::class_chain("**/XCUIElementTypeButton[`name == \"Back\" OR name == \"close-button\" OR label == \"Close\"`]"),
                Locator::predicate("name == 'Done'"),
                Locator::predicate("label == 'Dismiss'"),
            ],
            dismiss_swipe: SwipeDirection::Right,
            back_locators: vec![
                Locator::predicate("name == \"direct_thread_back_button\""),
                Locator::accessibility_id("direct_thread_back_button"),
                Locator::class_chain("**/XCUIElementTypeNavigationBar/**/XCUIElementTypeButton[1]"),
            ],
            message_input: Locator::predicate("type == 'XCUIElementTypeTextView' AND visible == 1"),
            send_button: Locator::class_chain("**/XCUIElementTypeButton[`name == \"send button\"`]"),
            interruption_locators: vec![
                Locator::predicate("label == 'Not Now'"),
                Locator::predicate("label == 'Skip'"),
                Locator::predicate("label == 'Not now'"),
            ],
            login: LoginProfile {
                url: "instagram://".to_string(),
                username_field: vec![
                    Locator::predicate("type == 'XCUIElementTypeTextField' AND visible == 1"),
                ],
                password_field: vec![
                    Locator::predicate("type == 'XCUIElementTypeSecureTextField' AND visible == 1"),
                ],
                submit: vec![Locator::predicate("label == 'Log in'")],
            },
            self_phrases: vec![
                "your recipe assistant".to_string(),
                "I'll extract the full recipe".to_string(),
                "turn it into a card for you".to_string(),
            ],
            vision: VisionHints {
                inbox: "The direct messages inbox list is visible".to_string(),
                thread_view: "A single conversation is open with a message input box at the bottom".to_string(),
                overlay: "A shared post is open full screen over the conversation".to_string(),
                shared_content: "the most recent shared post preview bubble in the conversation".to_string(),
                dismiss_control: "the close or back button of the open post".to_string(),
                back_control: "the back arrow at the top left of the conversation".to_string(),
                send_control: "the send button next to the message input".to_string(),
                caption: "Read the full caption text of the open post.".to_string(),
            },
            coordinates: CoordinateHints {
                dismiss: RelativePoint { x: 0.06, y: 0.07 },
                back: RelativePoint { x: 0.06, y: 0.07 },
                send: RelativePoint { x: 0.93, y: 0.94 },
            },
            open_tap_duration_ms: 100,
        }
    }
}
