//! Logical actions and the concrete techniques that can carry them out.
//!
//! A `LogicalAction` names an intent. An `ActionPlan` lists the candidate
//! techniques for one concrete occurrence of that intent, each tagged with the
//! `InteractionStrategy` family it belongs to. The chain decides the order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::driver::{Bounds, Element, Locator, RelativePoint, SwipeDirection};
use crate::profile::UiProfile;
use crate::verifier::{ExpectedState, VerificationOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalAction {
    OpenThread,
    ExpandContentPreview,
    ExtractCaption,
    ExitContentView,
    SendReply,
    ReturnToInbox,
}

impl fmt::Display for LogicalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogicalAction::OpenThread => "open_thread",
            LogicalAction::ExpandContentPreview => "expand_content_preview",
            LogicalAction::ExtractCaption => "extract_caption",
            LogicalAction::ExitContentView => "exit_content_view",
            LogicalAction::SendReply => "send_reply",
            LogicalAction::ReturnToInbox => "return_to_inbox",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InteractionStrategy {
    StructuralLocate,
    ScriptEvaluate,
    VisionGuidedLocate,
    CoordinateFallback,
}

impl InteractionStrategy {
    pub const ALL: [InteractionStrategy; 4] = [
        InteractionStrategy::StructuralLocate,
        InteractionStrategy::ScriptEvaluate,
        InteractionStrategy::VisionGuidedLocate,
        InteractionStrategy::CoordinateFallback,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionStrategy::StructuralLocate => "structural",
            InteractionStrategy::ScriptEvaluate => "script",
            InteractionStrategy::VisionGuidedLocate => "vision",
            InteractionStrategy::CoordinateFallback => "coordinate",
        }
    }

    pub fn needs_screenshot(&self) -> bool {
        matches!(self, InteractionStrategy::VisionGuidedLocate)
    }
}

impl fmt::Display for InteractionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "structural" | "structural_locate" => Ok(InteractionStrategy::StructuralLocate),
            "script" | "script_evaluate" => Ok(InteractionStrategy::ScriptEvaluate),
            "vision" | "vision_guided_locate" => Ok(InteractionStrategy::VisionGuidedLocate),
            "coordinate" | "coordinate_fallback" => Ok(InteractionStrategy::CoordinateFallback),
            other => Err(format!("unknown interaction strategy '{}'", other)),
        }
    }
}

/// One concrete way of doing something on screen.
#[derive(Debug, Clone)]
pub enum Technique {
    ClickFirst(Vec<Locator>),
    ClickElement(Element),
    TapLocatorCenter { locators: Vec<Locator>, duration_ms: u64 },
    TapBounds { bounds: Bounds, duration_ms: u64 },
    TapRelative { point: RelativePoint, duration_ms: u64 },
    VisionTap { description: String, duration_ms: u64 },
    Evaluate { script: String },
    Swipe(SwipeDirection),
    Navigate(String),
    TypeAndSubmit { input: Locator, submit: Locator, text: String },
    TypeThenVisionSubmit { input: Locator, submit_description: String, text: String },
    TypeThenTapRelative { input: Locator, submit: RelativePoint, text: String },
    ReadLongestText { locator: Locator, expand: Vec<Locator>, min_chars: usize },
    ReadByScript { script: String },
    VisionRead { instruction: String },
    SwipeThenRead { direction: SwipeDirection, locator: Locator, min_chars: usize },
}

impl Technique {
    pub fn label(&self) -> &'static str {
        match self {
            Technique::ClickFirst(_) => "click_first",
            Technique::ClickElement(_) => "click_element",
            Technique::TapLocatorCenter { .. } => "tap_locator_center",
            Technique::TapBounds { .. } => "tap_bounds",
            Technique::TapRelative { .. } => "tap_relative",
            Technique::VisionTap { .. } => "vision_tap",
            Technique::Evaluate { .. } => "evaluate",
            Technique::Swipe(_) => "swipe",
            Technique::Navigate(_) => "navigate",
            Technique::TypeAndSubmit { .. } => "type_and_submit",
            Technique::TypeThenVisionSubmit { .. } => "type_then_vision_submit",
            Technique::TypeThenTapRelative { .. } => "type_then_tap_relative",
            Technique::ReadLongestText { .. } => "read_longest_text",
            Technique::ReadByScript { .. } => "read_by_script",
            Technique::VisionRead { .. } => "vision_read",
            Technique::SwipeThenRead { .. } => "swipe_then_read",
        }
    }

    /// Whether a repeat of this technique has a visible side effect.
    pub fn mutates_ui(&self) -> bool {
        !matches!(
            self,
            Technique::ReadLongestText { .. } | Technique::ReadByScript { .. } | Technique::VisionRead { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct StrategyStep {
    pub strategy: InteractionStrategy,
    pub technique: Technique,
}

impl StrategyStep {
    pub fn new(strategy: InteractionStrategy, technique: Technique) -> Self {
        Self { strategy, technique }
    }
}

/// Everything needed to carry out one logical action.
#[derive(Debug, Clone)]
pub struct ActionPlan {
    pub action: LogicalAction,
    pub expected: ExpectedState,
    pub steps: Vec<StrategyStep>,
}

impl ActionPlan {
    pub fn new(action: LogicalAction, expected: ExpectedState) -> Self {
        Self { action, expected, steps: Vec::new() }
    }

    pub fn step(mut self, strategy: InteractionStrategy, technique: Technique) -> Self {
        self.steps.push(StrategyStep::new(strategy, technique));
        self
    }

    /// Steps in the configured priority order. Strategies missing from
    /// `order` are disabled; ties keep plan order.
    pub fn ordered_steps(&self, order: &[InteractionStrategy]) -> Vec<&StrategyStep> {
        let mut steps: Vec<(usize, &StrategyStep)> = self
            .steps
            .iter()
            .filter_map(|s| order.iter().position(|o| *o == s.strategy).map(|rank| (rank, s)))
            .collect();
        steps.sort_by_key(|(rank, _)| *rank);
        steps.into_iter().map(|(_, s)| s).collect()
    }

    pub fn open_thread(profile: &UiProfile, cell: &Element) -> Self {
        let duration_ms = profile.open_tap_duration_ms;
        let mut plan = ActionPlan::new(LogicalAction::OpenThread, ExpectedState::ThreadView)
            .step(InteractionStrategy::StructuralLocate, Technique::ClickElement(cell.clone()))
            .step(
                InteractionStrategy::VisionGuidedLocate,
                Technique::VisionTap {
                    description: format!("the conversation row for '{}'", cell.text.lines().next().unwrap_or_default()),
                    duration_ms,
                },
            );
        if let Some(bounds) = cell.bounds {
            plan = plan.step(InteractionStrategy::CoordinateFallback, Technique::TapBounds { bounds, duration_ms });
        }
        plan
    }

    pub fn expand_content_preview(profile: &UiProfile, preview: &Element) -> Self {
        let duration_ms = profile.open_tap_duration_ms;
        let mut plan = ActionPlan::new(LogicalAction::ExpandContentPreview, ExpectedState::OverlayPresent)
            .step(
                InteractionStrategy::StructuralLocate,
                Technique::TapLocatorCenter { locators: profile.shared_content_locators.clone(), duration_ms },
            )
            .step(
                InteractionStrategy::VisionGuidedLocate,
                Technique::VisionTap { description: profile.vision.shared_content.clone(), duration_ms },
            );
        if let Some(bounds) = preview.bounds {
            plan = plan.step(InteractionStrategy::CoordinateFallback, Technique::TapBounds { bounds, duration_ms });
        }
        plan
    }

    pub fn extract_caption(profile: &UiProfile, min_chars: usize) -> Self {
        ActionPlan::new(LogicalAction::ExtractCaption, ExpectedState::TextCaptured { min_chars })
            .step(
                InteractionStrategy::StructuralLocate,
                Technique::ReadLongestText {
                    locator: profile.message_text_locator.clone(),
                    expand: profile.caption_expand_locators.clone(),
                    min_chars,
                },
            )
            .step(
                InteractionStrategy::ScriptEvaluate,
                Technique::ReadByScript { script: profile.caption_script.clone() },
            )
            .step(
                InteractionStrategy::VisionGuidedLocate,
                Technique::VisionRead { instruction: profile.vision.caption.clone() },
            )
            .step(
                InteractionStrategy::CoordinateFallback,
                Technique::SwipeThenRead {
                    direction: SwipeDirection::Up,
                    locator: profile.message_text_locator.clone(),
                    min_chars,
                },
            )
    }

    pub fn exit_content_view(profile: &UiProfile) -> Self {
        ActionPlan::new(LogicalAction::ExitContentView, ExpectedState::OverlayAbsent)
            .step(InteractionStrategy::StructuralLocate, Technique::ClickFirst(profile.dismiss_locators.clone()))
            .step(InteractionStrategy::StructuralLocate, Technique::Swipe(profile.dismiss_swipe))
            .step(InteractionStrategy::ScriptEvaluate, Technique::Navigate(profile.inbox_deep_link.clone()))
            .step(
                InteractionStrategy::VisionGuidedLocate,
                Technique::VisionTap {
                    description: profile.vision.dismiss_control.clone(),
                    duration_ms: profile.open_tap_duration_ms,
                },
            )
            .step(
                InteractionStrategy::CoordinateFallback,
                Technique::TapRelative {
                    point: profile.coordinates.dismiss,
                    duration_ms: profile.open_tap_duration_ms,
                },
            )
    }

    pub fn return_to_inbox(profile: &UiProfile) -> Self {
        ActionPlan::new(LogicalAction::ReturnToInbox, ExpectedState::Inbox)
            .step(InteractionStrategy::StructuralLocate, Technique::ClickFirst(profile.back_locators.clone()))
            .step(InteractionStrategy::ScriptEvaluate, Technique::Navigate(profile.inbox_deep_link.clone()))
            .step(
                InteractionStrategy::VisionGuidedLocate,
                Technique::VisionTap {
                    description: profile.vision.back_control.clone(),
                    duration_ms: profile.open_tap_duration_ms,
                },
            )
            .step(
                InteractionStrategy::CoordinateFallback,
                Technique::TapRelative { point: profile.coordinates.back, duration_ms: profile.open_tap_duration_ms },
            )
    }

    /// `baseline` is how many bubbles already showed the reply before sending.
    pub fn send_reply(profile: &UiProfile, text: &str, baseline: usize) -> Self {
        let expected = ExpectedState::ReplyVisible { snippet: reply_snippet(text), baseline };
        ActionPlan::new(LogicalAction::SendReply, expected)
            .step(
                InteractionStrategy::StructuralLocate,
                Technique::TypeAndSubmit {
                    input: profile.message_input.clone(),
                    submit: profile.send_button.clone(),
                    text: text.to_string(),
                },
            )
            .step(
                InteractionStrategy::VisionGuidedLocate,
                Technique::TypeThenVisionSubmit {
                    input: profile.message_input.clone(),
                    submit_description: profile.vision.send_control.clone(),
                    text: text.to_string(),
                },
            )
            .step(
                InteractionStrategy::CoordinateFallback,
                Technique::TypeThenTapRelative {
                    input: profile.message_input.clone(),
                    submit: profile.coordinates.send,
                    text: text.to_string(),
                },
            )
    }
}

/// Leading part of a reply, short enough to match a truncated bubble.
pub fn reply_snippet(text: &str) -> String {
    text.lines().next().unwrap_or_default().chars().take(40).collect::<String>().trim().to_string()
}

/// Diagnostic record of one strategy attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ActionAttempt {
    pub action: LogicalAction,
    pub strategy: InteractionStrategy,
    pub technique: &'static str,
    pub raw_success: bool,
    pub verification: Option<VerificationOutcome>,
    /// Snapshot id the attempt ran against.
    pub evidence: String,
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl ActionAttempt {
    pub fn is_verified(&self) -> bool {
        self.verification == Some(VerificationOutcome::Verified)
    }

    pub fn is_ambiguous(&self) -> bool {
        self.verification == Some(VerificationOutcome::Ambiguous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategies_parse_from_config_names() {
        assert_eq!("vision".parse::<InteractionStrategy>().unwrap(), InteractionStrategy::VisionGuidedLocate);
        assert_eq!(
            " Coordinate_Fallback ".parse::<InteractionStrategy>().unwrap(),
            InteractionStrategy::CoordinateFallback
        );
        assert!("telepathy".parse::<InteractionStrategy>().is_err());
    }

    #[test]
    fn ordered_steps_follow_configured_order() {
        let profile = UiProfile::default();
        let plan = ActionPlan::exit_content_view(&profile);
        let order = [InteractionStrategy::CoordinateFallback, InteractionStrategy::StructuralLocate];
        let steps = plan.ordered_steps(&order);

        let labels: Vec<&str> = steps.iter().map(|s| s.technique.label()).collect();
        assert_eq!(labels, vec!["tap_relative", "click_first", "swipe"]);
    }

    #[test]
    fn open_taps_use_short_press() {
        let profile = UiProfile::default();
        let cell = Element {
            id: "c1".into(),
            text: "chef_anna".into(),
            bounds: Some(Bounds { x: 0, y: 300, width: 390, height: 72 }),
        };
        let plan = ActionPlan::open_thread(&profile, &cell);
        let coordinate = plan
            .steps
            .iter()
            .find(|s| s.strategy == InteractionStrategy::CoordinateFallback)
            .unwrap();
        match &coordinate.technique {
            Technique::TapBounds { duration_ms, .. } => assert_eq!(*duration_ms, profile.open_tap_duration_ms),
            other => panic!("unexpected technique {:?}", other),
        }
    }

    #[test]
    fn reply_snippet_is_first_line_prefix() {
        assert_eq!(reply_snippet("Got it!\nMore text"), "Got it!");
        assert_eq!(reply_snippet(&"x".repeat(100)).len(), 40);
    }
}
