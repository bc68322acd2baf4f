// Navigation Verifier - post-condition checks for expected screens.
//
// Structural signals are polled until the deadline. Only when they are
// inconclusive (partial or unreadable) is the vision provider consulted, and
// an unsure answer there is reported as Ambiguous, never as success.

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::sleep;

use crate::config::VerifierSettings;
use crate::driver::{AutomationDriver, Locator};
use crate::error::{AgentError, AgentResult, DriverError};
use crate::profile::UiProfile;
use crate::vision::{wait_for_ui_settle, UiUnderstandingProvider, VisionVerdict};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedState {
    Inbox,
    ThreadView,
    OverlayPresent,
    OverlayAbsent,
    /// More bubbles carry the snippet than the `baseline` counted before sending.
    ReplyVisible { snippet: String, baseline: usize },
    /// The attempt itself produced at least this much text.
    TextCaptured { min_chars: usize },
}

impl ExpectedState {
    pub fn name(&self) -> &'static str {
        match self {
            ExpectedState::Inbox => "inbox",
            ExpectedState::ThreadView => "thread_view",
            ExpectedState::OverlayPresent => "overlay_present",
            ExpectedState::OverlayAbsent => "overlay_absent",
            ExpectedState::ReplyVisible { .. } => "reply_visible",
            ExpectedState::TextCaptured { .. } => "text_captured",
        }
    }

    /// States that describe the screen, as opposed to the attempt output.
    pub fn is_screen_state(&self) -> bool {
        !matches!(self, ExpectedState::TextCaptured { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VerificationOutcome {
    Verified,
    Unverified,
    Ambiguous,
}

/// Result of one structural read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Present,
    Absent,
    /// Some indicators agree, others do not.
    Mixed,
    /// The driver could not answer.
    Unavailable,
}

pub struct NavigationVerifier {
    driver: Arc<dyn AutomationDriver>,
    vision: Arc<dyn UiUnderstandingProvider>,
    profile: Arc<UiProfile>,
    settings: VerifierSettings,
}

impl NavigationVerifier {
    pub fn new(
        driver: Arc<dyn AutomationDriver>,
        vision: Arc<dyn UiUnderstandingProvider>,
        profile: Arc<UiProfile>,
        settings: VerifierSettings,
    ) -> Self {
        Self { driver, vision, profile, settings }
    }

    pub async fn verify(&self, expected: &ExpectedState) -> AgentResult<VerificationOutcome> {
        self.verify_output(expected, None).await
    }

    /// Like `verify`, with the text an attempt produced for output checks.
    pub async fn verify_output(
        &self,
        expected: &ExpectedState,
        output: Option<&str>,
    ) -> AgentResult<VerificationOutcome> {
        if let ExpectedState::TextCaptured { min_chars } = expected {
            let captured = output.map(|t| t.trim().chars().count()).unwrap_or(0);
            return Ok(if captured >= *min_chars {
                VerificationOutcome::Verified
            } else {
                VerificationOutcome::Unverified
            });
        }

        wait_for_ui_settle(self.driver.as_ref(), self.settings.settle_timeout).await;

        let deadline = Instant::now() + self.settings.timeout;
        let last = loop {
            let signal = self.probe(expected).await?;
            if signal == Signal::Present {
                tracing::debug!(state = expected.name(), "verified structurally");
                return Ok(VerificationOutcome::Verified);
            }
            if Instant::now() >= deadline {
                break signal;
            }
            sleep(self.settings.poll_interval).await;
        };

        match last {
            Signal::Absent => {
                tracing::debug!(state = expected.name(), "not reached before deadline");
                Ok(VerificationOutcome::Unverified)
            }
            _ => self.consult_vision(expected).await,
        }
    }

    /// One structural read of the screen, no waiting.
    pub async fn probe(&self, expected: &ExpectedState) -> AgentResult<Signal> {
        let profile = &self.profile;
        let signal = match expected {
            ExpectedState::Inbox => self.any_present(&profile.inbox_signals).await?,
            ExpectedState::OverlayPresent => self.any_present(&profile.overlay_signals).await?,
            ExpectedState::ThreadView => self.all_present(&profile.thread_signals).await?,
            ExpectedState::OverlayAbsent => match self.any_present(&profile.overlay_signals).await? {
                Signal::Present => Signal::Absent,
                Signal::Absent => {
                    // The overlay being gone only counts once a known screen is back.
                    let thread = self.all_present(&profile.thread_signals).await?;
                    let inbox = self.any_present(&profile.inbox_signals).await?;
                    if thread == Signal::Present || inbox == Signal::Present {
                        Signal::Present
                    } else {
                        Signal::Mixed
                    }
                }
                other => other,
            },
            ExpectedState::ReplyVisible { snippet, baseline } => match self.count_text(snippet).await? {
                Some(count) if count > *baseline => Signal::Present,
                Some(_) => Signal::Absent,
                None => Signal::Unavailable,
            },
            ExpectedState::TextCaptured { .. } => Signal::Unavailable,
        };
        Ok(signal)
    }

    async fn presence(&self, locator: &Locator) -> AgentResult<Option<bool>> {
        match self.driver.locate(locator).await {
            Ok(found) => Ok(Some(!found.is_empty())),
            Err(DriverError::NoSuchElement(_)) => Ok(Some(false)),
            Err(DriverError::InvalidSession(msg)) => Err(AgentError::FatalSession(msg)),
            Err(e) => {
                tracing::debug!(locator = %locator, error = %e, "signal unreadable");
                Ok(None)
            }
        }
    }

    async fn any_present(&self, locators: &[Locator]) -> AgentResult<Signal> {
        let mut unreadable = false;
        for locator in locators {
            match self.presence(locator).await? {
                Some(true) => return Ok(Signal::Present),
                Some(false) => {}
                None => unreadable = true,
            }
        }
        Ok(if unreadable { Signal::Unavailable } else { Signal::Absent })
    }

    async fn all_present(&self, locators: &[Locator]) -> AgentResult<Signal> {
        let mut present = 0;
        let mut unreadable = false;
        for locator in locators {
            match self.presence(locator).await? {
                Some(true) => present += 1,
                Some(false) => {}
                None => unreadable = true,
            }
        }
        Ok(if unreadable {
            Signal::Unavailable
        } else if present == locators.len() {
            Signal::Present
        } else if present == 0 {
            Signal::Absent
        } else {
            Signal::Mixed
        })
    }

    /// Message bubbles containing `snippet`. `None` when the list is unreadable.
    pub async fn count_text(&self, snippet: &str) -> AgentResult<Option<usize>> {
        let needle = snippet.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(None);
        }
        match self.driver.locate(&self.profile.message_text_locator).await {
            Ok(found) => Ok(Some(found.iter().filter(|e| e.text.to_lowercase().contains(&needle)).count())),
            Err(DriverError::NoSuchElement(_)) => Ok(Some(0)),
            Err(DriverError::InvalidSession(msg)) => Err(AgentError::FatalSession(msg)),
            Err(_) => Ok(None),
        }
    }

    async fn consult_vision(&self, expected: &ExpectedState) -> AgentResult<VerificationOutcome> {
        let hints = &self.profile.vision;
        let (condition, inverted) = match expected {
            ExpectedState::Inbox => (hints.inbox.clone(), false),
            ExpectedState::ThreadView => (hints.thread_view.clone(), false),
            ExpectedState::OverlayPresent => (hints.overlay.clone(), false),
            ExpectedState::OverlayAbsent => (hints.overlay.clone(), true),
            ExpectedState::ReplyVisible { snippet, .. } => {
                (format!("The last message in the conversation starts with '{}'", snippet), false)
            }
            ExpectedState::TextCaptured { .. } => return Ok(VerificationOutcome::Unverified),
        };

        let snapshot = self.driver.snapshot().await?;
        let verdict = match self.vision.assess(&snapshot, &condition).await {
            Ok(v) => v,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::warn!(provider = self.vision.name(), error = %e, "vision check failed");
                VisionVerdict::Unsure
            }
        };

        let outcome = match (verdict, inverted) {
            (VisionVerdict::Yes, false) | (VisionVerdict::No, true) => VerificationOutcome::Verified,
            (VisionVerdict::No, false) | (VisionVerdict::Yes, true) => VerificationOutcome::Unverified,
            (VisionVerdict::Unsure, _) => VerificationOutcome::Ambiguous,
        };
        tracing::debug!(
            state = expected.name(),
            snapshot = %snapshot.id,
            ?verdict,
            ?outcome,
            "structural signals inconclusive, asked vision"
        );
        Ok(outcome)
    }
}
