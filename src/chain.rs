// Interaction Strategy Chain
//
// Runs the steps of an ActionPlan in configured priority order and stops at
// the first one whose post-condition verifies. Raw success alone never ends
// the chain. UI errors are absorbed here; only fatal session errors and
// cancellation leave as Err.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ChainSettings;
use crate::driver::{locate_first, AutomationDriver, Element, Locator, Point, Snapshot, TapOptions};
use crate::error::{AgentError, AgentResult};
use crate::strategy::{ActionAttempt, ActionPlan, StrategyStep, Technique};
use crate::verifier::{NavigationVerifier, Signal, VerificationOutcome};
use crate::vision::UiUnderstandingProvider;

/// Vision predictions below this are treated as "not found".
const MIN_VISION_CONFIDENCE: f32 = 0.3;

#[derive(Debug, Clone)]
pub enum ChainOutcome {
    Verified {
        attempt: ActionAttempt,
        output: Option<String>,
        attempts: Vec<ActionAttempt>,
    },
    Failed {
        attempts: Vec<ActionAttempt>,
    },
}

impl ChainOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, ChainOutcome::Verified { .. })
    }

    pub fn attempts(&self) -> &[ActionAttempt] {
        match self {
            ChainOutcome::Verified { attempts, .. } => attempts,
            ChainOutcome::Failed { attempts } => attempts,
        }
    }

    pub fn into_output(self) -> Option<String> {
        match self {
            ChainOutcome::Verified { output, .. } => output,
            ChainOutcome::Failed { .. } => None,
        }
    }
}

pub struct StrategyChain {
    driver: Arc<dyn AutomationDriver>,
    vision: Arc<dyn UiUnderstandingProvider>,
    verifier: Arc<NavigationVerifier>,
    settings: ChainSettings,
}

impl StrategyChain {
    pub fn new(
        driver: Arc<dyn AutomationDriver>,
        vision: Arc<dyn UiUnderstandingProvider>,
        verifier: Arc<NavigationVerifier>,
        settings: ChainSettings,
    ) -> Self {
        Self { driver, vision, verifier, settings }
    }

    pub fn verifier(&self) -> &NavigationVerifier {
        &self.verifier
    }

    pub async fn execute(&self, plan: &ActionPlan, cancel: &CancellationToken) -> AgentResult<ChainOutcome> {
        let steps = plan.ordered_steps(&self.settings.order);
        let mut attempts: Vec<ActionAttempt> = Vec::new();

        for step in steps {
            // A previous action may have landed after its verification window.
            // Re-check before doing anything that would repeat it.
            if let Some(previous) = attempts.last() {
                if previous.raw_success && plan.expected.is_screen_state() && step.technique.mutates_ui() {
                    if self.verifier.probe(&plan.expected).await? == Signal::Present {
                        let mut late = previous.clone();
                        late.verification = Some(VerificationOutcome::Verified);
                        tracing::info!(
                            action = %plan.action,
                            strategy = %late.strategy,
                            "verified late, skipping remaining strategies"
                        );
                        return Ok(ChainOutcome::Verified { attempt: late, output: None, attempts });
                    }
                }
            }

            let mut retries_left = self.settings.in_strategy_retries;
            loop {
                if cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }

                let (attempt, output) = self.attempt(plan, step).await?;
                let verified = attempt.is_verified();
                let transient = !attempt.raw_success;
                attempts.push(attempt.clone());

                if verified {
                    tracing::info!(
                        action = %plan.action,
                        strategy = %attempt.strategy,
                        technique = attempt.technique,
                        evidence = %attempt.evidence,
                        "action verified"
                    );
                    return Ok(ChainOutcome::Verified { attempt, output, attempts });
                }
                if transient && retries_left > 0 {
                    retries_left -= 1;
                    continue;
                }
                break;
            }
        }

        tracing::warn!(
            action = %plan.action,
            attempts = ?attempts
                .iter()
                .map(|a| format!("{}/{}:{:?}", a.strategy, a.technique, a.verification))
                .collect::<Vec<_>>(),
            "all strategies exhausted without verification"
        );
        Ok(ChainOutcome::Failed { attempts })
    }

    async fn attempt(&self, plan: &ActionPlan, step: &StrategyStep) -> AgentResult<(ActionAttempt, Option<String>)> {
        let started = Instant::now();
        let snapshot = if step.strategy.needs_screenshot() {
            self.driver.snapshot().await?
        } else {
            Snapshot::marker()
        };

        let limit = self.settings.timeouts.for_strategy(step.strategy);
        let result = match tokio::time::timeout(limit, self.run(&step.technique, &snapshot)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::TransientUi(format!(
                "{} timed out after {}ms",
                step.technique.label(),
                limit.as_millis()
            ))),
        };

        let mut attempt = ActionAttempt {
            action: plan.action,
            strategy: step.strategy,
            technique: step.technique.label(),
            raw_success: false,
            verification: None,
            evidence: snapshot.id.clone(),
            error: None,
            elapsed_ms: 0,
        };

        let output = match result {
            Ok(output) => output,
            Err(e) if e.is_fatal() || matches!(e, AgentError::Cancelled) => return Err(e),
            Err(e) => {
                tracing::debug!(action = %plan.action, strategy = %step.strategy, error = %e, "strategy failed");
                attempt.error = Some(e.to_string());
                attempt.elapsed_ms = started.elapsed().as_millis() as u64;
                return Ok((attempt, None));
            }
        };

        attempt.raw_success = true;
        let verification = self.verifier.verify_output(&plan.expected, output.as_deref()).await?;
        attempt.verification = Some(verification);
        attempt.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::debug!(
            action = %plan.action,
            strategy = %step.strategy,
            verification = ?verification,
            elapsed_ms = attempt.elapsed_ms,
            "strategy executed"
        );
        Ok((attempt, output))
    }

    async fn run(&self, technique: &Technique, snapshot: &Snapshot) -> AgentResult<Option<String>> {
        let driver = self.driver.as_ref();
        match technique {
            Technique::ClickFirst(locators) => {
                let element = self.require_first(locators).await?;
                driver.click(&element).await?;
                Ok(None)
            }
            Technique::ClickElement(element) => {
                driver.click(element).await?;
                Ok(None)
            }
            Technique::TapLocatorCenter { locators, duration_ms } => {
                let element = self.require_lowest(locators).await?;
                let bounds = element
                    .bounds
                    .ok_or_else(|| AgentError::TransientUi(format!("element {} has no bounds", element.id)))?;
                driver.tap(bounds.center(), TapOptions { duration_ms: *duration_ms }).await?;
                Ok(None)
            }
            Technique::TapBounds { bounds, duration_ms } => {
                driver.tap(bounds.center(), TapOptions { duration_ms: *duration_ms }).await?;
                Ok(None)
            }
            Technique::TapRelative { point, duration_ms } => {
                let viewport = driver.viewport().await?;
                driver.tap(point.resolve(viewport), TapOptions { duration_ms: *duration_ms }).await?;
                Ok(None)
            }
            Technique::VisionTap { description, duration_ms } => {
                let point = self.vision_point(snapshot, description).await?;
                driver.tap(point, TapOptions { duration_ms: *duration_ms }).await?;
                Ok(None)
            }
            Technique::Evaluate { script } => {
                driver.evaluate(script, Vec::new()).await?;
                Ok(None)
            }
            Technique::Swipe(direction) => {
                driver.swipe(*direction).await?;
                Ok(None)
            }
            Technique::Navigate(url) => {
                driver.navigate(url).await?;
                Ok(None)
            }
            Technique::TypeAndSubmit { input, submit, text } => {
                self.type_into(input, text).await?;
                let button = self.require_first(std::slice::from_ref(submit)).await?;
                driver.click(&button).await?;
                Ok(None)
            }
            Technique::TypeThenVisionSubmit { input, submit_description, text } => {
                self.type_into(input, text).await?;
                let fresh = driver.snapshot().await?;
                let point = self.vision_point(&fresh, submit_description).await?;
                driver.tap(point, TapOptions::default()).await?;
                Ok(None)
            }
            Technique::TypeThenTapRelative { input, submit, text } => {
                self.type_into(input, text).await?;
                let viewport = driver.viewport().await?;
                driver.tap(submit.resolve(viewport), TapOptions::default()).await?;
                Ok(None)
            }
            Technique::ReadLongestText { locator, expand, .. } => {
                // The expansion control is optional; short captions have none.
                if let Ok(Some((_, found))) = locate_first(driver, expand).await {
                    if let Some(more) = found.first() {
                        if let Err(e) = driver.click(more).await {
                            tracing::debug!(error = %e, "caption expansion tap failed");
                        }
                    }
                }
                self.longest_text(locator).await
            }
            Technique::ReadByScript { script } => match driver.evaluate(script, Vec::new()).await? {
                Value::String(raw) => Ok(text_from_script_result(&raw)),
                Value::Null => Ok(None),
                other => Ok(Some(other.to_string())),
            },
            Technique::VisionRead { instruction } => self.vision.read_text(snapshot, instruction).await,
            Technique::SwipeThenRead { direction, locator, .. } => {
                driver.swipe(*direction).await?;
                self.longest_text(locator).await
            }
        }
    }

    async fn require_first(&self, locators: &[Locator]) -> AgentResult<Element> {
        match locate_first(self.driver.as_ref(), locators).await? {
            Some((_, found)) => found
                .into_iter()
                .next()
                .ok_or_else(|| AgentError::TransientUi("locator matched nothing".into())),
            None => Err(AgentError::TransientUi(format!("no element for {} locator(s)", locators.len()))),
        }
    }

    /// Lowest on-screen match, which in a conversation is the most recent one.
    async fn require_lowest(&self, locators: &[Locator]) -> AgentResult<Element> {
        match locate_first(self.driver.as_ref(), locators).await? {
            Some((_, found)) => found
                .into_iter()
                .max_by_key(|e| e.bounds.map(|b| b.y).unwrap_or(i32::MIN))
                .ok_or_else(|| AgentError::TransientUi("locator matched nothing".into())),
            None => Err(AgentError::TransientUi(format!("no element for {} locator(s)", locators.len()))),
        }
    }

    async fn type_into(&self, input: &Locator, text: &str) -> AgentResult<()> {
        let field = self.require_first(std::slice::from_ref(input)).await?;
        self.driver.type_text(&field, text).await?;
        Ok(())
    }

    async fn vision_point(&self, snapshot: &Snapshot, description: &str) -> AgentResult<Point> {
        match self.vision.locate(snapshot, description).await? {
            Some(p) if p.confidence >= MIN_VISION_CONFIDENCE => Ok(p.point),
            Some(p) => Err(AgentError::TransientUi(format!(
                "vision confidence {:.2} too low for '{}'",
                p.confidence, description
            ))),
            None => Err(AgentError::TransientUi(format!("vision could not find '{}'", description))),
        }
    }

    async fn longest_text(&self, locator: &Locator) -> AgentResult<Option<String>> {
        let found = match self.driver.locate(locator).await {
            Ok(found) => found,
            Err(crate::error::DriverError::NoSuchElement(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(found
            .into_iter()
            .map(|e| e.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .max_by_key(|t| t.chars().count()))
    }
}

static SOURCE_ATTRIBUTE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:label|value|name)="([^"]*)""#).expect("valid regex"));

/// Scripts return either plain text or a native page source; for page
/// source, the longest attribute text is the caption candidate.
fn text_from_script_result(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if !trimmed.starts_with('<') {
        return Some(trimmed.to_string());
    }
    SOURCE_ATTRIBUTE
        .captures_iter(trimmed)
        .filter_map(|c| c.get(1))
        .map(|m| unescape_xml(m.as_str()))
        .max_by_key(|t| t.chars().count())
        .filter(|t| !t.trim().is_empty())
}

fn unescape_xml(s: &str) -> String {
    s.replace("&#10;", "\n")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}
