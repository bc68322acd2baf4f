//! Thread Processor
//!
//! Moves one thread from detection to a terminal state:
//!
//! ```text
//! Idle -> Opened -> Skipped
//!                -> PostDetected -> PostExpanded -> CaptionExtracted -> PostExited
//!                   -> ContentHandedOff -> ReplySent -> Completed
//! Opened -> ReplySent (artifact delivered earlier, reply still missing)
//! any non-terminal state -> Failed
//! ```
//!
//! Content can only be handed to the extractor through an `ExtractionJob`,
//! and a job can only be handed off with an `ExitedContent` proof, which in
//! turn only exists after the overlay exit was verified. Once the overlay has
//! been opened the thread is carried through to the exit even if the cycle
//! is cancelled.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chain::{ChainOutcome, StrategyChain};
use crate::collaborators::{Collaborators, StructuredContent};
use crate::config::AgentConfig;
use crate::driver::{locate_first, AutomationDriver, Element};
use crate::error::{AgentError, AgentResult};
use crate::ledger::{Ledger, LedgerOutcome};
use crate::message::{latest_message, ledger_key, Message, SenderRole};
use crate::profile::UiProfile;
use crate::scanner::{Thread, ThreadScanner};
use crate::strategy::{reply_snippet, ActionAttempt, ActionPlan, LogicalAction};
use crate::verifier::{ExpectedState, NavigationVerifier, Signal};
use crate::vision::UiUnderstandingProvider;

/// Ambiguous verifications tolerated for one logical action.
const MAX_AMBIGUOUS: usize = 3;

mod proof {
    /// Evidence that the content overlay was exited and verified.
    #[derive(Debug, Clone)]
    pub struct ExitedContent {
        evidence: String,
    }

    impl ExitedContent {
        pub(super) fn new(evidence: &str) -> Self {
            Self { evidence: evidence.to_string() }
        }

        pub fn evidence(&self) -> &str {
            &self.evidence
        }
    }
}

pub use proof::ExitedContent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JobStatus {
    Pending,
    HandedOff,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub thread_id: String,
    pub raw_content: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub error: Option<String>,
    exited: ExitedContent,
}

impl ExtractionJob {
    pub fn hand_off(thread_id: &str, raw_content: String, exited: ExitedContent) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            raw_content,
            status: JobStatus::HandedOff,
            retry_count: 0,
            error: None,
            exited,
        }
    }

    pub fn exit_evidence(&self) -> &str {
        self.exited.evidence()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    SelfMessage,
    NoSharedContent,
    AlreadyHandled,
    InFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    Exhausted(LogicalAction),
    Ambiguous(LogicalAction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompletionOutcome {
    Replied,
    AlreadyReplied,
    NoCaption,
    ExtractionFailed,
    DeliveryFailed,
}

#[derive(Debug, Clone)]
pub enum ThreadState {
    Idle,
    Opened { message: Option<Message> },
    Skipped { reason: SkipReason },
    PostDetected { preview: Element },
    PostExpanded,
    CaptionExtracted { caption: Option<String> },
    PostExited { evidence: String },
    ContentHandedOff { job: ExtractionJob },
    ReplySent,
    Completed { outcome: CompletionOutcome },
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateKind {
    Idle,
    Opened,
    Skipped,
    PostDetected,
    PostExpanded,
    CaptionExtracted,
    PostExited,
    ContentHandedOff,
    ReplySent,
    Completed,
    Failed,
}

impl ThreadState {
    pub fn kind(&self) -> StateKind {
        match self {
            ThreadState::Idle => StateKind::Idle,
            ThreadState::Opened { .. } => StateKind::Opened,
            ThreadState::Skipped { .. } => StateKind::Skipped,
            ThreadState::PostDetected { .. } => StateKind::PostDetected,
            ThreadState::PostExpanded => StateKind::PostExpanded,
            ThreadState::CaptionExtracted { .. } => StateKind::CaptionExtracted,
            ThreadState::PostExited { .. } => StateKind::PostExited,
            ThreadState::ContentHandedOff { .. } => StateKind::ContentHandedOff,
            ThreadState::ReplySent => StateKind::ReplySent,
            ThreadState::Completed { .. } => StateKind::Completed,
            ThreadState::Failed { .. } => StateKind::Failed,
        }
    }
}

impl StateKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StateKind::Skipped | StateKind::Completed | StateKind::Failed)
    }

    pub fn can_transition(&self, to: StateKind) -> bool {
        use StateKind::*;
        if to == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Idle, Opened)
                | (Idle, Skipped)
                | (Opened, Skipped)
                | (Opened, PostDetected)
                | (Opened, ReplySent)
                | (Opened, Completed)
                | (PostDetected, PostExpanded)
                | (PostExpanded, CaptionExtracted)
                | (CaptionExtracted, PostExited)
                | (PostExited, ContentHandedOff)
                | (PostExited, Completed)
                | (ContentHandedOff, ReplySent)
                | (ContentHandedOff, Completed)
                | (ReplySent, Completed)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadReport {
    pub thread_id: String,
    pub final_state: StateKind,
    pub history: Vec<StateKind>,
    pub attempts: Vec<ActionAttempt>,
    pub skip_reason: Option<SkipReason>,
    pub failure: Option<FailureReason>,
    pub outcome: Option<CompletionOutcome>,
    pub reply_sent: bool,
}

impl ThreadReport {
    pub fn extraction_failed(&self) -> bool {
        matches!(self.outcome, Some(CompletionOutcome::ExtractionFailed) | Some(CompletionOutcome::NoCaption))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyOutcome {
    Sent,
    AlreadySent,
    NotVerified,
}

/// Everything the processor needs to act on the current session.
pub struct UiContext {
    pub driver: Arc<dyn AutomationDriver>,
    pub vision: Arc<dyn UiUnderstandingProvider>,
    pub profile: Arc<UiProfile>,
    pub verifier: Arc<NavigationVerifier>,
    pub chain: StrategyChain,
}

impl UiContext {
    pub fn new(
        driver: Arc<dyn AutomationDriver>,
        vision: Arc<dyn UiUnderstandingProvider>,
        profile: Arc<UiProfile>,
        config: &AgentConfig,
    ) -> Self {
        let verifier = Arc::new(NavigationVerifier::new(
            driver.clone(),
            vision.clone(),
            profile.clone(),
            config.verifier.clone(),
        ));
        let chain = StrategyChain::new(driver.clone(), vision.clone(), verifier.clone(), config.chain.clone());
        Self { driver, vision, profile, verifier, chain }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub max_retries_per_transition: u32,
    pub extraction_timeout: Duration,
    pub extraction_retries: u32,
    pub min_caption_chars: usize,
    pub reply_template: String,
    pub delivery_destination: String,
    pub account: Option<String>,
}

impl ProcessorSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_retries_per_transition: config.max_retries_per_transition.max(1),
            extraction_timeout: config.extraction_timeout,
            extraction_retries: config.extraction_retries,
            min_caption_chars: config.min_caption_chars,
            reply_template: config.reply_template.clone(),
            delivery_destination: config.delivery_destination.clone(),
            account: config.account_username.clone(),
        }
    }
}

/// State of one thread while it is being processed.
struct Run {
    thread_id: String,
    state: ThreadState,
    history: Vec<StateKind>,
    attempts: Vec<ActionAttempt>,
    reply_sent: bool,
}

impl Run {
    fn new(thread_id: &str) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            state: ThreadState::Idle,
            history: vec![StateKind::Idle],
            attempts: Vec::new(),
            reply_sent: false,
        }
    }

    fn advance(&mut self, next: ThreadState) {
        let from = self.state.kind();
        let to = next.kind();
        debug_assert!(from.can_transition(to), "illegal transition {:?} -> {:?}", from, to);
        match &next {
            ThreadState::Failed { reason } => {
                tracing::warn!(thread = %self.thread_id, from = ?from, reason = ?reason, "thread failed")
            }
            _ => tracing::info!(thread = %self.thread_id, from = ?from, state = ?to, "state transition"),
        }
        self.history.push(to);
        self.state = next;
    }

    fn into_report(self) -> ThreadReport {
        let (skip_reason, failure, outcome) = match &self.state {
            ThreadState::Skipped { reason } => (Some(*reason), None, None),
            ThreadState::Failed { reason } => (None, Some(*reason), None),
            ThreadState::Completed { outcome } => (None, None, Some(*outcome)),
            _ => (None, None, None),
        };
        ThreadReport {
            thread_id: self.thread_id,
            final_state: self.state.kind(),
            history: self.history,
            attempts: self.attempts,
            skip_reason,
            failure,
            outcome,
            reply_sent: self.reply_sent,
        }
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let inserted = set.lock().unwrap_or_else(|p| p.into_inner()).insert(id.to_string());
        inserted.then(|| Self { set, id: id.to_string() })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|p| p.into_inner()).remove(&self.id);
    }
}

pub struct ThreadProcessor {
    ledger: Arc<Ledger>,
    collaborators: Collaborators,
    settings: ProcessorSettings,
    in_flight: Mutex<HashSet<String>>,
}

impl ThreadProcessor {
    pub fn new(ledger: Arc<Ledger>, collaborators: Collaborators, settings: ProcessorSettings) -> Self {
        Self { ledger, collaborators, settings, in_flight: Mutex::new(HashSet::new()) }
    }

    pub async fn process(
        &self,
        ui: &UiContext,
        thread: &Thread,
        cancel: &CancellationToken,
    ) -> AgentResult<ThreadReport> {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let mut run = Run::new(&thread.id);
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &thread.id) else {
            run.advance(ThreadState::Skipped { reason: SkipReason::InFlight });
            return Ok(run.into_report());
        };

        let result = self.drive(ui, thread, &mut run, cancel).await;
        match &result {
            Err(e) if e.is_fatal() => {}
            _ => self.return_to_inbox(ui, &mut run).await?,
        }
        result.map(|_| run.into_report())
    }

    async fn drive(
        &self,
        ui: &UiContext,
        thread: &Thread,
        run: &mut Run,
        cancel: &CancellationToken,
    ) -> AgentResult<()> {
        let profile = ui.profile.as_ref();

        let open = ActionPlan::open_thread(profile, &thread.element);
        if let Err(reason) = self.attempt_action(ui, &open, cancel, run).await? {
            run.advance(ThreadState::Failed { reason });
            return Ok(());
        }

        let account = self.settings.account.as_deref();
        let message = match latest_message(ui.driver.as_ref(), profile, &thread.label, account).await {
            Ok(m) => m,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(thread = %thread.id, error = %e, "latest message unreadable");
                None
            }
        };
        let message_hash = message.as_ref().map(|m| m.hash.clone()).unwrap_or_else(|| "no_message".to_string());
        let from_self = message.as_ref().map(|m| m.sender == SenderRole::Myself).unwrap_or(false);
        run.advance(ThreadState::Opened { message });

        let key = ledger_key(&thread.id, &message_hash);
        if from_self {
            self.ledger.record(&key, &thread.id, LedgerOutcome::Skipped)?;
            run.advance(ThreadState::Skipped { reason: SkipReason::SelfMessage });
            return Ok(());
        }
        if self.ledger.has(&key)? {
            if self.ledger.awaiting_reply(&key)? {
                tracing::info!(thread = %thread.id, "artifact delivered earlier without a reply, resuming");
                return self.reply(ui, thread, &key, run).await;
            }
            run.advance(ThreadState::Skipped { reason: SkipReason::AlreadyHandled });
            return Ok(());
        }

        let Some(preview) = self.find_preview(ui).await? else {
            self.ledger.record(&key, &thread.id, LedgerOutcome::Skipped)?;
            run.advance(ThreadState::Skipped { reason: SkipReason::NoSharedContent });
            return Ok(());
        };
        run.advance(ThreadState::PostDetected { preview: preview.clone() });

        let expand = ActionPlan::expand_content_preview(profile, &preview);
        match self.attempt_action(ui, &expand, cancel, run).await {
            Ok(Ok(_)) => {}
            Ok(Err(reason)) => {
                // Verification failed, but the overlay may still have opened.
                let reason = self.leave_overlay(ui, run).await?.unwrap_or(reason);
                run.advance(ThreadState::Failed { reason });
                return Ok(());
            }
            Err(AgentError::Cancelled) => {
                self.leave_overlay(ui, run).await?;
                return Err(AgentError::Cancelled);
            }
            Err(e) => return Err(e),
        }
        run.advance(ThreadState::PostExpanded);

        let caption = self.read_caption(ui, run).await?;
        run.advance(ThreadState::CaptionExtracted { caption: caption.clone() });

        let exited = match self.exit_content(ui, run).await? {
            Ok(proof) => proof,
            Err(reason) => {
                run.advance(ThreadState::Failed { reason });
                return Ok(());
            }
        };
        self.ledger.record(&key, &thread.id, LedgerOutcome::Processed)?;
        run.advance(ThreadState::PostExited { evidence: exited.evidence().to_string() });

        let Some(raw) = caption else {
            self.ledger.record(&key, &thread.id, LedgerOutcome::ExtractionFailed)?;
            run.advance(ThreadState::Completed { outcome: CompletionOutcome::NoCaption });
            return Ok(());
        };

        let mut job = ExtractionJob::hand_off(&thread.id, raw, exited);
        run.advance(ThreadState::ContentHandedOff { job: job.clone() });

        let Some(content) = self.extract(&mut job).await else {
            self.ledger.record(&key, &thread.id, LedgerOutcome::ExtractionFailed)?;
            run.advance(ThreadState::Completed { outcome: CompletionOutcome::ExtractionFailed });
            return Ok(());
        };

        if let Err(e) = self.render_and_deliver(&thread.id, &content).await {
            tracing::warn!(thread = %thread.id, error = %e, "render or delivery failed, not replying");
            run.advance(ThreadState::Completed { outcome: CompletionOutcome::DeliveryFailed });
            return Ok(());
        }
        self.ledger.record(&key, &thread.id, LedgerOutcome::Delivered)?;
        self.reply(ui, thread, &key, run).await
    }

    /// Replies from inside the thread. An exit by deep link leaves the inbox
    /// showing, so the thread is reopened first when needed.
    async fn reply(&self, ui: &UiContext, thread: &Thread, key: &str, run: &mut Run) -> AgentResult<()> {
        if let Err(reason) = self.ensure_in_thread(ui, thread, run).await? {
            run.advance(ThreadState::Failed { reason });
            return Ok(());
        }

        let (outcome, attempts) = self.send_reply(ui, key, &thread.id, &self.settings.reply_template).await?;
        run.attempts.extend(attempts);
        match outcome {
            ReplyOutcome::Sent => {
                run.reply_sent = true;
                run.advance(ThreadState::ReplySent);
                run.advance(ThreadState::Completed { outcome: CompletionOutcome::Replied });
            }
            ReplyOutcome::AlreadySent => {
                run.advance(ThreadState::Completed { outcome: CompletionOutcome::AlreadyReplied });
            }
            ReplyOutcome::NotVerified => {
                run.advance(ThreadState::Failed { reason: FailureReason::Exhausted(LogicalAction::SendReply) });
            }
        }
        Ok(())
    }

    /// Runs the chain for `plan` up to the transition retry budget.
    async fn attempt_action(
        &self,
        ui: &UiContext,
        plan: &ActionPlan,
        cancel: &CancellationToken,
        run: &mut Run,
    ) -> AgentResult<Result<ActionAttempt, FailureReason>> {
        let mut ambiguous = 0;
        for round in 1..=self.settings.max_retries_per_transition {
            if round > 1 && plan.expected.is_screen_state() {
                // An earlier round may have worked after all; repeating it could undo it.
                if ui.verifier.probe(&plan.expected).await? == Signal::Present {
                    if let Some(last) = run.attempts.iter().rev().find(|a| a.action == plan.action && a.raw_success) {
                        tracing::info!(thread = %run.thread_id, action = %plan.action, "reached on re-check");
                        return Ok(Ok(last.clone()));
                    }
                }
            }

            let outcome = ui.chain.execute(plan, cancel).await?;
            ambiguous += outcome.attempts().iter().filter(|a| a.is_ambiguous()).count();
            run.attempts.extend(outcome.attempts().iter().cloned());

            if let ChainOutcome::Verified { attempt, .. } = outcome {
                return Ok(Ok(attempt));
            }
            if ambiguous >= MAX_AMBIGUOUS {
                return Ok(Err(FailureReason::Ambiguous(plan.action)));
            }
            tracing::warn!(
                thread = %run.thread_id,
                action = %plan.action,
                round,
                max = self.settings.max_retries_per_transition,
                "action not verified, retrying"
            );
        }
        Ok(Err(FailureReason::Exhausted(plan.action)))
    }

    /// Closes the overlay if it may be open. Returns the failure when it stays open.
    async fn leave_overlay(&self, ui: &UiContext, run: &mut Run) -> AgentResult<Option<FailureReason>> {
        if ui.verifier.probe(&ExpectedState::OverlayAbsent).await? == Signal::Present {
            return Ok(None);
        }
        match self.exit_content(ui, run).await? {
            Ok(_) => Ok(None),
            Err(reason) => {
                tracing::warn!(thread = %run.thread_id, reason = ?reason, "overlay still open after failed expand");
                Ok(Some(reason))
            }
        }
    }

    async fn ensure_in_thread(
        &self,
        ui: &UiContext,
        thread: &Thread,
        run: &mut Run,
    ) -> AgentResult<Result<(), FailureReason>> {
        if ui.verifier.probe(&ExpectedState::ThreadView).await? == Signal::Present {
            return Ok(Ok(()));
        }
        tracing::info!(thread = %thread.id, "thread no longer open, reopening before reply");
        let cell = match ThreadScanner::new(ui.driver.as_ref(), &ui.profile).find(&thread.id).await {
            Ok(Some(found)) => found.element,
            Ok(None) => thread.element.clone(),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(thread = %thread.id, error = %e, "thread list unreadable, using scanned cell");
                thread.element.clone()
            }
        };
        let plan = ActionPlan::open_thread(&ui.profile, &cell);
        let opened = self.attempt_action(ui, &plan, &CancellationToken::new(), run).await?;
        Ok(opened.map(|_| ()))
    }

    /// Exit the overlay. Runs shielded from cancellation.
    async fn exit_content(&self, ui: &UiContext, run: &mut Run) -> AgentResult<Result<ExitedContent, FailureReason>> {
        let plan = ActionPlan::exit_content_view(&ui.profile);
        let shielded = CancellationToken::new();
        Ok(self
            .attempt_action(ui, &plan, &shielded, run)
            .await?
            .map(|attempt| ExitedContent::new(&attempt.evidence)))
    }

    /// Caption failures never stop the thread; it still has to exit.
    async fn read_caption(&self, ui: &UiContext, run: &mut Run) -> AgentResult<Option<String>> {
        let plan = ActionPlan::extract_caption(&ui.profile, self.settings.min_caption_chars);
        match ui.chain.execute(&plan, &CancellationToken::new()).await {
            Ok(outcome) => {
                run.attempts.extend(outcome.attempts().iter().cloned());
                Ok(outcome.into_output())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(thread = %run.thread_id, error = %e, "caption extraction errored");
                Ok(None)
            }
        }
    }

    async fn find_preview(&self, ui: &UiContext) -> AgentResult<Option<Element>> {
        let found = locate_first(ui.driver.as_ref(), &ui.profile.shared_content_locators).await?;
        Ok(found.and_then(|(_, elements)| {
            elements.into_iter().max_by_key(|e| e.bounds.map(|b| b.y).unwrap_or(i32::MIN))
        }))
    }

    async fn extract(&self, job: &mut ExtractionJob) -> Option<StructuredContent> {
        for attempt in 0..=self.settings.extraction_retries {
            job.retry_count = attempt;
            let call = self.collaborators.extractor.extract(&job.raw_content);
            match tokio::time::timeout(self.settings.extraction_timeout, call).await {
                Ok(Ok(Some(content))) => {
                    job.status = JobStatus::Completed;
                    return Some(content);
                }
                Ok(Ok(None)) => {
                    tracing::info!(thread = %job.thread_id, "extractor found nothing to structure");
                    job.error = Some("no structured content".into());
                    break;
                }
                Ok(Err(e)) => {
                    tracing::warn!(thread = %job.thread_id, attempt, error = %e, "extraction failed");
                    job.error = Some(e.to_string());
                }
                Err(_) => {
                    tracing::warn!(
                        thread = %job.thread_id,
                        attempt,
                        timeout_ms = self.settings.extraction_timeout.as_millis() as u64,
                        "extraction timed out"
                    );
                    job.error = Some("timed out".into());
                }
            }
        }
        job.status = JobStatus::Failed;
        None
    }

    async fn render_and_deliver(&self, thread_id: &str, content: &StructuredContent) -> AgentResult<()> {
        let artifact = self.collaborators.renderer.render(content).await?;
        let destination = self.settings.delivery_destination.replace("{thread}", thread_id);
        let ack = self.collaborators.delivery.deliver(&artifact, &destination).await?;
        tracing::info!(thread = thread_id, artifact = %artifact.id, ack = %ack.id, "artifact delivered");
        Ok(())
    }

    /// Sends `text` unless the ledger already holds a `sent` entry for `key`.
    pub async fn send_reply(
        &self,
        ui: &UiContext,
        key: &str,
        thread_id: &str,
        text: &str,
    ) -> AgentResult<(ReplyOutcome, Vec<ActionAttempt>)> {
        if self.ledger.has_sent(key)? {
            tracing::info!(thread = thread_id, "reply already sent for this message, skipping");
            return Ok((ReplyOutcome::AlreadySent, Vec::new()));
        }

        let Some(baseline) = ui.verifier.count_text(&reply_snippet(text)).await? else {
            tracing::warn!(thread = thread_id, "message list unreadable, not sending an unverifiable reply");
            return Ok((ReplyOutcome::NotVerified, Vec::new()));
        };
        let plan = ActionPlan::send_reply(&ui.profile, text, baseline);
        let mut run = Run::new(thread_id);
        let result = self.attempt_action(ui, &plan, &CancellationToken::new(), &mut run).await?;
        let outcome = match result {
            Ok(_) => {
                if !self.ledger.record(key, thread_id, LedgerOutcome::Sent)? {
                    tracing::warn!(thread = thread_id, "sent entry already present for key");
                }
                ReplyOutcome::Sent
            }
            Err(_) => ReplyOutcome::NotVerified,
        };
        Ok((outcome, run.attempts))
    }

    async fn return_to_inbox(&self, ui: &UiContext, run: &mut Run) -> AgentResult<()> {
        let plan = ActionPlan::return_to_inbox(&ui.profile);
        match ui.chain.execute(&plan, &CancellationToken::new()).await {
            Ok(outcome) => {
                if !outcome.is_verified() {
                    tracing::warn!(thread = %run.thread_id, "could not confirm return to inbox");
                }
                run.attempts.extend(outcome.attempts().iter().cloned());
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                tracing::warn!(thread = %run.thread_id, error = %e, "return to inbox errored");
                Ok(())
            }
        }
    }
}
