//! Control surface: one cycle, the polling loop, a single named thread, status.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{Collaborators, HttpDelivery, HttpExtractor, HttpRenderer};
use crate::config::AgentConfig;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::driver::webdriver::WebDriverFactory;
use crate::driver::DriverFactory;
use crate::error::{AgentError, AgentResult};
use crate::ledger::Ledger;
use crate::processor::{ProcessorSettings, StateKind, ThreadProcessor, ThreadReport, UiContext};
use crate::profile::UiProfile;
use crate::scanner::ThreadScanner;
use crate::session::{dismiss_interruptions, SessionManager};
use crate::vision::{NullProvider, UiUnderstandingProvider, VisionModelProvider};

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStatus {
    pub cycles: u64,
    pub threads_scanned: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub replies_sent: u64,
    pub extraction_failures: u64,
    pub session_restarts: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AgentStatus {
    fn tally(&mut self, report: &ThreadReport) {
        match report.final_state {
            StateKind::Completed => self.completed += 1,
            StateKind::Skipped => self.skipped += 1,
            StateKind::Failed => self.failed += 1,
            _ => {}
        }
        if report.reply_sent {
            self.replies_sent += 1;
        }
        if report.extraction_failed() {
            self.extraction_failures += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub scanned: usize,
    pub threads: Vec<ThreadReport>,
    pub cancelled: bool,
    pub timed_out: bool,
    /// Set when the session died mid-cycle and was restarted.
    pub aborted: Option<String>,
}

impl CycleReport {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            duration_ms: 0,
            scanned: 0,
            threads: Vec::new(),
            cancelled: false,
            timed_out: false,
            aborted: None,
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    profile: Arc<UiProfile>,
    vision: Arc<dyn UiUnderstandingProvider>,
    sessions: AsyncMutex<SessionManager>,
    processor: ThreadProcessor,
    ledger: Arc<Ledger>,
    status: Mutex<AgentStatus>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        profile: Arc<UiProfile>,
        factory: Arc<dyn DriverFactory>,
        credentials: Arc<dyn CredentialStore>,
        vision: Arc<dyn UiUnderstandingProvider>,
        ledger: Arc<Ledger>,
        collaborators: Collaborators,
    ) -> Self {
        let sessions = SessionManager::new(factory, credentials, vision.clone(), profile.clone(), &config);
        let processor = ThreadProcessor::new(ledger.clone(), collaborators, ProcessorSettings::from_config(&config));
        Self {
            config,
            profile,
            vision,
            sessions: AsyncMutex::new(sessions),
            processor,
            ledger,
            status: Mutex::new(AgentStatus::default()),
        }
    }

    /// Wires the production backends described by `config`.
    pub fn from_config(config: AgentConfig) -> AgentResult<Self> {
        let profile = match &config.profile_path {
            Some(path) => UiProfile::load(path)?,
            None => UiProfile::default(),
        };

        let factory = WebDriverFactory::new(
            &config.webdriver_url,
            config.webdriver_capabilities.clone(),
            config.chain.timeouts.vision,
        )
        .map_err(|e| AgentError::Config(format!("webdriver client: {}", e)))?;

        let vision: Arc<dyn UiUnderstandingProvider> = match &config.vision_api_key {
            Some(key) => Arc::new(VisionModelProvider::new(&config.vision_api_url, key, &config.vision_model)?),
            None => {
                tracing::warn!("no vision API key configured, vision strategies will never succeed");
                Arc::new(NullProvider)
            }
        };

        let required = |value: &Option<String>, name: &str| {
            value
                .clone()
                .ok_or_else(|| AgentError::Config(format!("{} is not configured", name)))
        };
        let collaborators = Collaborators {
            extractor: Arc::new(HttpExtractor::new(&required(&config.extraction_url, "AGENT_EXTRACTION_URL")?)?),
            renderer: Arc::new(HttpRenderer::new(&required(&config.render_url, "AGENT_RENDER_URL")?)?),
            delivery: Arc::new(HttpDelivery::new(&required(&config.delivery_url, "AGENT_DELIVERY_URL")?)?),
        };

        let ledger = Arc::new(Ledger::open(&config.ledger_path())?);
        let credentials = Arc::new(FileCredentialStore::new(&config.credentials_path()));

        Ok(Self::new(
            config,
            Arc::new(profile),
            Arc::new(factory),
            credentials,
            vision,
            ledger,
            collaborators,
        ))
    }

    pub fn status(&self) -> AgentStatus {
        self.status.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn update_status(&self, f: impl FnOnce(&mut AgentStatus)) {
        f(&mut self.status.lock().unwrap_or_else(|p| p.into_inner()));
    }

    /// Scans the inbox once and processes every unread thread, bottom first.
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> AgentResult<CycleReport> {
        let started = Instant::now();
        let mut report = CycleReport::new();
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let mut sessions = self.sessions.lock().await;
        let result = self.cycle(&mut sessions, cancel, started, &mut report).await;
        report.duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(()) => Ok(()),
            Err(AgentError::FatalSession(reason)) => {
                tracing::error!(error = %reason, "session lost mid-cycle");
                report.aborted = Some(reason.clone());
                self.update_status(|s| {
                    s.session_restarts += 1;
                    s.last_error = Some(reason);
                });
                sessions.restart_on_failure().await
            }
            Err(e) => Err(e),
        };

        self.update_status(|s| {
            s.cycles += 1;
            s.threads_scanned += report.scanned as u64;
            s.last_cycle_at = Some(Utc::now());
            for thread in &report.threads {
                s.tally(thread);
            }
        });
        tracing::info!(
            scanned = report.scanned,
            processed = report.threads.len(),
            cancelled = report.cancelled,
            timed_out = report.timed_out,
            duration_ms = report.duration_ms,
            "cycle finished"
        );
        outcome.map(|_| report)
    }

    async fn cycle(
        &self,
        sessions: &mut SessionManager,
        cancel: &CancellationToken,
        started: Instant,
        report: &mut CycleReport,
    ) -> AgentResult<()> {
        let driver = sessions.acquire().await?.driver.clone();
        let ui = UiContext::new(driver.clone(), self.vision.clone(), self.profile.clone(), &self.config);

        dismiss_interruptions(driver.as_ref(), &self.profile).await?;
        let mut threads = ThreadScanner::new(driver.as_ref(), &self.profile).list_unread().await?;
        for thread in threads.iter_mut() {
            thread.last_processed = self.ledger.last_processed(&thread.id)?;
        }
        report.scanned = threads.len();

        for thread in &threads {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if started.elapsed() >= self.config.cycle_timeout {
                tracing::warn!(remaining = threads.len() - report.threads.len(), "cycle deadline reached");
                report.timed_out = true;
                break;
            }

            match self.processor.process(&ui, thread, cancel).await {
                Ok(done) => report.threads.push(done),
                Err(AgentError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(thread = %thread.id, error = %e, "thread processing errored");
                    self.update_status(|s| {
                        s.failed += 1;
                        s.last_error = Some(e.to_string());
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs cycles every `scan_interval` until cancelled or a fatal error.
    pub async fn run_loop(&self, cancel: &CancellationToken) -> AgentResult<()> {
        tracing::info!(interval_secs = self.config.scan_interval.as_secs_f64(), "agent loop started");
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }
            match self.run_cycle(cancel).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "stopping agent loop");
                    self.update_status(|s| s.last_error = Some(e.to_string()));
                    break Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cycle failed");
                    self.update_status(|s| s.last_error = Some(e.to_string()));
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.config.scan_interval) => {}
            }
        };
        self.sessions.lock().await.close().await;
        tracing::info!("agent loop stopped");
        result
    }

    /// Processes one thread by id or label, read or not. `None` when no such
    /// thread is visible.
    pub async fn process_target(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> AgentResult<Option<ThreadReport>> {
        let mut sessions = self.sessions.lock().await;
        let driver = sessions.acquire().await?.driver.clone();
        let ui = UiContext::new(driver, self.vision.clone(), self.profile.clone(), &self.config);
        let result = self.target(&ui, identifier, cancel).await;

        if let Err(AgentError::FatalSession(reason)) = &result {
            self.update_status(|s| {
                s.session_restarts += 1;
                s.last_error = Some(reason.clone());
            });
            if let Err(e) = sessions.restart_on_failure().await {
                tracing::error!(error = %e, "session restart failed");
            }
        }
        if let Ok(Some(report)) = &result {
            self.update_status(|s| s.tally(report));
        }
        result
    }

    async fn target(
        &self,
        ui: &UiContext,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> AgentResult<Option<ThreadReport>> {
        dismiss_interruptions(ui.driver.as_ref(), &self.profile).await?;
        let Some(mut thread) = ThreadScanner::new(ui.driver.as_ref(), &self.profile).find(identifier).await? else {
            tracing::info!(target_thread = identifier, "no visible thread matches");
            return Ok(None);
        };
        thread.last_processed = self.ledger.last_processed(&thread.id)?;
        self.processor.process(ui, &thread, cancel).await.map(Some)
    }

    pub async fn shutdown(&self) {
        self.sessions.lock().await.close().await;
    }
}
