// Session Manager - owns the single authenticated automation session.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{AgentConfig, VerifierSettings};
use crate::credentials::{CredentialStore, StoredSession};
use crate::driver::{locate_first, AutomationDriver, DriverFactory, Locator};
use crate::error::{AgentError, AgentResult, DriverError};
use crate::profile::UiProfile;
use crate::retry::{with_retry, RetryConfig};
use crate::verifier::{ExpectedState, NavigationVerifier, VerificationOutcome};
use crate::vision::UiUnderstandingProvider;

pub struct Session {
    pub id: String,
    pub driver: Arc<dyn AutomationDriver>,
    pub created_at: DateTime<Utc>,
    live: bool,
}

impl Session {
    pub fn is_live(&self) -> bool {
        self.live
    }
}

pub struct SessionManager {
    factory: Arc<dyn DriverFactory>,
    credentials: Arc<dyn CredentialStore>,
    vision: Arc<dyn UiUnderstandingProvider>,
    profile: Arc<UiProfile>,
    verifier_settings: VerifierSettings,
    login_retry: RetryConfig,
    username: Option<String>,
    password: Option<String>,
    current: Option<Session>,
    restarts: u64,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        credentials: Arc<dyn CredentialStore>,
        vision: Arc<dyn UiUnderstandingProvider>,
        profile: Arc<UiProfile>,
        config: &AgentConfig,
    ) -> Self {
        Self {
            factory,
            credentials,
            vision,
            profile,
            verifier_settings: config.verifier.clone(),
            login_retry: config.login_retry.clone(),
            username: config.account_username.clone(),
            password: config.account_password.clone(),
            current: None,
            restarts: 0,
        }
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    pub fn account(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Returns the live session, creating and authenticating one if needed.
    pub async fn acquire(&mut self) -> AgentResult<&Session> {
        let reusable = self.current.as_ref().map(|s| s.live).unwrap_or(false);
        if !reusable {
            if let Some(stale) = self.current.take() {
                quit_quietly(&stale).await;
            }
            let session = self.start().await?;
            self.current = Some(session);
        }
        self.current
            .as_ref()
            .ok_or_else(|| AgentError::FatalSession("session vanished after start".into()))
    }

    async fn start(&self) -> AgentResult<Session> {
        let factory = self.factory.as_ref();
        let driver = with_retry(&self.login_retry, "start_driver", move || async move {
            factory
                .create()
                .await
                .map_err(|e| AgentError::TransientUi(format!("driver start failed: {}", e)))
        })
        .await
        .map_err(|e| AgentError::FatalSession(format!("could not start automation session: {}", e)))?;

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            driver,
            created_at: Utc::now(),
            live: true,
        };
        tracing::info!(session = %session.id, "automation session started");

        if let Err(e) = self.authenticate(session.driver.clone()).await {
            quit_quietly(&session).await;
            return Err(e);
        }
        Ok(session)
    }

    /// Reuses persisted cookies when they still work, otherwise logs in
    /// with credentials under bounded backoff. Exhaustion is an auth failure.
    pub async fn authenticate(&self, driver: Arc<dyn AutomationDriver>) -> AgentResult<()> {
        let verifier = NavigationVerifier::new(
            driver.clone(),
            self.vision.clone(),
            self.profile.clone(),
            self.verifier_settings.clone(),
        );

        if let Some(stored) = self.credentials.load().await? {
            if !stored.is_empty() && self.restore(driver.as_ref(), &verifier, &stored).await? {
                tracing::info!(cookies = stored.cookies.len(), "session restored from stored cookies");
                return Ok(());
            }
            tracing::info!("stored session no longer valid, logging in");
        }

        let (Some(username), Some(password)) = (self.username.as_deref(), self.password.as_deref()) else {
            return Err(AgentError::Auth("no stored session and no account credentials configured".into()));
        };

        let driver_ref = driver.as_ref();
        let verifier_ref = &verifier;
        let result = with_retry(&self.login_retry, "login", move || {
            self.login_once(driver_ref, verifier_ref, username, password)
        })
        .await;

        match result {
            Ok(()) => {}
            Err(e @ AgentError::FatalSession(_)) | Err(e @ AgentError::Auth(_)) => return Err(e),
            Err(e) => {
                return Err(AgentError::Auth(format!(
                    "login failed after {} attempts: {}",
                    self.login_retry.max_attempts, e
                )))
            }
        }

        let cookies = match driver.cookies().await {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "could not read cookies after login");
                Vec::new()
            }
        };
        let stored = StoredSession {
            username: Some(username.to_string()),
            cookies,
            token: None,
            saved_at: Some(Utc::now()),
        };
        if let Err(e) = self.credentials.save(&stored).await {
            tracing::warn!(error = %e, "could not persist session artifacts");
        }
        tracing::info!(account = username, "logged in");
        Ok(())
    }

    async fn restore(
        &self,
        driver: &dyn AutomationDriver,
        verifier: &NavigationVerifier,
        stored: &StoredSession,
    ) -> AgentResult<bool> {
        if let Err(e) = driver.set_cookies(&stored.cookies).await {
            if let DriverError::InvalidSession(msg) = e {
                return Err(AgentError::FatalSession(msg));
            }
            tracing::debug!(error = %e, "cookie restore rejected");
            return Ok(false);
        }
        driver.navigate(&self.profile.inbox_deep_link).await?;
        dismiss_interruptions(driver, &self.profile).await?;
        Ok(verifier.verify(&ExpectedState::Inbox).await? == VerificationOutcome::Verified)
    }

    async fn login_once(
        &self,
        driver: &dyn AutomationDriver,
        verifier: &NavigationVerifier,
        username: &str,
        password: &str,
    ) -> AgentResult<()> {
        let login = &self.profile.login;
        driver.navigate(&login.url).await?;

        fill(driver, &login.username_field, username, "username").await?;
        fill(driver, &login.password_field, password, "password").await?;
        let submit = first_element(driver, &login.submit, "login button").await?;
        driver.click(&submit).await?;

        dismiss_interruptions(driver, &self.profile).await?;
        driver.navigate(&self.profile.inbox_deep_link).await?;
        dismiss_interruptions(driver, &self.profile).await?;

        match verifier.verify(&ExpectedState::Inbox).await? {
            VerificationOutcome::Verified => Ok(()),
            other => Err(AgentError::TransientUi(format!("inbox not reached after login ({:?})", other))),
        }
    }

    /// Marks the current session unusable; the next acquire starts over.
    pub fn invalidate(&mut self) {
        if let Some(session) = self.current.as_mut() {
            session.live = false;
        }
    }

    pub async fn restart_on_failure(&mut self) -> AgentResult<()> {
        self.invalidate();
        self.restarts += 1;
        tracing::warn!(restarts = self.restarts, "restarting automation session");
        self.acquire().await.map(|_| ())
    }

    pub async fn close(&mut self) {
        if let Some(session) = self.current.take() {
            quit_quietly(&session).await;
            tracing::info!(session = %session.id, "automation session closed");
        }
    }
}

async fn quit_quietly(session: &Session) {
    if let Err(e) = session.driver.quit().await {
        tracing::debug!(session = %session.id, error = %e, "quit failed");
    }
}

async fn first_element(
    driver: &dyn AutomationDriver,
    locators: &[Locator],
    what: &str,
) -> AgentResult<crate::driver::Element> {
    locate_first(driver, locators)
        .await?
        .and_then(|(_, found)| found.into_iter().next())
        .ok_or_else(|| AgentError::TransientUi(format!("{} not found", what)))
}

async fn fill(driver: &dyn AutomationDriver, locators: &[Locator], text: &str, what: &str) -> AgentResult<()> {
    let field = first_element(driver, locators, what).await?;
    driver.type_text(&field, text).await?;
    Ok(())
}

/// Taps away known interruption dialogs. Best-effort: nothing here is
/// verified and only a dead session is an error.
pub async fn dismiss_interruptions(driver: &dyn AutomationDriver, profile: &UiProfile) -> AgentResult<usize> {
    let mut dismissed = 0;
    for locator in &profile.interruption_locators {
        match driver.locate(locator).await {
            Ok(found) => {
                if let Some(button) = found.first() {
                    match driver.click(button).await {
                        Ok(()) => {
                            dismissed += 1;
                            tracing::info!(locator = %locator, "dismissed interruption");
                        }
                        Err(DriverError::InvalidSession(msg)) => return Err(AgentError::FatalSession(msg)),
                        Err(e) => tracing::debug!(error = %e, "interruption tap failed"),
                    }
                }
            }
            Err(DriverError::InvalidSession(msg)) => return Err(AgentError::FatalSession(msg)),
            Err(_) => {}
        }
    }
    Ok(dismissed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::FileCredentialStore;
    use crate::testing::{fast_config, test_profile, FakeFactory, FakeVision};
    use crate::vision::VisionVerdict;
    use serde_json::json;

    fn manager(factory: &Arc<FakeFactory>, store: Arc<dyn CredentialStore>, password: Option<&str>) -> SessionManager {
        let mut config = fast_config();
        config.account_username = Some("recipe_bot".into());
        config.account_password = password.map(|p| p.to_string());
        SessionManager::new(
            factory.clone(),
            store,
            Arc::new(FakeVision::new(VisionVerdict::Unsure)),
            Arc::new(test_profile()),
            &config,
        )
    }

    #[tokio::test]
    async fn full_login_persists_cookies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::new(&dir.path().join("credentials.json")));
        let factory = Arc::new(FakeFactory::new("hunter2"));
        let mut sessions = manager(&factory, store.clone(), Some("hunter2"));

        sessions.acquire().await.unwrap();
        let driver = factory.last().unwrap();
        assert!(driver.typed().contains(&"hunter2".to_string()));
        assert_eq!(driver.count_actions("click:popup-not-now"), 1);

        let saved = store.load().await.unwrap().unwrap();
        assert!(!saved.cookies.is_empty());
    }

    #[tokio::test]
    async fn stored_cookies_skip_the_login_form() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::new(&dir.path().join("credentials.json")));
        store
            .save(&StoredSession {
                username: Some("recipe_bot".into()),
                cookies: vec![json!({ "name": "sessionid", "value": "fake" })],
                token: None,
                saved_at: None,
            })
            .await
            .unwrap();
        let factory = Arc::new(FakeFactory::new("hunter2"));
        let mut sessions = manager(&factory, store, None);

        sessions.acquire().await.unwrap();
        assert!(factory.last().unwrap().typed().is_empty());
    }

    #[tokio::test]
    async fn wrong_password_is_an_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::new(&dir.path().join("credentials.json")));
        let factory = Arc::new(FakeFactory::new("hunter2"));
        let mut sessions = manager(&factory, store, Some("wrong"));

        let err = sessions.acquire().await.err().unwrap();
        assert!(matches!(err, AgentError::Auth(_)));
        assert!(factory.last().unwrap().quit_called());
    }

    #[tokio::test]
    async fn missing_credentials_are_an_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::new(&dir.path().join("credentials.json")));
        let factory = Arc::new(FakeFactory::new("hunter2"));
        let mut sessions = manager(&factory, store, None);
        assert!(matches!(sessions.acquire().await, Err(AgentError::Auth(_))));
    }

    #[tokio::test]
    async fn restart_replaces_the_driver() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCredentialStore::new(&dir.path().join("credentials.json")));
        let factory = Arc::new(FakeFactory::new("hunter2"));
        let mut sessions = manager(&factory, store, Some("hunter2"));

        let first = sessions.acquire().await.unwrap().id.clone();
        sessions.restart_on_failure().await.unwrap();
        let second = sessions.acquire().await.unwrap().id.clone();

        assert_ne!(first, second);
        assert_eq!(sessions.restarts(), 1);
        assert_eq!(factory.created(), 2);
        assert!(factory.driver(0).unwrap().quit_called());
    }
}
