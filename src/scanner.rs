// Thread Scanner - lists unread threads of the visible inbox, bottom first.
//
// Every call reads the live UI again. Processing bottom-up keeps the
// positions of the remaining threads valid while the ones above are read.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::driver::{locate_first, AutomationDriver, Element};
use crate::error::{AgentResult, DriverError};
use crate::profile::UiProfile;

#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: String,
    pub label: String,
    pub unread: bool,
    /// Index in the visible list, 0 at the top.
    pub position: usize,
    #[serde(skip)]
    pub element: Element,
    pub last_processed: Option<DateTime<Utc>>,
}

pub struct ThreadScanner<'a> {
    driver: &'a dyn AutomationDriver,
    profile: &'a UiProfile,
}

impl<'a> ThreadScanner<'a> {
    pub fn new(driver: &'a dyn AutomationDriver, profile: &'a UiProfile) -> Self {
        Self { driver, profile }
    }

    pub async fn list_unread(&self) -> AgentResult<Vec<Thread>> {
        let cells = match locate_first(self.driver, &self.profile.unread_thread_locators).await? {
            Some((locator, cells)) => {
                tracing::debug!(locator = %locator, count = cells.len(), "unread cells located");
                cells
            }
            None => Vec::new(),
        };

        let mut threads = self.to_threads(cells, true);
        threads.reverse();
        tracing::info!(unread = threads.len(), "inbox scanned");
        Ok(threads)
    }

    /// All visible threads, top to bottom, read or not.
    pub async fn list_all(&self) -> AgentResult<Vec<Thread>> {
        let cells = match self.driver.locate(&self.profile.thread_cell_locator).await {
            Ok(found) => found,
            Err(DriverError::NoSuchElement(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(self.to_threads(cells, false))
    }

    /// Thread whose id or label matches `identifier`, case-insensitively.
    pub async fn find(&self, identifier: &str) -> AgentResult<Option<Thread>> {
        let wanted = identifier.trim().to_lowercase();
        let threads = self.list_all().await?;
        Ok(threads
            .into_iter()
            .find(|t| t.id.to_lowercase() == wanted || t.label.to_lowercase().contains(&wanted)))
    }

    fn to_threads(&self, mut cells: Vec<Element>, unread: bool) -> Vec<Thread> {
        cells.sort_by_key(|e| e.bounds.map(|b| b.y).unwrap_or(i32::MAX));
        cells
            .into_iter()
            .filter(|cell| !self.profile.is_excluded_label(&cell.text))
            .enumerate()
            .map(|(position, cell)| {
                let (id, label) = thread_identity(&cell.text, self.profile);
                Thread { id, label, unread, position, element: cell, last_processed: None }
            })
            .collect()
    }
}

/// Thread id is its name label; unusable labels fall back to a hash of the cell text.
pub fn thread_identity(cell_text: &str, profile: &UiProfile) -> (String, String) {
    let label = cell_text
        .lines()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .unwrap_or_default()
        .to_string();
    if label.is_empty() || profile.is_excluded_label(&label) {
        let digest = hex::encode(Sha256::digest(cell_text.trim().as_bytes()));
        (format!("thread-{}", &digest[..12]), label)
    } else {
        (label.clone(), label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_profile, FakeDriver};

    #[tokio::test]
    async fn unread_threads_come_bottom_first() {
        let driver = FakeDriver::new();
        driver.add_thread("top", true, false);
        driver.add_thread("middle", false, false);
        driver.add_thread("bottom", true, false);
        let profile = test_profile();

        let threads = ThreadScanner::new(&driver, &profile).list_unread().await.unwrap();
        let ids: Vec<&str> = threads.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["bottom", "top"]);
        assert!(threads[0].position > threads[1].position);
    }

    #[tokio::test]
    async fn excluded_rows_are_not_threads() {
        let driver = FakeDriver::new();
        driver.add_thread("video-call", true, false);
        driver.add_thread("chef_anna", true, false);
        let profile = test_profile();

        let threads = ThreadScanner::new(&driver, &profile).list_unread().await.unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id, "chef_anna");
    }

    #[tokio::test]
    async fn find_matches_read_threads_too() {
        let driver = FakeDriver::new();
        driver.add_thread("Chef_Anna", false, false);
        let profile = test_profile();

        let found = ThreadScanner::new(&driver, &profile).find("chef_anna").await.unwrap();
        assert_eq!(found.map(|t| t.id), Some("Chef_Anna".to_string()));
        assert!(ThreadScanner::new(&driver, &profile).find("nobody").await.unwrap().is_none());
    }

    #[test]
    fn unlabeled_cells_get_stable_ids() {
        let profile = test_profile();
        let (a, _) = thread_identity("  \n", &profile);
        let (b, _) = thread_identity("  \n", &profile);
        assert_eq!(a, b);
        assert!(a.starts_with("thread-"));
        assert_eq!(thread_identity("anna\nsent a post", &profile).0, "anna");
    }
}
