// Automation Driver - capability set over one UI automation backend.
// Everything above this layer speaks Locator / Element / Snapshot and never
// a backend-specific API.

pub mod webdriver;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::DriverError;

// =====================================================
// Locators & Elements
// =====================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorKind {
    AccessibilityId,
    XPath,
    Css,
    ClassName,
    ClassChain,
    Predicate,
}

impl LocatorKind {
    /// Strategy name on the WebDriver wire.
    pub fn as_wire(&self) -> &'static str {
        match self {
            LocatorKind::AccessibilityId => "accessibility id",
            LocatorKind::XPath => "xpath",
            LocatorKind::Css => "css selector",
            LocatorKind::ClassName => "class name",
            LocatorKind::ClassChain => "-ios class chain",
            LocatorKind::Predicate => "-ios predicate string",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub kind: LocatorKind,
    pub value: String,
}

impl Locator {
    pub fn new(kind: LocatorKind, value: &str) -> Self {
        Self { kind, value: value.to_string() }
    }

    pub fn accessibility_id(value: &str) -> Self {
        Self::new(LocatorKind::AccessibilityId, value)
    }

    pub fn xpath(value: &str) -> Self {
        Self::new(LocatorKind::XPath, value)
    }

    pub fn class_chain(value: &str) -> Self {
        Self::new(LocatorKind::ClassChain, value)
    }

    pub fn predicate(value: &str) -> Self {
        Self::new(LocatorKind::Predicate, value)
    }

    pub fn class_name(value: &str) -> Self {
        Self::new(LocatorKind::ClassName, value)
    }

    pub fn css(value: &str) -> Self {
        Self::new(LocatorKind::Css, value)
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.kind.as_wire(), self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2, self.y + self.height / 2)
    }

    pub fn contains(&self, point: Point) -> bool {
        self.width > 0
            && self.height > 0
            && point.x >= self.x
            && point.x <= self.x + self.width
            && point.y >= self.y
            && point.y <= self.y + self.height
    }
}

/// Element handle from the live UI. Handles go stale once the screen changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub text: String,
    pub bounds: Option<Bounds>,
}

/// Screen position expressed as a fraction of the viewport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativePoint {
    pub x: f32,
    pub y: f32,
}

impl RelativePoint {
    pub fn resolve(&self, viewport: Bounds) -> Point {
        Point::new(
            viewport.x + (viewport.width as f32 * self.x.clamp(0.0, 1.0)) as i32,
            viewport.y + (viewport.height as f32 * self.y.clamp(0.0, 1.0)) as i32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

impl SwipeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwipeDirection::Up => "up",
            SwipeDirection::Down => "down",
            SwipeDirection::Left => "left",
            SwipeDirection::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapOptions {
    /// Press duration. Long presses open context menus on most targets.
    pub duration_ms: u64,
}

impl Default for TapOptions {
    fn default() -> Self {
        Self { duration_ms: 100 }
    }
}

// =====================================================
// Snapshot
// =====================================================

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub taken_at: DateTime<Utc>,
    /// Base64 PNG, when the backend could capture one.
    pub screenshot_b64: Option<String>,
}

impl Snapshot {
    pub fn new(screenshot_b64: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            taken_at: Utc::now(),
            screenshot_b64,
        }
    }

    /// Evidence marker without pixels, for strategies that never look at the screen.
    pub fn marker() -> Self {
        Self::new(None)
    }
}

// =====================================================
// Driver capability set
// =====================================================

#[async_trait]
pub trait AutomationDriver: Send + Sync {
    async fn locate(&self, locator: &Locator) -> Result<Vec<Element>, DriverError>;

    async fn click(&self, element: &Element) -> Result<(), DriverError>;

    async fn tap(&self, point: Point, options: TapOptions) -> Result<(), DriverError>;

    async fn type_text(&self, element: &Element, text: &str) -> Result<(), DriverError>;

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError>;

    async fn swipe(&self, direction: SwipeDirection) -> Result<(), DriverError>;

    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    async fn viewport(&self) -> Result<Bounds, DriverError>;

    async fn screenshot(&self) -> Result<String, DriverError>;

    async fn cookies(&self) -> Result<Vec<Value>, DriverError>;

    async fn set_cookies(&self, cookies: &[Value]) -> Result<(), DriverError>;

    async fn quit(&self) -> Result<(), DriverError>;

    /// Screen capture tagged with an evidence id. A backend that cannot take
    /// screenshots still yields a snapshot; only a dead session is an error.
    async fn snapshot(&self) -> Result<Snapshot, DriverError> {
        match self.screenshot().await {
            Ok(b64) => Ok(Snapshot::new(Some(b64))),
            Err(DriverError::InvalidSession(msg)) => Err(DriverError::InvalidSession(msg)),
            Err(_) => Ok(Snapshot::new(None)),
        }
    }
}

/// Creates fresh driver contexts; the session manager owns the result.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn AutomationDriver>, DriverError>;
}

/// Locate with an ordered list of locators; the first one yielding elements wins.
pub async fn locate_first(
    driver: &dyn AutomationDriver,
    locators: &[Locator],
) -> Result<Option<(Locator, Vec<Element>)>, DriverError> {
    for locator in locators {
        match driver.locate(locator).await {
            Ok(found) if !found.is_empty() => return Ok(Some((locator.clone(), found))),
            Ok(_) => {}
            Err(DriverError::InvalidSession(msg)) => return Err(DriverError::InvalidSession(msg)),
            Err(DriverError::NoSuchElement(_)) => {}
            Err(e) => tracing::debug!(locator = %locator, error = %e, "locator failed"),
        }
    }
    Ok(None)
}
