// W3C WebDriver backend. Speaks the plain HTTP wire protocol, so the same
// client drives chromedriver/geckodriver (web) and an Appium server (mobile).

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::{AutomationDriver, Bounds, DriverFactory, Element, Locator, Point, SwipeDirection, TapOptions};
use crate::error::DriverError;

const ELEMENT_KEY: &str = "element-6066-11e4-a4ae-4f4a5f6b4e5f";
const LEGACY_ELEMENT_KEY: &str = "ELEMENT";

pub struct WebDriverFactory {
    client: Client,
    server_url: String,
    capabilities: Value,
}

impl WebDriverFactory {
    pub fn new(server_url: &str, capabilities: Value, request_timeout: Duration) -> Result<Self, DriverError> {
        let client = Client::builder()
            .no_proxy()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            capabilities,
        })
    }
}

#[async_trait]
impl DriverFactory for WebDriverFactory {
    async fn create(&self) -> Result<Arc<dyn AutomationDriver>, DriverError> {
        let body = json!({ "capabilities": { "alwaysMatch": self.capabilities } });
        let url = format!("{}/session", self.server_url);
        let resp = self.client.post(&url).json(&body).send().await?;
        let payload: Value = resp.json().await?;
        let value = unwrap_value(payload)?;

        let session_id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DriverError::Protocol("new session response without sessionId".into()))?
            .to_string();

        tracing::info!(session = %session_id, server = %self.server_url, "webdriver session created");
        Ok(Arc::new(WebDriverClient {
            client: self.client.clone(),
            base: format!("{}/session/{}", self.server_url, session_id),
            session_id,
        }))
    }
}

pub struct WebDriverClient {
    client: Client,
    base: String,
    session_id: String,
}

impl WebDriverClient {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DriverError> {
        let url = format!("{}{}", self.base, path);
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await?;
        let payload: Value = resp.json().await?;
        unwrap_value(payload)
    }

    async fn element_text(&self, id: &str) -> String {
        if let Ok(Value::String(text)) = self.command(Method::GET, &format!("/element/{}/text", id), None).await {
            if !text.trim().is_empty() {
                return text;
            }
        }
        // Native mobile elements often keep their text in attributes only.
        for attr in ["value", "label", "name"] {
            if let Ok(Value::String(text)) = self
                .command(Method::GET, &format!("/element/{}/attribute/{}", id, attr), None)
                .await
            {
                if !text.trim().is_empty() {
                    return text;
                }
            }
        }
        String::new()
    }

    async fn element_rect(&self, id: &str) -> Option<Bounds> {
        let rect = self.command(Method::GET, &format!("/element/{}/rect", id), None).await.ok()?;
        Some(Bounds {
            x: rect.get("x")?.as_f64()? as i32,
            y: rect.get("y")?.as_f64()? as i32,
            width: rect.get("width")?.as_f64()? as i32,
            height: rect.get("height")?.as_f64()? as i32,
        })
    }

    async fn perform_pointer(&self, actions: Vec<Value>) -> Result<(), DriverError> {
        let body = json!({
            "actions": [{
                "type": "pointer",
                "id": "finger1",
                "parameters": { "pointerType": "touch" },
                "actions": actions,
            }]
        });
        self.command(Method::POST, "/actions", Some(body)).await?;
        let _ = self.command(Method::DELETE, "/actions", None).await;
        Ok(())
    }
}

fn unwrap_value(payload: Value) -> Result<Value, DriverError> {
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if let Some(code) = value.get("error").and_then(|v| v.as_str()) {
        let message = value
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        return Err(classify_wire_error(code, message));
    }
    Ok(value)
}

fn classify_wire_error(code: &str, message: String) -> DriverError {
    match code {
        "no such element" => DriverError::NoSuchElement(message),
        "stale element reference" => DriverError::StaleElement(message),
        "invalid session id" | "session not created" => DriverError::InvalidSession(message),
        "timeout" | "script timeout" => DriverError::Timeout(message),
        other => DriverError::Protocol(format!("{}: {}", other, message)),
    }
}

fn element_id(value: &Value) -> Option<String> {
    value
        .get(ELEMENT_KEY)
        .or_else(|| value.get(LEGACY_ELEMENT_KEY))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn swipe_path(viewport: Bounds, direction: SwipeDirection) -> (Point, Point) {
    let center = viewport.center();
    let dx = viewport.width * 35 / 100;
    let dy = viewport.height * 30 / 100;
    match direction {
        SwipeDirection::Up => (Point::new(center.x, center.y + dy), Point::new(center.x, center.y - dy)),
        SwipeDirection::Down => (Point::new(center.x, center.y - dy), Point::new(center.x, center.y + dy)),
        SwipeDirection::Left => (Point::new(center.x + dx, center.y), Point::new(center.x - dx, center.y)),
        SwipeDirection::Right => (Point::new(viewport.x + 5, center.y), Point::new(center.x + dx, center.y)),
    }
}

#[async_trait]
impl AutomationDriver for WebDriverClient {
    async fn locate(&self, locator: &Locator) -> Result<Vec<Element>, DriverError> {
        let body = json!({ "using": locator.kind.as_wire(), "value": locator.value });
        let found = self.command(Method::POST, "/elements", Some(body)).await?;
        let mut elements = Vec::new();
        for raw in found.as_array().cloned().unwrap_or_default() {
            let Some(id) = element_id(&raw) else { continue };
            let bounds = self.element_rect(&id).await;
            let text = self.element_text(&id).await;
            elements.push(Element { id, text, bounds });
        }
        Ok(elements)
    }

    async fn click(&self, element: &Element) -> Result<(), DriverError> {
        self.command(Method::POST, &format!("/element/{}/click", element.id), Some(json!({})))
            .await
            .map(|_| ())
    }

    async fn tap(&self, point: Point, options: TapOptions) -> Result<(), DriverError> {
        self.perform_pointer(vec![
            json!({ "type": "pointerMove", "duration": 0, "x": point.x, "y": point.y }),
            json!({ "type": "pointerDown", "button": 0 }),
            json!({ "type": "pause", "duration": options.duration_ms }),
            json!({ "type": "pointerUp", "button": 0 }),
        ])
        .await
    }

    async fn type_text(&self, element: &Element, text: &str) -> Result<(), DriverError> {
        self.command(
            Method::POST,
            &format!("/element/{}/value", element.id),
            Some(json!({ "text": text })),
        )
        .await
        .map(|_| ())
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError> {
        self.command(Method::POST, "/execute/sync", Some(json!({ "script": script, "args": args })))
            .await
    }

    async fn swipe(&self, direction: SwipeDirection) -> Result<(), DriverError> {
        let viewport = self.viewport().await?;
        let (from, to) = swipe_path(viewport, direction);
        self.perform_pointer(vec![
            json!({ "type": "pointerMove", "duration": 0, "x": from.x, "y": from.y }),
            json!({ "type": "pointerDown", "button": 0 }),
            json!({ "type": "pointerMove", "duration": 300, "x": to.x, "y": to.y }),
            json!({ "type": "pointerUp", "button": 0 }),
        ])
        .await
    }

    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url }))).await.map(|_| ())
    }

    async fn viewport(&self) -> Result<Bounds, DriverError> {
        let rect = self.command(Method::GET, "/window/rect", None).await?;
        let read = |key: &str| rect.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0) as i32;
        Ok(Bounds { x: 0, y: 0, width: read("width"), height: read("height") })
    }

    async fn screenshot(&self) -> Result<String, DriverError> {
        match self.command(Method::GET, "/screenshot", None).await? {
            Value::String(b64) => Ok(b64),
            other => Err(DriverError::Protocol(format!("unexpected screenshot payload: {}", other))),
        }
    }

    async fn cookies(&self) -> Result<Vec<Value>, DriverError> {
        let value = self.command(Method::GET, "/cookie", None).await?;
        Ok(value.as_array().cloned().unwrap_or_default())
    }

    async fn set_cookies(&self, cookies: &[Value]) -> Result<(), DriverError> {
        for cookie in cookies {
            self.command(Method::POST, "/cookie", Some(json!({ "cookie": cookie }))).await?;
        }
        Ok(())
    }

    async fn quit(&self) -> Result<(), DriverError> {
        let resp = self.client.delete(&self.base).send().await?;
        tracing::info!(session = %self.session_id, status = %resp.status(), "webdriver session closed");
        Ok(())
    }
}
