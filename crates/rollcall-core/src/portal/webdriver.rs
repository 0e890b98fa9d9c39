//! Portal binding over the W3C WebDriver HTTP protocol.
//!
//! The portal's user-management page addresses everything through DOM ids:
//!
//! - user rows: `tr` elements with id `teacher-<id>`
//! - row fields: `email-<id>`, `analytics-<id>`, `provisionmap-<id>`,
//!   `detentions-<id>`; flag controls expose their state in `data-value`
//! - row menu: an ellipsis icon under the element with id `<id>`, holding a
//!   `set-password` link to `#<id>`
//! - password dialog: a global confirm button `change-teacher-password`

use std::process::{Child, Command, Stdio};
use std::time::Duration;

use reqwest::Method;
use secrecy::ExposeSecret;
use serde_json::{Value, json};

use super::{
    ActuationError, AuthenticationError, PermissionFlag, PortalActuator, PortalCredentials,
    PortalLauncher, RowHandle, Waiter,
};
use crate::config::{PortalConfig, RowMatch};

/// W3C element reference key.
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4a5ae5d8a6e6";

const ROW_XPATH: &str = r#"//tr[starts-with(@id, "teacher-")]"#;
const LOGIN_SUBMIT_CSS: &str = r#"input[type="submit"][value="Log in"]"#;
const CONFIRM_PASSWORD_CSS: &str = r#"[id="change-teacher-password"]"#;
const SCROLL_INTO_VIEW_JS: &str = "arguments[0].scrollIntoView({block: 'center'});";
const CLICK_JS: &str = "arguments[0].click();";

/// Element lookup strategy.
#[derive(Debug, Clone)]
enum Locator {
    Css(String),
    XPath(String),
}

impl Locator {
    fn id(id: &str) -> Self {
        Self::Css(format!(r#"[id="{id}"]"#))
    }

    fn payload(&self) -> Value {
        match self {
            Self::Css(selector) => json!({ "using": "css selector", "value": selector }),
            Self::XPath(path) => json!({ "using": "xpath", "value": path }),
        }
    }

    fn describe(&self) -> &str {
        match self {
            Self::Css(value) | Self::XPath(value) => value,
        }
    }
}

/// Opaque driver-side element id.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ElementId(String);

impl ElementId {
    fn from_value(value: &Value) -> Result<Self, ActuationError> {
        value
            .get(ELEMENT_KEY)
            .and_then(Value::as_str)
            .map(|id| Self(id.to_string()))
            .ok_or_else(|| ActuationError::Protocol(format!("not an element reference: {value}")))
    }

    fn reference(&self) -> Value {
        json!({ ELEMENT_KEY: self.0 })
    }
}

/// Minimal blocking WebDriver client bound to one session.
struct WebDriverClient {
    http: reqwest::blocking::Client,
    base_url: String,
    session_id: String,
}

impl WebDriverClient {
    fn http_client() -> Result<reqwest::blocking::Client, ActuationError> {
        reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|error| ActuationError::Http {
                status: None,
                message: error.to_string(),
            })
    }

    fn new_session(base_url: &str, capabilities: Value) -> Result<Self, ActuationError> {
        let http = Self::http_client()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let value = send(
            &http,
            Method::POST,
            &format!("{base_url}/session"),
            Some(&json!({ "capabilities": capabilities })),
            "new session",
        )?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ActuationError::Protocol(format!("new session reply: {value}")))?
            .to_string();

        tracing::info!(session_id = %session_id, "webdriver session started");
        Ok(Self {
            http,
            base_url,
            session_id,
        })
    }

    fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        target: &str,
    ) -> Result<Value, ActuationError> {
        let url = format!("{}/session/{}{path}", self.base_url, self.session_id);
        send(&self.http, method, &url, body, target)
    }

    fn navigate(&self, url: &str) -> Result<(), ActuationError> {
        self.command(Method::POST, "/url", Some(&json!({ "url": url })), url)
            .map(drop)
    }

    fn current_url(&self) -> Result<String, ActuationError> {
        let value = self.command(Method::GET, "/url", None, "current url")?;
        value
            .as_str()
            .map(ToString::to_string)
            .ok_or_else(|| ActuationError::Protocol(format!("current url reply: {value}")))
    }

    fn find(&self, locator: &Locator) -> Result<ElementId, ActuationError> {
        let value = self.command(
            Method::POST,
            "/element",
            Some(&locator.payload()),
            locator.describe(),
        )?;
        ElementId::from_value(&value)
    }

    fn find_all(&self, locator: &Locator) -> Result<Vec<ElementId>, ActuationError> {
        let value = self.command(
            Method::POST,
            "/elements",
            Some(&locator.payload()),
            locator.describe(),
        )?;
        value
            .as_array()
            .ok_or_else(|| ActuationError::Protocol(format!("find elements reply: {value}")))?
            .iter()
            .map(ElementId::from_value)
            .collect()
    }

    fn find_within(&self, parent: &ElementId, locator: &Locator) -> Result<ElementId, ActuationError> {
        let value = self.command(
            Method::POST,
            &format!("/element/{}/element", parent.0),
            Some(&locator.payload()),
            locator.describe(),
        )?;
        ElementId::from_value(&value)
    }

    fn text(&self, element: &ElementId) -> Result<String, ActuationError> {
        let value = self.command(Method::GET, &format!("/element/{}/text", element.0), None, "text")?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn attribute(&self, element: &ElementId, name: &str) -> Result<Option<String>, ActuationError> {
        let value = self.command(
            Method::GET,
            &format!("/element/{}/attribute/{name}", element.0),
            None,
            name,
        )?;
        Ok(value.as_str().map(ToString::to_string))
    }

    fn flag(&self, element: &ElementId, property: &str) -> Result<bool, ActuationError> {
        let value = self.command(
            Method::GET,
            &format!("/element/{}/{property}", element.0),
            None,
            property,
        )?;
        Ok(value.as_bool().unwrap_or(false))
    }

    fn is_interactive(&self, element: &ElementId) -> Result<bool, ActuationError> {
        Ok(self.flag(element, "displayed")? && self.flag(element, "enabled")?)
    }

    fn clear(&self, element: &ElementId) -> Result<(), ActuationError> {
        self.command(
            Method::POST,
            &format!("/element/{}/clear", element.0),
            Some(&json!({})),
            "clear",
        )
        .map(drop)
    }

    fn send_keys(&self, element: &ElementId, text: &str) -> Result<(), ActuationError> {
        self.command(
            Method::POST,
            &format!("/element/{}/value", element.0),
            Some(&json!({ "text": text })),
            "send keys",
        )
        .map(drop)
    }

    fn click(&self, element: &ElementId) -> Result<(), ActuationError> {
        self.command(
            Method::POST,
            &format!("/element/{}/click", element.0),
            Some(&json!({})),
            "click",
        )
        .map(drop)
    }

    fn execute(&self, script: &str, element: &ElementId) -> Result<Value, ActuationError> {
        self.command(
            Method::POST,
            "/execute/sync",
            Some(&json!({ "script": script, "args": [element.reference()] })),
            "execute script",
        )
    }

    fn delete_session(&self) -> Result<(), ActuationError> {
        self.command(Method::DELETE, "", None, "delete session").map(drop)
    }
}

/// Sends one WebDriver command and unwraps the `value` member of the reply.
fn send(
    http: &reqwest::blocking::Client,
    method: Method,
    url: &str,
    body: Option<&Value>,
    target: &str,
) -> Result<Value, ActuationError> {
    let mut request = http.request(method, url);
    if let Some(body) = body {
        request = request.json(body);
    }
    let response = request.send().map_err(|error| ActuationError::Http {
        status: None,
        message: error.to_string(),
    })?;

    let status = response.status();
    let payload: Value = response.json().map_err(|error| ActuationError::Http {
        status: Some(status.as_u16()),
        message: format!("unreadable webdriver reply: {error}"),
    })?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }
    Err(classify_error(&value, target))
}

/// Maps a W3C error payload to an [`ActuationError`].
fn classify_error(value: &Value, target: &str) -> ActuationError {
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match error {
        "no such element" | "stale element reference" => ActuationError::no_such_element(target),
        "invalid session id" | "no such window" | "session not created" => {
            ActuationError::SessionLost {
                reason: format!("{error}: {message}"),
            }
        },
        _ => ActuationError::Driver {
            error: error.to_string(),
            message,
        },
    }
}

/// Session capabilities for `browser`.
fn browser_capabilities(browser: &str, headless: bool) -> Value {
    let (browser_name, options_key, headless_arg) = match browser.to_ascii_lowercase().as_str() {
        "chrome" | "chromium" => ("chrome", "goog:chromeOptions", "--headless=new"),
        "firefox" => ("firefox", "moz:firefoxOptions", "-headless"),
        _ => ("MicrosoftEdge", "ms:edgeOptions", "--headless"),
    };
    let args: Vec<&str> = if headless { vec![headless_arg] } else { Vec::new() };

    json!({
        "alwaysMatch": {
            "browserName": browser_name,
            options_key: { "args": args },
        }
    })
}

/// Portal driven through a live browser session.
pub struct WebDriverPortal {
    client: WebDriverClient,
    login_url: String,
    users_url: String,
    row_match: RowMatch,
    waiter: Waiter,
    driver: Option<Child>,
    released: bool,
}

impl std::fmt::Debug for WebDriverPortal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebDriverPortal")
            .field("session_id", &self.client.session_id)
            .field("login_url", &self.login_url)
            .field("users_url", &self.users_url)
            .field("row_match", &self.row_match)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl WebDriverPortal {
    fn wait_for(&self, locator: &Locator) -> Result<ElementId, ActuationError> {
        self.waiter.until(locator.describe(), || match self.client.find(locator) {
            Ok(element) => Ok(Some(element)),
            Err(ActuationError::NoSuchElement { .. }) => Ok(None),
            Err(error) => Err(error),
        })
    }

    fn wait_clickable(&self, locator: &Locator) -> Result<ElementId, ActuationError> {
        self.waiter.until(locator.describe(), || {
            let element = match self.client.find(locator) {
                Ok(element) => element,
                Err(ActuationError::NoSuchElement { .. }) => return Ok(None),
                Err(error) => return Err(error),
            };
            Ok(self.client.is_interactive(&element)?.then_some(element))
        })
    }

    fn script_click(&self, locator: &Locator) -> Result<(), ActuationError> {
        let element = self.wait_clickable(locator)?;
        self.client.execute(CLICK_JS, &element).map(drop)
    }

    fn row_matches(&self, row: &ElementId, full_name: &str) -> Result<bool, ActuationError> {
        match self.row_match {
            RowMatch::NameContains => {
                let cell = match self
                    .client
                    .find_within(row, &Locator::Css(".teacher-name".to_string()))
                {
                    Ok(cell) => cell,
                    Err(ActuationError::NoSuchElement { .. }) => return Ok(false),
                    Err(error) => return Err(error),
                };
                let displayed = self.client.text(&cell)?;
                Ok(displayed
                    .trim()
                    .to_lowercase()
                    .contains(&full_name.to_lowercase()))
            },
            RowMatch::FullNameAttribute => Ok(self
                .client
                .attribute(row, "data-full_name")?
                .is_some_and(|value| value == full_name)),
        }
    }
}

impl PortalActuator for WebDriverPortal {
    fn authenticate(&mut self, credentials: &PortalCredentials) -> Result<(), AuthenticationError> {
        let login = || -> Result<(), ActuationError> {
            self.client.navigate(&self.login_url)?;
            let account_input = self.wait_for(&Locator::id("email"))?;
            let password_input = self.wait_for(&Locator::id("password"))?;
            self.client.send_keys(&account_input, &credentials.email)?;
            self.client
                .send_keys(&password_input, credentials.password.expose_secret())?;
            let submit = self.wait_for(&Locator::Css(LOGIN_SUBMIT_CSS.to_string()))?;
            self.client.click(&submit)
        };
        login().map_err(AuthenticationError::NotCompleted)?;

        let left_login_page = self.waiter.until("post-login page", || {
            let current = self.client.current_url()?;
            Ok((current.trim_end_matches('/') != self.login_url.trim_end_matches('/')).then_some(()))
        });
        match left_login_page {
            Ok(()) => {
                tracing::info!(login_url = %self.login_url, "successfully authenticated");
                Ok(())
            },
            Err(ActuationError::Timeout { .. }) => Err(AuthenticationError::Rejected {
                account: credentials.email.clone(),
            }),
            Err(error) => Err(AuthenticationError::NotCompleted(error)),
        }
    }

    fn open_user_management_view(&mut self) -> Result<(), ActuationError> {
        self.client.navigate(&self.users_url)
    }

    fn find_user_row(&mut self, full_name: &str) -> Result<Option<RowHandle>, ActuationError> {
        let row_locator = Locator::XPath(ROW_XPATH.to_string());
        let rows = match self.waiter.until("user rows", || {
            let rows = self.client.find_all(&row_locator)?;
            Ok((!rows.is_empty()).then_some(rows))
        }) {
            Ok(rows) => rows,
            Err(ActuationError::Timeout { .. }) => {
                tracing::warn!("user-management page shows no rows");
                return Ok(None);
            },
            Err(error) => return Err(error),
        };

        for row in &rows {
            if !self.row_matches(row, full_name)? {
                continue;
            }
            let element_id = self.client.attribute(row, "id")?.unwrap_or_default();
            return RowHandle::from_row_element_id(&element_id)
                .map(Some)
                .ok_or_else(|| ActuationError::Protocol(format!("unexpected row id {element_id:?}")));
        }
        Ok(None)
    }

    fn set_email_field(&mut self, row: &RowHandle, email: &str) -> Result<(), ActuationError> {
        let input = self.wait_for(&Locator::id(&row.email_input_id()))?;
        self.client.clear(&input)?;
        self.client.send_keys(&input, email)
    }

    fn permission_state(
        &mut self,
        row: &RowHandle,
        flag: PermissionFlag,
    ) -> Result<bool, ActuationError> {
        let control = self.wait_for(&Locator::id(&flag.control_id(row)))?;
        let value = self.client.attribute(&control, "data-value")?;
        Ok(value.as_deref() != Some("no"))
    }

    fn toggle_permission(
        &mut self,
        row: &RowHandle,
        flag: PermissionFlag,
    ) -> Result<(), ActuationError> {
        let locator = Locator::id(&flag.control_id(row));
        let control = self.wait_for(&locator)?;
        self.client.execute(SCROLL_INTO_VIEW_JS, &control)?;
        let control = self.wait_clickable(&locator)?;
        self.client.click(&control)
    }

    fn trigger_password_reset(&mut self, row: &RowHandle) -> Result<(), ActuationError> {
        let id = row.id();
        self.script_click(&Locator::XPath(format!(
            r#"//*[@id="{id}"]//i[contains(@class, "fa-ellipsis-v")]"#
        )))?;
        self.script_click(&Locator::XPath(format!(
            r##"//a[@href="#{id}" and contains(@class, "set-password")]"##
        )))?;
        self.script_click(&Locator::Css(CONFIRM_PASSWORD_CSS.to_string()))
    }

    fn release(&mut self) -> Result<(), ActuationError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let closed = self.client.delete_session();
        if let Some(mut driver) = self.driver.take() {
            stop_driver(&mut driver);
        }
        closed
    }
}

impl Drop for WebDriverPortal {
    fn drop(&mut self) {
        if let Err(error) = self.release() {
            tracing::warn!(%error, "failed to close browser session");
        }
    }
}

/// Kills and reaps the driver process.
fn stop_driver(driver: &mut Child) {
    if let Err(error) = driver.kill().and_then(|()| driver.wait().map(drop)) {
        tracing::warn!(pid = driver.id(), %error, "failed to stop webdriver process");
    }
}

/// Starts the driver (optionally) and opens a browser session.
#[derive(Debug, Clone)]
pub struct WebDriverLauncher {
    config: PortalConfig,
}

impl WebDriverLauncher {
    /// Creates a launcher for the configured portal.
    #[must_use]
    pub const fn new(config: PortalConfig) -> Self {
        Self { config }
    }

    fn spawn_driver(&self) -> Result<Option<Child>, ActuationError> {
        let Some(binary) = &self.config.driver_binary else {
            return Ok(None);
        };
        let port = reqwest::Url::parse(&self.config.webdriver_url)
            .ok()
            .and_then(|url| url.port_or_known_default())
            .ok_or_else(|| {
                ActuationError::Protocol(format!(
                    "webdriver url {} has no port",
                    self.config.webdriver_url
                ))
            })?;

        let child = Command::new(binary)
            .arg(format!("--port={port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|error| ActuationError::Http {
                status: None,
                message: format!("failed to start {}: {error}", binary.display()),
            })?;
        tracing::info!(driver = %binary.display(), port, "webdriver process started");
        Ok(Some(child))
    }

    fn wait_until_ready(&self, waiter: &Waiter) -> Result<(), ActuationError> {
        let http = WebDriverClient::http_client()?;
        let status_url = format!("{}/status", self.config.webdriver_url.trim_end_matches('/'));
        waiter.until("webdriver status", || {
            // Connection refused while the driver boots is "not ready".
            let Ok(value) = send(&http, Method::GET, &status_url, None, "status") else {
                return Ok(None);
            };
            Ok(value
                .get("ready")
                .and_then(Value::as_bool)
                .unwrap_or(true)
                .then_some(()))
        })
    }
}

impl PortalLauncher for WebDriverLauncher {
    type Portal = WebDriverPortal;

    fn launch(&self) -> Result<Self::Portal, ActuationError> {
        let waiter = Waiter::new(self.config.wait_timeout());
        let mut driver = self.spawn_driver()?;

        let session = self.wait_until_ready(&waiter).and_then(|()| {
            WebDriverClient::new_session(
                &self.config.webdriver_url,
                browser_capabilities(&self.config.browser, self.config.headless),
            )
        });
        let client = match session {
            Ok(client) => client,
            Err(error) => {
                if let Some(child) = driver.as_mut() {
                    stop_driver(child);
                }
                return Err(error);
            },
        };

        Ok(WebDriverPortal {
            client,
            login_url: self.config.login_url.clone(),
            users_url: self.config.users_url.clone(),
            row_match: self.config.row_match,
            waiter,
            driver,
            released: false,
        })
    }
}
