//! In-process WebDriver endpoint serving a scripted page.
//!
//! Elements answer to the literal locator strings they are registered with,
//! so a lookup only succeeds when the binding sends exactly that selector.
//! Every state-changing command is appended to an action log.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde_json::{Value, json};

/// Session id handed out by the stub.
pub const SESSION_ID: &str = "stub-session";

const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4a5ae5d8a6e6";

/// One element of the scripted page.
#[derive(Debug, Clone)]
pub struct StubElement {
    label: String,
    selectors: Vec<String>,
    parent: Option<usize>,
    text: String,
    attributes: HashMap<String, String>,
    interactive: bool,
    navigates_to: Option<String>,
}

impl StubElement {
    /// An element without a DOM id, named `label` in the action log.
    pub fn labelled(label: &str) -> Self {
        Self {
            label: label.to_string(),
            selectors: Vec::new(),
            parent: None,
            text: String::new(),
            attributes: HashMap::new(),
            interactive: true,
            navigates_to: None,
        }
    }

    /// An element with DOM id `dom_id`, reachable as `[id="<dom_id>"]`.
    pub fn with_id(dom_id: &str) -> Self {
        Self::labelled(dom_id)
            .matching(&format!(r#"[id="{dom_id}"]"#))
            .with_attribute("id", dom_id)
    }

    /// Also answer to `selector`.
    pub fn matching(mut self, selector: &str) -> Self {
        self.selectors.push(selector.to_string());
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    /// Only reachable through a lookup scoped to `parent`.
    pub const fn child_of(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Present but never displayed.
    pub const fn hidden(mut self) -> Self {
        self.interactive = false;
        self
    }

    /// Clicking the element loads `url`.
    pub fn navigates_to(mut self, url: &str) -> Self {
        self.navigates_to = Some(url.to_string());
        self
    }
}

#[derive(Debug, Default)]
struct Page {
    elements: Vec<StubElement>,
    current_url: String,
    actions: Vec<String>,
    capabilities: Value,
    session_lost: bool,
}

type Reply = (u16, Value);

fn ok(value: Value) -> Reply {
    (200, value)
}

fn fail(status: u16, error: &str, message: &str) -> Reply {
    (
        status,
        json!({ "error": error, "message": message, "stacktrace": "" }),
    )
}

fn element_ref(index: usize) -> Value {
    json!({ ELEMENT_KEY: format!("e{index}") })
}

impl Page {
    fn element(&self, reference: &str) -> Option<(usize, &StubElement)> {
        let index: usize = reference.strip_prefix('e')?.parse().ok()?;
        self.elements.get(index).map(|element| (index, element))
    }

    fn matches(element: &StubElement, body: &Value, parent: Option<usize>) -> bool {
        let selector = body["value"].as_str().unwrap_or_default();
        element.selectors.iter().any(|known| known == selector)
            && (parent.is_none() || element.parent == parent)
    }

    fn find_one(&self, body: &Value, parent: Option<usize>) -> Reply {
        self.elements
            .iter()
            .position(|element| Self::matches(element, body, parent))
            .map_or_else(
                || fail(404, "no such element", "Unable to locate element"),
                |index| ok(element_ref(index)),
            )
    }

    fn find_all(&self, body: &Value) -> Reply {
        let found: Vec<Value> = self
            .elements
            .iter()
            .enumerate()
            .filter(|(_, element)| element.parent.is_none() && Self::matches(element, body, None))
            .map(|(index, _)| element_ref(index))
            .collect();
        ok(Value::Array(found))
    }

    fn click(&mut self, reference: &str, via_script: bool) -> Reply {
        let Some((_, element)) = self.element(reference) else {
            return fail(404, "stale element reference", reference);
        };
        let label = element.label.clone();
        let target = element.navigates_to.clone();
        let prefix = if via_script { "script click" } else { "click" };
        self.actions.push(format!("{prefix} {label}"));
        if let Some(url) = target {
            self.current_url = url;
        }
        ok(Value::Null)
    }

    fn execute(&mut self, body: &Value) -> Reply {
        let script = body["script"].as_str().unwrap_or_default();
        let reference = body["args"][0][ELEMENT_KEY].as_str().unwrap_or_default();
        if script.contains(".click()") {
            return self.click(reference, true);
        }
        let Some((_, element)) = self.element(reference) else {
            return fail(404, "stale element reference", reference);
        };
        let kind = if script.contains("scrollIntoView") { "scroll" } else { "script" };
        let entry = format!("{kind} {}", element.label);
        self.actions.push(entry);
        ok(Value::Null)
    }

    fn element_command(&mut self, method: &str, reference: &str, command: &[&str], body: &Value) -> Reply {
        let Some((index, element)) = self
            .element(reference)
            .map(|(index, element)| (index, element.clone()))
        else {
            return fail(404, "stale element reference", reference);
        };
        let label = element.label;
        match (method, command) {
            ("POST", ["element"]) => self.find_one(body, Some(index)),
            ("GET", ["text"]) => ok(json!(element.text)),
            ("GET", ["attribute", name]) => ok(element
                .attributes
                .get(*name)
                .map_or(Value::Null, |value| json!(value))),
            ("GET", ["displayed" | "enabled"]) => ok(json!(element.interactive)),
            ("POST", ["clear"]) => {
                self.actions.push(format!("clear {label}"));
                ok(Value::Null)
            },
            ("POST", ["value"]) => {
                let text = body["text"].as_str().unwrap_or_default();
                self.actions.push(format!("type {label} {text}"));
                ok(Value::Null)
            },
            ("POST", ["click"]) => self.click(reference, false),
            _ => fail(404, "unknown command", &command.join("/")),
        }
    }

    fn handle(&mut self, method: &str, path: &str, body: &Value) -> Reply {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match (method, segments.as_slice()) {
            ("GET", ["status"]) => ok(json!({ "ready": true, "message": "stub ready" })),
            ("POST", ["session"]) => {
                self.capabilities = body["capabilities"].clone();
                ok(json!({ "sessionId": SESSION_ID, "capabilities": {} }))
            },
            (_, ["session", _, ..]) if self.session_lost => {
                fail(404, "invalid session id", "session deleted")
            },
            ("DELETE", ["session", _]) => {
                self.actions.push("delete session".to_string());
                ok(Value::Null)
            },
            ("POST", ["session", _, "url"]) => {
                let url = body["url"].as_str().unwrap_or_default().to_string();
                self.actions.push(format!("navigate {url}"));
                self.current_url = url;
                ok(Value::Null)
            },
            ("GET", ["session", _, "url"]) => ok(json!(self.current_url)),
            ("POST", ["session", _, "element"]) => self.find_one(body, None),
            ("POST", ["session", _, "elements"]) => self.find_all(body),
            ("POST", ["session", _, "execute", "sync"]) => self.execute(body),
            (_, ["session", _, "element", reference, command @ ..]) => {
                self.element_command(method, reference, command, body)
            },
            _ => fail(404, "unknown command", path),
        }
    }
}

/// A WebDriver endpoint on `127.0.0.1` serving one scripted page.
#[derive(Debug, Clone)]
pub struct StubDriver {
    base_url: String,
    page: Arc<Mutex<Page>>,
}

impl StubDriver {
    /// Binds an ephemeral port and starts serving.
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub webdriver");
        let addr = listener.local_addr().expect("stub webdriver addr");
        let page = Arc::new(Mutex::new(Page::default()));

        let shared = Arc::clone(&page);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                serve(stream, &shared);
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            page,
        }
    }

    fn page(&self) -> MutexGuard<'_, Page> {
        self.page.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Adds `element` to the page, returning its index for `child_of`.
    pub fn add(&self, element: StubElement) -> usize {
        let mut page = self.page();
        page.elements.push(element);
        page.elements.len() - 1
    }

    /// From now on every session command fails with `invalid session id`.
    pub fn lose_session(&self) {
        self.page().session_lost = true;
    }

    /// State-changing commands received so far.
    pub fn actions(&self) -> Vec<String> {
        self.page().actions.clone()
    }

    /// Capabilities sent with the new-session request.
    pub fn capabilities(&self) -> Value {
        self.page().capabilities.clone()
    }
}

/// Serves one request, then closes the connection.
fn serve(stream: TcpStream, page: &Mutex<Page>) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let Some((method, path, body)) = read_request(&mut reader) else {
        return;
    };

    let (status, value) = page
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .handle(&method, &path, &body);

    let payload = json!({ "value": value }).to_string();
    let reason = if status == 200 { "OK" } else { "Not Found" };
    let mut stream = stream;
    let _ = write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{payload}",
        payload.len()
    );
    let _ = stream.flush();
}

fn read_request(reader: &mut BufReader<TcpStream>) -> Option<(String, String, Value)> {
    let mut request_line = String::new();
    reader.read_line(&mut request_line).ok()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut content_length = 0;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().unwrap_or(0);
            }
        }
    }

    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).ok()?;
    let body = serde_json::from_slice(&body).unwrap_or(Value::Null);
    Some((method, path, body))
}
