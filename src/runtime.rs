//! Chromiumoxide-backed [`BrowserSession`].
//!
//! Owns the CDP connection for one run: launching or attaching per the
//! [`SessionPlan`], pumping the chromiumoxide handler on a background task,
//! and driving one page. Element interactions are performed in page context
//! against the walker-produced XPath locators, which keeps click/type
//! semantics identical to what the element index saw at capture time
//! (including hops into same-origin iframes via the `|` separator).

use std::sync::Arc;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::logging::PilotLogger;
use crate::session::{BrowserSession, DriverError, DriverErrorKind, Locator, SessionPlan};

/// Shared helper injected ahead of every interaction script. Resolves a
/// `|`-separated XPath chain, descending through same-origin iframes.
const RESOLVE_FN: &str = r#"
function __wpResolve(path) {
  var segments = path.split("|");
  var doc = document;
  for (var i = 0; i < segments.length; i++) {
    var node = doc.evaluate(segments[i], doc, null,
      XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
    if (!node) return null;
    if (i === segments.length - 1) return node;
    if (!node.contentDocument) return null;
    doc = node.contentDocument;
  }
  return null;
}
"#;

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

fn click_script(xpath: &str) -> String {
    format!(
        r#"(function() {{
{RESOLVE_FN}
  var el = __wpResolve({target});
  if (!el) return "missing";
  el.scrollIntoView({{ block: "center", inline: "center" }});
  try {{
    el.click();
    return "ok";
  }} catch (err) {{
    return "error:" + err.message;
  }}
}})()"#,
        target = quote(xpath)
    )
}

fn type_script(xpath: &str, text: &str, press_enter: bool) -> String {
    format!(
        r#"(function() {{
{RESOLVE_FN}
  var el = __wpResolve({target});
  if (!el) return "missing";
  el.scrollIntoView({{ block: "center", inline: "center" }});
  el.focus();
  var tag = el.nodeName.toLowerCase();
  if (tag === "input" || tag === "textarea") {{
    var proto = tag === "input" ? HTMLInputElement.prototype : HTMLTextAreaElement.prototype;
    var setter = Object.getOwnPropertyDescriptor(proto, "value").set;
    setter.call(el, {text});
    el.dispatchEvent(new Event("input", {{ bubbles: true }}));
    el.dispatchEvent(new Event("change", {{ bubbles: true }}));
  }} else if (el.isContentEditable) {{
    el.textContent = {text};
    el.dispatchEvent(new Event("input", {{ bubbles: true }}));
  }} else {{
    return "error:element does not accept text";
  }}
  if ({press_enter}) {{
    var opts = {{ key: "Enter", code: "Enter", keyCode: 13, bubbles: true }};
    el.dispatchEvent(new KeyboardEvent("keydown", opts));
    el.dispatchEvent(new KeyboardEvent("keyup", opts));
    if (el.form && el.form.requestSubmit) el.form.requestSubmit();
  }}
  return "ok";
}})()"#,
        target = quote(xpath),
        text = quote(text),
    )
}

fn extract_script(xpath: Option<&str>) -> String {
    match xpath {
        Some(xpath) => format!(
            r#"(function() {{
{RESOLVE_FN}
  var el = __wpResolve({target});
  if (!el) return null;
  return el.innerText || el.textContent || "";
}})()"#,
            target = quote(xpath)
        ),
        None => "document.body ? document.body.innerText : \"\"".to_string(),
    }
}

fn locator_xpath(locator: &Locator) -> Result<&str, DriverError> {
    match locator {
        Locator::XPath(xpath) => Ok(xpath),
        Locator::Css(_) => Err(DriverError::new(
            DriverErrorKind::Other,
            "css locators are not produced by the element index",
        )),
    }
}

/// Map the sentinel strings returned by interaction scripts.
fn interaction_outcome(result: &Value, what: &str) -> Result<(), DriverError> {
    match result.as_str() {
        Some("ok") => Ok(()),
        Some("missing") => Err(DriverError::new(
            DriverErrorKind::TargetMissing,
            format!("{what} target no longer exists in the document"),
        )),
        Some(other) if other.starts_with("error:") => Err(DriverError::new(
            DriverErrorKind::NotInteractable,
            other.trim_start_matches("error:").to_string(),
        )),
        _ => Err(DriverError::new(
            DriverErrorKind::EvaluationFailed,
            format!("{what} script returned an unexpected value: {result}"),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct CdpVersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

/// Resolve an `http(s)://` debugging address to its websocket URL via
/// `/json/version`; `ws://` URLs pass through untouched.
async fn resolve_ws_url(url: &str) -> Result<String, DriverError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        return Ok(url.to_string());
    }
    let endpoint = format!("{}/json/version", url.trim_end_matches('/'));
    let response = reqwest::get(&endpoint).await.map_err(|err| {
        DriverError::session_unavailable(format!("CDP endpoint discovery failed: {err}"))
    })?;
    let info: CdpVersionInfo = response.json().await.map_err(|err| {
        DriverError::session_unavailable(format!("CDP endpoint returned malformed version info: {err}"))
    })?;
    Ok(info.web_socket_debugger_url)
}

struct RuntimeState {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
}

/// One CDP-backed browser session, scoped to one agent run.
pub struct ChromiumoxideSession {
    state: Arc<Mutex<Option<RuntimeState>>>,
    logger: PilotLogger,
}

impl ChromiumoxideSession {
    /// Launch or attach per the plan and bind the session to one page.
    pub async fn connect(plan: &SessionPlan, logger: PilotLogger) -> Result<Self, DriverError> {
        let (browser, handler) = match plan {
            SessionPlan::AttachCdp { url } => {
                let ws_url = resolve_ws_url(url).await?;
                Browser::connect(ws_url).await.map_err(|err| {
                    DriverError::session_unavailable(format!("CDP attach failed: {err}"))
                })?
            }
            SessionPlan::LaunchLocal { .. } => {
                let config = build_browser_config(plan)?;
                Browser::launch(config).await.map_err(|err| {
                    DriverError::session_unavailable(format!("browser launch failed: {err}"))
                })?
            }
        };

        let handler_logger = logger.clone();
        let handler = spawn_handler(handler, handler_logger);

        let pages = browser.pages().await.map_err(|err| {
            DriverError::session_unavailable(format!("page enumeration failed: {err}"))
        })?;
        let page = match pages.into_iter().next() {
            Some(page) => page,
            None => browser.new_page("about:blank").await.map_err(|err| {
                DriverError::session_unavailable(format!("page creation failed: {err}"))
            })?,
        };

        logger.info("browser session established", Some("session"), None);

        Ok(Self {
            state: Arc::new(Mutex::new(Some(RuntimeState {
                browser,
                handler,
                page,
            }))),
            logger,
        })
    }

    async fn page(&self) -> Result<Page, DriverError> {
        let guard = self.state.lock().await;
        guard
            .as_ref()
            .map(|state| state.page.clone())
            .ok_or_else(|| DriverError::session_unavailable("session already closed"))
    }

    async fn run_interaction(&self, script: String, what: &str) -> Result<(), DriverError> {
        let value = self.evaluate(&script).await?;
        interaction_outcome(&value, what)
    }
}

fn spawn_handler(
    mut handler: chromiumoxide::handler::Handler,
    logger: PilotLogger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = handler.next().await {
            if let Err(err) = result {
                logger.error(format!("cdp handler error: {err}"), Some("session"), None);
            }
        }
    })
}

fn build_browser_config(plan: &SessionPlan) -> Result<BrowserConfig, DriverError> {
    let SessionPlan::LaunchLocal {
        chrome_executable,
        headless,
        viewport,
        args,
        user_data_dir,
    } = plan
    else {
        return Err(DriverError::new(
            DriverErrorKind::Other,
            "attach plans carry no launch configuration",
        ));
    };

    let mut builder = BrowserConfig::builder();

    if let Some(path) = chrome_executable {
        builder = builder.chrome_executable(path);
    }
    if let Some(dir) = user_data_dir {
        builder = builder.user_data_dir(dir);
    }

    let builder = builder
        .viewport(chromiumoxide::handler::viewport::Viewport {
            width: viewport.width,
            height: viewport.height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: viewport.width >= viewport.height,
            has_touch: false,
        })
        .args(args.clone());

    let builder = if *headless { builder } else { builder.with_head() };

    builder
        .build()
        .map_err(|message| DriverError::session_unavailable(message))
}

#[async_trait]
impl BrowserSession for ChromiumoxideSession {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let page = self.page().await?;
        page.goto(url).await.map_err(|err| {
            DriverError::new(
                DriverErrorKind::NavigationFailed,
                format!("navigation to {url} failed: {err}"),
            )
        })?;
        page.wait_for_navigation().await.map_err(|err| {
            DriverError::new(
                DriverErrorKind::NavigationFailed,
                format!("load after navigation to {url} failed: {err}"),
            )
        })?;
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        let xpath = locator_xpath(locator)?;
        self.run_interaction(click_script(xpath), "click").await
    }

    async fn type_text(
        &self,
        locator: &Locator,
        text: &str,
        press_enter: bool,
    ) -> Result<(), DriverError> {
        let xpath = locator_xpath(locator)?;
        self.run_interaction(type_script(xpath, text, press_enter), "typing")
            .await
    }

    async fn scroll(&self, delta_y: i64) -> Result<(), DriverError> {
        let script = format!("(function() {{ window.scrollBy(0, {delta_y}); return \"ok\"; }})()");
        self.run_interaction(script, "scroll").await
    }

    async fn extract_text(&self, locator: Option<&Locator>) -> Result<String, DriverError> {
        let xpath = match locator {
            Some(locator) => Some(locator_xpath(locator)?),
            None => None,
        };
        let value = self.evaluate(&extract_script(xpath)).await?;
        match value {
            Value::String(text) => Ok(text),
            Value::Null => Err(DriverError::new(
                DriverErrorKind::TargetMissing,
                "extraction target no longer exists in the document",
            )),
            other => Ok(other.to_string()),
        }
    }

    async fn evaluate(&self, script: &str) -> Result<Value, DriverError> {
        let page = self.page().await?;
        let evaluation = page.evaluate(script).await.map_err(|err| {
            DriverError::new(
                DriverErrorKind::EvaluationFailed,
                format!("script evaluation failed: {err}"),
            )
        })?;
        evaluation.into_value::<Value>().map_err(|err| {
            DriverError::new(
                DriverErrorKind::EvaluationFailed,
                format!("script result was not serializable: {err}"),
            )
        })
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let page = self.page().await?;
        let url = page.url().await.map_err(|err| {
            DriverError::session_unavailable(format!("url query failed: {err}"))
        })?;
        Ok(url.unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn close(&self) -> Result<(), DriverError> {
        let state = {
            let mut guard = self.state.lock().await;
            guard.take()
        };

        if let Some(mut state) = state {
            if let Err(err) = state.browser.close().await {
                self.logger.error(
                    format!("browser close reported: {err}"),
                    Some("session"),
                    None,
                );
            }
            state.handler.abort();
            self.logger.info("browser session closed", Some("session"), None);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ws_urls_pass_through_discovery() {
        let url = "ws://127.0.0.1:9222/devtools/browser/abc";
        assert_eq!(resolve_ws_url(url).await.unwrap(), url);
    }

    #[test]
    fn click_script_quotes_the_locator() {
        let script = click_script("/html/body/button[1]");
        assert!(script.contains("__wpResolve(\"/html/body/button[1]\")"));
        assert!(script.contains("scrollIntoView"));
    }

    #[test]
    fn type_script_escapes_text_payload() {
        let script = type_script("/html/body/input[1]", "say \"hi\"\nthere", true);
        assert!(script.contains("\"say \\\"hi\\\"\\nthere\""));
        assert!(script.contains("requestSubmit"));
    }

    #[test]
    fn interaction_outcomes_map_to_driver_errors() {
        assert!(interaction_outcome(&json!("ok"), "click").is_ok());

        let missing = interaction_outcome(&json!("missing"), "click").unwrap_err();
        assert_eq!(missing.kind, DriverErrorKind::TargetMissing);

        let refused = interaction_outcome(&json!("error:covered by overlay"), "click").unwrap_err();
        assert_eq!(refused.kind, DriverErrorKind::NotInteractable);
        assert!(refused.message.contains("covered by overlay"));

        let odd = interaction_outcome(&json!(42), "click").unwrap_err();
        assert_eq!(odd.kind, DriverErrorKind::EvaluationFailed);
    }

    #[test]
    fn extract_script_defaults_to_whole_page() {
        assert!(extract_script(None).contains("document.body"));
        assert!(extract_script(Some("/html/body/p[1]")).contains("__wpResolve"));
    }

    #[test]
    fn attach_plans_have_no_launch_config() {
        let plan = SessionPlan::AttachCdp {
            url: "ws://localhost:9222".to_string(),
        };
        assert!(build_browser_config(&plan).is_err());
    }
}
