use async_trait::async_trait;
use base64::Engine;
use scraper::{Html, Selector as HtmlSelector};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thirtyfour::extensions::cdp::ChromeDevTools;
use thirtyfour::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cookies::CookieJar;
use super::keys::{parse_keys, KeyToken};
use super::{Connector, Input, Surface};
use crate::captcha::CaptchaSolver;
use crate::error::{ErrorKind, SessionError, SurfaceError};
use crate::locator::{find_template, load_template, Hit, Locator, Selector, TextPattern};
use crate::wait::{PollPolicy, Poller, WaitError};

const MODIFIER_RELEASE: char = '\u{E000}';
const CONTROL: char = '\u{E009}';
const ALT: char = '\u{E00A}';

/// Launches Chrome through a running ChromeDriver.
#[derive(Debug, Clone)]
pub struct WebConnector {
    pub webdriver_url: String,
    pub headless: bool,
    pub home_url: String,
    /// Where browser downloads land (the staging directory).
    pub download_dir: PathBuf,
    pub page_load_timeout: Duration,
    /// How often readiness is polled after a navigation.
    pub poll_interval: Duration,
    /// The run's token; page-ready waits stop when it fires.
    pub cancel: CancellationToken,
}

impl WebConnector {
    async fn launch(&self) -> WebDriverResult<WebDriver> {
        let mut caps = DesiredCapabilities::chrome();
        if self.headless {
            caps.add_chrome_arg("--headless=new")?;
        }
        caps.add_chrome_arg("--no-sandbox")?;
        caps.add_chrome_arg("--disable-dev-shm-usage")?;
        caps.add_chrome_arg("--disable-gpu")?;
        caps.add_chrome_arg("--window-size=1920,1080")?;
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")?;

        let driver = WebDriver::new(&self.webdriver_url, caps).await?;
        driver.set_page_load_timeout(self.page_load_timeout).await?;
        driver.set_script_timeout(Duration::from_secs(60)).await?;
        // Probes must answer immediately; waiting is done by the poller.
        driver.set_implicit_wait_timeout(Duration::ZERO).await?;

        let dev_tools = ChromeDevTools::new(driver.handle.clone());
        let download_path = self.download_dir.to_string_lossy().to_string();
        if let Err(e) = dev_tools
            .execute_cdp_with_params(
                "Page.setDownloadBehavior",
                json!({ "behavior": "allow", "downloadPath": download_path }),
            )
            .await
        {
            warn!("Could not redirect downloads to {}: {}", download_path, e);
        }

        Ok(driver)
    }
}

#[async_trait]
impl Connector for WebConnector {
    fn target(&self) -> String {
        format!("Chrome via {} ({})", self.webdriver_url, self.home_url)
    }

    async fn connect(&self) -> Result<Box<dyn Surface>, SessionError> {
        let establish = |reason: String| SessionError::Establish {
            target: self.target(),
            reason,
        };

        let driver = self
            .launch()
            .await
            .map_err(|e| establish(format!("Failed to connect to WebDriver: {}", e)))?;

        if let Err(e) = driver.goto(&self.home_url).await {
            let reason = format!("Failed to open {}: {}", self.home_url, e);
            if let Err(quit_err) = driver.quit().await {
                debug!("Failed to quit browser after launch error: {}", quit_err);
            }
            return Err(establish(reason));
        }

        info!("🌐 Browser session ready at {}", self.home_url);
        Ok(Box::new(WebSurface {
            driver,
            home_url: self.home_url.clone(),
            alert_open: false,
            ready_policy: PollPolicy::new(self.poll_interval, self.page_load_timeout),
            cancel: self.cancel.clone(),
        }))
    }
}

/// A Chrome tab driven through WebDriver.
pub struct WebSurface {
    driver: WebDriver,
    home_url: String,
    alert_open: bool,
    ready_policy: PollPolicy,
    cancel: CancellationToken,
}

impl WebSurface {
    fn by(selector: &Selector) -> By {
        match selector {
            Selector::Css(s) => By::Css(s.as_str()),
            Selector::XPath(s) => By::XPath(s.as_str()),
            Selector::Id(s) => By::Id(s.as_str()),
            Selector::Name(s) => By::Name(s.as_str()),
        }
    }

    async fn first_displayed(
        &self,
        selector: &Selector,
    ) -> Result<Option<WebElement>, SurfaceError> {
        let elements = self
            .driver
            .find_all(Self::by(selector))
            .await
            .map_err(classify)?;
        for elem in elements {
            if elem.is_displayed().await.unwrap_or(false) {
                return Ok(Some(elem));
            }
        }
        Ok(None)
    }

    async fn wait_for_page_ready(&self) -> Result<(), SurfaceError> {
        let mut poller = Poller::new(self.ready_policy, &self.cancel);
        loop {
            match poller.tick().await {
                Ok(_) => {}
                Err(WaitError::Cancelled) => {
                    return Err(SurfaceError::Cancelled("page load".to_string()))
                }
                Err(WaitError::Timeout(limit)) => {
                    debug!("Page not ready after {:?}, continuing", limit);
                    return Ok(());
                }
            }

            let state = self
                .driver
                .execute("return document.readyState", vec![])
                .await
                .map_err(classify)?;
            if let Ok(state) = state.convert::<String>() {
                if is_page_ready(&state) {
                    return Ok(());
                }
            }
        }
    }

    /// Text as the browser renders it, so CSS-hidden nodes never count.
    async fn rendered_text(&self) -> Result<String, SurfaceError> {
        let script = "return document.body ? document.body.innerText : '';";
        match self.driver.execute(script, vec![]).await {
            Ok(ret) => ret
                .convert::<String>()
                .map_err(|e| SurfaceError::Backend(format!("innerText was not text: {}", e))),
            Err(e) => {
                let err = classify(e);
                if err.kind() == ErrorKind::SessionLost {
                    return Err(err);
                }
                debug!("innerText unavailable ({}), reading page source", err);
                let html = self.driver.source().await.map_err(classify)?;
                Ok(visible_text(&html))
            }
        }
    }

    async fn click_text(&self, pattern: &TextPattern) -> Result<(), SurfaceError> {
        let script = r#"
            const re = new RegExp(arguments[0], 'i');
            const nodes = document.querySelectorAll(
                'a, button, input[type=submit], input[type=button], label, span, td, div');
            let best = null;
            for (const n of nodes) {
                const t = (n.innerText || n.value || '').trim();
                if (!t || n.offsetParent === null || !re.test(t)) continue;
                if (!best || best.contains(n)) best = n;
            }
            if (!best) return false;
            best.scrollIntoView({ block: 'center' });
            best.click();
            if (best.focus) best.focus();
            return true;
        "#;
        let clicked = self
            .driver
            .execute(script, vec![json!(pattern.source())])
            .await
            .map_err(classify)?
            .convert::<bool>()
            .unwrap_or(false);
        if clicked {
            Ok(())
        } else {
            Err(SurfaceError::NotFound(format!(
                "no clickable element with text /{}/",
                pattern.source()
            )))
        }
    }

    async fn click_point(&self, x: i32, y: i32) -> Result<(), SurfaceError> {
        let script = r#"
            const el = document.elementFromPoint(arguments[0], arguments[1]);
            if (!el) return false;
            el.click();
            if (el.focus) el.focus();
            return true;
        "#;
        let clicked = self
            .driver
            .execute(script, vec![json!(x), json!(y)])
            .await
            .map_err(classify)?
            .convert::<bool>()
            .unwrap_or(false);
        if clicked {
            Ok(())
        } else {
            Err(SurfaceError::NotFound(format!("no element at ({}, {})", x, y)))
        }
    }

    async fn type_into_focused(&self, text: &str, clear: bool) -> Result<(), SurfaceError> {
        let active = self.driver.active_element().await.map_err(classify)?;
        if clear {
            if let Err(e) = active.clear().await {
                debug!("Could not clear focused element: {}", e);
            }
        }
        active.send_keys(text).await.map_err(classify)
    }

    async fn handle_alert(&mut self, tokens: &[KeyToken]) -> Result<(), SurfaceError> {
        self.alert_open = false;
        if tokens.contains(&KeyToken::Escape) {
            self.driver.dismiss_alert().await.map_err(classify)
        } else {
            self.driver.accept_alert().await.map_err(classify)
        }
    }
}

#[async_trait]
impl Surface for WebSurface {
    fn label(&self) -> String {
        format!("browser ({})", self.home_url)
    }

    async fn probe(&mut self, locator: &Locator) -> Result<Option<Hit>, SurfaceError> {
        match locator {
            Locator::Selector(selector) => {
                let Some(elem) = self.first_displayed(selector).await? else {
                    return Ok(None);
                };
                Ok(Some(Hit {
                    point: element_center(&elem).await,
                    text: element_value(&elem).await,
                }))
            }
            Locator::Text(pattern) => {
                let text = self.rendered_text().await?;
                Ok(text_match(&text, pattern).map(Hit::with_text))
            }
            Locator::Image(template) => {
                let needle = load_template(&template.path).map_err(|e| {
                    SurfaceError::Backend(format!(
                        "Failed to load template {}: {}",
                        template.path.display(),
                        e
                    ))
                })?;
                let png = self.driver.screenshot_as_png().await.map_err(classify)?;
                let screen = image::load_from_memory(&png)
                    .map_err(|e| SurfaceError::Backend(format!("Invalid screenshot: {}", e)))?
                    .to_luma8();
                Ok(find_template(&screen, &needle, template.threshold).map(|m| {
                    let (x, y) = m.center();
                    Hit::at(x, y)
                }))
            }
        }
    }

    async fn act(
        &mut self,
        locator: &Locator,
        hit: &Hit,
        input: &Input,
    ) -> Result<(), SurfaceError> {
        match locator {
            Locator::Selector(selector) => {
                let elem = self
                    .first_displayed(selector)
                    .await?
                    .ok_or_else(|| SurfaceError::NotFound(locator.to_string()))?;
                match input {
                    Input::Click => {
                        if let Err(e) = elem.click().await {
                            // Overlays intercept native clicks; a script click goes through.
                            debug!("Native click failed ({}), using script click", e);
                            let arg = elem.to_json().map_err(classify)?;
                            self.driver
                                .execute("arguments[0].click();", vec![arg])
                                .await
                                .map_err(classify)?;
                        }
                        Ok(())
                    }
                    Input::Type { text, clear } => {
                        if *clear {
                            elem.clear().await.map_err(classify)?;
                        }
                        elem.send_keys(text.as_str()).await.map_err(classify)
                    }
                }
            }
            Locator::Text(pattern) => {
                self.click_text(pattern).await?;
                match input {
                    Input::Click => Ok(()),
                    Input::Type { text, clear } => self.type_into_focused(text, *clear).await,
                }
            }
            Locator::Image(_) => {
                let (x, y) = hit
                    .point
                    .ok_or_else(|| SurfaceError::NotFound(locator.to_string()))?;
                self.click_point(x, y).await?;
                match input {
                    Input::Click => Ok(()),
                    Input::Type { text, clear } => self.type_into_focused(text, *clear).await,
                }
            }
        }
    }

    async fn send_keys(&mut self, keys: &str) -> Result<(), SurfaceError> {
        let tokens = parse_keys(keys);
        if self.alert_open {
            return self.handle_alert(&tokens).await;
        }

        let mut data = String::new();
        for token in &tokens {
            match token {
                KeyToken::Text(text) => data.push_str(text),
                KeyToken::Ctrl(c) => {
                    data.push(CONTROL);
                    data.push(*c);
                    data.push(MODIFIER_RELEASE);
                }
                KeyToken::Alt(c) => {
                    data.push(ALT);
                    data.push(*c);
                    data.push(MODIFIER_RELEASE);
                }
                special => {
                    if let Some(code) = special.webdriver_code() {
                        data.push(code);
                    }
                }
            }
        }

        let active = self.driver.active_element().await.map_err(classify)?;
        active.send_keys(data.as_str()).await.map_err(classify)
    }

    async fn focus_dialog(&mut self, title: &str) -> Result<bool, SurfaceError> {
        if let Ok(text) = self.driver.get_alert_text().await {
            let found = text.to_lowercase().contains(&title.to_lowercase());
            self.alert_open = found;
            return Ok(found);
        }

        let script = r#"
            const needle = arguments[0].toLowerCase();
            const dialogs = document.querySelectorAll(
                '[role="dialog"], [role="alertdialog"], .modal.show, .modal.in, '
                + '.ui-dialog, .swal2-popup');
            for (const d of dialogs) {
                const style = window.getComputedStyle(d);
                if (style.display === 'none' || style.visibility === 'hidden') continue;
                if (!(d.innerText || '').toLowerCase().includes(needle)) continue;
                const target =
                    d.querySelector('button, input[type=button], input[type=submit], a') || d;
                target.focus();
                return true;
            }
            return false;
        "#;
        let found = self
            .driver
            .execute(script, vec![json!(title)])
            .await
            .map_err(classify)?
            .convert::<bool>()
            .unwrap_or(false);
        Ok(found)
    }

    async fn navigate(&mut self, target: &str) -> Result<(), SurfaceError> {
        debug!("Navigating to {}", target);
        self.driver.goto(target).await.map_err(classify)?;
        self.wait_for_page_ready().await
    }

    async fn recover(&mut self) -> Result<(), SurfaceError> {
        if self.alert_open || self.driver.get_alert_text().await.is_ok() {
            if let Err(e) = self.driver.dismiss_alert().await {
                debug!("Could not dismiss alert during recovery: {}", e);
            }
            self.alert_open = false;
        }
        let home = self.home_url.clone();
        self.navigate(&home).await
    }

    async fn export_pdf(&mut self, path: &Path) -> Result<(), SurfaceError> {
        let dev_tools = ChromeDevTools::new(self.driver.handle.clone());
        let result = dev_tools
            .execute_cdp_with_params(
                "Page.printToPDF",
                json!({ "printBackground": true, "preferCSSPageSize": true }),
            )
            .await
            .map_err(classify)?;

        let data = result
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SurfaceError::Backend("printToPDF returned no data".to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| SurfaceError::Backend(format!("Invalid PDF payload: {}", e)))?;

        tokio::fs::write(path, bytes).await?;
        debug!("Page printed to {}", path.display());
        Ok(())
    }

    async fn restore_session(&mut self, file: &Path) -> Result<bool, SurfaceError> {
        let jar = CookieJar::new(file);
        // Cookies can only be set for the domain currently loaded.
        let home = self.home_url.clone();
        self.navigate(&home).await?;
        let restored = jar
            .load(&self.driver)
            .await
            .map_err(|e| SurfaceError::Backend(e.to_string()))?;
        if restored {
            self.driver.refresh().await.map_err(classify)?;
            self.wait_for_page_ready().await?;
        }
        Ok(restored)
    }

    async fn save_session(&mut self, file: &Path) -> Result<(), SurfaceError> {
        CookieJar::new(file)
            .save(&self.driver)
            .await
            .map(|_| ())
            .map_err(|e| SurfaceError::Backend(e.to_string()))
    }

    async fn discard_session(&mut self, file: &Path) -> Result<(), SurfaceError> {
        if let Err(e) = self.driver.delete_all_cookies().await {
            debug!("Could not delete browser cookies: {}", e);
        }
        CookieJar::new(file)
            .clear()
            .map_err(|e| SurfaceError::Backend(e.to_string()))
    }

    async fn captcha_token(&mut self) -> Result<Option<String>, SurfaceError> {
        let script = r#"
            try {
                if (typeof grecaptcha !== 'undefined' && grecaptcha.getResponse) {
                    const response = grecaptcha.getResponse();
                    if (response) return response;
                }
            } catch (e) {}
            const fields = document.querySelectorAll(
                'textarea[name="g-recaptcha-response"], textarea[name="h-captcha-response"]');
            for (const f of fields) {
                if (f.value) return f.value;
            }
            const frame = document.querySelector('iframe[data-hcaptcha-response]');
            return frame ? frame.getAttribute('data-hcaptcha-response') || '' : '';
        "#;
        let token = self
            .driver
            .execute(script, vec![])
            .await
            .map_err(classify)?
            .convert::<String>()
            .unwrap_or_default();
        Ok(Some(token).filter(|t| !t.trim().is_empty()))
    }

    async fn solve_captcha(
        &mut self,
        solver: &CaptchaSolver,
        cancel: &CancellationToken,
    ) -> Result<bool, SurfaceError> {
        let html = self.driver.source().await.map_err(classify)?;
        let Some(site_key) = CaptchaSolver::extract_site_key(&html) else {
            debug!("No reCAPTCHA site key found in page");
            return Ok(false);
        };
        let page_url = self.driver.current_url().await.map_err(classify)?;

        let token = solver
            .solve_recaptcha_v2(&site_key, page_url.as_str(), cancel)
            .await
            .map_err(|e| SurfaceError::Backend(e.to_string()))?;

        let inject_script = r#"
            const token = arguments[0];
            const textarea = document.getElementById('g-recaptcha-response');
            if (textarea) {
                textarea.innerHTML = token;
                textarea.value = token;
                textarea.dispatchEvent(new Event('change', { bubbles: true }));
            }
            if (typeof ___grecaptcha_cfg !== 'undefined') {
                for (const id in ___grecaptcha_cfg.clients) {
                    const client = ___grecaptcha_cfg.clients[id];
                    if (client && typeof client.callback === 'function') {
                        try {
                            client.callback(token);
                        } catch (e) {
                            console.log('Callback error:', e);
                        }
                    }
                }
            }
            return true;
        "#;
        self.driver
            .execute(inject_script, vec![json!(token)])
            .await
            .map_err(classify)?;
        info!("✅ reCAPTCHA token injected");
        Ok(true)
    }

    async fn close(self: Box<Self>) -> Result<(), SurfaceError> {
        self.driver.quit().await.map_err(classify)
    }
}

async fn element_center(elem: &WebElement) -> Option<(i32, i32)> {
    let rect = elem.rect().await.ok()?;
    Some((
        (rect.x + rect.width / 2.0) as i32,
        (rect.y + rect.height / 2.0) as i32,
    ))
}

async fn element_value(elem: &WebElement) -> Option<String> {
    if let Ok(Some(value)) = elem.prop("value").await {
        if !value.is_empty() {
            return Some(value);
        }
    }
    if let Ok(text) = elem.text().await {
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

fn classify(err: WebDriverError) -> SurfaceError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("invalid session id")
        || lower.contains("no such window")
        || lower.contains("session deleted")
        || lower.contains("chrome not reachable")
        || lower.contains("disconnected")
    {
        SurfaceError::SessionLost(message)
    } else if lower.contains("no such element") {
        SurfaceError::NotFound(message)
    } else if lower.contains("timeout") || lower.contains("timed out") {
        SurfaceError::Timeout(message)
    } else {
        SurfaceError::Backend(message)
    }
}

fn is_page_ready(state: &str) -> bool {
    state == "complete" || state == "interactive"
}

/// Elements whose text never shows: non-rendered tags and subtrees hidden
/// inline with `hidden`, `aria-hidden` or a `display`/`visibility` style.
fn is_hidden(element: &scraper::node::Element) -> bool {
    if matches!(
        element.name(),
        "head" | "script" | "style" | "noscript" | "template"
    ) {
        return true;
    }
    if element.attr("hidden").is_some() || element.attr("aria-hidden") == Some("true") {
        return true;
    }
    element.attr("style").is_some_and(|style| {
        let style: String = style
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        style.contains("display:none") || style.contains("visibility:hidden")
    })
}

/// Collapsed visible text of an HTML document. Used when the browser
/// cannot render text itself; class-based hiding is not seen here.
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let body_selector = HtmlSelector::parse("body").expect("static selector");
    let root = document
        .select(&body_selector)
        .next()
        .unwrap_or_else(|| document.root_element());

    let mut raw = String::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(|a| a.value().as_element())
            .any(is_hidden);
        if !hidden {
            raw.push_str(text);
            raw.push(' ');
        }
    }

    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First match of `pattern` in `text`, with runs of whitespace collapsed so
/// line breaks between elements do not split a phrase.
pub fn text_match(text: &str, pattern: &TextPattern) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    pattern.find(&collapsed).map(|m| m.to_string())
}

pub fn visible_text_match(html: &str, pattern: &TextPattern) -> Option<String> {
    text_match(&visible_text(html), pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_text_skips_scripts() {
        let html = r#"
            <html><head><title>Consulta</title></head>
            <body>
                <script>var msg = "Situação no Simples Nacional";</script>
                <div>  Consulta   Optantes </div>
                <style>.x { color: red }</style>
            </body></html>
        "#;
        assert_eq!(visible_text(html), "Consulta Optantes");
    }

    #[test]
    fn test_visible_text_match_across_elements() {
        let html = r#"<body><span>Situação no</span><b>Simples Nacional:</b> Optante</body>"#;
        let pattern = TextPattern::literal("Situação no Simples Nacional");
        assert_eq!(
            visible_text_match(html, &pattern).as_deref(),
            Some("Situação no Simples Nacional")
        );
    }

    #[test]
    fn test_visible_text_match_failure_marker() {
        let html = r#"<body><p class="erro">CNPJ não encontrado na base</p></body>"#;
        let pattern = TextPattern::new(r"n[ãa]o encontrad[oa]").unwrap();
        assert!(visible_text_match(html, &pattern).is_some());
        let success = TextPattern::literal("Situação no Simples Nacional");
        assert!(visible_text_match(html, &success).is_none());
    }

    #[test]
    fn test_hidden_markers_are_not_visible() {
        let html = r#"<body>
            <div style="display:none">CNPJ não encontrado</div>
            <p hidden>Situação no Simples Nacional</p>
            <span style="visibility: hidden">CNPJ inválido</span>
            <div aria-hidden="true"><b>Erro</b></div>
            <p>Consulta Optantes</p>
        </body>"#;
        assert_eq!(visible_text(html), "Consulta Optantes");

        let failure = TextPattern::literal("não encontrado");
        let success = TextPattern::literal("Situação no Simples Nacional");
        assert_eq!(visible_text_match(html, &failure), None);
        assert_eq!(visible_text_match(html, &success), None);
    }

    #[test]
    fn test_rendered_text_match_spans_lines() {
        let rendered = "Situação no\nSimples Nacional:\tOptante";
        let pattern = TextPattern::literal("Situação no Simples Nacional");
        assert_eq!(
            text_match(rendered, &pattern).as_deref(),
            Some("Situação no Simples Nacional")
        );
        assert_eq!(text_match("", &pattern), None);
    }

    #[test]
    fn test_page_ready_states() {
        assert!(is_page_ready("complete"));
        assert!(is_page_ready("interactive"));
        assert!(!is_page_ready("loading"));
    }

    #[test]
    fn test_selector_mapping_is_total() {
        for selector in [
            Selector::Css("#a".into()),
            Selector::XPath("//a".into()),
            Selector::Id("a".into()),
            Selector::Name("a".into()),
        ] {
            let _ = WebSurface::by(&selector);
        }
    }
}
