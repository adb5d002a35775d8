//! Legacy desktop application driven through Windows UI Automation.
//!
//! Elements are located inside the application's main window: `Name`
//! selectors match element names partially, `Id` selectors match the
//! automation id, text patterns match element names, and image templates are
//! searched on a capture of the primary monitor.

use async_trait::async_trait;
use regex::Regex;

use super::{Connector, Surface};
use crate::config::Timings;
use crate::error::SessionError;

/// Attaches to the first top-level window whose title matches a pattern.
#[derive(Debug, Clone)]
pub struct DesktopConnector {
    pub title_pattern: Regex,
    pub timings: Timings,
}

impl DesktopConnector {
    pub fn new(title_pattern: Regex, timings: Timings) -> Self {
        Self {
            title_pattern,
            timings,
        }
    }
}

#[cfg(not(windows))]
#[async_trait]
impl Connector for DesktopConnector {
    fn target(&self) -> String {
        format!("window /{}/", self.title_pattern)
    }

    async fn connect(&self) -> Result<Box<dyn Surface>, SessionError> {
        Err(SessionError::Establish {
            target: self.target(),
            reason: "desktop automation is only available on Windows".to_string(),
        })
    }
}

#[cfg(windows)]
pub use self::windows::DesktopSurface;

#[cfg(windows)]
mod windows {
    use super::*;
    use tracing::{debug, info, warn};
    use uiautomation::controls::ControlType;
    use uiautomation::inputs::Mouse;
    use uiautomation::types::Point;
    use uiautomation::{UIAutomation, UIElement};

    use crate::error::SurfaceError;
    use crate::locator::{find_template, load_template, Hit, Locator, Selector};
    use crate::surface::keys::{parse_keys, KeyToken};
    use crate::surface::Input;

    const ELEMENT_PROBE_MS: u64 = 100;
    const WINDOW_SEARCH_MS: u64 = 5_000;
    const KEY_INTERVAL_MS: u64 = 10;

    /// COM handle owned by a single surface.
    struct Com<T>(T);

    // Safety: the handle is only ever used by the task that owns the surface,
    // one call at a time.
    unsafe impl<T> Send for Com<T> {}

    fn backend(context: &str, err: impl std::fmt::Display) -> SurfaceError {
        SurfaceError::Backend(format!("{}: {}", context, err))
    }

    #[async_trait]
    impl Connector for DesktopConnector {
        fn target(&self) -> String {
            format!("window /{}/", self.title_pattern)
        }

        async fn connect(&self) -> Result<Box<dyn Surface>, SessionError> {
            let surface = DesktopSurface::attach(&self.title_pattern, &self.timings).map_err(|e| {
                SessionError::Establish {
                    target: self.target(),
                    reason: e.to_string(),
                }
            })?;
            info!("🖥️  Attached to '{}'", surface.title);
            Ok(Box::new(surface))
        }
    }

    pub struct DesktopSurface {
        automation: Com<UIAutomation>,
        window: Com<UIElement>,
        title: String,
        title_pattern: Regex,
        dialog_timeout_ms: u64,
    }

    impl DesktopSurface {
        fn attach(title_pattern: &Regex, timings: &Timings) -> Result<Self, SurfaceError> {
            let automation =
                UIAutomation::new().map_err(|e| backend("UI Automation unavailable", e))?;
            let window = find_window(&automation, title_pattern, WINDOW_SEARCH_MS)?;
            if let Err(e) = window.set_focus() {
                warn!("Could not focus application window: {}", e);
            }
            let title = window.get_name().unwrap_or_default();
            Ok(Self {
                automation: Com(automation),
                window: Com(window),
                title,
                title_pattern: title_pattern.clone(),
                dialog_timeout_ms: timings.popup_probe_timeout().as_millis() as u64,
            })
        }

        /// Fails with `SessionLost` when the main window is gone.
        fn ensure_window(&self) -> Result<(), SurfaceError> {
            match self.window.0.get_name() {
                Ok(_) => Ok(()),
                Err(e) => Err(SurfaceError::SessionLost(format!(
                    "window '{}' is no longer available: {}",
                    self.title, e
                ))),
            }
        }

        fn find_element(&self, locator: &Locator) -> Result<Option<UIElement>, SurfaceError> {
            let matcher = self
                .automation
                .0
                .create_matcher()
                .from_ref(&self.window.0)
                .depth(12)
                .timeout(ELEMENT_PROBE_MS);

            let matcher = match locator {
                Locator::Selector(Selector::Name(name)) => matcher.contains_name(name),
                Locator::Selector(Selector::Id(id)) => {
                    let id = id.clone();
                    matcher.filter_fn(Box::new(move |e: &UIElement| {
                        Ok(e.get_automation_id().map(|a| a == id).unwrap_or(false))
                    }))
                }
                Locator::Selector(other) => {
                    return Err(SurfaceError::Unsupported(format!(
                        "{:?} selectors do not apply to desktop windows",
                        other
                    )))
                }
                Locator::Text(pattern) => {
                    let regex = pattern.regex().clone();
                    matcher.filter_fn(Box::new(move |e: &UIElement| {
                        Ok(regex.is_match(&e.get_name().unwrap_or_default()))
                    }))
                }
                Locator::Image(_) => return Ok(None),
            };

            Ok(matcher.find_first().ok())
        }

        fn locate_image(&self, locator: &Locator) -> Result<Option<Hit>, SurfaceError> {
            let Locator::Image(template) = locator else {
                return Ok(None);
            };
            let needle = load_template(&template.path)
                .map_err(|e| backend(&format!("template {}", template.path.display()), e))?;

            let monitors = xcap::Monitor::all().map_err(|e| backend("monitor list", e))?;
            let monitor = monitors
                .into_iter()
                .find(|m| m.is_primary().unwrap_or(false))
                .ok_or_else(|| SurfaceError::Backend("no primary monitor".to_string()))?;
            let offset_x = monitor.x().unwrap_or(0);
            let offset_y = monitor.y().unwrap_or(0);
            let capture = monitor
                .capture_image()
                .map_err(|e| backend("screen capture", e))?;
            let screen = image::DynamicImage::ImageRgba8(capture).to_luma8();

            Ok(find_template(&screen, &needle, template.threshold).map(|m| {
                let (x, y) = m.center();
                Hit::at(x + offset_x, y + offset_y)
            }))
        }

        fn type_text(
            &self,
            element: &UIElement,
            text: &str,
            clear: bool,
        ) -> Result<(), SurfaceError> {
            if clear {
                element
                    .send_keys("{ctrl}(a){delete}", KEY_INTERVAL_MS)
                    .map_err(|e| backend("clear field", e))?;
            }
            element
                .send_text(text, KEY_INTERVAL_MS)
                .map_err(|e| backend("type text", e))
        }

        fn focused(&self) -> Result<UIElement, SurfaceError> {
            self.automation
                .0
                .get_focused_element()
                .map_err(|e| backend("focused element", e))
        }
    }

    fn find_window(
        automation: &UIAutomation,
        title_pattern: &Regex,
        timeout_ms: u64,
    ) -> Result<UIElement, SurfaceError> {
        let root = automation
            .get_root_element()
            .map_err(|e| backend("desktop root", e))?;
        let pattern = title_pattern.clone();
        automation
            .create_matcher()
            .from_ref(&root)
            .control_type(ControlType::Window)
            .filter_fn(Box::new(move |e: &UIElement| {
                Ok(pattern.is_match(&e.get_name().unwrap_or_default()))
            }))
            .depth(2)
            .timeout(timeout_ms)
            .find_first()
            .map_err(|e| SurfaceError::NotFound(format!("window /{}/: {}", title_pattern, e)))
    }

    fn element_hit(element: &UIElement) -> Hit {
        let point = element.get_bounding_rectangle().ok().map(|rect| {
            (
                rect.get_left() + rect.get_width() / 2,
                rect.get_top() + rect.get_height() / 2,
            )
        });
        let text = element.get_name().ok().filter(|n| !n.is_empty());
        Hit { point, text }
    }

    /// Key sequence in the notation `UIElement::send_keys` understands.
    fn uia_keys(tokens: &[KeyToken]) -> Vec<(bool, String)> {
        tokens
            .iter()
            .map(|token| match token {
                KeyToken::Text(text) => (true, text.clone()),
                KeyToken::Enter => (false, "{enter}".to_string()),
                KeyToken::Escape => (false, "{esc}".to_string()),
                KeyToken::Tab => (false, "{tab}".to_string()),
                KeyToken::Backspace => (false, "{backspace}".to_string()),
                KeyToken::Delete => (false, "{delete}".to_string()),
                KeyToken::Ctrl(c) => (false, format!("{{ctrl}}({})", c)),
                KeyToken::Alt(c) => (false, format!("{{alt}}({})", c)),
            })
            .collect()
    }

    #[async_trait]
    impl Surface for DesktopSurface {
        fn label(&self) -> String {
            format!("window '{}'", self.title)
        }

        async fn probe(&mut self, locator: &Locator) -> Result<Option<Hit>, SurfaceError> {
            self.ensure_window()?;
            if let Locator::Image(_) = locator {
                return self.locate_image(locator);
            }
            Ok(self.find_element(locator)?.map(|e| element_hit(&e)))
        }

        async fn act(
            &mut self,
            locator: &Locator,
            hit: &Hit,
            input: &Input,
        ) -> Result<(), SurfaceError> {
            self.ensure_window()?;

            if let Locator::Image(_) = locator {
                let (x, y) = hit
                    .point
                    .ok_or_else(|| SurfaceError::NotFound(locator.to_string()))?;
                Mouse::default()
                    .click(Point::new(x, y))
                    .map_err(|e| backend("mouse click", e))?;
                if let Input::Type { text, clear } = input {
                    let focused = self.focused()?;
                    self.type_text(&focused, text, *clear)?;
                }
                return Ok(());
            }

            let element = self
                .find_element(locator)?
                .ok_or_else(|| SurfaceError::NotFound(locator.to_string()))?;
            match input {
                Input::Click => element.click().map_err(|e| backend("click", e)),
                Input::Type { text, clear } => {
                    element.set_focus().map_err(|e| backend("focus", e))?;
                    self.type_text(&element, text, *clear)
                }
            }
        }

        async fn send_keys(&mut self, keys: &str) -> Result<(), SurfaceError> {
            let target = self.focused().unwrap_or_else(|_| self.window.0.clone());
            for (literal, chunk) in uia_keys(&parse_keys(keys)) {
                let result = if literal {
                    target.send_text(&chunk, KEY_INTERVAL_MS)
                } else {
                    target.send_keys(&chunk, KEY_INTERVAL_MS)
                };
                result.map_err(|e| backend("send keys", e))?;
            }
            Ok(())
        }

        async fn focus_dialog(&mut self, title: &str) -> Result<bool, SurfaceError> {
            let needle = title.to_lowercase();
            let root = self
                .automation
                .0
                .get_root_element()
                .map_err(|e| backend("desktop root", e))?;
            let dialog = self
                .automation
                .0
                .create_matcher()
                .from_ref(&root)
                .control_type(ControlType::Window)
                .filter_fn(Box::new(move |e: &UIElement| {
                    Ok(e.get_name().unwrap_or_default().to_lowercase().contains(&needle))
                }))
                .depth(3)
                .timeout(self.dialog_timeout_ms)
                .find_first();

            match dialog {
                Ok(dialog) => {
                    dialog.set_focus().map_err(|e| backend("focus dialog", e))?;
                    debug!("Focused dialog '{}'", dialog.get_name().unwrap_or_default());
                    Ok(true)
                }
                Err(_) => Ok(false),
            }
        }

        async fn navigate(&mut self, target: &str) -> Result<(), SurfaceError> {
            self.ensure_window()?;
            debug!("Bringing '{}' to front for {}", self.title, target);
            self.window.0.set_focus().map_err(|e| backend("focus window", e))
        }

        async fn recover(&mut self) -> Result<(), SurfaceError> {
            self.ensure_window()?;
            self.window.0.set_focus().map_err(|e| backend("focus window", e))?;
            self.window
                .0
                .send_keys("{esc}{esc}", KEY_INTERVAL_MS)
                .map_err(|e| backend("escape", e))?;
            // The application may have been restarted with a new window handle.
            if let Ok(window) = find_window(&self.automation.0, &self.title_pattern, 0) {
                self.window = Com(window);
            }
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), SurfaceError> {
            // The application belongs to the operator; leave it running.
            Ok(())
        }
    }
}
