pub mod desktop;
pub mod scripted;
pub mod web;

mod cookies;
mod keys;

pub use keys::{parse_keys, KeyToken};

use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::captcha::CaptchaSolver;
use crate::error::{SessionError, SurfaceError};
use crate::locator::{Hit, Locator};

/// Input delivered to an element found by a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Click,
    Type { text: String, clear: bool },
}

/// One live automation handle: a browser page or an application window.
///
/// A surface is owned by exactly one task loop and used strictly
/// sequentially.
#[async_trait]
pub trait Surface: Send {
    fn label(&self) -> String;

    /// Single non-blocking lookup. `Ok(None)` means "not there right now".
    async fn probe(&mut self, locator: &Locator) -> Result<Option<Hit>, SurfaceError>;

    async fn act(&mut self, locator: &Locator, hit: &Hit, input: &Input)
        -> Result<(), SurfaceError>;

    /// Sends a key sequence (`{ENTER}`, `{ESC}`, `^p`, plain text) to whatever
    /// currently has focus.
    async fn send_keys(&mut self, keys: &str) -> Result<(), SurfaceError>;

    /// Looks for an open dialog whose title or text contains `title`, and
    /// focuses it when found.
    async fn focus_dialog(&mut self, title: &str) -> Result<bool, SurfaceError>;

    /// Moves to a known place: a URL for browsers, the main window for
    /// desktop applications.
    async fn navigate(&mut self, target: &str) -> Result<(), SurfaceError>;

    /// Returns the surface to a navigable state after a failed task.
    async fn recover(&mut self) -> Result<(), SurfaceError>;

    /// Renders the current view to a PDF file.
    async fn export_pdf(&mut self, _path: &Path) -> Result<(), SurfaceError> {
        Err(SurfaceError::Unsupported(format!(
            "{} cannot render pages to PDF",
            self.label()
        )))
    }

    /// Restores persisted login state. Returns whether anything was restored.
    async fn restore_session(&mut self, _file: &Path) -> Result<bool, SurfaceError> {
        Ok(false)
    }

    async fn save_session(&mut self, _file: &Path) -> Result<(), SurfaceError> {
        Ok(())
    }

    /// Drops persisted login state that no longer grants access.
    async fn discard_session(&mut self, _file: &Path) -> Result<(), SurfaceError> {
        Ok(())
    }

    /// Response token of a captcha the current view considers solved. Read
    /// from page state rather than from a displayed element, since captcha
    /// widgets keep their response fields hidden. `None` while unsolved.
    async fn captcha_token(&mut self) -> Result<Option<String>, SurfaceError> {
        Ok(None)
    }

    /// Solves a captcha on the current view through an external service.
    /// Returns `false` when there is nothing this surface can solve.
    async fn solve_captcha(
        &mut self,
        _solver: &CaptchaSolver,
        _cancel: &CancellationToken,
    ) -> Result<bool, SurfaceError> {
        Ok(false)
    }

    async fn close(self: Box<Self>) -> Result<(), SurfaceError>;
}

/// Creates surfaces. Used once at the start of a run and again whenever the
/// driver has to replace a lost session.
#[async_trait]
pub trait Connector: Send + Sync {
    fn target(&self) -> String;

    async fn connect(&self) -> Result<Box<dyn Surface>, SessionError>;
}
