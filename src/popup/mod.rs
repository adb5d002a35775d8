use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Timings;
use crate::error::SurfaceError;
use crate::progress::Reporter;
use crate::surface::Surface;
use crate::wait::pause;

/// A known transient dialog and the keys that dismiss it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopupSignature {
    /// Case-insensitive fragment of the dialog title or text.
    pub title: String,
    pub dismiss_keys: String,
}

impl PopupSignature {
    pub fn new(title: &str, dismiss_keys: &str) -> Self {
        Self {
            title: title.to_string(),
            dismiss_keys: dismiss_keys.to_string(),
        }
    }

    pub fn confirm(title: &str) -> Self {
        Self::new(title, "{ENTER}")
    }
}

/// Dismisses known dialogs so the next step starts from a clean state.
#[derive(Debug, Clone)]
pub struct PopupScanner {
    signatures: Vec<PopupSignature>,
    max_passes: usize,
    settle: Duration,
}

impl PopupScanner {
    pub fn new(signatures: Vec<PopupSignature>, max_passes: usize, settle: Duration) -> Self {
        Self {
            signatures,
            max_passes: max_passes.max(1),
            settle,
        }
    }

    pub fn with_timings(signatures: Vec<PopupSignature>, timings: &Timings) -> Self {
        Self::new(signatures, timings.popup_passes, timings.popup_settle())
    }

    pub fn signatures(&self) -> &[PopupSignature] {
        &self.signatures
    }

    /// Runs up to `max_passes` passes. Each pass dismisses the first open
    /// signature; a pass that finds nothing ends the scan, since dismissing one
    /// dialog may reveal another. Returns the titles that were dismissed,
    /// empty when nothing was open. Cancellation ends the scan after the
    /// current dismissal.
    pub async fn scan(
        &self,
        surface: &mut dyn Surface,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, SurfaceError> {
        let mut dismissed = Vec::new();

        for pass in 1..=self.max_passes {
            let mut found = None;
            for signature in &self.signatures {
                if surface.focus_dialog(&signature.title).await? {
                    found = Some(signature);
                    break;
                }
            }

            let Some(signature) = found else {
                break;
            };

            debug!("Pass {}: dismissing '{}'", pass, signature.title);
            surface.send_keys(&signature.dismiss_keys).await?;
            dismissed.push(signature.title.clone());
            if pause(self.settle, cancel).await.is_err() {
                debug!("Popup scan interrupted by cancellation");
                break;
            }
        }

        Ok(dismissed)
    }

    /// Scan that never fails: errors are logged and dropped. Used in per-task
    /// cleanup so nothing there can strand the run.
    pub async fn cleanup(
        &self,
        surface: &mut dyn Surface,
        reporter: &Reporter,
        cancel: &CancellationToken,
    ) -> bool {
        match self.scan(surface, cancel).await {
            Ok(dismissed) if dismissed.is_empty() => false,
            Ok(dismissed) => {
                reporter.report(format!("🧹 Dismissed: {}", dismissed.join(", ")));
                true
            }
            Err(e) => {
                warn!("Popup cleanup failed: {}", e);
                false
            }
        }
    }
}

/// Dialogs raised by the legacy "Comércio" desktop application.
pub fn legacy_signatures() -> Vec<PopupSignature> {
    vec![
        PopupSignature::confirm("Erro"),
        PopupSignature::confirm("Atenção"),
        PopupSignature::confirm("Aviso"),
        PopupSignature::confirm("Confirmação"),
        PopupSignature::confirm("Informação"),
        PopupSignature::confirm("Já existe"),
        PopupSignature::new("Salvar Saída de Impressão como", "{ESC}"),
    ]
}

/// Alerts and modals seen on the government portals.
pub fn web_signatures() -> Vec<PopupSignature> {
    vec![
        PopupSignature::confirm("sessão expirou"),
        PopupSignature::confirm("Atenção"),
        PopupSignature::confirm("Aviso"),
        PopupSignature::confirm("Erro"),
        PopupSignature::confirm("Confirma"),
    ]
}
