//! In-memory surface driven by declarative rules, for tests and dry runs.
//!
//! A [`Script`] holds the shared state: which locators are visible, which
//! dialogs are open and what happens when something is clicked, typed or
//! navigated to. Every surface and connector built from the same script sees
//! the same state, so a test can keep a handle and inspect the journal after
//! the run.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use super::{Connector, Input, Surface};
use crate::error::{SessionError, SurfaceError};
use crate::locator::{Hit, Locator};

/// State change applied when a rule fires.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Show(Locator),
    ShowWithText(Locator, String),
    Hide(Locator),
    OpenDialog(String),
    WriteFile { path: PathBuf, bytes: Vec<u8> },
    LoseSession,
}

#[derive(Debug, Clone, PartialEq)]
enum Trigger {
    Click(Locator),
    Type(Locator, Option<String>),
    Keys(String),
    Navigate(String),
}

#[derive(Debug, Clone)]
struct Rule {
    trigger: Trigger,
    effects: Vec<Effect>,
}

#[derive(Debug, Default)]
struct ScriptState {
    visible: Vec<(Locator, Hit)>,
    dialogs: Vec<String>,
    focused_dialog: Option<usize>,
    rules: Vec<Rule>,
    journal: Vec<String>,
    session_lost: bool,
    export: Option<Vec<u8>>,
    connects: u32,
    fail_connect: bool,
    saved_session: bool,
    captcha_token: Option<String>,
}

impl ScriptState {
    fn check_session(&self) -> Result<(), SurfaceError> {
        if self.session_lost {
            Err(SurfaceError::SessionLost("scripted session closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn hit_for(&self, locator: &Locator) -> Option<Hit> {
        self.visible
            .iter()
            .find(|(l, _)| l == locator)
            .map(|(_, hit)| hit.clone())
    }

    fn set_visible(&mut self, locator: Locator, hit: Hit) {
        self.visible.retain(|(l, _)| l != &locator);
        self.visible.push((locator, hit));
    }

    fn effects_for(&self, trigger: &Trigger) -> Vec<Effect> {
        self.rules
            .iter()
            .filter(|rule| match (&rule.trigger, trigger) {
                (Trigger::Type(l, None), Trigger::Type(other, _)) => l == other,
                (a, b) => a == b,
            })
            .flat_map(|rule| rule.effects.clone())
            .collect()
    }

    fn apply(&mut self, effects: Vec<Effect>) -> Result<(), SurfaceError> {
        for effect in effects {
            match effect {
                Effect::Show(locator) => self.set_visible(locator, Hit::default()),
                Effect::ShowWithText(locator, text) => {
                    self.set_visible(locator, Hit::with_text(text))
                }
                Effect::Hide(locator) => self.visible.retain(|(l, _)| l != &locator),
                Effect::OpenDialog(title) => self.dialogs.push(title),
                Effect::WriteFile { path, bytes } => std::fs::write(&path, bytes)?,
                Effect::LoseSession => self.session_lost = true,
            }
        }
        Ok(())
    }
}

/// Shared, cloneable script definition.
#[derive(Debug, Clone, Default)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn show(&self, locator: Locator) -> &Self {
        self.lock().set_visible(locator, Hit::default());
        self
    }

    pub fn show_with_text(&self, locator: Locator, text: &str) -> &Self {
        self.lock().set_visible(locator, Hit::with_text(text));
        self
    }

    pub fn hide(&self, locator: &Locator) -> &Self {
        self.lock().visible.retain(|(l, _)| l != locator);
        self
    }

    pub fn open_dialog(&self, title: &str) -> &Self {
        self.lock().dialogs.push(title.to_string());
        self
    }

    pub fn on_click(&self, locator: Locator, effects: Vec<Effect>) -> &Self {
        self.add_rule(Trigger::Click(locator), effects)
    }

    /// Fires when `locator` receives text; `text = None` matches any text.
    pub fn on_type(&self, locator: Locator, text: Option<&str>, effects: Vec<Effect>) -> &Self {
        self.add_rule(Trigger::Type(locator, text.map(str::to_string)), effects)
    }

    pub fn on_keys(&self, keys: &str, effects: Vec<Effect>) -> &Self {
        self.add_rule(Trigger::Keys(keys.to_string()), effects)
    }

    pub fn on_navigate(&self, target: &str, effects: Vec<Effect>) -> &Self {
        self.add_rule(Trigger::Navigate(target.to_string()), effects)
    }

    fn add_rule(&self, trigger: Trigger, effects: Vec<Effect>) -> &Self {
        self.lock().rules.push(Rule { trigger, effects });
        self
    }

    /// Bytes written by `export_pdf`; `None` makes the export fail.
    pub fn set_export(&self, bytes: Option<Vec<u8>>) -> &Self {
        self.lock().export = bytes;
        self
    }

    pub fn lose_session(&self) -> &Self {
        self.lock().session_lost = true;
        self
    }

    /// Whether a persisted login exists for `restore_session` to pick up.
    pub fn saved_session(&self, saved: bool) -> &Self {
        self.lock().saved_session = saved;
        self
    }

    pub fn set_captcha_token(&self, token: Option<&str>) -> &Self {
        self.lock().captcha_token = token.map(str::to_string);
        self
    }

    pub fn has_saved_session(&self) -> bool {
        self.lock().saved_session
    }

    pub fn fail_connect(&self, fail: bool) -> &Self {
        self.lock().fail_connect = fail;
        self
    }

    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn dialogs(&self) -> Vec<String> {
        self.lock().dialogs.clone()
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    pub fn is_visible(&self, locator: &Locator) -> bool {
        self.lock().hit_for(locator).is_some()
    }

    pub fn surface(&self) -> ScriptedSurface {
        ScriptedSurface {
            script: self.clone(),
        }
    }

    pub fn connector(&self) -> ScriptedConnector {
        ScriptedConnector {
            script: self.clone(),
        }
    }
}

pub struct ScriptedSurface {
    script: Script,
}

#[async_trait]
impl Surface for ScriptedSurface {
    fn label(&self) -> String {
        "scripted".to_string()
    }

    async fn probe(&mut self, locator: &Locator) -> Result<Option<Hit>, SurfaceError> {
        let state = self.script.lock();
        state.check_session()?;
        Ok(state.hit_for(locator))
    }

    async fn act(
        &mut self,
        locator: &Locator,
        _hit: &Hit,
        input: &Input,
    ) -> Result<(), SurfaceError> {
        let mut state = self.script.lock();
        state.check_session()?;
        if state.hit_for(locator).is_none() {
            return Err(SurfaceError::NotFound(locator.to_string()));
        }
        let trigger = match input {
            Input::Click => {
                state.journal.push(format!("click {}", locator));
                Trigger::Click(locator.clone())
            }
            Input::Type { text, .. } => {
                state.journal.push(format!("type {} {}", locator, text));
                Trigger::Type(locator.clone(), Some(text.clone()))
            }
        };
        let effects = state.effects_for(&trigger);
        state.apply(effects)
    }

    async fn send_keys(&mut self, keys: &str) -> Result<(), SurfaceError> {
        let mut state = self.script.lock();
        state.check_session()?;
        state.journal.push(format!("keys {}", keys));
        if let Some(index) = state.focused_dialog.take() {
            if index < state.dialogs.len() {
                let title = state.dialogs.remove(index);
                debug!("Scripted dialog '{}' dismissed", title);
            }
        }
        let effects = state.effects_for(&Trigger::Keys(keys.to_string()));
        state.apply(effects)
    }

    async fn focus_dialog(&mut self, title: &str) -> Result<bool, SurfaceError> {
        let mut state = self.script.lock();
        state.check_session()?;
        let needle = title.to_lowercase();
        let found = state
            .dialogs
            .iter()
            .rposition(|d| d.to_lowercase().contains(&needle));
        state.focused_dialog = found;
        Ok(found.is_some())
    }

    async fn navigate(&mut self, target: &str) -> Result<(), SurfaceError> {
        let mut state = self.script.lock();
        state.check_session()?;
        state.journal.push(format!("navigate {}", target));
        let effects = state.effects_for(&Trigger::Navigate(target.to_string()));
        state.apply(effects)
    }

    async fn recover(&mut self) -> Result<(), SurfaceError> {
        let mut state = self.script.lock();
        state.check_session()?;
        state.journal.push("recover".to_string());
        state.dialogs.clear();
        state.focused_dialog = None;
        Ok(())
    }

    async fn export_pdf(&mut self, path: &Path) -> Result<(), SurfaceError> {
        let mut state = self.script.lock();
        state.check_session()?;
        state.journal.push("export".to_string());
        match &state.export {
            Some(bytes) => {
                std::fs::write(path, bytes)?;
                Ok(())
            }
            None => Err(SurfaceError::Backend("nothing to print".to_string())),
        }
    }

    async fn restore_session(&mut self, _file: &Path) -> Result<bool, SurfaceError> {
        let mut state = self.script.lock();
        state.check_session()?;
        state.journal.push("restore session".to_string());
        Ok(state.saved_session)
    }

    async fn save_session(&mut self, _file: &Path) -> Result<(), SurfaceError> {
        let mut state = self.script.lock();
        state.check_session()?;
        state.journal.push("save session".to_string());
        state.saved_session = true;
        Ok(())
    }

    async fn discard_session(&mut self, _file: &Path) -> Result<(), SurfaceError> {
        let mut state = self.script.lock();
        state.journal.push("discard session".to_string());
        state.saved_session = false;
        Ok(())
    }

    async fn captcha_token(&mut self) -> Result<Option<String>, SurfaceError> {
        let state = self.script.lock();
        state.check_session()?;
        Ok(state.captcha_token.clone())
    }

    async fn close(self: Box<Self>) -> Result<(), SurfaceError> {
        self.script.lock().journal.push("close".to_string());
        Ok(())
    }
}

pub struct ScriptedConnector {
    script: Script,
}

#[async_trait]
impl Connector for ScriptedConnector {
    fn target(&self) -> String {
        "scripted target".to_string()
    }

    async fn connect(&self) -> Result<Box<dyn Surface>, SessionError> {
        let mut state = self.script.lock();
        if state.fail_connect {
            return Err(SessionError::Establish {
                target: self.target(),
                reason: "target window not found".to_string(),
            });
        }
        state.connects += 1;
        state.session_lost = false;
        state.journal.push("connect".to_string());
        drop(state);
        Ok(Box::new(self.script.surface()))
    }
}
