//! Boundary to the host windowing system.
//!
//! A [`UiDriver`] is the only way the controller touches the legacy
//! application. It is passed around explicitly as an `Arc<dyn UiDriver>`
//! capability; [`Window`] binds that capability to one window matcher the
//! same way a locator binds an engine to a selector.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::errors::DriverError;

// Default timeout if none is specified on the window handle itself
const DEFAULT_WINDOW_TIMEOUT: Duration = Duration::from_secs(20);

/// How a window title is matched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TitleMatch {
    /// Whole-title equality
    Exact(String),
    /// Regular expression anchored at the start of the title
    Pattern(String),
}

/// Identifies one top-level window of the application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowMatcher {
    pub title: TitleMatch,
    /// Which of several matching windows to pick, in z-order
    #[serde(default)]
    pub found_index: usize,
}

impl WindowMatcher {
    pub fn exact(title: impl Into<String>) -> Self {
        Self {
            title: TitleMatch::Exact(title.into()),
            found_index: 0,
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            title: TitleMatch::Pattern(pattern.into()),
            found_index: 0,
        }
    }

    pub fn nth(mut self, index: usize) -> Self {
        self.found_index = index;
        self
    }

    /// Checks a concrete window title against this matcher. An invalid
    /// pattern matches nothing.
    pub fn matches(&self, title: &str) -> bool {
        match &self.title {
            TitleMatch::Exact(expected) => expected == title,
            TitleMatch::Pattern(pattern) => Regex::new(&format!("^(?:{pattern})"))
                .map(|re| re.is_match(title))
                .unwrap_or(false),
        }
    }
}

impl fmt::Display for WindowMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.title {
            TitleMatch::Exact(title) => write!(f, "'{title}'")?,
            TitleMatch::Pattern(pattern) => write!(f, "/{pattern}/")?,
        }
        if self.found_index > 0 {
            write!(f, "[{}]", self.found_index)?;
        }
        Ok(())
    }
}

/// Condition a window is waited for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Exists,
    Visible,
    Enabled,
    /// Exists and accepts input
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Screen rectangle; `right` and `bottom` are inclusive edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    pub fn mid_point(&self) -> Point {
        Point::new(
            self.left + self.width() / 2,
            self.top + self.height() / 2,
        )
    }
}

/// Process started by [`UiDriver::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Connection to the running application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppHandle {
    pub pid: Option<u32>,
    pub path: PathBuf,
}

/// Everything the controller needs from the host windowing system.
///
/// Controls are addressed by the backend's own control names (for example
/// `"Edit2"` or `"OK"`); keystroke strings use the backend's key syntax, see
/// [`escape_keys`].
#[async_trait]
pub trait UiDriver: Send + Sync {
    /// Start the executable at `path`.
    async fn launch(&self, path: &Path) -> Result<ProcessHandle, DriverError>;

    /// Connect to an already running instance of the executable at `path`.
    async fn attach(&self, path: &Path) -> Result<AppHandle, DriverError>;

    fn exists(&self, window: &WindowMatcher) -> bool;

    async fn wait_for(
        &self,
        window: &WindowMatcher,
        state: WindowState,
        timeout: Duration,
    ) -> Result<(), DriverError>;

    fn set_focus(&self, window: &WindowMatcher) -> Result<(), DriverError>;

    fn close(&self, window: &WindowMatcher) -> Result<(), DriverError>;

    fn set_text(&self, window: &WindowMatcher, control: &str, value: &str)
        -> Result<(), DriverError>;

    fn text(&self, window: &WindowMatcher, control: &str) -> Result<String, DriverError>;

    fn click(&self, window: &WindowMatcher, control: &str) -> Result<(), DriverError>;

    fn is_enabled(&self, window: &WindowMatcher, control: &str) -> Result<bool, DriverError>;

    /// Send a key sequence to `control`, or to the window itself when `None`.
    fn type_keys(
        &self,
        window: &WindowMatcher,
        control: Option<&str>,
        keys: &str,
    ) -> Result<(), DriverError>;

    fn select_item(
        &self,
        window: &WindowMatcher,
        control: &str,
        index: usize,
    ) -> Result<(), DriverError>;

    /// Select a menu item by path, e.g. `"#4->#4->#1"`.
    fn menu_select(&self, window: &WindowMatcher, path: &str) -> Result<(), DriverError>;

    /// Text currently shown by a status strip control.
    fn status_text(&self, window: &WindowMatcher, control: &str) -> Result<String, DriverError>;

    /// Copy a modal's content to the clipboard and return the clipboard text.
    fn capture_clipboard_dump(&self, window: &WindowMatcher) -> Result<String, DriverError>;

    fn rectangle(&self, window: &WindowMatcher, control: &str) -> Result<Rect, DriverError>;

    fn move_pointer(&self, point: Point) -> Result<(), DriverError>;

    fn click_at(&self, point: Point) -> Result<(), DriverError>;
}

/// Escapes characters that carry meaning in key-sequence syntax so `text`
/// is typed literally.
pub fn escape_keys(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '{' | '}' | '+' | '^' | '%' | '~' | '(' | ')' | '[' | ']' => {
                escaped.push('{');
                escaped.push(c);
                escaped.push('}');
            }
            _ => escaped.push(c),
        }
    }
    escaped
}

/// A driver capability bound to one window.
#[derive(Clone)]
pub struct Window {
    driver: Arc<dyn UiDriver>,
    matcher: WindowMatcher,
    timeout: Duration,
}

impl fmt::Debug for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("matcher", &self.matcher)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Window {
    pub fn new(driver: Arc<dyn UiDriver>, matcher: WindowMatcher) -> Self {
        Self {
            driver,
            matcher,
            timeout: DEFAULT_WINDOW_TIMEOUT,
        }
    }

    /// Set the timeout used by [`Window::wait`] when none is passed.
    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn matcher(&self) -> &WindowMatcher {
        &self.matcher
    }

    pub fn exists(&self) -> bool {
        self.driver.exists(&self.matcher)
    }

    #[instrument(level = "debug", skip(self, timeout), fields(window = %self.matcher))]
    pub async fn wait(
        &self,
        state: WindowState,
        timeout: Option<Duration>,
    ) -> Result<(), DriverError> {
        let effective_timeout = timeout.unwrap_or(self.timeout);
        debug!(?state, ?effective_timeout, "Waiting for window");
        self.driver
            .wait_for(&self.matcher, state, effective_timeout)
            .await
            .map_err(|e| match e {
                DriverError::WindowNotFound(inner) => DriverError::Timeout(format!(
                    "Timed out after {effective_timeout:?} waiting for window {}: {inner}",
                    self.matcher
                )),
                other => other,
            })
    }

    pub fn set_focus(&self) -> Result<(), DriverError> {
        self.driver.set_focus(&self.matcher)
    }

    pub fn close(&self) -> Result<(), DriverError> {
        self.driver.close(&self.matcher)
    }

    /// Closes the window when present; returns whether it was.
    pub fn close_if_open(&self) -> Result<bool, DriverError> {
        if !self.exists() {
            return Ok(false);
        }
        self.close()?;
        Ok(true)
    }

    pub fn set_text(&self, control: &str, value: &str) -> Result<(), DriverError> {
        self.driver.set_text(&self.matcher, control, value)
    }

    pub fn text(&self, control: &str) -> Result<String, DriverError> {
        self.driver.text(&self.matcher, control)
    }

    pub fn click(&self, control: &str) -> Result<(), DriverError> {
        self.driver.click(&self.matcher, control)
    }

    pub fn is_enabled(&self, control: &str) -> Result<bool, DriverError> {
        self.driver.is_enabled(&self.matcher, control)
    }

    pub fn type_keys(&self, control: Option<&str>, keys: &str) -> Result<(), DriverError> {
        self.driver.type_keys(&self.matcher, control, keys)
    }

    pub fn select_item(&self, control: &str, index: usize) -> Result<(), DriverError> {
        self.driver.select_item(&self.matcher, control, index)
    }

    pub fn menu_select(&self, path: &str) -> Result<(), DriverError> {
        self.driver.menu_select(&self.matcher, path)
    }

    pub fn status_text(&self, control: &str) -> Result<String, DriverError> {
        self.driver.status_text(&self.matcher, control)
    }

    pub fn capture_clipboard_dump(&self) -> Result<String, DriverError> {
        self.driver.capture_clipboard_dump(&self.matcher)
    }

    pub fn rectangle(&self, control: &str) -> Result<Rect, DriverError> {
        self.driver.rectangle(&self.matcher, control)
    }
}
