//! Lifecycle of one session with the legacy client.
//!
//! [`SessionController::open`] launches the client, logs in and hands out a
//! [`Session`]. Mode-scoped work only happens through the [`ModeScope`]
//! handle that [`Session::enter_mode`] and [`Session::run_in_mode`] give
//! out, and every scoped operation re-checks the state at runtime as well.
//! Teardown kills the client's process tree; it is idempotent and runs on
//! every exit path, including dropping an unclosed session.

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SessionConfig;
use crate::credentials::{CredentialRotator, Credentials, Redacted};
use crate::dialogs::{ControlRole, DialogRole};
use crate::driver::{escape_keys, AppHandle, Point, UiDriver, Window, WindowState};
use crate::errors::SessionError;
use crate::export::{ExportTask, ExportVerifier};
use crate::inspector::{DialogInspector, DialogVerdict};
use crate::locator::{Axis, ToolbarButtonLocator};
use crate::process::{confirm_exited, reap_all, ProcessReaper};
use crate::store::CredentialStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Closed,
    Launching,
    Authenticating,
    PasswordExpired,
    Ready,
    ModeSelected(String),
    Exporting,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Closed => f.write_str("Closed"),
            SessionState::Launching => f.write_str("Launching"),
            SessionState::Authenticating => f.write_str("Authenticating"),
            SessionState::PasswordExpired => f.write_str("PasswordExpired"),
            SessionState::Ready => f.write_str("Ready"),
            SessionState::ModeSelected(mode) => write!(f, "ModeSelected({mode})"),
            SessionState::Exporting => f.write_str("Exporting"),
            SessionState::Faulted => f.write_str("Faulted"),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged { from: SessionState, to: SessionState },
    /// The client accepted a new password; it is the only valid one now.
    PasswordRotated(String),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::StateChanged { from, to } => f
                .debug_struct("StateChanged")
                .field("from", from)
                .field("to", to)
                .finish(),
            SessionEvent::PasswordRotated(password) => f
                .debug_tuple("PasswordRotated")
                .field(&Redacted(password))
                .finish(),
        }
    }
}

/// Final report of a session.
pub struct SessionResult {
    pub state: SessionState,
    pub rotated_password: Option<String>,
    pub error: Option<SessionError>,
}

impl fmt::Debug for SessionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionResult")
            .field("state", &self.state)
            .field(
                "rotated_password",
                &self.rotated_password.as_deref().map(Redacted),
            )
            .field("error", &self.error)
            .finish()
    }
}

// Application paths with a live session in this process.
static LIVE_INSTANCES: Lazy<Mutex<HashSet<PathBuf>>> = Lazy::new(|| Mutex::new(HashSet::new()));

#[derive(Debug)]
struct InstanceLease {
    path: PathBuf,
}

impl InstanceLease {
    fn acquire(path: PathBuf) -> Result<Self, SessionError> {
        let mut live = LIVE_INSTANCES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !live.insert(path.clone()) {
            return Err(SessionError::InstanceBusy(path));
        }
        Ok(Self { path })
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        LIVE_INSTANCES
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.path);
    }
}

pub struct SessionController {
    driver: Arc<dyn UiDriver>,
    reaper: Arc<dyn ProcessReaper>,
    config: SessionConfig,
    credentials: Credentials,
    store: Option<Arc<dyn CredentialStore>>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
    state: SessionState,
    rotated_password: Option<String>,
    attempts_used: u32,
    app: Option<AppHandle>,
    lease: Option<InstanceLease>,
}

impl SessionController {
    pub fn new(
        driver: Arc<dyn UiDriver>,
        reaper: Arc<dyn ProcessReaper>,
        config: SessionConfig,
        credentials: Credentials,
    ) -> Self {
        Self {
            driver,
            reaper,
            config,
            credentials,
            store: None,
            events: None,
            state: SessionState::Closed,
            rotated_password: None,
            attempts_used: 0,
            app: None,
            lease: None,
        }
    }

    /// Persists rotated passwords before the session continues.
    pub fn with_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Receives state changes and rotated passwords from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Password set during this controller's lifetime, if any. Still
    /// available when `open` failed after the client accepted it.
    pub fn rotated_password(&self) -> Option<&str> {
        self.rotated_password.as_deref()
    }

    pub fn attempts_used(&self) -> u32 {
        self.attempts_used
    }

    /// Client the controller is attached to; `None` after teardown.
    pub fn app(&self) -> Option<&AppHandle> {
        self.app.as_ref()
    }

    /// Launches the client and logs in. Each launch attempt reaps leftover
    /// processes and waits for them to exit first; fatal errors end the loop
    /// at once.
    #[instrument(skip(self), fields(app = %self.config.app_path.display()))]
    pub async fn open(&mut self) -> Result<Session<'_>, SessionError> {
        if self.lease.is_none() {
            self.lease = Some(InstanceLease::acquire(self.config.app_path.clone())?);
        }
        if let Err(e) = self.connect().await {
            self.fault(&e);
            self.lease = None;
            return Err(e);
        }
        Ok(Session {
            controller: self,
            closed: false,
        })
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver only means nobody is listening any more.
            let _ = events.send(event);
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.state, to.clone());
        debug!(%from, %to, "Session state changed");
        self.emit(SessionEvent::StateChanged { from, to });
    }

    fn consume_attempt(&mut self, what: &str) -> Result<(), SessionError> {
        self.attempts_used += 1;
        if self.attempts_used > self.config.max_total_attempts {
            return Err(SessionError::BudgetExhausted {
                what: what.to_string(),
                attempts: self.config.max_total_attempts,
            });
        }
        Ok(())
    }

    /// Counts one launch or restart against the global budget; faults the
    /// session once the budget is spent.
    fn charge_attempt(&mut self, what: &str) -> Result<(), SessionError> {
        if let Err(e) = self.consume_attempt(what) {
            self.fault(&e);
            return Err(e);
        }
        Ok(())
    }

    fn window(&self, role: DialogRole) -> Window {
        Window::new(self.driver.clone(), self.config.dialogs.window(role))
            .set_default_timeout(self.config.window_timeout)
    }

    fn control(&self, role: ControlRole) -> &str {
        self.config.dialogs.control(role)
    }

    async fn pause(duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }

    /// Signals the client's process tree to terminate. Safe to call in any
    /// state and more than once; the next launch confirms the processes
    /// are gone.
    pub fn teardown(&mut self) {
        let reaped = reap_all(self.reaper.as_ref(), &self.config.process_patterns);
        debug!(reaped, "Teardown finished");
        self.app = None;
        if self.state != SessionState::Faulted {
            self.transition(SessionState::Closed);
        }
    }

    fn fault(&mut self, cause: &SessionError) {
        error!("Session faulted: {}", cause);
        self.transition(SessionState::Faulted);
        self.teardown();
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        let policy = self.config.launch_policy.clone();
        let attempts = policy.attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.consume_attempt("launch")?;
            reap_all(self.reaper.as_ref(), &self.config.process_patterns);
            self.transition(SessionState::Launching);
            info!("Launching client, attempt {}/{}", attempt, attempts);

            match self.relaunch().await {
                Ok(()) => {
                    self.transition(SessionState::Ready);
                    info!("Session ready");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Launch attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = e.to_string();
                    self.app = None;
                    if attempt < attempts {
                        policy.wait(attempt - 1).await;
                    }
                }
            }
        }

        Err(SessionError::Connection {
            attempts,
            message: last_error,
        })
    }

    /// Starts a fresh client once every process of the previous one is gone.
    async fn relaunch(&mut self) -> Result<(), SessionError> {
        confirm_exited(
            self.reaper.as_ref(),
            &self.config.process_patterns,
            self.config.exit_grace,
            self.config.exit_timeout,
        )
        .await?;
        self.launch_and_login().await
    }

    async fn launch_and_login(&mut self) -> Result<(), SessionError> {
        let target = self
            .config
            .launch_target()
            .ok_or_else(|| {
                SessionError::InvalidArgument("use_loader is set but no loader path".to_string())
            })?
            .to_path_buf();
        let process = self.driver.launch(&target).await?;
        debug!(pid = process.pid, target = %target.display(), "Client process started");
        Self::pause(self.config.launch_settle).await;

        let loader = self.window(DialogRole::LoaderPrompt);
        if loader.exists() {
            debug!("Dismissing loader prompt");
            loader.click(self.control(ControlRole::Confirm))?;
        }

        self.app = Some(self.driver.attach(&self.config.app_path).await?);
        self.transition(SessionState::Authenticating);
        self.login().await?;
        self.check_interactivity().await
    }

    /// Sets a login field and reads it back; a field that did not take the
    /// value is cleared and typed once more.
    fn fill_checked(
        &self,
        window: &Window,
        role: ControlRole,
        value: &str,
        what: &str,
    ) -> Result<(), SessionError> {
        let control = self.control(role);
        window.set_text(control, value)?;
        if window.text(control)? == value {
            return Ok(());
        }

        debug!("Login field {} did not take the {}, retyping", control, what);
        window.set_text(control, "")?;
        window.type_keys(Some(control), &escape_keys(value))?;
        if window.text(control)? == value {
            return Ok(());
        }
        Err(SessionError::Authentication(format!(
            "login field {control} did not accept the {what}"
        )))
    }

    #[instrument(skip(self), fields(user = %self.credentials.username))]
    async fn login(&self) -> Result<(), SessionError> {
        let login = self.window(DialogRole::Login);
        login.wait(WindowState::Ready, None).await?;

        let username = self.credentials.username.clone();
        let password = self.credentials.password.clone();
        self.fill_checked(&login, ControlRole::LoginUser, &username, "user name")?;
        self.fill_checked(&login, ControlRole::LoginPassword, &password, "password")?;
        login.click(self.control(ControlRole::Confirm))?;
        Self::pause(self.config.settle).await;

        let error_window = self.window(DialogRole::Error);
        if login.exists() && error_window.exists() {
            let message = error_window
                .text(self.control(ControlRole::ErrorText))
                .unwrap_or_default();
            error!("Login rejected: {}", message);
            error_window.close_if_open()?;
            return Err(SessionError::Authentication(message));
        }
        Ok(())
    }

    /// Rotates an expired password, then opens the probe mode and closes
    /// the window it brings up.
    async fn check_interactivity(&mut self) -> Result<(), SessionError> {
        let notice = self.window(DialogRole::PasswordExpired);
        if notice.exists() {
            self.rotate_password(&notice).await?;
        }

        let probe_mode = self.config.probe_mode.clone();
        self.choose_mode(&probe_mode).await?;
        Self::pause(self.config.settle).await;

        let reports = self.window(DialogRole::ReportSelect);
        reports
            .wait(WindowState::Exists, None)
            .await
            .map_err(|_| SessionError::DialogTimeout {
                dialog: reports.matcher().to_string(),
                timeout: self.config.window_timeout,
            })?;
        reports.close()?;
        Ok(())
    }

    async fn rotate_password(&mut self, notice: &Window) -> Result<(), SessionError> {
        self.transition(SessionState::PasswordExpired);
        warn!("Password expired for {}", self.credentials.username);
        notice.close()?;

        let rotator = CredentialRotator::new(
            self.driver.clone(),
            self.config.dialogs.clone(),
            self.config.password_policy.clone(),
            self.config.rotation_policy.clone(),
        )
        .with_window_timeout(self.config.window_timeout);

        let new_password = rotator.rotate().await?;
        self.credentials.password = new_password.clone();
        self.rotated_password = Some(new_password.clone());
        info!(
            "Password rotated for {} to {}",
            self.credentials.username,
            Redacted(&new_password)
        );

        if let Some(store) = &self.store {
            store.store_password(&self.credentials.username, &new_password)?;
        }
        self.emit(SessionEvent::PasswordRotated(new_password));
        self.transition(SessionState::Authenticating);
        Ok(())
    }

    async fn choose_mode(&self, mode: &str) -> Result<(), SessionError> {
        let window = self.window(DialogRole::ModeSelect);
        window.wait(WindowState::Exists, None).await?;
        let input = self.control(ControlRole::ModeInput);
        window.set_text(input, mode)?;
        window.set_focus()?;
        window.type_keys(Some(input), self.control(ControlRole::SubmitKeys))?;
        debug!("Mode {} requested", mode);
        Ok(())
    }

    async fn restart(&mut self) -> Result<(), SessionError> {
        self.teardown();
        if let Err(e) = self.connect().await {
            self.fault(&e);
            return Err(e);
        }
        Ok(())
    }

    fn inspector(&self) -> DialogInspector {
        DialogInspector::new(
            self.driver.clone(),
            self.config.dialogs.clone(),
            self.config.settle,
        )
    }

    /// Reads whatever message box a failed operation left behind. A box
    /// that cannot be classified faults the session and comes back as
    /// [`SessionError::UnexpectedDialog`].
    async fn inspect_leftover_dialog(&mut self, cause: &SessionError) -> Option<SessionError> {
        match self.inspector().inspect().await {
            Ok(DialogVerdict::Absent) => None,
            Ok(DialogVerdict::Dismissed(content)) => {
                warn!(
                    "Dismissed message box: {}",
                    content.content.unwrap_or_default()
                );
                None
            }
            Ok(DialogVerdict::Unclassified(content)) => {
                let title = content.title.unwrap_or_else(|| "untitled".to_string());
                let unexpected =
                    SessionError::UnexpectedDialog(format!("'{title}' left open after: {cause}"));
                self.fault(&unexpected);
                Some(unexpected)
            }
            Err(e) => {
                warn!("Could not inspect message box: {}", e);
                None
            }
        }
    }

    fn require_ready(&self) -> Result<(), SessionError> {
        match &self.state {
            SessionState::Ready | SessionState::ModeSelected(_) => Ok(()),
            other => Err(SessionError::InvalidState {
                expected: "Ready",
                actual: other.clone(),
            }),
        }
    }

    fn require_mode_selected(&self) -> Result<String, SessionError> {
        match &self.state {
            SessionState::ModeSelected(mode) => Ok(mode.clone()),
            other => Err(SessionError::InvalidState {
                expected: "ModeSelected",
                actual: other.clone(),
            }),
        }
    }

    async fn select_mode(&mut self, mode: &str) -> Result<(), SessionError> {
        self.require_ready()?;
        self.choose_mode(mode).await?;
        self.transition(SessionState::ModeSelected(mode.to_string()));
        info!("Entered mode {}", mode);
        Ok(())
    }
}

/// A logged-in client. Borrowing the controller mutably keeps it the only
/// live session of this controller.
pub struct Session<'c> {
    controller: &'c mut SessionController,
    closed: bool,
}

impl<'c> Session<'c> {
    pub fn state(&self) -> &SessionState {
        &self.controller.state
    }

    pub fn credentials(&self) -> &Credentials {
        &self.controller.credentials
    }

    pub fn password_rotated(&self) -> bool {
        self.controller.rotated_password.is_some()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.controller.config
    }

    /// Message text of a visible system message box, dismissing it.
    pub async fn dialog_text(&self) -> Result<Option<String>, SessionError> {
        self.controller.inspector().dialog_text().await
    }

    /// Selects `mode` and returns the handle for mode-scoped work.
    pub async fn enter_mode(&mut self, mode: &str) -> Result<ModeScope<'_>, SessionError> {
        self.controller.select_mode(mode).await?;
        Ok(ModeScope {
            controller: &mut *self.controller,
            mode: mode.to_string(),
        })
    }

    /// Runs `body` in `mode`. A non-fatal failure relaunches the client and
    /// reruns the body, up to `max_restarts` times; fatal errors and an
    /// exhausted restart budget fault the session. A message box left open
    /// that cannot be classified faults it before the restart.
    ///
    /// ```ignore
    /// session
    ///     .run_in_mode("SLOAN", |scope| Box::pin(async move { scope.reload().await }))
    ///     .await?;
    /// ```
    #[instrument(skip(self, body))]
    pub async fn run_in_mode<T, F>(&mut self, mode: &str, mut body: F) -> Result<T, SessionError>
    where
        F: for<'s> FnMut(&'s mut ModeScope<'_>) -> BoxFuture<'s, Result<T, SessionError>>,
    {
        let max_restarts = self.controller.config.max_restarts;
        let mut restarts = 0;

        loop {
            let outcome = match self.enter_mode(mode).await {
                Ok(mut scope) => body(&mut scope).await,
                Err(e) => Err(e),
            };
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if error.is_fatal() {
                self.controller.fault(&error);
                return Err(error);
            }
            let leftover = self.controller.inspect_leftover_dialog(&error).await;
            let error = leftover.unwrap_or(error);
            if restarts >= max_restarts {
                error!(
                    "Mode {} failed after {} restart(s): {}",
                    mode, restarts, error
                );
                self.controller.fault(&error);
                return Err(error);
            }

            restarts += 1;
            warn!(
                "Mode {} failed ({}), restarting client {}/{}",
                mode, error, restarts, max_restarts
            );
            self.controller.charge_attempt("restart")?;
            self.controller.restart().await?;
        }
    }

    /// Kills the client and logs in again.
    pub async fn reload(&mut self) -> Result<(), SessionError> {
        self.controller.charge_attempt("reload")?;
        self.controller.restart().await
    }

    /// Exports in the currently selected mode. Fails with
    /// [`SessionError::InvalidState`] unless a mode is selected.
    pub async fn export<F>(
        &mut self,
        task: &ExportTask,
        verifier: &ExportVerifier,
        trigger: F,
    ) -> Result<(), SessionError>
    where
        F: for<'t> FnOnce(&'t ModeScope<'_>) -> BoxFuture<'t, Result<(), SessionError>>,
    {
        let mode = self.controller.require_mode_selected()?;
        let mut scope = ModeScope {
            controller: &mut *self.controller,
            mode,
        };
        scope.export(task, verifier, trigger).await
    }

    pub fn close(self) -> SessionResult {
        self.close_with(None)
    }

    /// Tears the client down and reports the final state together with the
    /// error the caller's work ended with.
    pub fn close_with(mut self, error: Option<SessionError>) -> SessionResult {
        self.closed = true;
        let controller = &mut *self.controller;
        controller.teardown();
        controller.lease = None;
        info!("Session closed in state {}", controller.state);
        SessionResult {
            state: controller.state.clone(),
            rotated_password: controller.rotated_password.clone(),
            error,
        }
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        warn!("Session dropped without close, tearing down the client");
        self.controller.teardown();
        self.controller.lease = None;
    }
}

/// Mode-scoped operations. Only exists while a mode is selected.
pub struct ModeScope<'a> {
    controller: &'a mut SessionController,
    mode: String,
}

impl ModeScope<'_> {
    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn control(&self, role: ControlRole) -> &str {
        self.controller.control(role)
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        match &self.controller.state {
            SessionState::ModeSelected(mode) if *mode == self.mode => Ok(()),
            SessionState::Exporting => Ok(()),
            other => Err(SessionError::InvalidState {
                expected: "ModeSelected",
                actual: other.clone(),
            }),
        }
    }

    pub fn window(&self, role: DialogRole) -> Result<Window, SessionError> {
        self.ensure_active()?;
        Ok(self.controller.window(role))
    }

    /// Waits for `role` to reach `state`, failing with a dialog timeout.
    pub async fn wait_window(
        &self,
        role: DialogRole,
        state: WindowState,
        timeout: Option<Duration>,
    ) -> Result<Window, SessionError> {
        let window = self.window(role)?;
        window
            .wait(state, timeout)
            .await
            .map_err(|_| SessionError::DialogTimeout {
                dialog: window.matcher().to_string(),
                timeout: timeout.unwrap_or(self.controller.config.window_timeout),
            })?;
        Ok(window)
    }

    /// Clicks the unlabeled toolbar button of `host` whose status hint is the
    /// `hint` control text.
    pub async fn locate_button(
        &self,
        host: DialogRole,
        toolbar: ControlRole,
        hint: ControlRole,
    ) -> Result<Point, SessionError> {
        let window = self.window(host)?;
        let config = &self.controller.config;
        let locator = ToolbarButtonLocator::new(
            self.controller.driver.clone(),
            config.dialogs.window(DialogRole::MainFrame),
            config.dialogs.control(ControlRole::StatusStrip),
            config.scan_policy.clone(),
        )
        .with_click_margin(config.click_margin);
        locator
            .locate_in(
                &window,
                config.dialogs.control(toolbar),
                config.dialogs.control(hint),
                Axis::Horizontal,
                config.scan_step,
            )
            .await
    }

    /// Terminates spreadsheet viewers the client opened after an export.
    pub fn reap_viewers(&self) -> usize {
        reap_all(
            self.controller.reaper.as_ref(),
            &self.controller.config.viewer_patterns,
        )
    }

    pub async fn dialog_text(&self) -> Result<Option<String>, SessionError> {
        self.ensure_active()?;
        self.controller.inspector().dialog_text().await
    }

    /// Runs `trigger` to request an export and waits until `verifier` finds
    /// the artifact ready. The session is `Exporting` meanwhile and returns
    /// to the mode afterwards, whatever the outcome.
    #[instrument(skip(self, verifier, trigger), fields(mode = %self.mode, target = %task.target.display()))]
    pub async fn export<F>(
        &mut self,
        task: &ExportTask,
        verifier: &ExportVerifier,
        trigger: F,
    ) -> Result<(), SessionError>
    where
        F: for<'t> FnOnce(&'t ModeScope<'_>) -> BoxFuture<'t, Result<(), SessionError>>,
    {
        let mode = self.controller.require_mode_selected()?;
        if mode != self.mode {
            return Err(SessionError::InvalidState {
                expected: "ModeSelected",
                actual: self.controller.state.clone(),
            });
        }

        self.controller.transition(SessionState::Exporting);
        let outcome = match trigger(&*self).await {
            Ok(()) => verifier.wait_until_ready(task).await,
            Err(e) => Err(e),
        };
        self.controller
            .transition(SessionState::ModeSelected(self.mode.clone()));

        match &outcome {
            Ok(()) => info!("Export of {} finished", task.source),
            Err(e) => warn!("Export of {} failed: {}", task.source, e),
        }
        outcome
    }

    /// Relaunches the client and selects this scope's mode again.
    pub async fn reload(&mut self) -> Result<(), SessionError> {
        self.ensure_active()?;
        warn!("Reloading client in mode {}", self.mode);
        self.controller.charge_attempt("reload")?;
        self.controller.restart().await?;
        let mode = self.mode.clone();
        self.controller.select_mode(&mode).await
    }
}
