use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::dialogs::{ControlRole, DialogRole, DialogTable};
use crate::driver::{UiDriver, Window, WindowState};
use crate::errors::SessionError;
use crate::retry::RetryPolicy;

const DIGITS: &[u8] = b"0123456789";
const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const PUNCTUATION: &[u8] = b"!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";
const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Login for the legacy client. `Debug` never prints the password.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &Redacted(&self.password))
            .finish()
    }
}

/// Displays a secret as a fixed mask.
pub struct Redacted<'a>(pub &'a str);

impl fmt::Display for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("<empty>")
        } else {
            f.write_str("********")
        }
    }
}

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Minimum character-class counts a generated password must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    pub length: usize,
    pub min_digits: usize,
    pub min_lower: usize,
    pub min_upper: usize,
    pub min_punct: usize,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            length: 12,
            min_digits: 1,
            min_lower: 1,
            min_upper: 1,
            min_punct: 1,
        }
    }
}

impl PasswordPolicy {
    pub fn required(&self) -> usize {
        self.min_digits + self.min_lower + self.min_upper + self.min_punct
    }

    pub fn is_satisfied_by(&self, password: &str) -> bool {
        let count = |set: &[u8]| password.bytes().filter(|b| set.contains(b)).count();
        password.chars().count() == self.length
            && count(DIGITS) >= self.min_digits
            && count(LOWERCASE) >= self.min_lower
            && count(UPPERCASE) >= self.min_upper
            && count(PUNCTUATION) >= self.min_punct
    }

    /// Draws a password from the OS random source. Class minimums are placed
    /// first and the whole sequence is shuffled afterwards, so no class sits
    /// at a predictable position.
    pub fn generate(&self) -> Result<String, SessionError> {
        if self.length < self.required() {
            return Err(SessionError::InvalidArgument(format!(
                "password length {} is shorter than the {} characters the class minimums require",
                self.length,
                self.required()
            )));
        }

        let mut rng = OsRng;
        let mut chars: Vec<u8> = Vec::with_capacity(self.length);
        for (set, count) in [
            (DIGITS, self.min_digits),
            (LOWERCASE, self.min_lower),
            (UPPERCASE, self.min_upper),
            (PUNCTUATION, self.min_punct),
            (ALPHANUMERIC, self.length - self.required()),
        ] {
            chars.extend((0..count).filter_map(|_| set.choose(&mut rng).copied()));
        }
        chars.shuffle(&mut rng);

        Ok(chars.into_iter().map(char::from).collect())
    }
}

/// Replaces an expired password through the client's change-password dialog.
pub struct CredentialRotator {
    driver: Arc<dyn UiDriver>,
    dialogs: DialogTable,
    policy: PasswordPolicy,
    submissions: RetryPolicy,
    window_timeout: Duration,
}

impl CredentialRotator {
    pub fn new(
        driver: Arc<dyn UiDriver>,
        dialogs: DialogTable,
        policy: PasswordPolicy,
        submissions: RetryPolicy,
    ) -> Self {
        Self {
            driver,
            dialogs,
            policy,
            submissions,
            window_timeout: Duration::from_secs(20),
        }
    }

    pub fn with_window_timeout(mut self, timeout: Duration) -> Self {
        self.window_timeout = timeout;
        self
    }

    pub fn generate(&self) -> Result<String, SessionError> {
        self.policy.generate()
    }

    fn window(&self, role: DialogRole) -> Window {
        Window::new(self.driver.clone(), self.dialogs.window(role))
            .set_default_timeout(self.window_timeout)
    }

    /// Generates a candidate and applies it; returns the accepted password.
    pub async fn rotate(&self) -> Result<String, SessionError> {
        let candidate = self.generate()?;
        self.apply(&candidate).await?;
        Ok(candidate)
    }

    /// Types the new password and its confirmation and submits them. The
    /// expiry notice must be gone afterwards; if it is back, the client
    /// rejected the candidate on a policy we cannot see.
    #[instrument(skip_all)]
    pub async fn apply(&self, new_password: &str) -> Result<(), SessionError> {
        let change = self.window(DialogRole::ChangePassword);
        change
            .wait(WindowState::Exists, None)
            .await
            .map_err(|_| SessionError::DialogTimeout {
                dialog: change.matcher().to_string(),
                timeout: self.window_timeout,
            })?;

        let new_field = self.dialogs.control(ControlRole::NewPassword);
        let confirm_field = self.dialogs.control(ControlRole::ConfirmPassword);
        let accept = self.dialogs.control(ControlRole::Confirm);

        let attempts = self.submissions.attempts();
        let mut submitted = false;
        for attempt in 1..=attempts {
            change.set_text(new_field, new_password)?;
            change.set_text(confirm_field, new_password)?;
            if change.is_enabled(accept)? {
                change.click(accept)?;
                submitted = true;
                break;
            }
            warn!(
                "Password change not accepted on submission {}/{}",
                attempt, attempts
            );
            if attempt < attempts {
                self.submissions.wait(attempt - 1).await;
            }
        }

        if !submitted {
            return Err(SessionError::PasswordPolicyViolation(format!(
                "change-password dialog did not accept the candidate after {attempts} submissions"
            )));
        }

        // Give the client a moment to dismiss or re-raise the notice.
        self.submissions.wait(0).await;
        if self.window(DialogRole::PasswordExpired).exists() {
            return Err(SessionError::PasswordPolicyViolation(format!(
                "expiry notice still shown after submitting a new password; the candidate \
                 probably violates the client's policy (digits >= {}, lowercase >= {}, \
                 uppercase >= {}, punctuation >= {})",
                self.policy.min_digits,
                self.policy.min_lower,
                self.policy.min_upper,
                self.policy.min_punct
            )));
        }

        info!("Password changed in the client");
        Ok(())
    }
}
