//! Session automation for a legacy desktop banking client
//!
//! The client only exposes a window-based GUI. This crate drives it through
//! an injected [`UiDriver`]: launching and logging in, rotating expired
//! passwords, reading its message boxes, finding toolbar buttons that carry
//! no identifiers, and deciding when an export written by the client is
//! complete.

pub mod config;
pub mod credentials;
pub mod dialogs;
pub mod driver;
pub mod errors;
pub mod export;
pub mod inspector;
pub mod locator;
pub mod pipeline;
pub mod process;
pub mod retry;
pub mod session;
pub mod store;
#[cfg(test)]
mod tests;

pub use config::{ConfigError, SessionConfig};
pub use credentials::{CredentialRotator, Credentials, PasswordPolicy, Redacted};
pub use dialogs::{ControlRole, DialogRole, DialogTable};
pub use driver::{
    AppHandle, Point, ProcessHandle, Rect, TitleMatch, UiDriver, Window, WindowMatcher,
    WindowState,
};
pub use errors::{DriverError, SessionError};
pub use export::{
    CommandConverter, ExportStatus, ExportTask, ExportVerifier, NotReadyReason, ReportConverter,
};
pub use inspector::{parse_transcript, DialogContent, DialogInspector, DialogVerdict};
pub use locator::{Axis, ToolbarButtonLocator};
pub use pipeline::{DateRange, ExportPlan, PipelineConfig, ReportPaths, ReportPipeline};
pub use process::{ProcessReaper, SysinfoReaper};
pub use retry::RetryPolicy;
pub use session::{ModeScope, Session, SessionController, SessionEvent, SessionResult, SessionState};
pub use store::{CredentialStore, EnvFileStore};
