use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::dialogs::{DialogRole, DialogTable};
use crate::driver::{UiDriver, Window};
use crate::errors::SessionError;

const TITLE_HEADER: &str = "[Window Title]";
const CONTENT_HEADER: &str = "[Content]";

/// Structured form of a modal's clipboard transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DialogContent {
    pub title: Option<String>,
    pub content: Option<String>,
    pub buttons: Vec<String>,
}

#[derive(Clone, Copy)]
enum Section {
    Title,
    Content,
}

/// Parses a transcript of the form
///
/// ```text
/// [Window Title]
/// Hello
/// [Content]
/// Body text
/// [OK] [Cancel]
/// ```
///
/// A section header arms exactly the next plain line. Any other bracketed
/// line is a button label. Plain lines with no armed section are dropped.
pub fn parse_transcript(transcript: &str) -> DialogContent {
    let mut dialog = DialogContent::default();
    let mut armed: Option<Section> = None;

    for line in transcript.lines().filter(|line| !line.is_empty()) {
        if line.starts_with(TITLE_HEADER) {
            armed = Some(Section::Title);
        } else if line.starts_with(CONTENT_HEADER) {
            armed = Some(Section::Content);
        } else if line.starts_with('[') {
            dialog
                .buttons
                .push(line.trim_matches(&['[', ']'][..]).to_string());
        } else if let Some(section) = armed.take() {
            match section {
                Section::Title => dialog.title = Some(line.to_string()),
                Section::Content => dialog.content = Some(line.to_string()),
            }
        }
    }

    dialog
}

/// Verdict on a modal found while the controller expected something else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogVerdict {
    /// No message box was showing
    Absent,
    /// An informational message; it has been dismissed
    Dismissed(DialogContent),
    /// A message box without readable content; still open
    Unclassified(DialogContent),
}

/// Captures and classifies the client's message boxes.
pub struct DialogInspector {
    driver: Arc<dyn UiDriver>,
    dialogs: DialogTable,
    settle: Duration,
}

impl DialogInspector {
    pub fn new(driver: Arc<dyn UiDriver>, dialogs: DialogTable, settle: Duration) -> Self {
        Self {
            driver,
            dialogs,
            settle,
        }
    }

    /// Copies the message box transcript, closing the box when it carried
    /// content.
    pub async fn inspect(&self) -> Result<DialogVerdict, SessionError> {
        let message = Window::new(
            self.driver.clone(),
            self.dialogs.window(DialogRole::SystemMessage),
        );
        if !message.exists() {
            return Ok(DialogVerdict::Absent);
        }

        message.set_focus()?;
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        let transcript = message.capture_clipboard_dump()?;
        let content = parse_transcript(&transcript);
        debug!(?content, "Captured message box");

        if content.content.is_some() {
            message.close()?;
            return Ok(DialogVerdict::Dismissed(content));
        }
        warn!(?content, "Message box has no readable content");
        Ok(DialogVerdict::Unclassified(content))
    }

    /// Message text of the visible message box, dismissing it. `None` when
    /// no box is open or it had no content.
    pub async fn dialog_text(&self) -> Result<Option<String>, SessionError> {
        Ok(match self.inspect().await? {
            DialogVerdict::Dismissed(content) => content.content,
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_transcript() {
        let dialog = parse_transcript("[Window Title]\nHello\n[Content]\nBody text\n[OK]\n[Cancel]");
        assert_eq!(
            dialog,
            DialogContent {
                title: Some("Hello".to_string()),
                content: Some("Body text".to_string()),
                buttons: vec!["OK".to_string(), "Cancel".to_string()],
            }
        );
    }

    #[test]
    fn missing_content_section_stays_absent() {
        let dialog = parse_transcript("[Window Title]\nColvir Banking System\n[OK]");
        assert_eq!(dialog.title.as_deref(), Some("Colvir Banking System"));
        assert_eq!(dialog.content, None);
        assert_eq!(dialog.buttons, vec!["OK"]);
    }

    #[test]
    fn header_arms_only_one_line() {
        let dialog = parse_transcript("[Content]\nfirst\nsecond\n[Yes]");
        assert_eq!(dialog.content.as_deref(), Some("first"));
        assert_eq!(dialog.buttons, vec!["Yes"]);
    }

    #[test]
    fn unarmed_lines_are_dropped_and_crlf_handled() {
        let dialog = parse_transcript("stray\r\n\r\n[Window Title]\r\nTitle\r\n[Retry]\r\n");
        assert_eq!(dialog.title.as_deref(), Some("Title"));
        assert_eq!(dialog.content, None);
        assert_eq!(dialog.buttons, vec!["Retry"]);
    }

    #[test]
    fn empty_transcript_yields_empty_content() {
        assert_eq!(parse_transcript(""), DialogContent::default());
    }
}
