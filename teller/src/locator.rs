//! Pointer-scan locator for toolbar buttons without identifiers.
//!
//! The client's toolbars expose no per-button accessibility data. The only
//! signal is the status strip of the main frame, which echoes the hint of
//! whatever control sits under the pointer. The locator sweeps the pointer
//! across the toolbar and stops where the echo matches the wanted label.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::driver::{Point, Rect, UiDriver, Window, WindowMatcher};
use crate::errors::SessionError;
use crate::retry::RetryPolicy;

pub const DEFAULT_STEP: i32 = 5;
pub const DEFAULT_CLICK_MARGIN: i32 = 3;

/// Direction of the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    #[default]
    Horizontal,
    Vertical,
}

/// Scan progress for one `locate` call.
#[derive(Debug)]
struct ButtonScanState {
    bounds: Rect,
    axis: Axis,
    step: i32,
    cursor: Point,
    hint: String,
    error_cycles: u32,
}

impl ButtonScanState {
    fn new(bounds: Rect, axis: Axis, step: i32) -> Self {
        let mut state = Self {
            bounds,
            axis,
            step,
            cursor: Point::default(),
            hint: String::new(),
            error_cycles: 0,
        };
        state.rewind();
        state
    }

    /// Back to the near edge; the cross-axis coordinate stays on the
    /// toolbar's centre line.
    fn rewind(&mut self) {
        let mid = self.bounds.mid_point();
        self.cursor = match self.axis {
            Axis::Horizontal => Point::new(self.bounds.left, mid.y),
            Axis::Vertical => Point::new(mid.x, self.bounds.top),
        };
    }

    fn advance(&mut self) {
        match self.axis {
            Axis::Horizontal => self.cursor.x += self.step,
            Axis::Vertical => self.cursor.y += self.step,
        }
    }

    fn past_far_edge(&self) -> bool {
        match self.axis {
            Axis::Horizontal => self.cursor.x > self.bounds.right,
            Axis::Vertical => self.cursor.y > self.bounds.bottom,
        }
    }

    /// The first matching position is the button's leading boundary, where
    /// hit-testing is unreliable; move inward, staying on the toolbar.
    fn click_point(&self, margin: i32) -> Point {
        let mut point = self.cursor;
        match self.axis {
            Axis::Horizontal => point.x = (point.x + margin).min(self.bounds.right),
            Axis::Vertical => point.y = (point.y + margin).min(self.bounds.bottom),
        }
        point
    }
}

pub struct ToolbarButtonLocator {
    driver: Arc<dyn UiDriver>,
    status_window: WindowMatcher,
    status_control: String,
    scans: RetryPolicy,
    click_margin: i32,
}

impl ToolbarButtonLocator {
    /// `scans` bounds the number of full sweeps and the pause between them.
    pub fn new(
        driver: Arc<dyn UiDriver>,
        status_window: WindowMatcher,
        status_control: impl Into<String>,
        scans: RetryPolicy,
    ) -> Self {
        Self {
            driver,
            status_window,
            status_control: status_control.into(),
            scans,
            click_margin: DEFAULT_CLICK_MARGIN,
        }
    }

    pub fn with_click_margin(mut self, margin: i32) -> Self {
        self.click_margin = margin.max(0);
        self
    }

    /// Sweeps `toolbar` along `axis` in `step`-pixel increments until the
    /// status strip reads `target`, then clicks just inside the matched
    /// button and returns the click point.
    #[instrument(skip(self))]
    pub async fn locate(
        &self,
        toolbar: Rect,
        target: &str,
        axis: Axis,
        step: i32,
    ) -> Result<Point, SessionError> {
        if step <= 0 {
            return Err(SessionError::InvalidArgument(format!(
                "scan step must be positive, got {step}"
            )));
        }

        let status = Window::new(self.driver.clone(), self.status_window.clone());
        let max_scans = self.scans.attempts();
        let mut scan = ButtonScanState::new(toolbar, axis, step);

        loop {
            if scan.past_far_edge() {
                scan.error_cycles += 1;
                warn!(
                    "Scan {}/{} reached the far edge without '{}' (last hint '{}')",
                    scan.error_cycles, max_scans, target, scan.hint
                );
                if scan.error_cycles >= max_scans {
                    return Err(SessionError::ButtonLocate {
                        label: target.to_string(),
                        scans: scan.error_cycles,
                    });
                }
                // The strip can lag behind the pointer; let the UI settle.
                self.scans.wait(scan.error_cycles - 1).await;
                scan.rewind();
                continue;
            }

            self.driver.move_pointer(scan.cursor)?;
            scan.hint = status
                .status_text(&self.status_control)?
                .trim()
                .to_string();
            if scan.hint == target {
                break;
            }
            scan.advance();
        }

        let point = scan.click_point(self.click_margin);
        debug!(matched = ?scan.cursor, ?point, "Status strip matched '{}'", target);
        self.driver.click_at(point)?;
        info!("Clicked toolbar button '{}' at ({}, {})", target, point.x, point.y);
        Ok(point)
    }

    /// Focuses `window`, reads the bounds of its `toolbar_control` and
    /// locates `target` on it.
    pub async fn locate_in(
        &self,
        window: &Window,
        toolbar_control: &str,
        target: &str,
        axis: Axis,
        step: i32,
    ) -> Result<Point, SessionError> {
        window.set_focus()?;
        let toolbar = window.rectangle(toolbar_control)?;
        self.locate(toolbar, target, axis, step).await
    }
}
