use super::AgentLoop;
use crate::resolver::AppResolver;
use pocketpilot_core::action::{Action, Direction};
use pocketpilot_core::record::{DispatchMethod, DispatchOutcome};
use pocketpilot_device::DeviceBackend;
use pocketpilot_llm::client::ModelBackend;
use std::time::Duration;
use tracing::{debug, info};

/// Longest `wait` the loop will actually sleep.
const MAX_WAIT_MS: u64 = 10_000;

/// Default duration for directional swipes.
const DIRECTIONAL_SWIPE_MS: u64 = 300;

impl<M: ModelBackend, B: DeviceBackend, R: AppResolver> AgentLoop<M, B, R> {
    /// Dispatch a normal action to the device. Returns the outcome plus
    /// whether any coordinate had to be clamped to the screen.
    ///
    /// `Finish`, `CallUser`, and `ParseError` never reach this point; the
    /// loop consumes them before dispatch.
    pub(crate) async fn dispatch_action(
        &self,
        action: &Action,
        screen: (u32, u32),
    ) -> (DispatchOutcome, bool) {
        let (width, height) = screen;
        debug!(action = %action.summary(), "Dispatching action");

        match action {
            Action::Tap { x, y } => {
                let ((x, y), clamped) = clamp_point(*x, *y, width, height);
                (self.device.tap(x, y).await, clamped)
            }

            Action::TapElement { index } => (self.device.tap_element(*index).await, false),

            Action::LongPress { x, y, duration_ms } => {
                let ((x, y), clamped) = clamp_point(*x, *y, width, height);
                (self.device.long_press(x, y, *duration_ms).await, clamped)
            }

            Action::Swipe {
                start,
                end,
                duration_ms,
            } => {
                let ((x1, y1), c1) = clamp_point(start.0, start.1, width, height);
                let ((x2, y2), c2) = clamp_point(end.0, end.1, width, height);
                (
                    self.device.swipe(x1, y1, x2, y2, *duration_ms).await,
                    c1 || c2,
                )
            }

            Action::SwipeDirection {
                direction,
                magnitude,
            } => {
                let (start, end) = directional_swipe(*direction, *magnitude, width, height);
                (
                    self.device
                        .swipe(start.0, start.1, end.0, end.1, DIRECTIONAL_SWIPE_MS)
                        .await,
                    false,
                )
            }

            Action::Type { text, clear_first } => {
                (self.device.input_text(text, *clear_first).await, false)
            }

            Action::Back => (self.device.back().await, false),

            Action::Home => (self.device.home().await, false),

            Action::OpenApp { name } => {
                // A dotted name already is a package id; anything else goes
                // through the name→package collaborator.
                let package = if name.contains('.') {
                    Some(name.clone())
                } else {
                    self.resolver.resolve(name)
                };
                match package {
                    Some(package) => {
                        info!(app = %name, package = %package, "Opening app");
                        (self.device.open_app(&package).await, false)
                    }
                    None => (
                        DispatchOutcome::failed(
                            DispatchMethod::System,
                            format!("no package known for app \"{}\"", name),
                        ),
                        false,
                    ),
                }
            }

            Action::OpenDeepLink { uri } => (self.device.open_deep_link(uri).await, false),

            Action::Wait { duration_ms } => {
                let wait = Duration::from_millis((*duration_ms).min(MAX_WAIT_MS));
                tokio::select! {
                    _ = self.cancel.cancelled() => (
                        DispatchOutcome::failed(DispatchMethod::System, "wait interrupted"),
                        false,
                    ),
                    _ = tokio::time::sleep(wait) => {
                        (DispatchOutcome::ok(DispatchMethod::System), false)
                    }
                }
            }

            Action::Finish { .. } | Action::CallUser { .. } | Action::ParseError { .. } => {
                unreachable!("terminal actions are consumed by the loop before dispatch")
            }
        }
    }
}

/// Clamp a point into the screen. The valid range is `0..width` x
/// `0..height` exclusive; a point exactly on the last pixel is untouched.
fn clamp_point(x: i32, y: i32, width: u32, height: u32) -> ((i32, i32), bool) {
    let max_x = (width as i32 - 1).max(0);
    let max_y = (height as i32 - 1).max(0);
    let cx = x.clamp(0, max_x);
    let cy = y.clamp(0, max_y);
    ((cx, cy), cx != x || cy != y)
}

/// Turn a directional swipe into a centered start/end gesture, kept inside
/// the screen.
fn directional_swipe(
    direction: Direction,
    magnitude: u32,
    width: u32,
    height: u32,
) -> ((i32, i32), (i32, i32)) {
    let cx = width as i32 / 2;
    let cy = height as i32 / 2;
    let m = magnitude as i32;
    let (dx, dy) = match direction {
        Direction::Up => (0, -m),
        Direction::Down => (0, m),
        Direction::Left => (-m, 0),
        Direction::Right => (m, 0),
    };
    let (end, _) = clamp_point(cx + dx, cy + dy, width, height);
    ((cx, cy), end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_inside_is_untouched() {
        assert_eq!(clamp_point(100, 200, 1080, 1920), ((100, 200), false));
    }

    #[test]
    fn point_on_edge_is_not_clamped() {
        assert_eq!(clamp_point(1079, 1919, 1080, 1920), ((1079, 1919), false));
        assert_eq!(clamp_point(0, 0, 1080, 1920), ((0, 0), false));
    }

    #[test]
    fn point_one_past_edge_is_clamped_and_flagged() {
        assert_eq!(clamp_point(1080, 100, 1080, 1920), ((1079, 100), true));
        assert_eq!(clamp_point(100, 1920, 1080, 1920), ((100, 1919), true));
    }

    #[test]
    fn negative_point_is_clamped_to_origin() {
        assert_eq!(clamp_point(-5, -1, 1080, 1920), ((0, 0), true));
    }

    #[test]
    fn directional_swipe_stays_on_screen() {
        let ((x1, y1), (x2, y2)) = directional_swipe(Direction::Up, 5000, 1080, 1920);
        assert_eq!((x1, y1), (540, 960));
        assert_eq!((x2, y2), (540, 0));

        let (_, (x2, y2)) = directional_swipe(Direction::Right, 200, 1080, 1920);
        assert_eq!((x2, y2), (740, 960));
    }
}
