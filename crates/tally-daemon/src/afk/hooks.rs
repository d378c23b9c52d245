use std::time::Duration;

use thiserror::Error;

use super::Detector;

#[derive(Debug, Error)]
#[error("afk hook {hook}: {reason}")]
pub struct HookError {
    pub hook: &'static str,
    pub reason: String,
}

impl HookError {
    pub fn new(hook: &'static str, reason: impl Into<String>) -> Self {
        Self {
            hook,
            reason: reason.into(),
        }
    }
}

/// Knows how to attach one source of user activity to a [`Detector`].
pub trait HookRegisterer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Attach the hook.
    ///
    /// `Ok(None)` means the source is not available here, for example a
    /// display server that is not running. The hook may keep a clone of the
    /// detector and call [`Detector::mark_as_afk`] or
    /// [`Detector::mark_as_no_longer_afk`] on its own.
    fn register(&self, detector: &Detector) -> Result<Option<Box<dyn AfkHook>>, HookError>;
}

/// An attached source of user activity.
pub trait AfkHook: Send {
    fn name(&self) -> &'static str;

    /// How long the user has been idle, if this hook can tell.
    fn tick(&mut self) -> Result<Option<Duration>, HookError>;

    fn unregister(&mut self) -> Result<(), HookError>;
}

/// Hooks compiled into this build.
///
/// There are none yet, so unless hooks are passed in explicitly the detector
/// never reports the user as away.
pub fn platform_hooks() -> Vec<Box<dyn HookRegisterer>> {
    Vec::new()
}
