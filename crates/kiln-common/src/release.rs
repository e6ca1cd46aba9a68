//! Deferred-release stack for nested kernel resources.
//!
//! A loop device inside a mount inside an overlay: releases must run in
//! exact reverse acquisition order, on every exit path. Callers push one
//! labeled release action per acquired resource; [`ReleaseStack::release_all`]
//! pops and runs them LIFO, collecting failures instead of stopping, so a
//! cleanup failure can never hide an in-flight error or skip a later
//! release.

use std::fmt;

use crate::error::{KilnError, KilnResult};

type ReleaseFn = Box<dyn FnOnce() -> KilnResult<()>>;

struct ReleaseStep {
    what: String,
    release: ReleaseFn,
}

/// A stack of deferred release actions, run in reverse push order.
///
/// Dropping a non-empty stack performs a best-effort release, logging any
/// failures. Code that cares about cleanup failures calls
/// [`ReleaseStack::release_all`] explicitly.
#[derive(Default)]
pub struct ReleaseStack {
    steps: Vec<ReleaseStep>,
}

impl ReleaseStack {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a release action for a just-acquired resource.
    pub fn push(
        &mut self,
        what: impl Into<String>,
        release: impl FnOnce() -> KilnResult<()> + 'static,
    ) {
        self.steps.push(ReleaseStep {
            what: what.into(),
            release: Box::new(release),
        });
    }

    /// Number of resources still held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether no resources are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Release everything in reverse acquisition order.
    ///
    /// Every release is attempted even when an earlier one fails; the
    /// failures are returned in the order they occurred.
    pub fn release_all(&mut self) -> Vec<KilnError> {
        let mut failures = Vec::new();
        while let Some(step) = self.steps.pop() {
            tracing::debug!(what = %step.what, "releasing");
            if let Err(err) = (step.release)() {
                tracing::error!(what = %step.what, error = %err, "release failed");
                failures.push(err);
            }
        }
        failures
    }
}

impl fmt::Debug for ReleaseStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|step| &step.what))
            .finish()
    }
}

impl Drop for ReleaseStack {
    fn drop(&mut self) {
        if !self.steps.is_empty() {
            tracing::warn!(held = self.steps.len(), "releasing resources on drop");
            let _ = self.release_all();
        }
    }
}
