//! Progress notifications for long-running construction steps.

use std::fmt;

use crate::util::usize_to_f64;

/// A single progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Component that emitted the event.
    pub source: &'static str,
    /// Work completed so far.
    pub value: usize,
    /// Total work expected.
    pub max: usize,
    /// Optional human-readable note.
    pub message: Option<String>,
}

impl ProgressEvent {
    /// Creates an event without a message.
    #[must_use]
    pub fn new(source: &'static str, value: usize, max: usize) -> Self {
        Self {
            source,
            value,
            max,
            message: None,
        }
    }

    /// Attaches a message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Completed fraction in `[0, 1]`.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.max == 0 {
            1.0
        } else {
            (usize_to_f64(self.value) / usize_to_f64(self.max)).min(1.0)
        }
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CurveEvent {}/{}: {}", self.value, self.max, self.source)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Receiver of progress events.
///
/// Events are delivered synchronously on the emitting thread; forwarding
/// them elsewhere is up to the observer.
pub trait ProgressObserver: Send {
    /// Called once per event.
    fn on_progress(&mut self, event: &ProgressEvent);
}

impl<F> ProgressObserver for F
where
    F: FnMut(&ProgressEvent) + Send,
{
    fn on_progress(&mut self, event: &ProgressEvent) {
        self(event);
    }
}

/// Ordered list of registered observers.
#[derive(Default)]
pub struct ObserverList {
    observers: Vec<Box<dyn ProgressObserver>>,
}

impl ObserverList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer; events reach observers in registration order.
    pub fn register(&mut self, observer: Box<dyn ProgressObserver>) {
        self.observers.push(observer);
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Delivers an event to every observer.
    pub fn emit(&mut self, event: &ProgressEvent) {
        for observer in &mut self.observers {
            observer.on_progress(event);
        }
    }
}

impl fmt::Debug for ObserverList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObserverList")
            .field("observers", &self.observers.len())
            .finish()
    }
}
