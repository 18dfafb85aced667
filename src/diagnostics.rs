//! Per-context error record for hosts that want a "last error" view or an error callback.
//!
//! Nothing in the library consults this; every operation reports through its `Result`.

use core::fmt::Debug;

use log::debug;

use crate::error::{Error, ErrorKind, Result};

type Observer = Box<dyn FnMut(ErrorKind, &str) + Send>;

#[derive(Default)]
pub struct Diagnostics {
    last: Option<(ErrorKind, String)>,
    observer: Option<Observer>,
}

impl Debug for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnostics")
            .field("last", &self.last)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// `observer` is called synchronously for every recorded error.
    pub fn with_observer(observer: impl FnMut(ErrorKind, &str) + Send + 'static) -> Self {
        Self {
            last: None,
            observer: Some(Box::new(observer)),
        }
    }

    pub fn set_observer(&mut self, observer: impl FnMut(ErrorKind, &str) + Send + 'static) {
        self.observer = Some(Box::new(observer));
    }

    pub fn record(&mut self, error: &Error) {
        let message = error.to_string();
        debug!("recorded {:?} error: {message}", error.kind());

        if let Some(observer) = self.observer.as_mut() {
            observer(error.kind(), &message);
        }
        self.last = Some((error.kind(), message));
    }

    /// Kind and message of the most recently recorded error
    pub fn last_error(&self) -> Option<(ErrorKind, &str)> {
        self.last
            .as_ref()
            .map(|(kind, message)| (*kind, message.as_str()))
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

pub trait ResultExt<T> {
    /// Records the error, if any, and hands the result back unchanged.
    fn report(self, diagnostics: &mut Diagnostics) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn report(self, diagnostics: &mut Diagnostics) -> Result<T> {
        self.inspect_err(|e| diagnostics.record(e))
    }
}
