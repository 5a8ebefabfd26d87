use std::io;

use crate::log::dev_warn;

use super::{set::SignalAction, signal_name, SignalNumber};

/// An installed signal action.
///
/// Dropping it puts back whatever action the signal had before [`SignalHandler::register`].
pub(crate) struct SignalHandler {
    signal: SignalNumber,
    original_action: SignalAction,
}

impl SignalHandler {
    /// Install `behavior` as the action for `signal`.
    pub(crate) fn register(
        signal: SignalNumber,
        behavior: SignalHandlerBehavior,
    ) -> io::Result<Self> {
        let original_action = SignalAction::new(behavior)?.register(signal)?;

        Ok(Self {
            signal,
            original_action,
        })
    }

    /// Keep the installed action for the rest of the process lifetime.
    pub(crate) fn forget(self) {
        std::mem::forget(self)
    }
}

impl Drop for SignalHandler {
    #[track_caller]
    fn drop(&mut self) {
        let signal = self.signal;
        if let Err(err) = self.original_action.register(signal) {
            dev_warn!(
                "cannot restore original action for {}: {err}",
                signal_name(signal),
            )
        }
    }
}

/// The possible behaviors for a [`SignalHandler`].
pub(crate) enum SignalHandlerBehavior {
    /// Execute the default action for the signal.
    Default,
    /// Ignore the arrival of the signal.
    Ignore,
    /// Reap terminated children and report them through the live [`super::ExitRecordPipe`].
    ReapChildren,
}
