//! Panic capture for job bodies and completion callbacks.

use alloc::string::String;
use core::any::Any;
use core::panic::AssertUnwindSafe;
use std::eprintln;
use std::panic::catch_unwind;
use std::process::abort;
use std::thread::Result;

/// Executes `f` and captures any panic, translating that panic into an `Err`
/// result. Job bodies run through this so that a panicking job is recorded as
/// such instead of tearing down the worker thread.
#[inline(always)]
pub fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

/// Extracts the message from a panic payload, if it carries one.
pub fn payload_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Aborts the program when dropped.
///
/// Held across graph propagation: a panic there would leave dependents that
/// can never be released.
pub struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        eprintln!("gantry: detected unexpected panic; aborting");
        abort();
    }
}
