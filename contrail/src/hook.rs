//! The profile-hook dispatcher.
//!
//! The host runtime fires a synchronous hook on every function entry, exit
//! and exception. The dispatcher sits between that hook and the [`Tracer`]:
//! it applies the per-function ignore flags, keeps the raw call depth so
//! that returns below the tracing start point are dropped, short-circuits
//! the designated logger function into LOG records, and detaches itself when
//! it finds it has been carried across a `fork` into a child process.

use thiserror::Error;

use crate::{
    host::{CodeRef, FlagsProvider, HostValue, NativeRef, ObjectId, TraceFlags},
    tracer::{self, Tracer},
};

/// The error type for [`HookDispatcher`].
#[derive(Error, Debug)]
pub enum Error {
    /// `start` was called on a dispatcher that has already run once.
    #[error("tracer object already exhausted")]
    Exhausted,
    #[error(transparent)]
    Trace(#[from] tracer::Error),
}

/// What the host binding should do with its installed hook after an event.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Control {
    /// Keep the hook installed.
    Continue,
    /// Uninstall the hook: the dispatcher has detached (post-fork child).
    Detach,
}

/// One host profile-hook event.
///
/// Every borrowed reference is valid only for the duration of the dispatch
/// call.
pub enum HookEvent<'a> {
    /// A pure function was entered. `slots` are the frame's leading local
    /// variable slots, one per declared argument.
    Call { code: CodeRef<'a>, slots: &'a [&'a dyn HostValue] },
    /// A pure function returned normally.
    Return { code: CodeRef<'a>, value: &'a dyn HostValue },
    /// An exception is unwinding out of a pure function.
    Unwind { code: CodeRef<'a>, exception: Option<&'a dyn HostValue> },
    /// A native function is about to be invoked.
    NativeCall { func: NativeRef<'a> },
    /// A native function returned normally.
    NativeReturn { func: NativeRef<'a> },
    /// A native function raised.
    NativeUnwind { func: NativeRef<'a>, exception: Option<&'a dyn HostValue> },
}

/// Maps host profile-hook events onto trace records.
///
/// The lifecycle is NEW → STARTED → STOPPED: [`start`](Self::start) may be
/// called at most once, [`stop`](Self::stop) is idempotent and flushes the
/// underlying tracer. One dispatcher belongs to one execution context; a
/// host with several threads installs one per thread.
pub struct HookDispatcher<F> {
    tracer: Tracer,
    flags: F,
    logger_code: Option<ObjectId>,
    pid: libc::pid_t,
    call_depth: u32,
    ignore_depth: u32,
    active: bool,
    used: bool,
}

impl<F> HookDispatcher<F>
where
    F: FlagsProvider,
{
    /// Constructs a dispatcher over `tracer`.
    ///
    /// `logger_code` is the identity of the designated logger function's
    /// code object; calls to it become LOG records instead of CALL records.
    pub fn new(tracer: Tracer, flags: F, logger_code: Option<ObjectId>) -> Self {
        Self {
            tracer,
            flags,
            logger_code,
            pid: unsafe { libc::getpid() },
            call_depth: 0,
            ignore_depth: 0,
            active: false,
            used: false,
        }
    }

    /// Starts dispatching. Can be called only once per dispatcher.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.used {
            return Err(Error::Exhausted);
        }
        self.used = true;
        self.active = true;
        Ok(())
    }

    /// Stops dispatching and flushes the tracer. Idempotent.
    pub fn stop(&mut self) -> Result<(), Error> {
        self.active = false;
        self.tracer.close()?;
        Ok(())
    }

    /// Whether the dispatcher is currently recording.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Dispatches one hook event.
    ///
    /// A failed record aborts that record only; the dispatcher stays usable
    /// for subsequent events.
    pub fn dispatch(&mut self, event: HookEvent<'_>) -> Result<Control, Error> {
        if !self.active {
            return Ok(Control::Continue);
        }
        if unsafe { libc::getpid() } != self.pid {
            // We have been forked into a child; detach so as not to corrupt
            // the parent's files. Host threads do not inherit the hook, so
            // the process id is the right thing to compare.
            self.active = false;
            return Ok(Control::Detach);
        }

        match event {
            HookEvent::Call { code, slots } => {
                self.call_depth += 1;
                let flags = self.flags.code_flags(&code);
                if self.call_ignored(flags) {
                    return Ok(Control::Continue);
                }
                if self.logger_code == Some(code.identity) {
                    // Not a normal trace call - it's the logger function.
                    // Its signature is (fmtstr, *args), so the first two
                    // slots exist.
                    if let (Some(fmt), Some(args)) = (slots.first(), slots.get(1)) {
                        self.tracer.record_log(*fmt, *args)?;
                        return Ok(Control::Continue);
                    }
                }
                let argc = (code.arg_count as usize).min(slots.len());
                self.tracer.record_call(&code, &slots[..argc])?;
            }

            HookEvent::Return { code, value } => {
                if !self.leave() {
                    return Ok(Control::Continue);
                }
                let flags = self.flags.code_flags(&code);
                if self.return_ignored(flags) {
                    return Ok(Control::Continue);
                }
                if self.logger_code == Some(code.identity) {
                    // The return of the logger shortcut, skip it.
                    return Ok(Control::Continue);
                }
                self.tracer.record_return(&code, value)?;
            }

            HookEvent::Unwind { code, exception } => {
                if !self.leave() {
                    return Ok(Control::Continue);
                }
                let flags = self.flags.code_flags(&code);
                if self.return_ignored(flags) {
                    return Ok(Control::Continue);
                }
                self.tracer.record_raise(&code, exception)?;
            }

            HookEvent::NativeCall { func } => {
                self.call_depth += 1;
                let flags = self.flags.native_flags(&func);
                if self.call_ignored(flags) {
                    return Ok(Control::Continue);
                }
                self.tracer.record_native_call(&func)?;
            }

            HookEvent::NativeReturn { func } => {
                if !self.leave() {
                    return Ok(Control::Continue);
                }
                let flags = self.flags.native_flags(&func);
                if self.return_ignored(flags) {
                    return Ok(Control::Continue);
                }
                self.tracer.record_native_return(&func)?;
            }

            HookEvent::NativeUnwind { func, exception } => {
                if !self.leave() {
                    return Ok(Control::Continue);
                }
                let flags = self.flags.native_flags(&func);
                if self.return_ignored(flags) {
                    return Ok(Control::Continue);
                }
                self.tracer.record_native_raise(&func, exception)?;
            }
        }

        Ok(Control::Continue)
    }

    /// Counts a return-class event against the raw call depth. Returns
    /// `false` for a shallow return, one below the point where tracing
    /// started.
    #[inline]
    fn leave(&mut self) -> bool {
        if self.call_depth > 0 {
            self.call_depth -= 1;
            true
        } else {
            false
        }
    }

    /// The call-side ignore state machine.
    fn call_ignored(&mut self, flags: TraceFlags) -> bool {
        if self.ignore_depth > 0 {
            // Already under an ignored-children frame.
            self.ignore_depth += 1;
            return true;
        }
        if flags.contains(TraceFlags::IGNORED_CHILDREN) {
            // This function's descendants will be ignored.
            self.ignore_depth = 1;
        }
        if flags.contains(TraceFlags::IGNORED_SINGLE) {
            // This function itself is ignored.
            return true;
        }
        false
    }

    /// The return-side ignore state machine.
    fn return_ignored(&mut self, flags: TraceFlags) -> bool {
        if self.ignore_depth > 0 {
            // The return of a frame under an ignored-children frame.
            self.ignore_depth -= 1;
            return true;
        }
        if flags.contains(TraceFlags::IGNORED_SINGLE) {
            return true;
        }
        false
    }
}
