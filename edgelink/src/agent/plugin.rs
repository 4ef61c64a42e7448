//! Plug-in seam of the agent scheduler.
//!
//! Plug-ins observe the operations the scheduler performs. Each operation is
//! announced three times, once per [`Step`], in registration order. A failing
//! plug-in is logged and never stops the operation itself.

use std::time::Duration;

use crate::actions::ActionRequest;
use crate::status::Result;
use crate::value::TypedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Before,
    During,
    After,
}

/// Operation the scheduler is about to perform, with its payload.
#[derive(Debug)]
pub enum Operation<'a> {
    /// One pass of the main loop.
    Iteration,
    ClientConnect,
    ClientDisconnect,
    TelemetryPublish {
        key: &'a str,
        value: &'a TypedValue,
    },
    ActionComplete {
        request: &'a ActionRequest,
    },
}

pub trait Plugin: Send {
    fn name(&self) -> &str;

    /// Called for every operation and step. `deadline` bounds how long the
    /// plug-in may spend before the scheduler moves on.
    fn execute(&mut self, op: &Operation<'_>, step: Step, deadline: Duration) -> Result<()>;
}
