//! Application-level orchestration utilities.
//!
//! This module owns the run lifecycle (selection, start, monitoring, cancel) and
//! post-run processing such as exports and the report download. CLI layers call
//! into this module to keep responsibilities separated.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, Selection, UiCommand};
pub(crate) use post_process::{process_run_completion, PostRunTargets};
