//! `event=<name> component=<part> key=value` lines for scheduler milestones.
//!
//! Routine diagnostics go through `tracing`. These events are the ones
//! operators grep for, so they keep a flat, stable layout under one target.

use std::fmt;

pub(crate) const LOG_TARGET: &str = "costore";

/// Part of the scheduler an event comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Component {
    /// Round loop, merged version and gc.
    TabletScheduler,
    /// Medium and major proposals and their dags.
    Medium,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Component::TabletScheduler => "tablet_scheduler",
            Component::Medium => "medium",
        })
    }
}

macro_rules! costore_log {
    ($level:expr, $component:expr, $event:literal, $fmt:literal $(, $args:expr)* $(,)?) => {{
        if log::log_enabled!(target: crate::logging::LOG_TARGET, $level) {
            log::log!(
                target: crate::logging::LOG_TARGET,
                $level,
                "event={} component={} {}",
                $event,
                $component,
                format_args!($fmt $(, $args)*)
            );
        }
    }};
}

pub(crate) use costore_log;
