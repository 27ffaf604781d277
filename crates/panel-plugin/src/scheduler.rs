//! Scheduled job dispatch.
//!
//! The panel owns the clock: it evaluates each advertised cron expression
//! and sends a trigger naming the job id when one is due. The plugin runs
//! the first handler registered under that id and always acknowledges,
//! even when no handler matches.

use std::sync::Arc;

use tracing::debug;

use crate::envelope::ScheduleCall;
use crate::registry::HandlerRegistry;

/// Callback invoked when a job fires.
pub type ScheduleHandler = Arc<dyn Fn() + Send + Sync>;

/// A job registration: id, cron expression and handler.
#[derive(Clone)]
pub struct ScheduleConfig {
    pub id: String,
    pub cron: String,
    pub handler: ScheduleHandler,
}

impl std::fmt::Debug for ScheduleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduleConfig").field("id", &self.id).field("cron", &self.cron).finish_non_exhaustive()
    }
}

/// Run the job named by `call`. Returns whether a handler ran.
pub(crate) fn dispatch(registry: &HandlerRegistry, call: &ScheduleCall) -> bool {
    match registry.schedule_handler(&call.schedule_id) {
        Some(handler) => {
            handler();
            true
        }
        None => {
            debug!(schedule = %call.schedule_id, "no schedule handler registered, acknowledging");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::registry::Plugin;

    fn trigger(id: &str) -> ScheduleCall {
        ScheduleCall {
            schedule_id: id.to_string(),
        }
    }

    #[test]
    fn matching_job_runs_exactly_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let registry = Plugin::new("test", "0.1.0")
            .schedule("cleanup", "*/5 * * * *", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .into_registry();

        assert!(dispatch(&registry, &trigger("cleanup")));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unknown_job_is_a_noop() {
        let registry = Plugin::new("test", "0.1.0").into_registry();
        assert!(!dispatch(&registry, &trigger("nope")));
    }

    #[test]
    fn same_id_with_two_crons_runs_first_only() {
        let hits = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&hits);
        let second = Arc::clone(&hits);
        let registry = Plugin::new("test", "0.1.0")
            .schedule("report", "0 * * * *", move || {
                first.fetch_add(1, Ordering::SeqCst);
            })
            .schedule("report", "30 * * * *", move || {
                second.fetch_add(100, Ordering::SeqCst);
            })
            .into_registry();

        dispatch(&registry, &trigger("report"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.info().schedules.len(), 2);
    }
}
