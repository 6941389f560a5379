//! Counting log events emitted while a test body runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

/// Counts events at `WARN` or `ERROR`.
#[derive(Debug, Clone, Default)]
pub struct WarningCounter {
    count: Arc<AtomicUsize>,
}

impl WarningCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Run `f` with this counter as the thread's subscriber.
    pub fn watch<R>(&self, f: impl FnOnce() -> R) -> R {
        let subscriber = Registry::default().with(self.clone());
        tracing::subscriber::with_default(subscriber, f)
    }
}

impl<S: Subscriber> Layer<S> for WarningCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        // More verbose levels compare greater.
        if *event.metadata().level() <= Level::WARN {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Run `f` and return its result with the number of warnings it logged.
pub fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let counter = WarningCounter::new();
    let result = counter.watch(f);
    (result, counter.count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_warnings_and_errors() {
        let ((), warnings) = count_warnings(|| {
            tracing::debug!("quiet");
            tracing::info!("still quiet");
            tracing::warn!("one");
            tracing::error!("two");
        });
        assert_eq!(warnings, 2);
    }

    #[test]
    fn events_outside_the_watch_are_ignored() {
        let counter = WarningCounter::new();
        tracing::warn!("before");
        let value = counter.watch(|| 7);
        tracing::warn!("after");
        assert_eq!(value, 7);
        assert_eq!(counter.count(), 0);
    }
}
