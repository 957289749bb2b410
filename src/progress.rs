use audioshelf::storage::models::Operation;
use audioshelf::{OperationEvent, OperationQueue, Subscription};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const POLL: Duration = Duration::from_millis(200);

/// Renders notifier events for one operation as an indicatif bar until the
/// operation reaches a terminal state.
pub struct OperationWatcher {
    bar: ProgressBar,
}

impl OperationWatcher {
    pub fn new(label: &str) -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(
            "  {spinner:.cyan} {prefix} [{bar:30.cyan/dim}] {pos}/{len} {wide_msg}",
        ) {
            bar.set_style(style.progress_chars("━╸─").tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        bar.set_prefix(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    /// Block until `id` is terminal. Falls back to polling the queue when
    /// events were dropped.
    pub fn watch(
        &self,
        subscription: &mut Subscription,
        queue: &OperationQueue,
        id: &str,
    ) -> audioshelf::Result<Operation> {
        loop {
            match subscription.next_timeout(POLL) {
                Some(event) if event.operation_id == id => {
                    self.render(&event);
                    if event.status.is_terminal() {
                        break;
                    }
                }
                Some(_) => {}
                None => {
                    let op = queue.get_operation(id)?;
                    self.render(&OperationEvent::from(&op));
                    if op.status.is_terminal() {
                        break;
                    }
                }
            }
        }
        self.bar.finish_and_clear();
        queue.get_operation(id)
    }

    fn render(&self, event: &OperationEvent) {
        if self.bar.length() != Some(event.total) {
            self.bar.set_length(event.total);
        }
        self.bar.set_position(event.progress);
        self.bar.set_message(event.message.clone());
    }
}
