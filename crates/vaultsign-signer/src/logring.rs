//! Bounded in-memory log ring.
//!
//! The gadget has no remote log shipping; the host pulls recent lines
//! through the `Logs` request instead. A `tracing` layer feeds formatted
//! events into a bounded ring; rotation of on-disk logs is out of scope.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Bounded ring of rendered log lines.
#[derive(Debug)]
pub struct LogRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogRing {
    /// Create a ring holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        })
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("log ring poisoned");
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The newest `limit` lines, oldest first. `limit == 0` means all.
    pub fn tail(&self, limit: usize) -> Vec<String> {
        let lines = self.lines.lock().expect("log ring poisoned");
        let take = if limit == 0 {
            lines.len()
        } else {
            limit.min(lines.len())
        };
        lines.iter().skip(lines.len() - take).cloned().collect()
    }
}

/// `tracing` layer rendering events into a [`LogRing`].
pub struct LogRingLayer {
    ring: Arc<LogRing>,
}

impl LogRingLayer {
    /// Create a layer feeding `ring`.
    pub fn new(ring: Arc<LogRing>) -> Self {
        Self { ring }
    }
}

impl<S: Subscriber> Layer<S> for LogRingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let mut line = format!("{} {}", meta.level(), meta.target());
        if !visitor.message.is_empty() {
            let _ = write!(line, " {}", visitor.message);
        }
        if !visitor.fields.is_empty() {
            let _ = write!(line, " {}", visitor.fields);
        }
        self.ring.push(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={:?}", field.name(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(format!("line{}", i));
        }
        assert_eq!(ring.tail(0), vec!["line2", "line3", "line4"]);
    }

    #[test]
    fn test_tail_limit() {
        let ring = LogRing::new(10);
        for i in 0..4 {
            ring.push(format!("line{}", i));
        }
        assert_eq!(ring.tail(2), vec!["line2", "line3"]);
        assert_eq!(ring.tail(100).len(), 4);
    }

    #[test]
    fn test_layer_captures_events() {
        use tracing_subscriber::layer::SubscriberExt;

        let ring = LogRing::new(16);
        let subscriber =
            tracing_subscriber::registry().with(LogRingLayer::new(ring.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(alias = "key1", "key unlocked");
        });

        let lines = ring.tail(0);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("key unlocked"));
        assert!(lines[0].contains("alias=\"key1\""));
    }
}
