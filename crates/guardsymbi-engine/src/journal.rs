use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use guardsymbi_core::event::EventBus;
use guardsymbi_core::types::{EventKind, RunEvent, RunId};

/// Ordered execution log for one run.
///
/// Sequence numbers are assigned under the same lock that appends, so the
/// retained order always matches `seq`. Each event is also published on the
/// bus for live consumers such as [`RunLogger`](crate::run_log::RunLogger).
pub struct RunJournal {
    run_id: RunId,
    events: Mutex<Vec<RunEvent>>,
    bus: Option<Arc<EventBus>>,
}

impl RunJournal {
    pub fn new(run_id: RunId, bus: Option<Arc<EventBus>>) -> Self {
        Self {
            run_id,
            events: Mutex::new(Vec::new()),
            bus,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn record(&self, task: Option<&str>, step: Option<&str>, kind: EventKind) {
        let event = {
            let mut events = self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let event = RunEvent {
                run_id: self.run_id.clone(),
                seq: events.len() as u64,
                task: task.map(str::to_string),
                step: step.map(str::to_string),
                timestamp: Utc::now(),
                kind,
            };
            events.push(event.clone());
            // Publish under the lock so subscribers see events in `seq` order.
            if let Some(bus) = &self.bus {
                bus.publish(event.clone());
            }
            event
        };

        debug!(
            run = %self.run_id,
            seq = event.seq,
            task = event.task.as_deref().unwrap_or("-"),
            step = event.step.as_deref().unwrap_or("-"),
            event = event.kind.name(),
            "transition"
        );
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
