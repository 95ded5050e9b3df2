use std::sync::{Arc, Mutex};

use anyhow::Result;

use crate::event::{FunnelEvent, SeenEvents};

/// Receiver of run notifications.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &FunnelEvent) -> Result<()>;
}

/// Fire-and-forget delivery: a failing sink is logged and never fails the
/// transition that produced the event.
pub fn notify(sink: &dyn EventSink, event: &FunnelEvent) {
    if let Err(err) = sink.publish(event) {
        tracing::warn!(
            run_id = %event.run_id,
            kind = event.kind.as_str(),
            error = %format!("{err:#}"),
            "event delivery failed"
        );
    }
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn publish(&self, event: &FunnelEvent) -> Result<()> {
        (**self).publish(event)
    }
}

#[derive(Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: &FunnelEvent) -> Result<()> {
        Ok(())
    }
}

/// Keeps every delivery, duplicates included. Used by tests and the scenario harness.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<FunnelEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FunnelEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Deliveries with redeliveries dropped.
    pub fn distinct(&self) -> Vec<FunnelEvent> {
        let mut seen = SeenEvents::new();
        self.events().into_iter().filter(|e| seen.first_time(e)).collect()
    }
}

impl EventSink for MemorySink {
    fn publish(&self, event: &FunnelEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| anyhow::anyhow!("memory sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// Delivers to every inner sink; one failing sink does not starve the others.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for FanOut {
    fn publish(&self, event: &FunnelEvent) -> Result<()> {
        for sink in &self.sinks {
            notify(sink.as_ref(), event);
        }
        Ok(())
    }
}
