use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::Edge;
use crate::error::GpioError;
use crate::event_log::EventLog;
use crate::gpio::{CallbackId, EdgeCallback, EdgeEvent, LineDriver};
use crate::registry::PinRegistry;

/// Driver callback that appends every observed transition to `log`.
pub(crate) fn input_sink(log: Arc<EventLog>) -> EdgeCallback {
    Arc::new(move |event: EdgeEvent| log.record(event.pin, event.level))
}

/// Registers application observers on input pins.
pub struct CallbackDispatcher<D: LineDriver> {
    registry: Arc<PinRegistry<D>>,
}

impl<D: LineDriver> CallbackDispatcher<D> {
    pub fn new(registry: Arc<PinRegistry<D>>) -> Self {
        Self { registry }
    }

    /// Handlers run on driver threads and must not reconfigure pins.
    pub fn add_callback<F>(
        &self,
        pin: u32,
        edge: Edge,
        handler: F,
    ) -> Result<CallbackHandle<D>, GpioError>
    where
        F: Fn(EdgeEvent) + Send + Sync + 'static,
    {
        let id = self.registry.attach_observer(pin, edge, Arc::new(handler))?;
        debug!("callback {} registered on GPIO {pin} for {edge:?}", id.0);

        Ok(CallbackHandle {
            id,
            pin,
            edge,
            registry: self.registry.clone(),
            cancelled: AtomicBool::new(false),
        })
    }
}

/// Registration returned by [`CallbackDispatcher::add_callback`].
///
/// Dropping the handle leaves the callback registered; call
/// [`CallbackHandle::cancel`] to remove it. Moving the pin out of input
/// mode cancels it as well.
#[must_use = "the callback stays registered until cancel() is called"]
pub struct CallbackHandle<D: LineDriver> {
    id: CallbackId,
    pin: u32,
    edge: Edge,
    registry: Arc<PinRegistry<D>>,
    cancelled: AtomicBool,
}

impl<D: LineDriver> CallbackHandle<D> {
    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn edge(&self) -> Edge {
        self.edge
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Removes this registration only. An invocation already dispatched by
    /// the driver may still complete.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.registry.detach_observer(self.pin, self.id);
            debug!("callback {} on GPIO {} cancelled", self.id.0, self.pin);
        }
    }
}
