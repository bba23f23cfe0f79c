//! UI-agnostic signal bridge.
//!
//! Subscribes to every pipeline event and re-emits them through a
//! channel so a UI can consume them on its own thread (or event loop).
//! The bus-side handlers only enqueue and return, so the bridge can
//! never stall the pipeline, whatever the consumer does.

use tracing::debug;

use eventbus::{EventBus, SubscriptionId};
use pitch_types::{
    ErrorCategory, ErrorEvent, FrameCapturedEvent, FrameDropEvent, ObservationDetectedEvent,
    PitchClipClosedEvent, PitchEndEvent, PitchStartEvent,
};

/// Everything the pipeline can tell a UI.
#[derive(Debug, Clone)]
pub enum UiEvent {
    FrameCaptured(FrameCapturedEvent),
    ObservationDetected(ObservationDetectedEvent),
    PitchStart(PitchStartEvent),
    PitchEnd(PitchEndEvent),
    PitchClipClosed(PitchClipClosedEvent),
    FrameDrop(FrameDropEvent),
    Error(ErrorEvent),
}

pub struct SignalBridge {
    bus: EventBus,
    rx: crossbeam_channel::Receiver<UiEvent>,
    subs: Vec<SubscriptionId>,
}

impl SignalBridge {
    pub fn new(bus: &EventBus) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut subs = Vec::new();

        macro_rules! forward {
            ($event:ty, $variant:path, $name:expr) => {{
                let tx = tx.clone();
                subs.push(bus.subscribe_infallible::<$event, _>(
                    $name,
                    ErrorCategory::Shutdown,
                    move |ev: &$event| {
                        // Unbounded send never blocks the bus.
                        let _ = tx.send($variant(ev.clone()));
                    },
                ));
            }};
        }

        forward!(FrameCapturedEvent, UiEvent::FrameCaptured, "bridge/frames");
        forward!(
            ObservationDetectedEvent,
            UiEvent::ObservationDetected,
            "bridge/observations"
        );
        forward!(PitchStartEvent, UiEvent::PitchStart, "bridge/pitch-start");
        forward!(PitchEndEvent, UiEvent::PitchEnd, "bridge/pitch-end");
        forward!(
            PitchClipClosedEvent,
            UiEvent::PitchClipClosed,
            "bridge/clip-closed"
        );
        forward!(FrameDropEvent, UiEvent::FrameDrop, "bridge/frame-drop");
        forward!(ErrorEvent, UiEvent::Error, "bridge/errors");

        Self {
            bus: bus.clone(),
            rx,
            subs,
        }
    }

    /// Drain everything currently queued without blocking.
    pub fn try_iter(&self) -> impl Iterator<Item = UiEvent> + '_ {
        self.rx.try_iter()
    }

    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Option<UiEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Number of events waiting to be drained.
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        for sub in self.subs.drain(..) {
            self.bus.unsubscribe(sub);
        }
        debug!("signal bridge detached");
    }
}
