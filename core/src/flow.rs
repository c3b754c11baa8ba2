//! Per-channel publisher flow control.
//!
//! Every message a channel has taken in but not yet finished with counts as
//! in flight. Crossing the high watermark sends `channel.flow(active=false)`
//! to the client; dropping below the low watermark sends
//! `channel.flow(active=true)` and replays the deliveries held back in the
//! meantime. Counters are atomics because additions and removals happen on
//! different tasks.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::info;

use crate::protocol::{Frame, Method};

/// Outbound side of a connection. Writes on one channel keep their order.
pub trait FrameSink: Send + Sync {
    fn write(&self, frame: Frame);

    fn write_and_flush(&self, frame: Frame);

    fn flush(&self);
}

#[derive(Debug)]
pub struct ChannelFlowManager {
    channel_id: u16,
    low_limit: usize,
    high_limit: usize,
    in_flight: AtomicUsize,
    active: AtomicBool,
    backlog: Mutex<Vec<Frame>>,
}

impl ChannelFlowManager {
    pub fn new(channel_id: u16, low_limit: usize, high_limit: usize) -> Self {
        Self {
            channel_id,
            low_limit,
            high_limit,
            in_flight: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            backlog: Mutex::new(Vec::new()),
        }
    }

    /// Returns true when this call turned flow off.
    pub fn notify_message_addition(&self, sink: &dyn FrameSink) -> bool {
        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if in_flight <= self.high_limit {
            return false;
        }
        // flow frames are switched and written under the backlog lock so they
        // reach the sink in the order the switches happened
        let _backlog = self.backlog.lock();
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        sink.write_and_flush(Frame::method(
            self.channel_id,
            Method::ChannelFlow { active: false },
        ));
        info!(channel = self.channel_id, in_flight, "Flow disabled");
        true
    }

    /// Returns true when this call turned flow back on.
    pub fn notify_message_removal(&self, sink: &dyn FrameSink) -> bool {
        let in_flight = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .map(|previous| previous.saturating_sub(1))
            .unwrap_or(0);
        if in_flight >= self.low_limit {
            return false;
        }

        let mut backlog = self.backlog.lock();
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        sink.write(Frame::method(
            self.channel_id,
            Method::ChannelFlow { active: true },
        ));
        for frame in backlog.drain(..) {
            sink.write(frame);
        }
        sink.flush();
        drop(backlog);
        info!(channel = self.channel_id, in_flight, "Flow enabled");
        true
    }

    /// Write `frames` now, or hold them until flow is back on. The frames of
    /// one call are never interleaved with another call's.
    pub fn write_or_hold(&self, sink: &dyn FrameSink, frames: Vec<Frame>) {
        let mut backlog = self.backlog.lock();
        if self.is_flow_active() && backlog.is_empty() {
            for frame in frames {
                sink.write(frame);
            }
            sink.flush();
        } else {
            backlog.extend(frames);
        }
    }

    pub fn is_flow_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn messages_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn held_frames(&self) -> usize {
        self.backlog.lock().len()
    }
}
