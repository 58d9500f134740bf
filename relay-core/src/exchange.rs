//! In-memory rendezvous between the two live peers of one device key (C6).

use crate::frame::Frame;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Bounded per-tick budget for the relay loop (§4.6): at most this many
/// frame operations (one read + one forward, counted per pass) before a
/// connection task yields.
pub const TICK_FRAME_BUDGET: usize = 10;

pub struct MessageExchange {
    pub device_key: String,
    platform_to_app: Mutex<VecDeque<Frame>>,
    app_to_platform: Mutex<VecDeque<Frame>>,
}

impl MessageExchange {
    pub fn new(device_key: String) -> Self {
        MessageExchange {
            device_key,
            platform_to_app: Mutex::new(VecDeque::new()),
            app_to_platform: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push_platform_to_app(&self, frame: Frame) {
        self.platform_to_app.lock().unwrap().push_back(frame);
    }

    pub fn pop_platform_to_app(&self) -> Option<Frame> {
        self.platform_to_app.lock().unwrap().pop_front()
    }

    pub fn push_app_to_platform(&self, frame: Frame) {
        self.app_to_platform.lock().unwrap().push_back(frame);
    }

    pub fn pop_app_to_platform(&self) -> Option<Frame> {
        self.app_to_platform.lock().unwrap().pop_front()
    }

    /// Discards stale data from both directions. Called when an app attaches
    /// to an exchange that may carry leftovers from a previous pairing.
    pub fn clear(&self) {
        self.platform_to_app.lock().unwrap().clear();
        self.app_to_platform.lock().unwrap().clear();
    }
}
