//! Buffering of early messages until the initialization handshake lands.

use std::collections::VecDeque;

use serde_json::Value;

use crate::protocol::MessageType;

/// Holds back messages of gated types until the bridge is told the
/// initialization handshake completed, then releases them once, in FIFO
/// order. Disconnect closes the gate again; anything still queued at that
/// point is discarded (its pending entries were already resolved empty).
pub(crate) struct InitGate {
    open: bool,
    queued: VecDeque<Value>,
}

impl InitGate {
    pub fn new() -> Self {
        Self {
            open: false,
            queued: VecDeque::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Either pass the message through for transmission or queue it.
    pub fn admit(&mut self, ty: MessageType, wire: Value) -> Option<Value> {
        if !self.open && ty.requires_init() {
            self.queued.push_back(wire);
            None
        } else {
            Some(wire)
        }
    }

    /// Open the gate and hand back everything queued, oldest first. A second
    /// call on an already-open gate returns nothing.
    pub fn open(&mut self) -> Vec<Value> {
        if self.open {
            return Vec::new();
        }
        self.open = true;
        self.queued.drain(..).collect()
    }

    pub fn close(&mut self) {
        self.open = false;
        self.queued.clear();
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }
}
