//! Init-capture buffer (§3 `InitCaptureBuffer`, §4.14, I2).
//!
//! A ring of raw inbound frames between `want_config_id` and the
//! matching `configComplete`, replayed to the virtual-node fan-out on
//! reconnect. Cleared on connect; appended to while capturing; frozen
//! on `configComplete`. Snapshots are defensive copies (§4.14).
//!
//! The frame vector lives behind an `Arc<Mutex<_>>` rather than as a
//! plain field: the dispatch loop (`Manager`, single writer) and
//! external callers going through [`CaptureSnapshotHandle`] (via
//! `ManagerHandle`, the virtual-node server replaying init frames to a
//! newly connected mobile client) both need to reach the same buffer,
//! and the manager's dispatch state otherwise never leaves `Manager`
//! itself (§5 "Shared state policy").

use std::sync::{Arc, Mutex};

use bytes::Bytes;

#[derive(Debug, Default)]
pub struct InitCaptureBuffer {
    frames: Arc<Mutex<Vec<Bytes>>>,
    capturing: bool,
}

impl InitCaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears the buffer and starts capturing (called at connect,
    /// before `want_config_id` is sent).
    pub fn start(&mut self) {
        self.frames.lock().expect("init capture mutex poisoned").clear();
        self.capturing = true;
    }

    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    /// Appends a frame iff capture is currently active (I2).
    pub fn push_if_capturing(&mut self, frame: Bytes) {
        if self.capturing {
            self.frames.lock().expect("init capture mutex poisoned").push(frame);
        }
    }

    /// Freezes the buffer on `configComplete` (I2).
    pub fn freeze(&mut self) {
        self.capturing = false;
    }

    /// Defensive copy of the captured frames (§4.14).
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.frames.lock().expect("init capture mutex poisoned").clone()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().expect("init capture mutex poisoned").is_empty()
    }

    /// A cheap, cloneable read handle external callers can hold onto
    /// without sharing the rest of [`InitCaptureBuffer`]'s (writer-only)
    /// API — the virtual-node server wants `snapshot()` at handoff time,
    /// nothing else.
    pub fn snapshot_handle(&self) -> CaptureSnapshotHandle {
        CaptureSnapshotHandle {
            frames: self.frames.clone(),
        }
    }
}

/// Read-only front door onto the init-capture buffer for external
/// callers (`ManagerHandle`). Mirrors the spec's "snapshots are
/// returned by value (defensive copy)" contract.
#[derive(Clone)]
pub struct CaptureSnapshotHandle {
    frames: Arc<Mutex<Vec<Bytes>>>,
}

impl CaptureSnapshotHandle {
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.frames.lock().expect("init capture mutex poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_frames_between_start_and_freeze_only() {
        let mut buffer = InitCaptureBuffer::new();
        buffer.start();
        buffer.push_if_capturing(Bytes::from_static(b"F1"));
        buffer.push_if_capturing(Bytes::from_static(b"F2"));
        buffer.push_if_capturing(Bytes::from_static(b"F3"));
        buffer.freeze();
        buffer.push_if_capturing(Bytes::from_static(b"F4"));

        let snapshot = buffer.snapshot();
        assert_eq!(
            snapshot,
            vec![
                Bytes::from_static(b"F1"),
                Bytes::from_static(b"F2"),
                Bytes::from_static(b"F3"),
            ]
        );
    }

    #[test]
    fn restarting_capture_clears_prior_frames() {
        let mut buffer = InitCaptureBuffer::new();
        buffer.start();
        buffer.push_if_capturing(Bytes::from_static(b"stale"));
        buffer.freeze();

        buffer.start();
        assert!(buffer.is_empty());
        assert!(buffer.is_capturing());
    }

    #[test]
    fn snapshot_handle_sees_the_same_frames_as_the_owning_buffer() {
        let mut buffer = InitCaptureBuffer::new();
        let handle = buffer.snapshot_handle();
        buffer.start();
        buffer.push_if_capturing(Bytes::from_static(b"F1"));
        assert_eq!(handle.snapshot(), vec![Bytes::from_static(b"F1")]);
    }
}
