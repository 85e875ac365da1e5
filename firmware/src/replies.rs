//! Console reply framing.
//!
//! The control loop formats replies synchronously; the USB task drains the
//! frames whenever the host is listening. Frames that do not fit in the
//! queue are dropped rather than stalling the controller.

#![allow(dead_code)]

use core::fmt;

use embassy_sync::channel::Channel;
use heapless::Vec;

#[cfg(not(target_os = "none"))]
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
#[cfg(target_os = "none")]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

#[cfg(target_os = "none")]
type ReplyMutex = CriticalSectionRawMutex;
#[cfg(not(target_os = "none"))]
type ReplyMutex = NoopRawMutex;

/// One USB full-speed bulk packet.
pub const REPLY_FRAME_SIZE: usize = 64;

/// Frames buffered toward the host.
pub const REPLY_QUEUE_DEPTH: usize = 16;

pub type ReplyFrame = Vec<u8, REPLY_FRAME_SIZE>;

/// Channel carrying console output to the USB task.
pub type ReplyQueue = Channel<ReplyMutex, ReplyFrame, REPLY_QUEUE_DEPTH>;

/// Splits formatted text into packet-sized frames, turning `\n` into `\r\n`.
pub struct ReplyWriter<F: FnMut(ReplyFrame) -> bool> {
    frame: ReplyFrame,
    sink: F,
    dropped: usize,
}

impl<F: FnMut(ReplyFrame) -> bool> ReplyWriter<F> {
    /// `sink` returns `false` when it had to discard the frame.
    pub fn new(sink: F) -> Self {
        Self {
            frame: Vec::new(),
            sink,
            dropped: 0,
        }
    }

    fn push(&mut self, byte: u8) {
        if self.frame.is_full() {
            self.flush();
        }
        // Cannot fail: the frame was just drained if it was full.
        let _ = self.frame.push(byte);
    }

    /// Hands the partial frame to the sink.
    pub fn flush(&mut self) {
        if self.frame.is_empty() {
            return;
        }
        let frame = core::mem::take(&mut self.frame);
        if !(self.sink)(frame) {
            self.dropped += 1;
        }
    }

    /// Terminates the reply with a line break and flushes it. Returns the
    /// number of frames the sink refused.
    pub fn finish(mut self) -> usize {
        self.push(b'\r');
        self.push(b'\n');
        self.flush();
        self.dropped
    }
}

impl<F: FnMut(ReplyFrame) -> bool> fmt::Write for ReplyWriter<F> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.push(b'\r');
            }
            self.push(byte);
        }
        Ok(())
    }
}

/// Writes `reply` followed by a line break into `queue` without blocking.
///
/// Returns how many frames the queue refused. A formatting error still
/// terminates whatever part of the line was written.
pub fn send_reply(queue: &ReplyQueue, reply: impl fmt::Display) -> Result<usize, fmt::Error> {
    use core::fmt::Write as _;

    let mut writer = ReplyWriter::new(|frame| queue.try_send(frame).is_ok());
    let formatted = write!(writer, "{reply}");
    let dropped = writer.finish();
    formatted.map(|()| dropped)
}
