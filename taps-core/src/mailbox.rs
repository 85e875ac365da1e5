//! Fixed-capacity message pool plus FIFO queue shared by interrupt producers
//! and the single control-loop consumer.
//!
//! Slots never leave the pool. A slot is on the free list, linked into the
//! queue, or held by exactly one [`Letter`] handle; every transition happens
//! inside one short critical section so producers may run from interrupt
//! context. Dropping a [`Letter`] returns its slot to the free list.

use core::cell::RefCell;
use core::fmt;
use core::mem::ManuallyDrop;

use critical_section::Mutex;

/// Number of messages the firmware mailbox can hold in flight at once.
pub const MAILBOX_CAPACITY: usize = 20;

/// Mailbox sized for the firmware event sources.
pub type EventMailbox = Mailbox<MAILBOX_CAPACITY>;

/// Event kinds understood by the control loop.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MessageKind {
    /// Marker for a slot sitting on the free list.
    Free,
    TrimRetractOn,
    TrimExtendOn,
    TrimOff,
    GaugeUpdate,
    FullRetract,
    Heartbeat,
    ConfigButtonOn,
    PowerFailed,
    PowerRestored,
    /// Operator console byte; the payload carries the command code.
    UserCommand,
}

impl MessageKind {
    /// Short label used in logs and console output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            MessageKind::Free => "free",
            MessageKind::TrimRetractOn => "trim-retract-on",
            MessageKind::TrimExtendOn => "trim-extend-on",
            MessageKind::TrimOff => "trim-off",
            MessageKind::GaugeUpdate => "gauge-update",
            MessageKind::FullRetract => "full-retract",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::ConfigButtonOn => "config-button-on",
            MessageKind::PowerFailed => "power-failed",
            MessageKind::PowerRestored => "power-restored",
            MessageKind::UserCommand => "user-command",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Copy, Clone)]
struct Slot {
    kind: MessageKind,
    payload: u32,
    next: Option<u8>,
}

impl Slot {
    const FREE: Self = Self {
        kind: MessageKind::Free,
        payload: 0,
        next: None,
    };
}

struct Pool<const N: usize> {
    slots: [Slot; N],
    free_head: Option<u8>,
    queue_head: Option<u8>,
    queue_tail: Option<u8>,
    free: usize,
    queued: usize,
    stopped: bool,
}

impl<const N: usize> Pool<N> {
    #[allow(clippy::cast_possible_truncation)]
    const fn new() -> Self {
        assert!(N > 0 && N < u8::MAX as usize, "mailbox capacity must fit a u8 link");

        let mut slots = [Slot::FREE; N];
        let mut index = 0;
        while index + 1 < N {
            slots[index].next = Some((index + 1) as u8);
            index += 1;
        }

        Self {
            slots,
            free_head: Some(0),
            queue_head: None,
            queue_tail: None,
            free: N,
            queued: 0,
            stopped: false,
        }
    }

    fn take_free(&mut self) -> Option<u8> {
        let index = self.free_head?;
        let slot = &mut self.slots[usize::from(index)];
        self.free_head = slot.next.take();
        self.free -= 1;
        Some(index)
    }

    fn release(&mut self, index: u8) {
        let slot = &mut self.slots[usize::from(index)];
        slot.kind = MessageKind::Free;
        slot.payload = 0;
        slot.next = self.free_head;
        self.free_head = Some(index);
        self.free += 1;
    }

    fn enqueue(&mut self, index: u8, kind: MessageKind, payload: u32) {
        let slot = &mut self.slots[usize::from(index)];
        slot.kind = kind;
        slot.payload = payload;
        slot.next = None;

        match self.queue_tail {
            Some(tail) => self.slots[usize::from(tail)].next = Some(index),
            None => self.queue_head = Some(index),
        }
        self.queue_tail = Some(index);
        self.queued += 1;
    }

    fn dequeue(&mut self) -> Option<u8> {
        let index = self.queue_head?;
        let slot = &mut self.slots[usize::from(index)];
        self.queue_head = slot.next.take();
        if self.queue_head.is_none() {
            self.queue_tail = None;
        }
        self.queued -= 1;
        Some(index)
    }

    fn drain(&mut self) -> usize {
        let mut flushed = 0;
        while let Some(index) = self.dequeue() {
            self.release(index);
            flushed += 1;
        }
        flushed
    }

    /// Frees every queued message except those of `keep`, which stay queued
    /// in their original order.
    fn drain_except(&mut self, keep: MessageKind) -> usize {
        let mut next = self.queue_head.take();
        self.queue_tail = None;
        self.queued = 0;

        let mut flushed = 0;
        while let Some(index) = next {
            let slot = self.slots[usize::from(index)];
            next = slot.next;
            if slot.kind == keep {
                self.enqueue(index, slot.kind, slot.payload);
            } else {
                self.release(index);
                flushed += 1;
            }
        }
        flushed
    }
}

/// Interrupt-safe message pool and FIFO.
pub struct Mailbox<const N: usize> {
    pool: Mutex<RefCell<Pool<N>>>,
}

impl<const N: usize> Mailbox<N> {
    /// Creates a mailbox with every slot on the free list, accepting pushes.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pool: Mutex::new(RefCell::new(Pool::new())),
        }
    }

    fn with_pool<R>(&self, f: impl FnOnce(&mut Pool<N>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.pool.borrow_ref_mut(cs)))
    }

    /// Takes a slot from the free list.
    ///
    /// Returns `None` when the pool is exhausted or the mailbox is stopped.
    pub fn allocate(&self, kind: MessageKind, payload: u32) -> Option<Letter<'_, N>> {
        let index = self.with_pool(|pool| {
            if pool.stopped {
                None
            } else {
                pool.take_free()
            }
        })?;

        Some(Letter {
            mailbox: self,
            index,
            kind,
            payload,
        })
    }

    /// Allocates with a zero payload.
    pub fn allocate_kind(&self, kind: MessageKind) -> Option<Letter<'_, N>> {
        self.allocate(kind, 0)
    }

    /// Appends the message at the tail of the queue, or frees it when stopped.
    pub fn push(&self, letter: Letter<'_, N>) {
        debug_assert!(core::ptr::eq(letter.mailbox, self), "letter pushed to a foreign mailbox");
        letter.push();
    }

    /// Removes the oldest queued message.
    pub fn pop(&self) -> Option<Letter<'_, N>> {
        self.with_pool(|pool| {
            let index = pool.dequeue()?;
            let slot = pool.slots[usize::from(index)];
            Some(Letter {
                mailbox: self,
                index,
                kind: slot.kind,
                payload: slot.payload,
            })
        })
    }

    /// Returns a consumed message to the free list.
    pub fn free(&self, letter: Letter<'_, N>) {
        debug_assert!(core::ptr::eq(letter.mailbox, self), "letter freed to a foreign mailbox");
        drop(letter);
    }

    /// Frees every queued message and reports how many were discarded.
    pub fn flush(&self) -> usize {
        self.with_pool(Pool::drain)
    }

    /// Like [`Mailbox::flush`], but messages of kind `keep` survive.
    pub fn flush_except(&self, keep: MessageKind) -> usize {
        self.with_pool(|pool| pool.drain_except(keep))
    }

    /// Accepts new allocations and pushes again.
    pub fn start(&self) {
        self.with_pool(|pool| pool.stopped = false);
    }

    /// Rejects new allocations, frees future pushes, and flushes the queue.
    pub fn stop(&self) {
        self.with_pool(|pool| {
            pool.stopped = true;
            pool.drain();
        });
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.with_pool(|pool| pool.stopped)
    }

    /// Number of messages waiting in the queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.with_pool(|pool| pool.queued)
    }

    /// Number of slots on the free list.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.with_pool(|pool| pool.free)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    fn enqueue_or_release(&self, index: u8, kind: MessageKind, payload: u32) {
        self.with_pool(|pool| {
            if pool.stopped {
                pool.release(index);
            } else {
                pool.enqueue(index, kind, payload);
            }
        });
    }

    fn release(&self, index: u8) {
        self.with_pool(|pool| pool.release(index));
    }
}

impl<const N: usize> Default for Mailbox<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle to one pool slot while it is outside the queue.
///
/// The handle is not `Clone`; pushing moves it into the queue and dropping it
/// frees the slot, so a message can never be owned twice or leaked.
pub struct Letter<'m, const N: usize> {
    mailbox: &'m Mailbox<N>,
    index: u8,
    kind: MessageKind,
    payload: u32,
}

impl<const N: usize> Letter<'_, N> {
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn payload(&self) -> u32 {
        self.payload
    }

    /// Moves the message into its mailbox queue.
    pub fn push(self) {
        let letter = ManuallyDrop::new(self);
        letter
            .mailbox
            .enqueue_or_release(letter.index, letter.kind, letter.payload);
    }

    /// Returns the slot to the free list.
    pub fn free(self) {
        drop(self);
    }
}

impl<const N: usize> Drop for Letter<'_, N> {
    fn drop(&mut self) {
        self.mailbox.release(self.index);
    }
}

impl<const N: usize> fmt::Debug for Letter<'_, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Letter")
            .field("slot", &self.index)
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_exhausts_at_capacity() {
        let mailbox: Mailbox<4> = Mailbox::new();
        let letters: [_; 4] = core::array::from_fn(|_| {
            mailbox
                .allocate_kind(MessageKind::Heartbeat)
                .expect("pool has room")
        });

        assert!(mailbox.allocate_kind(MessageKind::Heartbeat).is_none());
        assert_eq!(mailbox.free_slots(), 0);

        drop(letters);
        assert_eq!(mailbox.free_slots(), 4);
    }

    #[test]
    fn queue_preserves_fifo_order_and_payloads() {
        let mailbox: Mailbox<8> = Mailbox::new();
        for payload in 0..5 {
            mailbox
                .allocate(MessageKind::UserCommand, payload)
                .expect("slot available")
                .push();
        }

        for expected in 0..5 {
            let letter = mailbox.pop().expect("queued message");
            assert_eq!(letter.kind(), MessageKind::UserCommand);
            assert_eq!(letter.payload(), expected);
            mailbox.free(letter);
        }
        assert!(mailbox.pop().is_none());
        assert_eq!(mailbox.free_slots(), 8);
    }

    #[test]
    fn allocation_resets_payload_to_zero() {
        let mailbox: Mailbox<1> = Mailbox::new();
        mailbox
            .allocate(MessageKind::UserCommand, 0xdead)
            .expect("slot")
            .push();
        mailbox.pop().expect("queued").free();

        let letter = mailbox.allocate_kind(MessageKind::Heartbeat).expect("slot");
        assert_eq!(letter.payload(), 0);
    }

    #[test]
    fn flush_frees_everything_queued() {
        let mailbox: Mailbox<6> = Mailbox::new();
        for _ in 0..4 {
            mailbox
                .allocate_kind(MessageKind::GaugeUpdate)
                .expect("slot")
                .push();
        }

        assert_eq!(mailbox.flush(), 4);
        assert_eq!(mailbox.queued(), 0);
        assert_eq!(mailbox.free_slots(), 6);
    }

    #[test]
    fn flush_except_keeps_the_named_kind_in_order() {
        let mailbox: Mailbox<8> = Mailbox::new();
        let queued = [
            (MessageKind::Heartbeat, 0),
            (MessageKind::UserCommand, u32::from(b'p')),
            (MessageKind::TrimOff, 0),
            (MessageKind::UserCommand, u32::from(b'\r')),
            (MessageKind::GaugeUpdate, 0),
        ];
        for (kind, payload) in queued {
            mailbox.allocate(kind, payload).expect("slot").push();
        }

        assert_eq!(mailbox.flush_except(MessageKind::UserCommand), 3);
        assert_eq!(mailbox.queued(), 2);
        assert_eq!(mailbox.free_slots(), 6);

        let first = mailbox.pop().expect("queued");
        assert_eq!(first.kind(), MessageKind::UserCommand);
        assert_eq!(first.payload(), u32::from(b'p'));
        drop(first);
        assert_eq!(mailbox.pop().expect("queued").payload(), u32::from(b'\r'));
        assert!(mailbox.pop().is_none());

        mailbox.allocate_kind(MessageKind::Heartbeat).expect("slot").push();
        assert_eq!(mailbox.queued(), 1);
    }

    #[test]
    fn stopped_mailbox_rejects_allocation_until_started() {
        let mailbox: Mailbox<2> = Mailbox::new();
        mailbox.stop();
        assert!(mailbox.is_stopped());
        assert!(mailbox.allocate_kind(MessageKind::TrimOff).is_none());

        mailbox.start();
        assert!(mailbox.allocate_kind(MessageKind::TrimOff).is_some());
    }

    #[test]
    fn push_after_stop_returns_slot_to_free_list() {
        let mailbox: Mailbox<3> = Mailbox::new();
        let held = mailbox.allocate_kind(MessageKind::TrimExtendOn).expect("slot");
        mailbox
            .allocate_kind(MessageKind::TrimOff)
            .expect("slot")
            .push();

        mailbox.stop();
        assert_eq!(mailbox.queued(), 0);

        mailbox.push(held);
        assert_eq!(mailbox.queued(), 0);
        assert_eq!(mailbox.free_slots(), 3);
    }
}
