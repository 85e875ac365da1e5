use std::thread;

use taps_core::mailbox::{Mailbox, MessageKind};

static MAILBOX: Mailbox<8> = Mailbox::new();

#[test]
fn producers_on_other_threads_never_lose_slots() {
    const PER_PRODUCER: u32 = 500;

    let producers: Vec<_> = (0..3_u32)
        .map(|producer| {
            thread::spawn(move || {
                let mut sent = 0_u32;
                for sequence in 0..PER_PRODUCER {
                    if let Some(letter) =
                        MAILBOX.allocate(MessageKind::Heartbeat, (producer << 16) | sequence)
                    {
                        letter.push();
                        sent += 1;
                    }
                }
                sent
            })
        })
        .collect();

    let mut received = 0_u32;
    let mut last_seen = [None::<u32>; 3];
    loop {
        while let Some(letter) = MAILBOX.pop() {
            let producer = (letter.payload() >> 16) as usize;
            let sequence = letter.payload() & 0xffff;
            if let Some(previous) = last_seen[producer] {
                assert!(sequence > previous, "producer {producer} reordered");
            }
            last_seen[producer] = Some(sequence);
            received += 1;
        }
        if producers.iter().all(thread::JoinHandle::is_finished) && MAILBOX.queued() == 0 {
            break;
        }
        thread::yield_now();
    }

    let sent: u32 = producers
        .into_iter()
        .map(|handle| handle.join().expect("producer panicked"))
        .sum();
    assert_eq!(received, sent);
    assert_eq!(MAILBOX.free_slots(), MAILBOX.capacity());
}
