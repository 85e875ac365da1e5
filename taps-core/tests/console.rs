mod common;

use common::{MockFlash, MockFram};
use taps_core::console::{ConsoleCommand, ConsoleReply, LineBuffer, execute, parse};
use taps_core::nvstate::{FlashStore, FramStore, NvStore, RawResponse, SaveReason};

fn run<S: NvStore>(store: &mut S, line: &str) -> ConsoleReply {
    let command = parse(line).expect("command should parse");
    execute(&command, store)
}

#[test]
fn print_reports_backend_and_flags() {
    let mut store = FramStore::load(MockFram::new());
    store.set_actuator_percent(12.5, SaveReason::SavedPositionImmediate);

    let reply = run(&mut store, "print").to_string();
    assert!(reply.starts_with("backend: FRAM (unlimited updates)"), "{reply}");
    assert!(reply.contains("actuator percent: 12.50 [changed]"), "{reply}");
    assert!(reply.contains("reason: SavedPositionImmediate [changed]"), "{reply}");
    assert!(reply.contains("86.75"), "{reply}");
}

#[test]
fn zap_asks_before_wiping() {
    let mut store = FlashStore::load(MockFlash::new());
    store.set_actuator_percent(50.0, SaveReason::PowerDownSave);
    store.commit().expect("commit");

    assert_eq!(run(&mut store, "zap"), ConsoleReply::ConfirmZap);
    assert!(store.changing_region().is_valid());

    assert_eq!(run(&mut store, "zap yes"), ConsoleReply::Zapped);
    assert!(!store.changing_region().is_valid());
    assert!(!store.record().actuator_percent().was_valid());
}

#[test]
fn calibration_is_validated_then_committed() {
    let mut store = FlashStore::load(MockFlash::new());

    assert_eq!(run(&mut store, "cal 10 20 15 40 50"), ConsoleReply::Rejected);
    assert!(!store.constant_region().is_valid());

    let points = [10.0, 20.0, 30.0, 40.0, 50.0];
    assert_eq!(
        run(&mut store, "cal 10 20 30 40 50"),
        ConsoleReply::Calibrated(points)
    );
    assert!(store.constant_region().is_valid());

    let reloaded = FlashStore::load(store.into_device());
    assert_eq!(reloaded.record().gauge_calibration().get(), points);
    assert!(reloaded.record().gauge_calibration().was_valid());
}

#[test]
fn commit_writes_pending_changes() {
    let mut store = FramStore::load(MockFram::new());
    store.set_actuator_percent(77.0, SaveReason::SavedPositionImmediate);

    assert_eq!(run(&mut store, "commit"), ConsoleReply::Committed);
    assert!(!store.record().dirty());
}

#[test]
fn raw_commands_depend_on_backend() {
    let mut fram = FramStore::load(MockFram::new());
    assert_eq!(
        run(&mut fram, "probe"),
        ConsoleReply::Raw(RawResponse::Probed(true))
    );
    assert_eq!(run(&mut fram, "write 0x200 0xde 0xad").to_string(), "wrote 2 bytes");
    assert_eq!(run(&mut fram, "read 0x200 2").to_string(), "de ad");
    assert_eq!(run(&mut fram, "regions"), ConsoleReply::Unsupported);

    let mut flash = FlashStore::load(MockFlash::new());
    assert_eq!(run(&mut flash, "probe"), ConsoleReply::Unsupported);
    assert_eq!(run(&mut flash, "write 0 1"), ConsoleReply::Unsupported);
    let regions = run(&mut flash, "regions").to_string();
    assert!(regions.starts_with("constant @ 0xf800: slot 0/93 empty"), "{regions}");
    assert!(regions.contains("changing @ 0xf000: slot 0/512 empty"), "{regions}");
}

#[test]
fn out_of_range_read_reports_failure() {
    let mut flash = FlashStore::load(MockFlash::new());
    match run(&mut flash, "read 0x20000 4") {
        ConsoleReply::Raw(RawResponse::Failed(_)) => {}
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[test]
fn line_buffer_feeds_execute() {
    let mut store = FramStore::load(MockFram::new());
    let mut line = LineBuffer::new();

    let mut replies = Vec::new();
    for &byte in b"  help \r\nzap\r" {
        if let Some(parsed) = line.ingest(byte) {
            let command = parsed.expect("line should parse");
            replies.push(execute(&command, &mut store));
        }
    }

    assert_eq!(replies, [ConsoleReply::Help, ConsoleReply::ConfirmZap]);
    assert_eq!(parse("bogus").map(|_| ()), Err(taps_core::console::ConsoleError::Syntax));
    assert_eq!(
        parse("read 0 16"),
        Ok(ConsoleCommand::Read { address: 0, len: 16 })
    );
}
