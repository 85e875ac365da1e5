mod common;

use common::{FLASH_CAPACITY, FLASH_SECTOR, MockFlash, MockFram, close};
use taps_core::nvstate::{
    DEFAULT_GAUGE_CALIBRATION, FlashStore, FramStore, NvBackend, NvStore, RawCommand, RawResponse,
    SaveReason, StorageError,
};

const CALIBRATION: [f32; 5] = [80.0, 70.0, 60.0, 50.0, 40.0];

fn reload_flash(store: FlashStore<MockFlash>) -> FlashStore<MockFlash> {
    FlashStore::load(store.into_device())
}

fn reload_fram(store: FramStore<MockFram>) -> FramStore<MockFram> {
    FramStore::load(store.into_transport())
}

#[test]
fn blank_flash_loads_defaults() {
    let store = FlashStore::load(MockFlash::new());
    let record = store.record();

    assert_eq!(record.gauge_calibration().get(), DEFAULT_GAUGE_CALIBRATION);
    assert!(!record.gauge_calibration().was_valid());
    assert!(!record.actuator_percent().was_valid());
    assert!(!record.reason().was_valid());
    assert!(!record.dirty());
    assert!(!store.unlimited_updates());
    assert_eq!(store.name(), "FLASH");
}

#[test]
fn flash_regions_sit_below_the_top_of_the_device() {
    let store = FlashStore::load(MockFlash::new());

    assert_eq!(store.constant_region().base(), FLASH_CAPACITY - FLASH_SECTOR);
    assert_eq!(store.changing_region().base(), FLASH_CAPACITY - 2 * FLASH_SECTOR);
    assert_eq!(store.changing_region().slots(), FLASH_SECTOR / 4);
    assert_eq!(store.constant_region().slots(), FLASH_SECTOR / 22);
}

#[test]
fn flash_round_trip_marks_fields_valid() {
    let mut store = FlashStore::load(MockFlash::new());
    store.set_actuator_percent(38.1, SaveReason::InitialMovement);
    store.record_mut().set_gauge_calibration(CALIBRATION);
    store.commit().expect("commit should succeed");
    assert!(!store.record().dirty());

    let store = reload_flash(store);
    let record = store.record();
    assert!(close(record.actuator_percent().get(), 38.1, 0.005));
    assert_eq!(record.reason().get(), SaveReason::InitialMovement);
    assert_eq!(record.gauge_calibration().get(), CALIBRATION);
    assert!(record.actuator_percent().was_valid());
    assert!(record.reason().was_valid());
    assert!(record.gauge_calibration().was_valid());
}

#[test]
fn commit_without_changes_programs_nothing() {
    let mut store = FlashStore::load(MockFlash::new());
    store.set_actuator_percent(40.0, SaveReason::SavedPositionLazy);
    store.commit().expect("first commit");
    let programs = store.device().programs;

    store.commit().expect("second commit");
    store.set_actuator_percent(40.0, SaveReason::SavedPositionLazy);
    store.commit().expect("identical value");

    assert_eq!(store.device().programs, programs);
}

#[test]
fn restoring_the_stored_value_skips_the_write() {
    let mut store = FlashStore::load(MockFlash::new());
    store.set_actuator_percent(40.0, SaveReason::SavedPositionLazy);
    store.commit().expect("first commit");
    let programs = store.device().programs;

    // Changed twice before a commit, ending where it started.
    store.set_actuator_percent(41.0, SaveReason::SavedPositionLazy);
    store.set_actuator_percent(40.0, SaveReason::SavedPositionLazy);
    assert!(store.record().dirty());
    store.commit().expect("commit");

    assert_eq!(store.device().programs, programs);
    assert!(!store.record().dirty());
}

#[test]
fn wear_levelling_appends_until_the_region_is_full() {
    let mut store = FlashStore::load(MockFlash::new());
    let slots = store.changing_region().slots();

    for index in 0..slots {
        store.set_actuator_percent(index as f32 * 0.1, SaveReason::SavedPositionLazy);
        store.commit().expect("append");
    }
    assert_eq!(store.device().erases, 0);
    assert_eq!(store.changing_region().current_slot(), slots - 1);

    store.set_actuator_percent(99.5, SaveReason::SavedPositionLazy);
    store.commit().expect("wrap");
    assert_eq!(store.device().erases, 1);
    assert_eq!(store.changing_region().current_slot(), 0);

    let store = reload_flash(store);
    assert!(close(store.record().actuator_percent().get(), 99.5, 0.005));
    assert_eq!(store.changing_region().current_slot(), 0);
}

#[test]
fn newest_slot_wins_after_reload() {
    let mut store = FlashStore::load(MockFlash::new());
    for percent in [10.0, 20.0, 30.0] {
        store.set_actuator_percent(percent, SaveReason::PowerDownSave);
        store.commit().expect("append");
    }

    let store = reload_flash(store);
    assert_eq!(store.changing_region().current_slot(), 2);
    assert!(close(store.record().actuator_percent().get(), 30.0, 0.005));
    assert_eq!(store.record().reason().get(), SaveReason::PowerDownSave);
}

#[test]
fn corrupted_newest_slot_falls_back_to_the_previous_one() {
    let mut store = FlashStore::load(MockFlash::new());
    store.set_actuator_percent(10.0, SaveReason::PowerDownSave);
    store.commit().expect("first");
    store.set_actuator_percent(20.0, SaveReason::PowerDownSave);
    store.commit().expect("second");

    let newest = store.changing_region().base() + 4;
    let mut flash = store.into_device();
    flash.flip_bit(newest, 3);

    let store = FlashStore::load(flash);
    assert_eq!(store.changing_region().current_slot(), 0);
    assert!(close(store.record().actuator_percent().get(), 10.0, 0.005));
}

#[test]
fn corrupted_only_slot_loads_defaults() {
    let mut store = FlashStore::load(MockFlash::new());
    store.set_actuator_percent(55.0, SaveReason::PowerDownSave);
    store.record_mut().set_gauge_calibration(CALIBRATION);
    store.commit().expect("commit");

    let changing = store.changing_region().base();
    let constant = store.constant_region().base();
    let mut flash = store.into_device();
    flash.flip_bit(changing, 0);
    flash.flip_bit(constant + 21, 7);

    let store = FlashStore::load(flash);
    let record = store.record();
    assert!(!record.actuator_percent().was_valid());
    assert!(!record.reason().was_valid());
    assert_eq!(record.actuator_percent().get(), 0.0);
    assert_eq!(record.reason().get(), SaveReason::InitialMovement);
    assert!(!record.gauge_calibration().was_valid());
    assert_eq!(record.gauge_calibration().get(), DEFAULT_GAUGE_CALIBRATION);
}

#[test]
fn every_bit_of_the_position_slot_is_covered() {
    for byte in 0..4 {
        for bit in 0..8 {
            let mut store = FlashStore::load(MockFlash::new());
            store.set_actuator_percent(55.0, SaveReason::PowerDownSave);
            store.record_mut().set_gauge_calibration(CALIBRATION);
            store.commit().expect("commit");

            let slot = store.changing_region().base();
            let mut flash = store.into_device();
            flash.flip_bit(slot + byte, bit);

            let store = FlashStore::load(flash);
            let record = store.record();
            assert!(
                !record.actuator_percent().was_valid(),
                "byte {byte} bit {bit} went unnoticed"
            );
            assert!(!record.reason().was_valid());
            assert_eq!(record.actuator_percent().get(), 0.0);
            assert!(record.gauge_calibration().was_valid());
        }
    }
}

#[test]
fn every_bit_of_the_calibration_slot_is_covered() {
    for byte in 0..22 {
        for bit in 0..8 {
            let mut store = FlashStore::load(MockFlash::new());
            store.set_actuator_percent(55.0, SaveReason::PowerDownSave);
            store.record_mut().set_gauge_calibration(CALIBRATION);
            store.commit().expect("commit");

            let slot = store.constant_region().base();
            let mut flash = store.into_device();
            flash.flip_bit(slot + byte, bit);

            let store = FlashStore::load(flash);
            let record = store.record();
            assert!(
                !record.gauge_calibration().was_valid(),
                "byte {byte} bit {bit} went unnoticed"
            );
            assert_eq!(record.gauge_calibration().get(), DEFAULT_GAUGE_CALIBRATION);
            assert!(record.actuator_percent().was_valid());
        }
    }
}

#[test]
fn double_word_device_only_programs_erased_units() {
    let mut store = FlashStore::load(MockFlash::strict());
    assert_eq!(store.changing_region().slots(), FLASH_SECTOR / 8);

    store.record_mut().set_gauge_calibration(CALIBRATION);
    for percent in [10.0, 20.0, 30.0] {
        store.set_actuator_percent(percent, SaveReason::SavedPositionLazy);
        store.commit().expect("append onto a partly programmed region");
    }
    store.record_mut().set_gauge_calibration([85.0, 70.0, 60.0, 50.0, 35.0]);
    store.commit().expect("second calibration slot");

    let store = reload_flash(store);
    assert_eq!(store.changing_region().current_slot(), 2);
    assert_eq!(store.constant_region().current_slot(), 1);
    assert!(close(store.record().actuator_percent().get(), 30.0, 0.005));
    assert_eq!(
        store.record().gauge_calibration().get(),
        [85.0, 70.0, 60.0, 50.0, 35.0]
    );
}

#[test]
fn double_word_device_wraps_after_erasing() {
    let mut store = FlashStore::load(MockFlash::strict());
    let slots = store.changing_region().slots();

    for index in 0..=slots {
        store.set_actuator_percent((index + 1) as f32 * 0.1, SaveReason::SavedPositionLazy);
        store.commit().expect("strict append");
    }
    assert_eq!(store.device().erases, 1);
    assert_eq!(store.changing_region().current_slot(), 0);

    let store = reload_flash(store);
    assert!(close(
        store.record().actuator_percent().get(),
        (slots + 1) as f32 * 0.1,
        0.005
    ));
}

#[test]
fn failed_program_keeps_fields_dirty() {
    let mut store = FlashStore::load(MockFlash::new());
    store.device_mut().fail_programs = true;
    store.set_actuator_percent(12.0, SaveReason::InitialMovement);

    let err = store.commit().expect_err("program should fail");
    assert!(matches!(err, StorageError::Flash(_)), "unexpected error: {err:?}");
    assert!(store.record().actuator_percent().changed());

    store.device_mut().fail_programs = false;
    store.commit().expect("retry should succeed");
    let store = reload_flash(store);
    assert!(close(store.record().actuator_percent().get(), 12.0, 0.005));
}

#[test]
fn flash_zap_erases_both_regions() {
    let mut store = FlashStore::load(MockFlash::new());
    store.set_actuator_percent(70.0, SaveReason::PowerDownSave);
    store.record_mut().set_gauge_calibration(CALIBRATION);
    store.commit().expect("commit");

    store.zap().expect("zap");
    assert_eq!(store.device().erases, 2);
    assert_eq!(store.record().actuator_percent().get(), 0.0);
    assert!(!store.changing_region().is_valid());

    let store = reload_flash(store);
    assert!(!store.record().actuator_percent().was_valid());
    assert!(!store.record().gauge_calibration().was_valid());
}

#[test]
fn flash_reports_region_status() {
    let mut store = FlashStore::load(MockFlash::new());
    store.set_actuator_percent(5.0, SaveReason::InitialMovement);
    store.commit().expect("commit");

    match store.raw_command(RawCommand::RegionStatus) {
        Some(RawResponse::Regions([constant, changing])) => {
            assert_eq!(constant.name, "constant");
            assert!(!constant.valid);
            assert_eq!(changing.name, "changing");
            assert!(changing.valid);
            assert_eq!(changing.programs, 1);
        }
        other => panic!("unexpected raw response: {other:?}"),
    }
    assert!(store.raw_command(RawCommand::Probe).is_none());
}

#[test]
fn fram_round_trip_and_immediate_saves() {
    let mut store = FramStore::load(MockFram::new());
    assert!(store.unlimited_updates());
    assert!(!store.record().actuator_percent().was_valid());

    store.set_actuator_percent(42.5, SaveReason::SavedPositionImmediate);
    store.record_mut().set_gauge_calibration(CALIBRATION);
    store.commit().expect("commit");

    let store = reload_fram(store);
    let record = store.record();
    assert_eq!(record.actuator_percent().get(), 42.5);
    assert_eq!(record.reason().get(), SaveReason::SavedPositionImmediate);
    assert_eq!(record.gauge_calibration().get(), CALIBRATION);
    assert!(record.actuator_percent().was_valid());
    assert!(record.gauge_calibration().was_valid());
}

#[test]
fn fram_writes_only_changed_fields() {
    let mut store = FramStore::load(MockFram::new());
    store.set_actuator_percent(10.0, SaveReason::SavedPositionImmediate);
    store.commit().expect("commit");
    let writes = store.transport().writes;

    store.commit().expect("idle commit");
    assert_eq!(store.transport().writes, writes);

    // Percent and CRC only; the reason is unchanged.
    store.set_actuator_percent(11.0, SaveReason::SavedPositionImmediate);
    store.commit().expect("commit");
    assert_eq!(store.transport().writes, writes + 2);
}

#[test]
fn torn_fram_update_is_caught_at_load() {
    let mut store = FramStore::load(MockFram::new());
    store.set_actuator_percent(40.0, SaveReason::SavedPositionImmediate);
    store.commit().expect("commit");

    store.transport_mut().writes_before_failure = Some(1);
    store.set_actuator_percent(60.0, SaveReason::SavedPositionImmediate);
    let err = store.commit().expect_err("crc write should fail");
    assert_eq!(err, StorageError::TransportTimeoutOrNack);
    assert!(store.record().actuator_percent().changed());

    let mut transport = store.into_transport();
    transport.writes_before_failure = None;
    let store = FramStore::load(transport);
    assert!(!store.record().actuator_percent().was_valid());
    assert!(!store.record().reason().was_valid());
    assert_eq!(store.record().actuator_percent().get(), 0.0);
}

#[test]
fn fram_zap_clears_the_table() {
    let mut store = FramStore::load(MockFram::new());
    store.set_actuator_percent(90.0, SaveReason::PowerDownSave);
    store.record_mut().set_gauge_calibration(CALIBRATION);
    store.commit().expect("commit");

    store.zap().expect("zap");
    assert!(store.transport().memory.iter().all(|&byte| byte == 0));
    assert!(!store.record().dirty());

    let store = reload_fram(store);
    assert!(!store.record().actuator_percent().was_valid());
    assert!(!store.record().gauge_calibration().was_valid());
}

#[test]
fn fram_raw_access() {
    let mut store = FramStore::load(MockFram::new());

    match store.raw_command(RawCommand::Write {
        address: 0x100,
        bytes: &[1, 2, 3],
    }) {
        Some(RawResponse::Written(3)) => {}
        other => panic!("unexpected raw response: {other:?}"),
    }
    match store.raw_command(RawCommand::Read {
        address: 0x100,
        len: 3,
    }) {
        Some(RawResponse::Bytes(bytes)) => assert_eq!(bytes.as_slice(), &[1, 2, 3]),
        other => panic!("unexpected raw response: {other:?}"),
    }
    assert_eq!(
        store.raw_command(RawCommand::Probe),
        Some(RawResponse::Probed(true))
    );
    assert!(store.raw_command(RawCommand::RegionStatus).is_none());
}

#[test]
fn backend_prefers_fram_when_present() {
    let backend = NvBackend::select(MockFram::new(), MockFlash::new());
    assert!(backend.is_fram());
    assert_eq!(backend.name(), "FRAM");
    assert!(backend.unlimited_updates());
}

#[test]
fn backend_falls_back_to_flash() {
    let mut backend = NvBackend::select(MockFram::absent(), MockFlash::new());
    assert!(!backend.is_fram());
    assert_eq!(backend.name(), "FLASH");

    backend.set_actuator_percent(33.0, SaveReason::PowerDownSave);
    backend.commit().expect("commit");
    assert!(backend.close_enough(33.05));
}
