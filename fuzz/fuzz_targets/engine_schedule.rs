//! Fuzz test for the transfer engine
//!
//! Drives a send and a receive through scripted channels with arbitrary
//! per-call counts. The engine must never request more than one chunk,
//! never panic, and on success must have moved exactly the blob.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use savsend_core::mock::{ScriptedChannel, Step, pattern};
use savsend_core::{DeviceKind, Direction, MAX_CHUNK, StorageBlob, TransferEngine};

#[derive(Debug, Arbitrary)]
enum FuzzStep {
    Full,
    Accept(u16),
    Closed,
    Overreport(u16),
}

#[derive(Debug, Arbitrary)]
struct Input {
    size: u16,
    receive: bool,
    steps: Vec<FuzzStep>,
}

fuzz_target!(|input: Input| {
    let size = usize::from(input.size).max(1);
    let steps = input.steps.iter().map(|step| match *step {
        FuzzStep::Full => Step::Full,
        FuzzStep::Accept(n) => Step::Accept(usize::from(n)),
        FuzzStep::Closed => Step::Closed,
        FuzzStep::Overreport(n) => Step::Overreport(MAX_CHUNK + 1 + usize::from(n)),
    });

    let (direction, mut blob, mut channel) = if input.receive {
        let blob = StorageBlob::zeroed(DeviceKind::EEPROM, size as u32).expect("non-empty");
        let channel = ScriptedChannel::with_script(steps).with_source(pattern(size));
        (Direction::Receive, blob, channel)
    } else {
        let blob = StorageBlob::from_bytes(DeviceKind::EEPROM, pattern(size)).expect("non-empty");
        (Direction::Send, blob, ScriptedChannel::with_script(steps))
    };
    let log = channel.log();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let result = runtime.block_on(TransferEngine::default().transfer(
        direction,
        &mut blob,
        &mut channel,
        |offset| assert!(offset <= size),
    ));

    let log = log.lock().expect("log");
    assert!(log.requests.iter().all(|&r| r > 0 && r <= MAX_CHUNK));
    match result {
        Ok(report) => {
            assert_eq!(report.bytes, size);
            assert_eq!(blob.as_bytes(), &pattern(size)[..]);
        }
        Err(err) => assert!(err.offset < size),
    }
});
