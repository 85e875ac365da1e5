//! Operator console.
//!
//! Bytes arrive one at a time from the serial link and are assembled into
//! lines. Each line is parsed with `winnow` into a [`ConsoleCommand`] and
//! applied to the persistent store with [`execute`].
//!
//! ```text
//! print | p            show the stored record
//! zap yes              wipe persistent storage
//! commit               write changed fields
//! cal <f> x5           store a gauge calibration
//! probe                check the storage device answers
//! read <addr> <len>    raw read
//! write <addr> <b>...  raw write
//! regions              flash slot usage
//! help | ?
//! ```

use core::fmt;
use core::str;

use heapless::Vec;
use winnow::ascii::{dec_uint, float, hex_uint, space0, space1};
use winnow::combinator::{alt, delimited, eof, preceded, terminated};
use winnow::error::ContextError;
use winnow::prelude::*;

use crate::nvstate::{
    GaugeCalibration, NvStore, PersistedRecord, RawCommand, RawResponse, StorageError,
    is_valid_calibration,
};

/// Longest accepted console line, excluding the terminator.
pub const MAX_LINE_LEN: usize = 96;

/// Most bytes accepted by one `write` command.
pub const MAX_WRITE_BYTES: usize = 16;

#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleCommand {
    Print,
    Zap { confirmed: bool },
    Commit,
    Calibrate(GaugeCalibration),
    Probe,
    Read { address: u32, len: usize },
    Write { address: u32, bytes: Vec<u8, MAX_WRITE_BYTES> },
    Regions,
    Help,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConsoleError {
    LineOverflow,
    InvalidUtf8,
    Syntax,
}

impl fmt::Display for ConsoleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleError::LineOverflow => f.write_str("line too long"),
            ConsoleError::InvalidUtf8 => f.write_str("invalid UTF-8"),
            ConsoleError::Syntax => f.write_str("?"),
        }
    }
}

fn number<O>(input: &mut &str) -> Result<O, ContextError>
where
    O: winnow::ascii::Uint + winnow::ascii::HexUint,
{
    alt((preceded(alt(("0x", "0X")), hex_uint), dec_uint)).parse_next(input)
}

fn calibration(input: &mut &str) -> Result<GaugeCalibration, ContextError> {
    let mut points = [0.0_f32; 5];
    for point in &mut points {
        *point = preceded(space1, float).parse_next(input)?;
    }
    Ok(points)
}

fn write_bytes(input: &mut &str) -> Result<Vec<u8, MAX_WRITE_BYTES>, ContextError> {
    let mut bytes = Vec::new();
    while bytes.len() < MAX_WRITE_BYTES {
        let checkpoint = *input;
        match preceded(space1, number::<u8>).parse_next(input) {
            Ok(byte) => {
                // Bounded by the loop condition.
                let _ = bytes.push(byte);
            }
            Err(_) => {
                *input = checkpoint;
                break;
            }
        }
    }
    Ok(bytes)
}

#[allow(clippy::cast_possible_truncation)]
fn read(input: &mut &str) -> Result<ConsoleCommand, ContextError> {
    let address = preceded(space1, number::<u32>).parse_next(input)?;
    let len = preceded(space1, number::<u32>).parse_next(input)?;
    Ok(ConsoleCommand::Read {
        address,
        len: len as usize,
    })
}

fn write(input: &mut &str) -> Result<ConsoleCommand, ContextError> {
    let address = preceded(space1, number::<u32>).parse_next(input)?;
    let bytes = write_bytes(input)?;
    Ok(ConsoleCommand::Write { address, bytes })
}

fn command(input: &mut &str) -> Result<ConsoleCommand, ContextError> {
    alt((
        "print".value(ConsoleCommand::Print),
        "probe".value(ConsoleCommand::Probe),
        "p".value(ConsoleCommand::Print),
        ("zap", space1, "yes").value(ConsoleCommand::Zap { confirmed: true }),
        "zap".value(ConsoleCommand::Zap { confirmed: false }),
        "commit".value(ConsoleCommand::Commit),
        preceded("cal", calibration).map(ConsoleCommand::Calibrate),
        preceded("read", read),
        preceded("write", write),
        "regions".value(ConsoleCommand::Regions),
        alt(("help", "?")).value(ConsoleCommand::Help),
    ))
    .parse_next(input)
}

/// Parses one console line.
///
/// # Errors
///
/// Returns [`ConsoleError::Syntax`] when the line is not a known command.
pub fn parse(line: &str) -> Result<ConsoleCommand, ConsoleError> {
    delimited(space0, command, terminated(space0, eof))
        .parse(line)
        .map_err(|_| ConsoleError::Syntax)
}

/// Assembles console bytes into lines.
#[derive(Default)]
pub struct LineBuffer {
    buffer: Vec<u8, MAX_LINE_LEN>,
}

impl LineBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feeds one byte. Returns the parsed command once a non-empty line is
    /// terminated, or the error that discarded the line.
    pub fn ingest(&mut self, byte: u8) -> Option<Result<ConsoleCommand, ConsoleError>> {
        match byte {
            b'\r' | b'\n' => {
                if self.buffer.is_empty() {
                    return None;
                }
                let result = str::from_utf8(&self.buffer)
                    .map_err(|_| ConsoleError::InvalidUtf8)
                    .and_then(parse);
                self.buffer.clear();
                Some(result)
            }
            0x08 | 0x7f => {
                self.buffer.pop();
                None
            }
            value => {
                if self.buffer.push(value).is_err() {
                    self.buffer.clear();
                    return Some(Err(ConsoleError::LineOverflow));
                }
                None
            }
        }
    }

    #[must_use]
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

/// Printable snapshot of the persistent store.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StoreReport {
    pub backend: &'static str,
    pub unlimited_updates: bool,
    pub record: PersistedRecord,
}

impl StoreReport {
    pub fn capture<S: NvStore>(store: &S) -> Self {
        Self {
            backend: store.name(),
            unlimited_updates: store.unlimited_updates(),
            record: *store.record(),
        }
    }
}

fn flags(changed: bool, was_valid: bool) -> &'static str {
    match (changed, was_valid) {
        (true, true) => "changed, was valid",
        (true, false) => "changed",
        (false, true) => "was valid",
        (false, false) => "default",
    }
}

impl fmt::Display for StoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let endurance = if self.unlimited_updates {
            "unlimited"
        } else {
            "limited"
        };
        writeln!(f, "backend: {} ({endurance} updates)", self.backend)?;

        let calibration = self.record.gauge_calibration();
        write!(f, "gauge calibration:")?;
        for point in calibration.get() {
            write!(f, " {point:.2}")?;
        }
        writeln!(
            f,
            " [{}]",
            flags(calibration.changed(), calibration.was_valid())
        )?;

        let percent = self.record.actuator_percent();
        writeln!(
            f,
            "actuator percent: {:.2} [{}]",
            percent.get(),
            flags(percent.changed(), percent.was_valid())
        )?;

        let reason = self.record.reason();
        write!(
            f,
            "reason: {} [{}]",
            reason.get(),
            flags(reason.changed(), reason.was_valid())
        )
    }
}

/// Outcome of an executed console command.
#[derive(Clone, Debug, PartialEq)]
pub enum ConsoleReply {
    Report(StoreReport),
    ConfirmZap,
    Zapped,
    Committed,
    Calibrated(GaugeCalibration),
    /// Calibration failed range or monotonicity checks.
    Rejected,
    Raw(RawResponse),
    /// The backend does not handle this raw command.
    Unsupported,
    Failed(StorageError),
    Help,
}

impl fmt::Display for ConsoleReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleReply::Report(report) => fmt::Display::fmt(report, f),
            ConsoleReply::ConfirmZap => f.write_str("erase all remembered settings? use `zap yes`"),
            ConsoleReply::Zapped => f.write_str("zapped!"),
            ConsoleReply::Committed => f.write_str("committed"),
            ConsoleReply::Calibrated(points) => {
                f.write_str("calibrated:")?;
                for point in points {
                    write!(f, " {point:.2}")?;
                }
                Ok(())
            }
            ConsoleReply::Rejected => f.write_str("** REJECTED!"),
            ConsoleReply::Raw(response) => fmt_raw(response, f),
            ConsoleReply::Unsupported => f.write_str("?"),
            ConsoleReply::Failed(err) => write!(f, "error: {err}"),
            ConsoleReply::Help => f.write_str(
                "print | zap yes | commit | cal <5 duties> | probe | read <addr> <len> | write <addr> <bytes> | regions",
            ),
        }
    }
}

fn fmt_raw(response: &RawResponse, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match response {
        RawResponse::Probed(found) => {
            f.write_str(if *found { "device present" } else { "no device" })
        }
        RawResponse::Bytes(bytes) => {
            for (index, byte) in bytes.iter().enumerate() {
                if index > 0 {
                    f.write_str(if index % 16 == 0 { "\n" } else { " " })?;
                }
                write!(f, "{byte:02x}")?;
            }
            Ok(())
        }
        RawResponse::Written(count) => write!(f, "wrote {count} bytes"),
        RawResponse::Regions(regions) => {
            for (index, region) in regions.iter().enumerate() {
                if index > 0 {
                    f.write_str("\n")?;
                }
                write!(
                    f,
                    "{} @ {:#x}: slot {}/{} {}, {} programs, {} erases",
                    region.name,
                    region.base,
                    region.current_slot,
                    region.slots,
                    if region.valid { "valid" } else { "empty" },
                    region.programs,
                    region.erases
                )?;
            }
            Ok(())
        }
        RawResponse::Failed(err) => write!(f, "error: {err}"),
    }
}

fn raw<S: NvStore>(store: &mut S, command: RawCommand<'_>) -> ConsoleReply {
    store
        .raw_command(command)
        .map_or(ConsoleReply::Unsupported, ConsoleReply::Raw)
}

/// Applies `command` to `store`.
pub fn execute<S: NvStore>(command: &ConsoleCommand, store: &mut S) -> ConsoleReply {
    match command {
        ConsoleCommand::Print => ConsoleReply::Report(StoreReport::capture(store)),
        ConsoleCommand::Zap { confirmed: false } => ConsoleReply::ConfirmZap,
        ConsoleCommand::Zap { confirmed: true } => match store.zap() {
            Ok(()) => ConsoleReply::Zapped,
            Err(err) => ConsoleReply::Failed(err),
        },
        ConsoleCommand::Commit => match store.commit() {
            Ok(()) => ConsoleReply::Committed,
            Err(err) => ConsoleReply::Failed(err),
        },
        ConsoleCommand::Calibrate(points) => {
            if !is_valid_calibration(points) {
                return ConsoleReply::Rejected;
            }
            store.record_mut().set_gauge_calibration(*points);
            match store.commit() {
                Ok(()) => ConsoleReply::Calibrated(*points),
                Err(err) => ConsoleReply::Failed(err),
            }
        }
        ConsoleCommand::Probe => raw(store, RawCommand::Probe),
        ConsoleCommand::Read { address, len } => raw(
            store,
            RawCommand::Read {
                address: *address,
                len: *len,
            },
        ),
        ConsoleCommand::Write { address, bytes } => raw(
            store,
            RawCommand::Write {
                address: *address,
                bytes,
            },
        ),
        ConsoleCommand::Regions => raw(store, RawCommand::RegionStatus),
        ConsoleCommand::Help => ConsoleReply::Help,
    }
}
