use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use taps_core::actuator::Direction;
use taps_core::control::{Board, ControlConfig, Controller, DEFAULT_PROFILE};
use taps_core::gauge::CalibrationInput;
use taps_core::mailbox::{EventMailbox, MAILBOX_CAPACITY};
use taps_core::nvstate::{NvBackend, NvStore};
use taps_core::sources::{PowerEdge, TrimSwitchEdge, install_event_ticks};

use crate::board::{
    EmuBoard, LoggingMotor, MemFlash, MemFram, Memory, Scheduler, Sources, VirtualClock,
    flash_memory, fram_memory,
};

pub const HELP_TOPICS: &[(&str, &str)] = &[
    (
        "extend",
        "extend <ms>                 - hold the trim switch down (extend) for <ms>",
    ),
    (
        "retract",
        "retract <ms>                - hold the trim switch up (retract) for <ms>",
    ),
    (
        "press",
        "press <extend|retract>      - close one half of the trim switch",
    ),
    ("release", "release                     - release the trim switch"),
    (
        "advance",
        "advance <ms>                - let time pass, handling every event",
    ),
    (
        "power",
        "power <fail|restore>        - drive the supply supervisor",
    ),
    (
        "button",
        "button                      - tap the config button (runs calibration)",
    ),
    (
        "cal",
        "cal <raise|lower|accept|abort|idle> [count] - queue calibration input",
    ),
    (
        "console",
        "console <line>              - type a line on the maintenance console",
    ),
    ("status", "status                      - show actuator, gauge and store"),
    ("reboot", "reboot                      - restart with the same memory"),
    ("help", "help [topic]                - show help for a command"),
];

/// Which storage the emulated board carries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Fram,
    Flash,
}

impl Backend {
    pub fn from_tag(tag: &str) -> Result<Self, String> {
        if tag.eq_ignore_ascii_case("fram") {
            Ok(Self::Fram)
        } else if tag.eq_ignore_ascii_case("flash") {
            Ok(Self::Flash)
        } else {
            Err(format!("Unknown backend `{tag}`"))
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub backend: Backend,
    pub full_transit_ms: u32,
    pub transcript: Option<PathBuf>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Flash,
            full_transit_ms: DEFAULT_PROFILE.full_transit_ms(),
            transcript: None,
        }
    }
}

type Store = NvBackend<MemFram, MemFlash>;
type EmuController = Controller<'static, Store, LoggingMotor, EmuBoard, MAILBOX_CAPACITY>;

/// One boot of the emulated board.
struct Boot {
    sources: &'static Sources,
    clock: Rc<VirtualClock>,
    controller: EmuController,
}

impl Boot {
    fn start(options: &SessionOptions, fram: &Memory, flash: &Memory) -> Self {
        // Each boot gets fresh producer state, as after a hardware reset.
        let mailbox: &'static EventMailbox = Box::leak(Box::new(EventMailbox::new()));
        let sources: &'static Sources = Box::leak(Box::new(Sources::new(mailbox)));
        let scheduler: &'static Scheduler = Box::leak(Box::new(Scheduler::new()));
        if install_event_ticks(scheduler).is_none() {
            eprintln!("tick scheduler full");
        }

        let clock = Rc::new(VirtualClock::new(scheduler, sources));
        let store = NvBackend::select(
            MemFram::new(Rc::clone(fram), options.backend == Backend::Fram),
            MemFlash::new(Rc::clone(flash)),
        );
        let board = EmuBoard::new(Rc::clone(&clock), store.record().gauge_calibration().get());
        let config = ControlConfig::default().with_full_transit_ms(options.full_transit_ms);
        let mut controller =
            Controller::new(sources, store, LoggingMotor::default(), board, config);
        controller.boot();

        Self {
            sources,
            clock,
            controller,
        }
    }
}

pub struct Session {
    options: SessionOptions,
    fram: Memory,
    flash: Memory,
    boot: Boot,
    /// Virtual time spent in earlier boots.
    earlier_ms: u64,
    boots: u32,
    transcript: Option<TranscriptLogger>,
}

impl Session {
    pub fn new(options: SessionOptions) -> io::Result<Self> {
        let transcript = options
            .transcript
            .as_deref()
            .map(|path| TranscriptLogger::new(path, options.backend))
            .transpose()?;
        let fram = fram_memory();
        let flash = flash_memory();
        let boot = Boot::start(&options, &fram, &flash);

        Ok(Self {
            options,
            fram,
            flash,
            boot,
            earlier_ms: 0,
            boots: 1,
            transcript,
        })
    }

    fn elapsed_ms(&self) -> u64 {
        self.earlier_ms + self.boot.clock.now()
    }

    #[cfg(test)]
    fn controller(&self) -> &EmuController {
        &self.boot.controller
    }

    pub fn handle_command(&mut self, line: &str) -> io::Result<Vec<String>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let elapsed = self.elapsed_ms();
        if let Some(transcript) = self.transcript.as_mut() {
            transcript.append_line(elapsed, TranscriptRole::Host, trimmed)?;
        }

        let (verb, rest) = trimmed
            .split_once(char::is_whitespace)
            .map_or((trimmed, ""), |(verb, rest)| (verb, rest.trim()));

        let mut lines = match self.dispatch(verb, rest) {
            Ok(lines) => lines,
            Err(message) => vec![format!("ERR {message}")],
        };
        lines.extend(self.boot.controller.board_mut().take_output());

        let elapsed = self.elapsed_ms();
        if let Some(transcript) = self.transcript.as_mut() {
            for line in &lines {
                transcript.append_line(elapsed, TranscriptRole::Emulator, line)?;
            }
        }
        Ok(lines)
    }

    fn dispatch(&mut self, verb: &str, rest: &str) -> Result<Vec<String>, String> {
        match verb.to_ascii_lowercase().as_str() {
            "help" => Ok(help(rest)),
            "extend" => Ok(self.hold(TrimSwitchEdge::ExtendPressed, parse_ms(rest)?)),
            "retract" => Ok(self.hold(TrimSwitchEdge::RetractPressed, parse_ms(rest)?)),
            "press" => {
                let edge = match rest {
                    "extend" => TrimSwitchEdge::ExtendPressed,
                    "retract" => TrimSwitchEdge::RetractPressed,
                    other => return Err(format!("unknown switch half `{other}`")),
                };
                Ok(self.trim(edge))
            }
            "release" => Ok(self.trim(TrimSwitchEdge::Released)),
            "advance" => {
                self.advance(parse_ms(rest)?);
                Ok(vec![self.summary()])
            }
            "power" => {
                let edge = match rest {
                    "fail" => PowerEdge::Falling,
                    "restore" => PowerEdge::Rising,
                    other => return Err(format!("unknown power edge `{other}`")),
                };
                self.boot.sources.on_power_edge(edge);
                self.pump();
                Ok(vec![self.summary()])
            }
            "button" => {
                let posted = self.boot.sources.on_config_button(true);
                self.boot.sources.on_config_button(false);
                self.pump();
                let mut lines = Vec::new();
                if !posted {
                    lines.push("config button ignored".to_string());
                }
                lines.push(self.summary());
                Ok(lines)
            }
            "cal" => self.queue_calibration(rest),
            "console" => Ok(self.console(rest)),
            "status" => Ok(self.status()),
            "reboot" => Ok(self.reboot()),
            other => Err(format!("unknown command `{other}` (try `help`)")),
        }
    }

    fn trim(&mut self, edge: TrimSwitchEdge) -> Vec<String> {
        let posted = self.boot.sources.on_trim_switch(edge);
        self.pump();
        let mut lines = Vec::new();
        if !posted {
            lines.push("trim switch ignored".to_string());
        }
        lines.push(self.summary());
        lines
    }

    fn hold(&mut self, edge: TrimSwitchEdge, ms: u64) -> Vec<String> {
        let mut lines = self.trim(edge);
        lines.pop();
        self.advance(ms);
        lines.extend(self.trim(TrimSwitchEdge::Released));
        lines
    }

    /// Handles everything queued so far without letting time pass.
    fn pump(&mut self) -> usize {
        self.boot.controller.run_pending()
    }

    /// Lets `ms` of virtual time pass one tick at a time.
    pub fn advance(&mut self, ms: u64) {
        let mut remaining = ms;
        while remaining > 0 {
            let step = remaining.min(self.boot.clock.until_tick());
            self.boot.clock.advance(step);
            remaining -= step;
            self.pump();
        }
    }

    fn queue_calibration(&mut self, rest: &str) -> Result<Vec<String>, String> {
        let mut words = rest.split_whitespace();
        let input = match words.next() {
            Some("raise") => CalibrationInput::Raise,
            Some("lower") => CalibrationInput::Lower,
            Some("accept") => CalibrationInput::Accept,
            Some("abort") => CalibrationInput::Abort,
            Some("idle") => CalibrationInput::Idle,
            other => return Err(format!("unknown calibration input {other:?}")),
        };
        let count = match words.next() {
            Some(value) => value
                .parse()
                .map_err(|_| format!("bad count `{value}`"))?,
            None => 1,
        };
        let board = self.boot.controller.board_mut();
        board.queue_calibration(input, count);
        Ok(vec![format!(
            "{} calibration inputs queued",
            board.queued_calibration()
        )])
    }

    fn console(&mut self, line: &str) -> Vec<String> {
        for byte in line.bytes().chain([b'\r']) {
            if !self.boot.sources.post_user_command(byte) {
                self.pump();
                self.boot.sources.post_user_command(byte);
            }
        }
        self.pump();
        Vec::new()
    }

    fn reboot(&mut self) -> Vec<String> {
        self.earlier_ms = self.elapsed_ms();
        self.boots += 1;
        self.boot = Boot::start(&self.options, &self.fram, &self.flash);
        vec![format!("boot #{}", self.boots), self.summary()]
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self) -> String {
        let controller = &self.boot.controller;
        let now = controller.board().now();
        let actuator = controller.actuator();
        let direction = match actuator.direction() {
            Direction::Stopped => "stopped",
            Direction::Extending => "extending",
            Direction::Retracting => "retracting",
        };
        format!(
            "t={:.2}s actuator {:.1}% {}{} gauge {:.1}%",
            self.boot.clock.now() as f64 / 1000.0,
            actuator.percent(now),
            direction,
            if controller.is_homing() { " (homing)" } else { "" },
            controller.board().gauge_get(),
        )
    }

    fn status(&self) -> Vec<String> {
        let controller = &self.boot.controller;
        let board = controller.board();
        let record = controller.store().record();
        vec![
            self.summary(),
            format!(
                "motor {} ({} commands), movements {}, unsaved {}",
                controller.actuator().motor().state,
                controller.actuator().motor().commands,
                controller.movements(),
                controller.moved_since_save(),
            ),
            format!(
                "leds status={} heartbeat={} power={}, gauge {}",
                board.status_led,
                board.heartbeat_led,
                board.power_led,
                if board.gauge().output().powered() {
                    "on"
                } else {
                    "off"
                },
            ),
            format!(
                "store {}: {:.2}% ({}), dirty {}",
                controller.store().name(),
                record.actuator_percent().get(),
                record.reason().get().name(),
                record.dirty(),
            ),
            format!(
                "mailbox {} queued, {} dropped, faults {}",
                self.boot.sources.mailbox().queued(),
                self.boot.sources.dropped(),
                board.faults.len(),
            ),
        ]
    }
}

fn parse_ms(value: &str) -> Result<u64, String> {
    let digits = value.strip_suffix("ms").unwrap_or(value);
    if let Some(seconds) = digits.strip_suffix('s') {
        return seconds
            .parse::<u64>()
            .map(|s| s * 1000)
            .map_err(|_| format!("bad duration `{value}`"));
    }
    digits
        .parse()
        .map_err(|_| format!("bad duration `{value}`"))
}

fn help(topic: &str) -> Vec<String> {
    if !topic.is_empty() {
        if let Some((_, detail)) = HELP_TOPICS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(topic))
        {
            return vec![(*detail).to_string()];
        }
        return vec![
            format!("No help available for `{topic}`."),
            format!("Available topics: {}", help_topic_list()),
        ];
    }

    let mut lines = vec!["Available commands:".to_string()];
    for (_, detail) in HELP_TOPICS {
        lines.push(format!("  {detail}"));
    }
    lines.push("Type `help <topic>` for a specific command.".to_string());
    lines
}

fn help_topic_list() -> String {
    HELP_TOPICS
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ")
}

struct TranscriptLogger {
    writer: BufWriter<std::fs::File>,
}

impl TranscriptLogger {
    fn new(path: &Path, backend: Backend) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut logger = Self {
            writer: BufWriter::new(file),
        };
        writeln!(logger.writer, "# TAPS emulator transcript ({backend:?} backend)")?;
        writeln!(logger.writer, "# Timestamps are virtual milliseconds since first boot")?;
        writeln!(logger.writer)?;
        logger.writer.flush()?;
        Ok(logger)
    }

    fn append_line(&mut self, elapsed_ms: u64, role: TranscriptRole, line: &str) -> io::Result<()> {
        writeln!(self.writer, "[+{elapsed_ms:>7} ms] {} {line}", role.prefix())?;
        self.writer.flush()
    }
}

enum TranscriptRole {
    Host,
    Emulator,
}

impl TranscriptRole {
    fn prefix(&self) -> &'static str {
        match self {
            TranscriptRole::Host => "HOST>",
            TranscriptRole::Emulator => "EMU <",
        }
    }
}
