use std::io;
use std::path::PathBuf;

#[allow(dead_code)]
#[path = "../board.rs"]
mod board;
#[allow(dead_code)]
#[path = "../session.rs"]
mod session;

use session::{Backend, Session, SessionOptions};

fn main() -> io::Result<()> {
    record("homing", Backend::Flash, record_homing)?;
    record("lazy-save", Backend::Flash, record_lazy_save)?;
    record("power-fail", Backend::Flash, record_power_fail)?;
    record("console", Backend::Fram, record_console)?;
    Ok(())
}

fn record(
    name: &str,
    backend: Backend,
    script: fn(&mut Session) -> io::Result<()>,
) -> io::Result<()> {
    let mut session = Session::new(SessionOptions {
        backend,
        transcript: Some(PathBuf::from(format!("transcripts/{name}.log"))),
        ..SessionOptions::default()
    })?;
    script(&mut session)
}

fn run(session: &mut Session, lines: &[&str]) -> io::Result<()> {
    for line in lines {
        session.handle_command(line)?;
    }
    Ok(())
}

fn record_homing(session: &mut Session) -> io::Result<()> {
    run(
        session,
        &[
            "status",
            "press extend",
            "release",
            "advance 6s",
            "extend 1500",
            "status",
        ],
    )
}

fn record_lazy_save(session: &mut Session) -> io::Result<()> {
    run(
        session,
        &[
            "advance 6s",
            "extend 2000",
            "retract 500",
            "advance 16s",
            "status",
            "reboot",
            "advance 12s",
            "status",
        ],
    )
}

fn record_power_fail(session: &mut Session) -> io::Result<()> {
    run(
        session,
        &[
            "advance 6s",
            "extend 1200",
            "power fail",
            "status",
            "reboot",
            "status",
        ],
    )
}

fn record_console(session: &mut Session) -> io::Result<()> {
    run(
        session,
        &[
            "advance 6s",
            "console help",
            "console print",
            "console probe",
            "console read 0x0 16",
            "console zap",
            "console zap yes",
            "console print",
        ],
    )
}
