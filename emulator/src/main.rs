mod board;
mod session;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use session::{Backend, Session, SessionOptions};

const USAGE: &str =
    "Usage: taps-emulator [--backend <fram|flash>] [--transit <ms>] [--transcript <path>]";

fn main() -> io::Result<()> {
    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new(options)?;
    let mut line = String::new();

    writeln!(
        writer,
        "TAPS emulator ready. Type `help` for commands or `exit` to quit."
    )?;
    writeln!(writer, "{}", session.summary())?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if should_terminate(trimmed) {
            writeln!(writer, "Session closed.")?;
            break;
        }

        let responses = session.handle_command(trimmed)?;
        for response in responses {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}

fn should_terminate(input: &str) -> bool {
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn parse_options(mut args: impl Iterator<Item = String>) -> Result<SessionOptions, String> {
    let mut options = SessionOptions::default();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let mut value = || {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("Expected value after {flag}"))
        };
        match flag.as_str() {
            "--backend" => options.backend = Backend::from_tag(&value()?)?,
            "--transit" => {
                let raw = value()?;
                options.full_transit_ms = raw
                    .parse()
                    .map_err(|_| format!("Bad transit time `{raw}`"))?;
            }
            "--transcript" => options.transcript = Some(PathBuf::from(value()?)),
            other => return Err(format!("Unknown argument `{other}`")),
        }
    }
    Ok(options)
}
