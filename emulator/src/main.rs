mod script;
mod session;
mod sim;

use std::env;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process;

use session::Session;

const USAGE: &str = "Usage: button-emulator [--transcript <path>] [script]";

struct Options {
    script: Option<PathBuf>,
    transcript: Option<PathBuf>,
}

fn main() -> io::Result<()> {
    let options = parse_args().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let mut session = Session::new(options.transcript.as_deref())?;
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    match options.script {
        Some(path) => {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                writeln!(writer, "> {line}")?;
                run_line(&mut session, &line, &mut writer)?;
                if session.is_closed() {
                    break;
                }
            }
        }
        None => repl(&mut session, &mut writer)?,
    }

    Ok(())
}

fn repl(session: &mut Session, writer: &mut impl Write) -> io::Result<()> {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut line = String::new();

    writeln!(
        writer,
        "Home Buttons emulator ready. Type `help` for commands or `quit` to exit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        run_line(session, &line, writer)?;
        if session.is_closed() {
            break;
        }
    }

    Ok(())
}

fn run_line(session: &mut Session, line: &str, writer: &mut impl Write) -> io::Result<()> {
    for output in session.handle_command(line)? {
        writeln!(writer, "{output}")?;
    }
    Ok(())
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        script: None,
        transcript: None,
    };
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(value) = arg.strip_prefix("--transcript=") {
            options.transcript = Some(PathBuf::from(value));
        } else if arg == "--transcript" {
            let value = args
                .next()
                .ok_or_else(|| "Expected path after --transcript".to_string())?;
            options.transcript = Some(PathBuf::from(value));
        } else if arg.starts_with('-') {
            return Err(format!("Unknown option `{arg}`"));
        } else if options.script.replace(PathBuf::from(&arg)).is_some() {
            return Err("Only one script may be given".to_string());
        }
    }
    Ok(options)
}
