//! Command grammar shared by interactive sessions and script files.
//!
//! One command per line, keywords in lower case. Blank lines and lines
//! starting with `#` are skipped. Durations carry an `ms`, `s` or `m` suffix.

use core::fmt;
use core::time::Duration;

use button_core::gesture::ButtonId;
use button_core::power::HardwareRevision;
use winnow::ascii::{alpha1, dec_uint, float, space1};
use winnow::combinator::{alt, cut_err, dispatch, empty, fail, opt, preceded};
use winnow::error::{StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::{rest, take_till};

/// How the next wake starts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BootKind {
    Reset,
    Timer,
    Button(ButtonId),
}

/// Changes to the simulated power inputs.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PowerCommand {
    BatteryVolts(f32),
    BatteryAbsent,
    Dc(bool),
    Standby(bool),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command<'a> {
    Boot(BootKind),
    /// Board revision used from the next boot on.
    Board(HardwareRevision),
    Power(PowerCommand),
    Press(ButtonId),
    Release(ButtonId),
    Click { id: ButtonId, count: u8 },
    Hold { id: ButtonId, duration: Duration },
    Advance(Duration),
    Link(bool),
    Broker(bool),
    Inbound { topic: &'a str, payload: &'a str },
    Heap(u32),
    /// Replaces the stored record with a provisioned one.
    Provision(&'a str),
    Status,
    Help,
    Quit,
}

/// A line that does not match the grammar.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptError {
    pub column: usize,
    pub message: String,
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column {}: {}", self.column, self.message)
    }
}

impl std::error::Error for ScriptError {}

/// Parses one line; `Ok(None)` for blanks and comments.
///
/// # Errors
///
/// Returns the column and expectation of the first mismatch.
pub fn parse_line(line: &str) -> Result<Option<Command<'_>>, ScriptError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    command.parse(line).map(Some).map_err(|err| {
        let detail = err.inner().to_string().replace('\n', "; ");
        ScriptError {
            column: err.offset() + 1,
            message: if detail.is_empty() {
                "unrecognised command".to_owned()
            } else {
                detail
            },
        }
    })
}

fn command<'a>(input: &mut &'a str) -> ModalResult<Command<'a>> {
    dispatch! {alpha1;
        "boot" => cut_err(preceded(space1, boot_kind)).map(Command::Boot),
        "board" => cut_err(preceded(space1, board)).map(Command::Board),
        "power" => cut_err(preceded(space1, power)).map(Command::Power),
        "press" => cut_err(preceded(space1, button)).map(Command::Press),
        "release" => cut_err(preceded(space1, button)).map(Command::Release),
        "click" => cut_err(preceded(space1, click)),
        "hold" => cut_err(preceded(space1, (button, preceded(space1, duration))))
            .map(|(id, duration)| Command::Hold { id, duration }),
        "advance" => cut_err(preceded(space1, duration)).map(Command::Advance),
        "link" => cut_err(preceded(space1, switch)).map(Command::Link),
        "broker" => cut_err(preceded(space1, switch)).map(Command::Broker),
        "inbound" => cut_err(preceded(space1, inbound)),
        "heap" => cut_err(preceded(space1, dec_uint::<_, u32, _>)).map(Command::Heap),
        "provision" => cut_err(preceded(space1, word)).map(Command::Provision),
        "status" => empty.value(Command::Status),
        "help" => empty.value(Command::Help),
        "quit" | "exit" => empty.value(Command::Quit),
        _ => fail,
    }
    .parse_next(input)
}

fn boot_kind(input: &mut &str) -> ModalResult<BootKind> {
    alt((
        "reset".value(BootKind::Reset),
        "timer".value(BootKind::Timer),
        preceded(("button", space1), button).map(BootKind::Button),
    ))
    .context(StrContext::Label("wake"))
    .context(StrContext::Expected(StrContextValue::Description(
        "reset, timer or button <n>",
    )))
    .parse_next(input)
}

fn board(input: &mut &str) -> ModalResult<HardwareRevision> {
    word.verify_map(HardwareRevision::parse)
        .context(StrContext::Label("board"))
        .context(StrContext::Expected(StrContextValue::Description(
            "1.0 or 2.0 to 2.3",
        )))
        .parse_next(input)
}

fn power(input: &mut &str) -> ModalResult<PowerCommand> {
    dispatch! {alpha1;
        "battery" => preceded(
            space1,
            alt((
                "absent".value(PowerCommand::BatteryAbsent),
                float.map(PowerCommand::BatteryVolts),
            )),
        ),
        "dc" => preceded(space1, switch).map(PowerCommand::Dc),
        "standby" => preceded(space1, switch).map(PowerCommand::Standby),
        _ => fail,
    }
    .context(StrContext::Label("power input"))
    .context(StrContext::Expected(StrContextValue::Description(
        "battery <volts>|absent, dc on|off or standby on|off",
    )))
    .parse_next(input)
}

fn click<'a>(input: &mut &'a str) -> ModalResult<Command<'a>> {
    let id = button.parse_next(input)?;
    let count = opt(preceded(
        space1,
        dec_uint::<_, u8, _>.verify(|count: &u8| *count > 0),
    ))
    .parse_next(input)?;
    Ok(Command::Click {
        id,
        count: count.unwrap_or(1),
    })
}

fn inbound<'a>(input: &mut &'a str) -> ModalResult<Command<'a>> {
    let topic = word.parse_next(input)?;
    let payload = opt(preceded(space1, rest)).parse_next(input)?;
    Ok(Command::Inbound {
        topic,
        payload: payload.unwrap_or(""),
    })
}

fn button(input: &mut &str) -> ModalResult<ButtonId> {
    dec_uint::<_, u8, _>
        .verify_map(ButtonId::new)
        .context(StrContext::Label("button"))
        .context(StrContext::Expected(StrContextValue::Description("1 to 6")))
        .parse_next(input)
}

fn duration(input: &mut &str) -> ModalResult<Duration> {
    (
        dec_uint::<_, u64, _>,
        alt(("ms".value(1u64), "s".value(1_000), "m".value(60_000))),
    )
        .map(|(value, scale)| Duration::from_millis(value.saturating_mul(scale)))
        .context(StrContext::Label("duration"))
        .context(StrContext::Expected(StrContextValue::Description(
            "<n>ms, <n>s or <n>m",
        )))
        .parse_next(input)
}

fn switch(input: &mut &str) -> ModalResult<bool> {
    alt(("on".value(true), "off".value(false), "up".value(true), "down".value(false)))
        .context(StrContext::Expected(StrContextValue::Description("on/off")))
        .parse_next(input)
}

fn word<'a>(input: &mut &'a str) -> ModalResult<&'a str> {
    take_till(1.., char::is_whitespace).parse_next(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u8) -> ButtonId {
        ButtonId::new(raw).expect("valid button")
    }

    fn parse_ok(line: &str) -> Command<'_> {
        parse_line(line)
            .expect("line parses")
            .expect("line holds a command")
    }

    #[test]
    fn parses_boot_variants() {
        assert_eq!(parse_ok("boot reset"), Command::Boot(BootKind::Reset));
        assert_eq!(parse_ok("boot timer"), Command::Boot(BootKind::Timer));
        assert_eq!(
            parse_ok("boot button 3"),
            Command::Boot(BootKind::Button(id(3)))
        );
    }

    #[test]
    fn board_versions_map_to_revisions() {
        assert_eq!(
            parse_ok("board 2.1"),
            Command::Board(HardwareRevision::Rev2_0)
        );
        assert_eq!(
            parse_ok("board 1.0"),
            Command::Board(HardwareRevision::Rev1_0)
        );
        let err = parse_line("board 3.0").expect_err("unknown board");
        assert!(err.message.contains("board"), "{err}");
    }

    #[test]
    fn durations_scale_by_suffix() {
        assert_eq!(
            parse_ok("advance 250ms"),
            Command::Advance(Duration::from_millis(250))
        );
        assert_eq!(
            parse_ok("advance 4s"),
            Command::Advance(Duration::from_secs(4))
        );
        assert_eq!(
            parse_ok("hold 2 2m"),
            Command::Hold {
                id: id(2),
                duration: Duration::from_secs(120),
            }
        );
    }

    #[test]
    fn click_count_defaults_to_one() {
        assert_eq!(
            parse_ok("click 4"),
            Command::Click { id: id(4), count: 1 }
        );
        assert_eq!(
            parse_ok("click 4 3"),
            Command::Click { id: id(4), count: 3 }
        );
        assert!(parse_line("click 4 0").is_err());
    }

    #[test]
    fn power_inputs_parse() {
        assert!(matches!(
            parse_ok("power battery 3.45"),
            Command::Power(PowerCommand::BatteryVolts(volts)) if (volts - 3.45).abs() < 1e-6
        ));
        assert_eq!(
            parse_ok("power battery absent"),
            Command::Power(PowerCommand::BatteryAbsent)
        );
        assert_eq!(
            parse_ok("power dc on"),
            Command::Power(PowerCommand::Dc(true))
        );
        assert_eq!(
            parse_ok("power standby off"),
            Command::Power(PowerCommand::Standby(false))
        );
    }

    #[test]
    fn inbound_keeps_the_rest_of_the_line() {
        assert_eq!(
            parse_ok("inbound homebuttons/hall/cmd/btn_1_label Kitchen lights"),
            Command::Inbound {
                topic: "homebuttons/hall/cmd/btn_1_label",
                payload: "Kitchen lights",
            }
        );
        assert_eq!(
            parse_ok("inbound homebuttons/hall/cmd/awake_mode"),
            Command::Inbound {
                topic: "homebuttons/hall/cmd/awake_mode",
                payload: "",
            }
        );
    }

    #[test]
    fn blanks_and_comments_are_skipped() {
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("# wake on the timer"), Ok(None));
        assert_eq!(parse_ok("  status  "), Command::Status);
        assert_eq!(parse_ok("exit"), Command::Quit);
    }

    #[test]
    fn errors_point_at_the_bad_argument() {
        let err = parse_line("press 9").expect_err("button out of range");
        assert_eq!(err.column, 7);
        assert!(err.message.contains("button"), "{err}");

        let err = parse_line("advance 5h").expect_err("unknown suffix");
        assert!(err.message.contains("duration"), "{err}");

        assert!(parse_line("dance").is_err());
    }
}
