//! The console command grammar.

use super::{BreakpointIdentity, Command, CommandError};
use nom::branch::alt;
use nom::bytes::complete::{tag, take_till1};
use nom::character::complete::{char, digit1, hex_digit1, space1};
use nom::combinator::{all_consuming, eof, map, map_res, rest};
use nom::sequence::{preceded, separated_pair, terminated};
use nom::IResult;

pub fn parse(input: &str) -> Result<Command, CommandError> {
    let input = input.trim();
    all_consuming(command)(input)
        .map(|(_, command)| command)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| CommandError::Parsing(input.to_string()))
}

fn command(input: &str) -> IResult<&str, Command> {
    alt((
        map(verb("breakpoints"), |_| Command::BreakpointList),
        map(
            preceded(verb_arg(&["break", "b"]), location),
            Command::Break,
        ),
        map(preceded(verb_arg(&["clear"]), location), Command::Clear),
        map(verbs(&["continue", "c"]), |_| Command::Continue),
        map(verbs(&["step", "s"]), |_| Command::Step),
        map(verbs(&["next", "n"]), |_| Command::Next),
        map(
            preceded(verb_arg(&["print", "p"]), rest),
            |expr: &str| Command::Print(expr.trim().to_string()),
        ),
        map(verb("locals"), |_| Command::Locals),
        map(verb("args"), |_| Command::Arguments),
        map(verb("regs"), |_| Command::Registers),
        map(verb("threads"), |_| Command::Threads),
        map(verb("goroutines"), |_| Command::Tasks),
        map(verb("help"), |_| Command::Help),
        map(verbs(&["exit", "quit", "q"]), |_| Command::Exit),
    ))(input)
}

/// A verb that takes no arguments: the whole input must be the word.
fn verb<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(tag(word), eof)
}

fn verbs<'a>(words: &'static [&'static str]) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input| {
        for word in words {
            if let Ok(ok) = verb(word)(input) {
                return Ok(ok);
            }
        }
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Alt,
        )))
    }
}

/// A verb followed by an argument.
fn verb_arg<'a>(
    words: &'static [&'static str],
) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    move |input| {
        for word in words {
            if let Ok(ok) = terminated(tag(*word), space1::<&str, nom::error::Error<&str>>)(input) {
                return Ok(ok);
            }
        }
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Alt,
        )))
    }
}

/// `file:line`, a function name, a breakpoint number, or a `0x` address.
fn location(input: &str) -> IResult<&str, BreakpointIdentity> {
    alt((
        map_res(preceded(tag("0x"), hex_digit1), |hex| {
            usize::from_str_radix(hex, 16).map(BreakpointIdentity::Address)
        }),
        map_res(
            separated_pair(take_till1(|c| c == ':'), char(':'), digit1),
            |(file, line): (&str, &str)| {
                line.parse()
                    .map(|line| BreakpointIdentity::Line(file.to_string(), line))
            },
        ),
        map_res(terminated(digit1, eof), |number: &str| {
            number.parse().map(BreakpointIdentity::Number)
        }),
        map(take_till1(|c: char| c.is_whitespace()), |name: &str| {
            BreakpointIdentity::Function(name.to_string())
        }),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_control_verbs() {
        assert_eq!(parse("continue").unwrap(), Command::Continue);
        assert_eq!(parse("c").unwrap(), Command::Continue);
        assert_eq!(parse(" step ").unwrap(), Command::Step);
        assert_eq!(parse("next").unwrap(), Command::Next);
        assert_eq!(parse("n").unwrap(), Command::Next);
        assert_eq!(parse("exit").unwrap(), Command::Exit);
        assert_eq!(parse("q").unwrap(), Command::Exit);
    }

    #[test]
    fn test_parse_break_locations() {
        assert_eq!(
            parse("break main.go:10").unwrap(),
            Command::Break(BreakpointIdentity::Line("main.go".to_string(), 10))
        );
        assert_eq!(
            parse("b main.main").unwrap(),
            Command::Break(BreakpointIdentity::Function("main.main".to_string()))
        );
        assert_eq!(
            parse("break 0x55555555bc13").unwrap(),
            Command::Break(BreakpointIdentity::Address(0x55555555bc13))
        );
        assert_eq!(
            parse("clear 2").unwrap(),
            Command::Clear(BreakpointIdentity::Number(2))
        );
    }

    #[test]
    fn test_parse_inspection_verbs() {
        assert_eq!(
            parse("print a.b").unwrap(),
            Command::Print("a.b".to_string())
        );
        assert_eq!(parse("p x").unwrap(), Command::Print("x".to_string()));
        assert_eq!(parse("regs").unwrap(), Command::Registers);
        assert_eq!(parse("threads").unwrap(), Command::Threads);
        assert_eq!(parse("goroutines").unwrap(), Command::Tasks);
        assert_eq!(parse("breakpoints").unwrap(), Command::BreakpointList);
        assert_eq!(parse("locals").unwrap(), Command::Locals);
        assert_eq!(parse("args").unwrap(), Command::Arguments);
    }

    #[test]
    fn test_parse_rejects_junk() {
        assert!(parse("").is_err());
        assert!(parse("breakz").is_err());
        assert!(parse("break").is_err());
        assert!(parse("step now").is_err());
        assert!(parse("unknown main.go:1").is_err());
    }
}
