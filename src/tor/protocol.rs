//! Control protocol framing
//!
//! Reply lines are `<code><sep><text>` where `sep` is `-` (more lines follow),
//! `+` (a dot-terminated data block follows) or a space (last line of the
//! reply). Code 650 marks asynchronous event lines, which share the socket with
//! command replies but are assembled separately.

use crate::error::{Result, TorError};

/// Status code carried by asynchronous event lines
pub const EVENT_CODE: u16 = 650;

/// Line terminator for commands sent to the daemon
pub const LINE_END: &str = "\r\n";

/// Position of a reply line within its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Separator {
    /// `-`: intermediate line
    Mid,
    /// `+`: data block follows
    Data,
    /// ` `: final line
    End,
}

/// One parsed reply line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    pub code: u16,
    pub separator: Separator,
    pub text: String,
}

impl ReplyLine {
    /// Parse a raw line (terminator optional)
    pub fn parse(raw: &str) -> Result<Self> {
        let line = raw.trim_end_matches(['\r', '\n']);
        let bytes = line.as_bytes();

        if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
            return Err(TorError::Protocol(format!(
                "reply line without status code: {:?}",
                line
            )));
        }

        let code = line[..3]
            .parse::<u16>()
            .map_err(|e| TorError::Protocol(format!("bad status code in {:?}: {}", line, e)))?;

        let separator = match bytes.get(3) {
            None | Some(b' ') => Separator::End,
            Some(b'-') => Separator::Mid,
            Some(b'+') => Separator::Data,
            Some(other) => {
                return Err(TorError::Protocol(format!(
                    "unknown reply separator {:?} in {:?}",
                    *other as char, line
                )));
            },
        };

        Ok(Self {
            code,
            separator,
            text: line.get(4..).unwrap_or_default().to_string(),
        })
    }

    pub fn is_event(&self) -> bool {
        self.code == EVENT_CODE
    }
}

/// Complete reply to a command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlResponse {
    /// Status code of the final line
    pub status_code: u16,
    /// Text of each logical line; data blocks are folded into their line with `\n`
    pub lines: Vec<String>,
    /// Final status code is 5xx
    pub is_error: bool,
}

impl ControlResponse {
    pub fn new(status_code: u16, lines: Vec<String>) -> Self {
        Self {
            status_code,
            lines,
            is_error: status_code >= 500,
        }
    }

    /// Text of the final line (`OK` for most successes)
    pub fn message(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or_default()
    }

    /// Turn an error reply into [`TorError::Command`]
    pub fn into_result(self) -> Result<Self> {
        if self.is_error {
            Err(TorError::Command {
                code: self.status_code,
                message: self.message().to_string(),
            })
        } else {
            Ok(self)
        }
    }

    /// Value of a `key=value` entry, as returned by GETINFO
    pub fn value(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
        })
    }
}

/// Asynchronous notification (code 650), not tied to any command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlEvent {
    pub lines: Vec<String>,
}

impl ControlEvent {
    /// Event keyword, e.g. `STATUS_CLIENT`, `NOTICE`, `CIRC`
    pub fn keyword(&self) -> &str {
        self.first_line().split_whitespace().next().unwrap_or_default()
    }

    /// First line without its keyword
    pub fn body(&self) -> &str {
        let line = self.first_line();
        line.split_once(' ').map(|(_, rest)| rest).unwrap_or_default()
    }

    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or_default()
    }
}

/// Accumulates lines of one logical stream until its final line arrives
#[derive(Debug, Default)]
pub struct ReplyAssembler {
    lines: Vec<String>,
    data: Option<Vec<String>>,
}

impl ReplyAssembler {
    /// Feed a reply line; returns the finished lines on the final line
    pub fn push(&mut self, line: ReplyLine) -> Option<Vec<String>> {
        match line.separator {
            Separator::Mid => {
                self.lines.push(line.text);
                None
            },
            Separator::Data => {
                self.data = Some(vec![line.text]);
                None
            },
            Separator::End => {
                self.lines.push(line.text);
                Some(std::mem::take(&mut self.lines))
            },
        }
    }

    /// Feed a raw line inside a data block; returns true when the block ends
    pub fn push_data(&mut self, raw: &str) -> bool {
        let Some(block) = self.data.as_mut() else {
            return true;
        };

        if raw == "." {
            let block = self.data.take().unwrap_or_default();
            self.lines.push(block.join("\n"));
            return true;
        }

        // Leading dots are doubled on the wire
        let unescaped = if raw.starts_with("..") { &raw[1..] } else { raw };
        block.push(unescaped.to_string());
        false
    }
}

/// Output of the demultiplexer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(ControlResponse),
    Event(ControlEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Response,
    Event,
}

/// Tagged-line classifier feeding two independent assemblers
///
/// Lines with [`EVENT_CODE`] go to the event assembler, everything else to the
/// response assembler, so an event arriving between the lines of a command
/// reply cannot be mistaken for part of it.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    response: ReplyAssembler,
    event: ReplyAssembler,
    data_target: Option<Stream>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line read from the socket
    pub fn feed(&mut self, raw: &str) -> Result<Option<Frame>> {
        let raw = raw.trim_end_matches(['\r', '\n']);

        if let Some(target) = self.data_target {
            if self.assembler(target).push_data(raw) {
                self.data_target = None;
            }
            return Ok(None);
        }

        let line = ReplyLine::parse(raw)?;
        let target = if line.is_event() {
            Stream::Event
        } else {
            Stream::Response
        };
        let code = line.code;
        let separator = line.separator;

        if let Some(lines) = self.assembler(target).push(line) {
            let frame = match target {
                Stream::Response => Frame::Response(ControlResponse::new(code, lines)),
                Stream::Event => Frame::Event(ControlEvent { lines }),
            };
            return Ok(Some(frame));
        }

        if separator == Separator::Data {
            self.data_target = Some(target);
        }
        Ok(None)
    }

    fn assembler(&mut self, target: Stream) -> &mut ReplyAssembler {
        match target {
            Stream::Response => &mut self.response,
            Stream::Event => &mut self.event,
        }
    }
}

/// Terminate a command with exactly one line delimiter
pub fn format_command(command: &str) -> String {
    let mut line = command.trim_end_matches(['\r', '\n']).to_string();
    line.push_str(LINE_END);
    line
}
