//! Command interpretation and response generation.
//!
//! Every decoded line maps to exactly one command:
//!
//! ```text
//! quit   -> farewell line, then the server closes the connection
//! time   -> current local date-time
//! other  -> the line as received, prefixed with the echo marker
//! ```
//!
//! Matching ignores ASCII case and surrounding whitespace.

use chrono::Local;

/// The interpreted meaning of one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    /// Echo the line back, exactly as received.
    Echo(&'a str),
    /// Say goodbye and close the connection.
    Quit,
    /// Report the server's local time.
    TimeQuery,
}

impl Command<'_> {
    /// Whether the connection closes once this command's response is flushed.
    pub fn closes_session(&self) -> bool {
        matches!(self, Command::Quit)
    }
}

/// Interpret a decoded line. Trimming only affects matching; the echoed
/// payload is the untrimmed line.
pub fn interpret(line: &str) -> Command<'_> {
    let token = line.trim();
    if token.eq_ignore_ascii_case("quit") {
        Command::Quit
    } else if token.eq_ignore_ascii_case("time") {
        Command::TimeQuery
    } else {
        Command::Echo(line)
    }
}

/// Whether a locally typed line asks to end the session.
pub fn is_quit(line: &str) -> bool {
    interpret(line) == Command::Quit
}

/// Builds server responses. Marker text and timestamp layout are
/// presentation settings, not part of the wire contract.
#[derive(Debug, Clone)]
pub struct Responder {
    echo_marker: String,
    farewell: String,
    time_format: String,
}

impl Responder {
    pub fn new(echo_marker: String, farewell: String, time_format: String) -> Self {
        Self {
            echo_marker,
            farewell,
            time_format,
        }
    }

    /// Produce the response line for `command`, without the line feed.
    pub fn respond(&self, command: &Command<'_>) -> String {
        match command {
            Command::Echo(payload) => {
                let mut response = String::with_capacity(self.echo_marker.len() + payload.len());
                response.push_str(&self.echo_marker);
                response.push_str(payload);
                response
            }
            Command::Quit => self.farewell.clone(),
            Command::TimeQuery => Local::now().format(&self.time_format).to_string(),
        }
    }
}
