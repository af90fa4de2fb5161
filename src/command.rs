//! # Command Channel
//!
//! Single-character playback commands, read out-of-band while TS data is
//! being written. A client (or the user at a terminal) steers playback by
//! sending one byte at a time; the writer multiplexes those reads with its
//! own sends and surfaces the latest command to its caller.

use tracing::{trace, warn};

/// A playback command, decoded from a single byte.
///
/// Skip-a-lot commands only make sense if they run to completion, so
/// callers conventionally mark them atomic (see
/// [`crate::TsWriter::set_command_atomic`]) while acting on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `q`: stop writing and shut down.
    Quit,
    /// `n`: play at normal speed.
    Normal,
    /// `p`: pause.
    Pause,
    /// `f`: fast forward.
    Fast,
    /// `F`: fast fast forward.
    FastFast,
    /// `r`: reverse.
    Reverse,
    /// `R`: fast reverse.
    FastReverse,
    /// `>`: skip forwards a little.
    SkipForward,
    /// `<`: skip backwards a little.
    SkipBackward,
    /// `]`: skip forwards a lot.
    SkipForwardLots,
    /// `[`: skip backwards a lot.
    SkipBackwardLots,
    /// `0`..`9`: select input file N.
    SelectFile(u8),
}

impl Command {
    /// Decodes one command byte. Newlines (needed to get commands through
    /// a line-buffered terminal) and unrecognized bytes yield `None` and
    /// are ignored silently.
    pub fn from_byte(byte: u8) -> Option<Command> {
        match byte {
            b'q' => Some(Command::Quit),
            b'n' => Some(Command::Normal),
            b'p' => Some(Command::Pause),
            b'f' => Some(Command::Fast),
            b'F' => Some(Command::FastFast),
            b'r' => Some(Command::Reverse),
            b'R' => Some(Command::FastReverse),
            b'>' => Some(Command::SkipForward),
            b'<' => Some(Command::SkipBackward),
            b']' => Some(Command::SkipForwardLots),
            b'[' => Some(Command::SkipBackwardLots),
            b'0'..=b'9' => Some(Command::SelectFile(byte - b'0')),
            _ => None,
        }
    }

    /// True for the commands that callers conventionally run to
    /// completion without interruption.
    pub fn is_atomic(&self) -> bool {
        matches!(self, Command::SkipForwardLots | Command::SkipBackwardLots)
    }
}

/// Where command bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandInput {
    /// Read commands from the output socket itself (the connected client
    /// talks back on the same TCP stream).
    OutputSocket,
    /// Read commands from standard input.
    Stdin,
}

/// The writer's view of the command channel. The `changed` flag is set
/// here whenever a new command arrives and is only ever cleared by the
/// caller acknowledging it.
#[derive(Debug)]
pub(crate) struct CommandState {
    pub(crate) current: Command,
    pub(crate) changed: bool,
    pub(crate) atomic: bool,
}

impl CommandState {
    /// Command input starts paused: nothing plays until the client asks.
    pub(crate) fn new() -> Self {
        Self {
            current: Command::Pause,
            changed: false,
            atomic: false,
        }
    }

    /// Applies one byte read from the channel.
    pub(crate) fn apply_byte(&mut self, byte: u8) {
        if let Some(command) = Command::from_byte(byte) {
            trace!(?command, "command received");
            self.current = command;
            self.changed = true;
        }
    }

    /// End-of-file or a read error on the command channel both mean the
    /// client has gone away; behave as if it asked to quit.
    pub(crate) fn quit_on_channel_loss(&mut self, reason: &str) {
        warn!(reason, "command channel lost, synthesizing quit");
        self.current = Command::Quit;
        self.changed = true;
    }
}
