//! # TS Writer
//!
//! The top of the engine: owns the output sink, optionally a buffered
//! pacing pipeline (required for UDP output), and optionally a command
//! channel (TCP output only). Packets go in one at a time through
//! [`TsWriter::write`]; [`TsWriter::close`] shuts the pipeline down in
//! order and waits for everything in flight to drain.

use crate::buffer::ring;
use crate::command::{Command, CommandInput, CommandState};
use crate::config::PacingConfig;
use crate::error::{PumpError, Result};
use crate::pace::{run_pacer, BufferedOutput};
use crate::sink::TsSink;
use crate::{TS_PACKET_SIZE, TS_SYNC_BYTE};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Where command bytes are actually read from.
enum CommandSource {
    /// The output TCP stream itself.
    Socket,
    /// The process's standard input.
    Stdin(io::Stdin),
}

/// The buffered half: the producer-side accumulator plus the handle of
/// the consumer task draining the ring.
struct Buffering {
    output: BufferedOutput,
    pacer: JoinHandle<Result<()>>,
}

/// Keep `keep` packets, then omit `omit`, repeatedly. A deliberately
/// degraded output for testing receivers.
struct PacketDrop {
    keep: u32,
    omit: u32,
    kept: u32,
    omitting: u32,
}

impl PacketDrop {
    fn should_drop(&mut self) -> bool {
        if self.omitting > 0 {
            self.omitting -= 1;
            return true;
        }
        if self.kept < self.keep {
            self.kept += 1;
            return false;
        }
        self.kept = 0;
        self.omitting = self.omit - 1;
        true
    }
}

/// A writer of MPEG transport stream packets.
///
/// Packets are written one at a time, tagged with their PID and any PCR
/// they carry. For file, stdout and TCP output the packet goes straight to
/// the sink; for UDP output, [`TsWriter::start_buffering`] must be called
/// first, after which packets flow through a circular buffer to a pacing
/// task that sends them at the rate the stream's PCRs imply.
///
/// ```no_run
/// use tspump::{PacingConfig, TsWriter};
///
/// #[tokio::main]
/// async fn main() -> tspump::Result<()> {
///     let mut writer = TsWriter::open_udp("239.255.1.1", 10000, None).await?;
///     writer.start_buffering(&PacingConfig::default())?;
///     let packet = [0x47u8; 188];
///     writer.write(&packet, 0x100, None).await?;
///     writer.close().await
/// }
/// ```
pub struct TsWriter {
    sink: Option<TsSink>,
    buffering: Option<Buffering>,
    command: CommandState,
    command_source: Option<CommandSource>,
    count: u64,
    drop: Option<PacketDrop>,
}

impl TsWriter {
    /// Wraps an already-opened sink.
    pub fn new(sink: TsSink) -> Self {
        Self {
            sink: Some(sink),
            buffering: None,
            command: CommandState::new(),
            command_source: None,
            count: 0,
            drop: None,
        }
    }

    /// Opens a file for TS output, or standard output when `path` is
    /// `None`.
    pub async fn open_file(path: Option<&std::path::Path>) -> Result<Self> {
        let sink = match path {
            Some(path) => TsSink::file(path).await?,
            None => TsSink::stdout(),
        };
        Ok(Self::new(sink))
    }

    /// Opens a network connection for TS output, TCP or UDP.
    pub async fn open_connection(use_tcp: bool, host: &str, port: u16) -> Result<Self> {
        let sink = if use_tcp {
            TsSink::tcp(host, port).await?
        } else {
            TsSink::udp(host, port, None).await?
        };
        Ok(Self::new(sink))
    }

    /// Opens UDP output to `host:port`, with an optional outgoing
    /// interface for multicast destinations. Buffered pacing must be
    /// started before any packet is written.
    pub async fn open_udp(host: &str, port: u16, multicast_if: Option<&str>) -> Result<Self> {
        Ok(Self::new(TsSink::udp(host, port, multicast_if).await?))
    }

    /// Waits for a client to connect and then writes TS data to it (and
    /// can listen for commands from it). TCP only.
    pub async fn wait_for_client(listener: &TcpListener) -> Result<Self> {
        Ok(Self::new(TsSink::accept(listener).await?))
    }

    /// Sets up the circular buffer and spawns the pacing task that drains
    /// it. Required for UDP output and not supported for anything else:
    /// paced emission only makes sense where the transport itself imposes
    /// no timing.
    pub fn start_buffering(&mut self, config: &PacingConfig) -> Result<()> {
        config.validate()?;
        if self.buffering.is_some() {
            return Err(PumpError::Config("buffering already started".into()));
        }
        match self.sink {
            Some(TsSink::Udp(_)) => {}
            Some(_) => {
                return Err(PumpError::Config(
                    "buffered output is only supported for UDP".into(),
                ))
            }
            None => return Err(PumpError::Sink("writer is closed".into())),
        }
        let Some(TsSink::Udp(socket)) = self.sink.take() else {
            unreachable!("checked above");
        };

        let (producer, consumer) = ring(config.circ_buf_size, config.packets_per_item);
        let output = BufferedOutput::new(producer, config);
        let pacer = tokio::spawn(run_pacer(consumer, socket, config.clone()));
        self.buffering = Some(Buffering { output, pacer });
        debug!(
            items = config.circ_buf_size,
            packets_per_item = config.packets_per_item,
            "buffered output started"
        );
        Ok(())
    }

    /// Starts watching for single-character commands while writing. Only
    /// supported for TCP output; the output stream is thereafter written
    /// with readiness checks so a command can always get through. The
    /// command state starts out paused.
    pub fn start_input(&mut self, input: CommandInput) -> Result<()> {
        match self.sink {
            Some(TsSink::Tcp(_)) => {}
            _ => {
                return Err(PumpError::Config(
                    "command input is only supported for TCP/IP".into(),
                ))
            }
        }
        self.command_source = Some(match input {
            CommandInput::OutputSocket => CommandSource::Socket,
            CommandInput::Stdin => CommandSource::Stdin(io::stdin()),
        });
        self.command = CommandState::new();
        Ok(())
    }

    /// The most recent command received.
    pub fn command(&self) -> Command {
        self.command.current
    }

    /// True if a new command has arrived since the last acknowledgement.
    /// While the command currently being executed has declared itself
    /// atomic, changes stay hidden until atomicity is lifted. Always
    /// false when command input is not enabled.
    pub fn command_changed(&self) -> bool {
        if self.command_source.is_none() || self.command.atomic {
            false
        } else {
            self.command.changed
        }
    }

    /// Acknowledges the current command; [`TsWriter::command_changed`]
    /// reports false until the next one arrives.
    pub fn acknowledge_command(&mut self) {
        self.command.changed = false;
    }

    /// Marks the current command as (not) interruptible. Skip commands
    /// only make sense run to completion; while atomic is set, newly
    /// arriving commands are held back from [`TsWriter::command_changed`].
    pub fn set_command_atomic(&mut self, atomic: bool) {
        self.command.atomic = atomic;
    }

    /// Blocks until a new command arrives. Used after a pause: there is
    /// nothing to write, so the only thing worth waiting on is the
    /// command channel.
    pub async fn wait_for_command(&mut self) -> Result<()> {
        let source = self.command_source.as_mut().ok_or_else(|| {
            PumpError::Config("cannot wait for commands when command input is not enabled".into())
        })?;
        while !self.command.changed {
            match source {
                CommandSource::Socket => {
                    let Some(TsSink::Tcp(stream)) = self.sink.as_mut() else {
                        return Err(PumpError::Sink("writer is closed".into()));
                    };
                    read_command_from_socket(stream, &mut self.command).await?;
                }
                CommandSource::Stdin(stdin) => {
                    read_command_from_stdin(stdin, &mut self.command).await;
                }
            }
        }
        Ok(())
    }

    /// The next committed item tells the pacer to restart its timeline.
    /// Only meaningful for buffered output; otherwise a no-op.
    pub fn mark_discontinuity(&mut self) {
        if let Some(buffering) = &mut self.buffering {
            buffering.output.mark_discontinuity();
        }
    }

    /// Degrades the output for testing: repeatedly write `keep` packets,
    /// then silently discard `omit`. Passing zero for either disables the
    /// degradation.
    pub fn set_packet_drop(&mut self, keep: u32, omit: u32) {
        self.drop = if keep == 0 || omit == 0 {
            None
        } else {
            Some(PacketDrop {
                keep,
                omit,
                kept: 0,
                omitting: 0,
            })
        };
    }

    /// Packets actually written so far (dropped packets are not counted).
    pub fn packets_written(&self) -> u64 {
        self.count
    }

    /// Writes one TS packet. `pid` is the packet's PID and `pcr` the PCR
    /// from its adaptation field, if it carried one; both are only
    /// consulted by buffered (paced) output.
    ///
    /// For TCP output with command input enabled, this call also services
    /// the command channel; check [`TsWriter::command_changed`] between
    /// writes.
    pub async fn write(
        &mut self,
        packet: &[u8; TS_PACKET_SIZE],
        pid: u16,
        pcr: Option<u64>,
    ) -> Result<()> {
        if let Some(drop) = &mut self.drop {
            if drop.should_drop() {
                return Ok(());
            }
        }

        if let Some(buffering) = &mut self.buffering {
            let index = self.count;
            self.count += 1;
            return buffering.output.write(packet, index, pid, pcr).await;
        }

        let sink = self
            .sink
            .as_mut()
            .ok_or_else(|| PumpError::Sink("writer is closed".into()))?;
        match sink {
            TsSink::Udp(_) => {
                return Err(PumpError::Config(
                    "UDP output requires start_buffering before writing".into(),
                ))
            }
            TsSink::Tcp(stream) => {
                if packet[0] != TS_SYNC_BYTE {
                    // Never put a non-TS packet on the wire.
                    warn!("dropping packet without TS sync byte");
                } else if let Some(source) = self.command_source.as_mut() {
                    send_tcp_multiplexed(stream, source, &mut self.command, packet).await?;
                } else {
                    stream.write_all(packet).await?;
                }
            }
            _ => sink.send_all(packet).await?,
        }
        self.count += 1;
        Ok(())
    }

    /// Closes the writer: flushes any partial buffered item, sends the
    /// end-of-stream sentinel, waits for the pacing task to drain the
    /// ring and exit, then flushes and drops the sink.
    pub async fn close(mut self) -> Result<()> {
        if let Some(mut buffering) = self.buffering.take() {
            buffering.output.write_eof().await?;
            info!("waiting for pacer to finish writing");
            match buffering.pacer.await {
                Ok(result) => result?,
                Err(join_error) => {
                    return Err(PumpError::Buffer(format!("pacer task failed: {join_error}")))
                }
            }
        }
        if let Some(mut sink) = self.sink.take() {
            sink.flush().await?;
        }
        info!(packets = self.count, "output complete");
        Ok(())
    }
}

/// Sends `data` over a TCP stream that is also carrying commands back to
/// us. Waits for the socket with explicit readiness interest so a command
/// can be picked up while the peer is not accepting data; a readable
/// command channel and a writable sink arriving together are both handled
/// before looping.
async fn send_tcp_multiplexed(
    stream: &mut TcpStream,
    source: &mut CommandSource,
    command: &mut CommandState,
    data: &[u8],
) -> Result<()> {
    let mut start = 0;
    match source {
        CommandSource::Socket => {
            while start < data.len() {
                // Only look for a new command once the previous one has
                // been acknowledged.
                let interest = if command.changed {
                    Interest::WRITABLE
                } else {
                    Interest::READABLE | Interest::WRITABLE
                };
                let ready = stream.ready(interest).await?;

                if ready.is_readable() && !command.changed {
                    let mut byte = [0u8; 1];
                    match stream.try_read(&mut byte) {
                        Ok(0) => command.quit_on_channel_loss("eof"),
                        Ok(_) => command.apply_byte(byte[0]),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            warn!(error = %e, "error reading command");
                            command.quit_on_channel_loss("read error");
                        }
                    }
                }

                if ready.is_writable() {
                    match stream.try_write(&data[start..]) {
                        Ok(written) => start += written,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        CommandSource::Stdin(stdin) => {
            while start < data.len() {
                tokio::select! {
                    byte = stdin.read_u8(), if !command.changed => match byte {
                        Ok(byte) => command.apply_byte(byte),
                        Err(_) => command.quit_on_channel_loss("stdin closed"),
                    },
                    ready = stream.writable() => {
                        ready?;
                        match stream.try_write(&data[start..]) {
                            Ok(written) => start += written,
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                            Err(e) => return Err(e.into()),
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Reads one command byte from the output socket.
async fn read_command_from_socket(stream: &mut TcpStream, command: &mut CommandState) -> Result<()> {
    stream.ready(Interest::READABLE).await?;
    let mut byte = [0u8; 1];
    match stream.try_read(&mut byte) {
        Ok(0) => command.quit_on_channel_loss("eof"),
        Ok(_) => command.apply_byte(byte[0]),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => {
            warn!(error = %e, "error reading command");
            command.quit_on_channel_loss("read error");
        }
    }
    Ok(())
}

/// Reads one command byte from standard input.
async fn read_command_from_stdin(stdin: &mut io::Stdin, command: &mut CommandState) {
    match stdin.read_u8().await {
        Ok(byte) => command.apply_byte(byte),
        Err(_) => command.quit_on_channel_loss("stdin closed"),
    }
}
