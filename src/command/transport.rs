//! Request/response transport over the command socket

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, info, trace, warn};

use super::device::DroneCommand;
use super::reply::{Classified, Reply, classify};
use crate::config::CommandConfig;
use crate::{Result, SessionError};

const REPLY_BUFFER: usize = 1518;

/// Turns the drone's half-duplex UDP text protocol into a retryable call.
///
/// The device only answers the most recent command, so at most one command
/// is in flight: callers queue on the socket lock in arrival order and the
/// lock holder is the only reader of the socket.
#[derive(Debug)]
pub struct CommandTransport {
    socket: Mutex<UdpSocket>,
    device: SocketAddr,
    local_addr: SocketAddr,
    config: CommandConfig,
}

impl CommandTransport {
    /// Bind an ephemeral local port for talking to `device`.
    ///
    /// Fails with `Config` if the timeouts in `config` cannot fit every attempt.
    pub async fn bind(device: SocketAddr, config: CommandConfig) -> Result<Self> {
        config.validate()?;
        let local: SocketAddr = if device.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| SessionError::transport("bind command socket", e))?;
        let local_addr =
            socket.local_addr().map_err(|e| SessionError::transport("command socket address", e))?;

        info!(%device, %local_addr, "Command transport ready");

        Ok(Self { socket: Mutex::new(socket), device, local_addr, config })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn device(&self) -> SocketAddr {
        self.device
    }

    /// Validate and send a typed command.
    pub async fn execute(&self, command: DroneCommand) -> Result<Reply> {
        command.validate()?;
        self.send(&command.to_string()).await
    }

    /// Send a raw text command and wait for its reply.
    ///
    /// Silence, empty and unrecognized replies are retried until
    /// `max_attempts` is used up; a reply containing `error` fails at once.
    pub async fn send(&self, command: &str) -> Result<Reply> {
        let command = command.trim();
        if command.is_empty() {
            return Err(SessionError::invalid_command("empty command"));
        }

        let socket = self.socket.lock().await;
        self.call(&socket, command).await
    }

    async fn call(&self, socket: &UdpSocket, command: &str) -> Result<Reply> {
        let started = Instant::now();
        let overall_deadline = started + self.config.command_timeout();
        let max_attempts = self.config.max_attempts;
        let mut attempts = 0u32;
        let mut last_invalid: Option<String> = None;

        while attempts < max_attempts {
            let now = Instant::now();
            if now >= overall_deadline {
                break;
            }
            attempts += 1;
            let slot_end = (now + self.config.retry_delay()).min(overall_deadline);

            self.drain_stale(socket);

            debug!(command, attempt = attempts, max_attempts, "Sending command");
            if let Err(e) = socket.send_to(command.as_bytes(), self.device).await {
                warn!(command, attempt = attempts, error = %e, "Command send failed");
                last_invalid = None;
                sleep_until(slot_end).await;
                continue;
            }

            match self.await_reply(socket, slot_end).await {
                Some(Classified::Success(reply)) => {
                    debug!(command, attempt = attempts, %reply, "Command succeeded");
                    return Ok(reply);
                }
                Some(Classified::Rejected(response)) => {
                    warn!(command, %response, "Command rejected by device");
                    return Err(SessionError::rejected(command, response));
                }
                Some(Classified::Malformed(response)) => {
                    warn!(command, attempt = attempts, ?response, "Invalid reply, retrying");
                    last_invalid = Some(response);
                    sleep_until(slot_end).await;
                }
                Some(Classified::Empty) => {
                    warn!(command, attempt = attempts, "Empty reply, retrying");
                    last_invalid = Some(String::new());
                    sleep_until(slot_end).await;
                }
                None => {
                    debug!(command, attempt = attempts, "No reply within attempt window");
                    last_invalid = None;
                }
            }
        }

        let elapsed = started.elapsed();
        warn!(command, attempts, ?elapsed, "Command failed");
        Err(match last_invalid {
            Some(response) => {
                SessionError::MalformedResponse { command: command.to_string(), response, attempts }
            }
            None => SessionError::protocol_timeout(command, attempts, elapsed),
        })
    }

    /// Wait for the first datagram from the device before `deadline`.
    async fn await_reply(&self, socket: &UdpSocket, deadline: Instant) -> Option<Classified> {
        let mut buf = [0u8; REPLY_BUFFER];
        loop {
            match timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Err(_) => return None,
                Ok(Ok((len, from))) if from == self.device => {
                    trace!(len, "Reply datagram");
                    return Some(classify(&buf[..len]));
                }
                Ok(Ok((len, from))) => {
                    trace!(%from, len, "Ignoring datagram from unexpected peer");
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "Receive failed");
                    sleep_until(deadline).await;
                    return None;
                }
            }
        }
    }

    /// Discard late replies to earlier attempts so they cannot answer this one.
    fn drain_stale(&self, socket: &UdpSocket) {
        let mut buf = [0u8; REPLY_BUFFER];
        while let Ok((len, from)) = socket.try_recv_from(&mut buf) {
            trace!(%from, len, "Discarding stale datagram");
        }
    }
}
