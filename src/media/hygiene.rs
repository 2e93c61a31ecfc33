//! Reclaiming the video port from orphaned transcoders
//!
//! A transcoder left over from a crashed run keeps the video port bound and
//! silently eats the feed. Before giving up on a busy port we look for such
//! processes by name and terminate them.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::{Result, SessionError};

/// A process holding a UDP port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortHolder {
    pub pid: u32,
    pub name: String,
}

/// Operating-system view of who holds a port.
#[async_trait::async_trait]
pub trait PortInspector: Send + Sync + 'static {
    /// Processes with a UDP socket bound to `port`.
    async fn udp_holders(&self, port: u16) -> io::Result<Vec<PortHolder>>;

    /// Ask the process to exit.
    async fn terminate(&self, pid: u32) -> io::Result<()>;
}

/// Inspector backed by the platform's own tools (`lsof`/`kill`, `netstat`/`taskkill`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortInspector;

#[async_trait::async_trait]
impl PortInspector for SystemPortInspector {
    #[cfg(not(windows))]
    async fn udp_holders(&self, port: u16) -> io::Result<Vec<PortHolder>> {
        let output =
            Command::new("lsof").args(["-nP", &format!("-iUDP:{port}"), "-Fpc"]).output().await?;
        // lsof exits non-zero when nothing matches
        Ok(parse_lsof(&String::from_utf8_lossy(&output.stdout)))
    }

    #[cfg(windows)]
    async fn udp_holders(&self, port: u16) -> io::Result<Vec<PortHolder>> {
        let output = Command::new("netstat").args(["-ano", "-p", "UDP"]).output().await?;
        let mut holders = Vec::new();
        for pid in parse_netstat_udp(&String::from_utf8_lossy(&output.stdout), port) {
            let task = Command::new("tasklist")
                .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
                .output()
                .await?;
            if let Some(name) = parse_tasklist(&String::from_utf8_lossy(&task.stdout)) {
                holders.push(PortHolder { pid, name });
            }
        }
        Ok(holders)
    }

    #[cfg(not(windows))]
    async fn terminate(&self, pid: u32) -> io::Result<()> {
        let status = Command::new("kill").args(["-TERM", &pid.to_string()]).status().await?;
        if status.success() { Ok(()) } else { Err(io::Error::other(format!("kill {pid}: {status}"))) }
    }

    #[cfg(windows)]
    async fn terminate(&self, pid: u32) -> io::Result<()> {
        let status =
            Command::new("taskkill").args(["/PID", &pid.to_string(), "/F"]).status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill {pid}: {status}")))
        }
    }
}

/// Bind the video port, reclaiming it from stale transcoders if needed.
///
/// Only holders whose name contains the transcoder program's name are
/// touched; anything else holding the port ends in `PortUnavailable`.
pub async fn bind_video_socket(
    port: u16,
    program: &str,
    inspector: &dyn PortInspector,
    attempts: u32,
    backoff: Duration,
) -> Result<UdpSocket> {
    let wanted = program_name(program);
    let own_pid = std::process::id();

    for attempt in 1..=attempts {
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(socket) => {
                if attempt > 1 {
                    info!(port, attempt, "Video port reclaimed");
                }
                return Ok(socket);
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                warn!(port, attempt, attempts, "Video port in use");
            }
            Err(e) => return Err(SessionError::transport(format!("bind video port {port}"), e)),
        }

        match inspector.udp_holders(port).await {
            Ok(holders) => {
                for holder in holders {
                    if holder.pid == own_pid || !holder.name.to_lowercase().contains(&wanted) {
                        debug!(pid = holder.pid, name = %holder.name, "Leaving port holder alone");
                        continue;
                    }
                    warn!(pid = holder.pid, name = %holder.name, port, "Terminating orphaned transcoder");
                    if let Err(e) = inspector.terminate(holder.pid).await {
                        warn!(pid = holder.pid, error = %e, "Failed to terminate port holder");
                    }
                }
            }
            Err(e) => warn!(port, error = %e, "Could not look up port holders"),
        }

        if attempt < attempts {
            tokio::time::sleep(backoff * attempt).await;
        }
    }

    Err(SessionError::PortUnavailable { port, attempts })
}

/// `"/usr/local/bin/ffmpeg"` and `"ffmpeg.exe"` both become `"ffmpeg"`.
fn program_name(program: &str) -> String {
    Path::new(program)
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_else(|| program.to_lowercase())
}

/// Parse `lsof -F pc` field output into holders.
#[cfg_attr(windows, allow(dead_code))]
fn parse_lsof(output: &str) -> Vec<PortHolder> {
    let mut holders: Vec<PortHolder> = Vec::new();
    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            if let Ok(pid) = pid.trim().parse() {
                holders.push(PortHolder { pid, name: String::new() });
            }
        } else if let Some(name) = line.strip_prefix('c') {
            if let Some(holder) = holders.last_mut() {
                holder.name = name.trim().to_string();
            }
        }
    }
    holders
}

/// Pids from `netstat -ano -p UDP` whose local address ends in `:port`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_udp(output: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [proto, local, _, pid] = fields.as_slice() else {
            continue;
        };
        if !proto.eq_ignore_ascii_case("udp") || !local.ends_with(&suffix) {
            continue;
        }
        if let Ok(pid) = pid.parse::<u32>() {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

/// Image name from one line of `tasklist /FO CSV /NH`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_tasklist(output: &str) -> Option<String> {
    let line = output.lines().map(str::trim).find(|line| line.starts_with('"'))?;
    let name = line.split(',').next()?.trim_matches('"');
    (!name.is_empty()).then(|| name.to_string())
}
