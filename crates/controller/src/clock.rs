//! Wall clock with an SNTP-corrected offset.
//!
//! The controller has no RTC of its own it can trust, so every decision
//! uses `Clock::now_utc`, which is the system clock plus the offset learned
//! from the last successful SNTP exchange.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use time::OffsetDateTime;
use tokio::net::UdpSocket;

/// Seconds between the NTP era (1900) and the Unix epoch (1970).
const NTP_UNIX_DELTA: u64 = 2_208_988_800;

/// Seconds in one NTP era; era 1 begins 2036-02-07T06:28:16Z.
const NTP_ERA_SECS: u64 = 1 << 32;

const PACKET_LEN: usize = 48;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// LI = 0, VN = 3, Mode = 3 (client).
const CLIENT_HEADER: u8 = 0x1B;

const MODE_SERVER: u8 = 4;

#[derive(Debug, Clone, Copy, Default)]
pub struct Clock {
    offset_secs: i64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Corrected Unix seconds.
    pub fn now_utc(&self) -> i64 {
        system_now() + self.offset_secs
    }

    pub fn offset_secs(&self) -> i64 {
        self.offset_secs
    }

    pub fn set_offset(&mut self, offset_secs: i64) {
        self.offset_secs = offset_secs;
    }

    /// Query `server` and adopt its time.  On failure the previous offset is
    /// kept and the error returned for the caller to log.
    pub async fn sync(&mut self, server: &str) -> Result<i64> {
        let offset = query_offset(server).await?;
        self.set_offset(offset);
        Ok(offset)
    }
}

fn system_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// SNTP
// ---------------------------------------------------------------------------

pub fn build_request() -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[0] = CLIENT_HEADER;
    packet
}

/// Extract the server's transmit timestamp as Unix seconds.  Seconds that
/// would fall before 1970 are read as NTP era 1 (2036 onwards).
pub fn parse_reply(reply: &[u8]) -> Result<i64> {
    if reply.len() < PACKET_LEN {
        bail!("short SNTP reply: {} bytes", reply.len());
    }
    let mode = reply[0] & 0x07;
    if mode != MODE_SERVER {
        bail!("unexpected SNTP mode {mode}");
    }
    // Stratum 0 is a kiss-of-death packet.
    if reply[1] == 0 {
        bail!("SNTP server sent kiss-of-death");
    }
    let secs = u64::from(u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]));
    if secs == 0 {
        bail!("SNTP reply has no transmit timestamp");
    }
    let ntp = if secs < NTP_UNIX_DELTA {
        secs + NTP_ERA_SECS
    } else {
        secs
    };
    Ok((ntp - NTP_UNIX_DELTA) as i64)
}

/// Server time minus local time, in whole seconds, measured against the
/// midpoint of the exchange.
pub async fn query_offset(server: &str) -> Result<i64> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind SNTP socket")?;
    socket
        .connect(server)
        .await
        .with_context(|| format!("failed to resolve SNTP server {server}"))?;

    let sent_at = system_now();
    socket
        .send(&build_request())
        .await
        .context("failed to send SNTP request")?;

    let mut buf = [0u8; PACKET_LEN];
    let n = tokio::time::timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .with_context(|| format!("SNTP query to {server} timed out"))?
        .context("failed to receive SNTP reply")?;
    let received_at = system_now();

    let server_time = parse_reply(&buf[..n])?;
    let midpoint = sent_at + (received_at - sent_at) / 2;
    Ok(server_time - midpoint)
}

// ===========================================================================
// Tests
// ===========================================================================
