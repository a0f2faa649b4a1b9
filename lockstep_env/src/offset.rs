//! Wallclock offset estimation against a network time source.
//!
//! Every participant corrects its local clock by the offset measured here,
//! so that independently hosted kernels agree on "now" to within the accuracy
//! of the time source.

use crate::context::RuntimeContext;
use crate::error::{EnvError, OffsetError};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{info, warn};

/// Seconds between the NTP era 0 epoch (1900) and the Unix epoch.
const NTP_UNIX_DELTA_SECS: i64 = 2_208_988_800;

/// Size of an SNTP v3 packet without extensions.
const SNTP_PACKET_LEN: usize = 48;

/// A source of "true" time.
#[async_trait]
pub trait TimeSource: Send + Sync + 'static {
    /// Queries `host` once and returns `trusted_time - local_time`.
    async fn query_offset(&self, host: &str) -> Result<TimeDelta, EnvError>;
}

/// Simple Network Time Protocol (RFC 4330) client over UDP.
#[derive(Debug, Clone)]
pub struct SntpTimeSource {
    /// Server port (123 for NTP)
    pub port: u16,

    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for SntpTimeSource {
    fn default() -> Self {
        Self {
            port: 123,
            timeout: Duration::from_secs(2),
        }
    }
}

impl SntpTimeSource {
    fn request_packet() -> [u8; SNTP_PACKET_LEN] {
        let mut packet = [0u8; SNTP_PACKET_LEN];
        // LI = 0, VN = 3, Mode = 3 (client)
        packet[0] = 0b00_011_011;
        packet
    }

    /// Computes the clock offset from a server reply.
    ///
    /// `sent` and `received` are the local times the request left and the
    /// reply arrived (T1 and T4).
    fn offset_from_reply(
        reply: &[u8],
        sent: DateTime<Utc>,
        received: DateTime<Utc>,
    ) -> Result<TimeDelta, EnvError> {
        if reply.len() < SNTP_PACKET_LEN {
            return Err(EnvError::time_protocol(format!(
                "short reply: {} bytes",
                reply.len()
            )));
        }
        let mode = reply[0] & 0b111;
        if mode != 4 {
            return Err(EnvError::time_protocol(format!("unexpected mode {}", mode)));
        }
        if reply[1] == 0 {
            return Err(EnvError::time_protocol("kiss-o'-death (stratum 0)"));
        }
        let server_receive = ntp_timestamp(&reply[32..40])?;
        let server_transmit = ntp_timestamp(&reply[40..48])?;

        // ((T2 - T1) + (T3 - T4)) / 2
        let sum = (server_receive - sent) + (server_transmit - received);
        Ok(sum / 2)
    }
}

fn ntp_timestamp(bytes: &[u8]) -> Result<DateTime<Utc>, EnvError> {
    let seconds = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64;
    let fraction = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as u64;
    let nanos = ((fraction * 1_000_000_000) >> 32) as u32;
    DateTime::from_timestamp(seconds - NTP_UNIX_DELTA_SECS, nanos)
        .ok_or_else(|| EnvError::time_protocol("timestamp out of range"))
}

#[async_trait]
impl TimeSource for SntpTimeSource {
    async fn query_offset(&self, host: &str) -> Result<TimeDelta, EnvError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, self.port)).await?;

        let sent = Utc::now();
        socket.send(&Self::request_packet()).await?;

        let mut reply = [0u8; 64];
        let len = tokio::time::timeout(self.timeout, socket.recv(&mut reply))
            .await
            .map_err(|_| EnvError::Timeout(self.timeout.as_millis() as u64))??;
        let received = Utc::now();

        Self::offset_from_reply(&reply[..len], sent, received)
    }
}

/// Returns the local wall clock corrected by `offset`.
pub fn now_corrected(context: &dyn RuntimeContext, offset: TimeDelta) -> DateTime<Utc> {
    context.system_time() + offset
}

/// Queries a [`TimeSource`] with a fixed retry policy.
pub struct ClockOffsetEstimator {
    source: Arc<dyn TimeSource>,
    context: Arc<dyn RuntimeContext>,
}

impl ClockOffsetEstimator {
    /// Creates a new estimator.
    pub fn new(source: Arc<dyn TimeSource>, context: Arc<dyn RuntimeContext>) -> Self {
        Self { source, context }
    }

    /// Estimates this process's deviation from the time source at `host`.
    ///
    /// Makes up to `max_retries` attempts, waiting `retry_delay` between
    /// consecutive attempts.
    ///
    /// # Errors
    /// `OffsetError::NoOffsetAvailable` when every attempt fails.
    pub async fn estimate_offset(
        &self,
        host: &str,
        retry_delay: Duration,
        max_retries: u32,
    ) -> Result<TimeDelta, OffsetError> {
        for attempt in 1..=max_retries {
            info!("Contacting {} to retrieve wallclock offset", host);
            match self.source.query_offset(host).await {
                Ok(offset) => {
                    info!("Wallclock offset updated to {}", offset);
                    return Ok(offset);
                }
                Err(e) => {
                    warn!(
                        "Could not query {} ({}), attempt #{}/{}",
                        host, e, attempt, max_retries
                    );
                    if attempt < max_retries {
                        self.context.sleep(retry_delay).await;
                    }
                }
            }
        }

        Err(OffsetError::NoOffsetAvailable {
            host: host.to_string(),
            attempts: max_retries,
        })
    }
}
