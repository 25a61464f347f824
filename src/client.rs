use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{DeviceConfig, RetryConfig};
use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{parse_response, parse_status, set_message, status_request, SetCommand, WireResponse};
use crate::types::*;
use crate::{Error, Result};

const MAX_DATAGRAM: usize = 4096;

/// What the command queue and the reconciliation manager need from a
/// device. [`DeviceClient`] is the UDP implementation.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    async fn update_state(&self) -> Result<StatusRecord>;

    async fn send_set_command(&self, command: &SetCommand) -> Result<()>;

    fn is_available(&self) -> bool;

    fn cleanup(&self);
}

pub struct DeviceClientBuilder {
    config: DeviceConfig,
    log_mode: Option<MessageLogMode>,
    log_path: Option<String>,
}

impl DeviceClientBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self::from_config(DeviceConfig::new(host))
    }

    pub fn from_config(config: DeviceConfig) -> Self {
        Self {
            config,
            log_mode: None,
            log_path: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn unit(mut self, unit: TemperatureUnit) -> Self {
        self.config.unit = unit;
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<DeviceClient> {
        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Mutex::new(MessageLogger::new(mode, &path)?)),
            _ => None,
        };

        Ok(DeviceClient {
            address: self.config.address(),
            config: self.config,
            next_seq: AtomicU32::new(1),
            available: AtomicBool::new(true),
            logger,
            cancel: CancellationToken::new(),
        })
    }
}

/// UDP/XML codec for one device.
///
/// Each exchange binds its own ephemeral socket, so a late answer to an
/// abandoned attempt can never be mistaken for the current one; answers
/// carrying a different `seq` are dropped anyway.
pub struct DeviceClient {
    config: DeviceConfig,
    address: String,
    next_seq: AtomicU32,
    available: AtomicBool,
    logger: Option<Mutex<MessageLogger>>,
    cancel: CancellationToken,
}

impl DeviceClient {
    pub fn builder(host: impl Into<String>) -> DeviceClientBuilder {
        DeviceClientBuilder::new(host)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Send one payload and wait for the response tagged with `seq`.
    /// The socket lives only for this call.
    pub async fn send_command(
        &self,
        payload: &str,
        seq: u32,
        timeout: Duration,
    ) -> Result<WireResponse> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }

        let target = self.resolve().await?;
        let bind: SocketAddr = if target.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(Error::Network)?;
        socket.connect(target).await.map_err(Error::Network)?;

        trace!(seq, host = %self.address, xml = payload, "send");
        if let Some(logger) = &self.logger {
            logger.lock().log_request(&self.address, seq, payload);
        }
        socket.send(payload.as_bytes()).await.map_err(Error::Network)?;

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let len = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(Error::Closed),
                received = tokio::time::timeout_at(deadline, socket.recv(&mut buf)) => match received {
                    Err(_) => return Err(Error::Timeout { seq, after: timeout }),
                    Ok(Err(e)) => return Err(Error::Network(e)),
                    Ok(Ok(len)) => len,
                },
            };

            let xml = String::from_utf8_lossy(&buf[..len]);
            trace!(seq, host = %self.address, xml = %xml, "recv");
            let response = parse_response(&xml);
            if let Some(logger) = &self.logger {
                let resp_seq = response.as_ref().ok().and_then(|r| r.seq);
                logger.lock().log_response(&self.address, resp_seq, &xml);
            }

            let response = response?;
            match response.seq {
                Some(got) if got != seq => {
                    debug!(expected = seq, got, "discarding response for another sequence");
                }
                _ => return Ok(response),
            }
        }
    }

    /// Query the device and project the answer onto a [`StatusRecord`].
    pub async fn update_state(&self) -> Result<StatusRecord> {
        let response = self
            .with_retry("status", |seq| self.exchange(status_request(seq), seq))
            .await?;
        let status = parse_status(&response, self.config.unit)?;
        if let Some(logger) = &self.logger {
            logger.lock().log_status(&status);
        }
        debug!(host = %self.address, power = ?status.power, mode = ?status.operation_mode, "status updated");
        Ok(status)
    }

    pub async fn send_set_command(&self, command: &SetCommand) -> Result<()> {
        if command.is_empty() {
            debug!("empty command, nothing to send");
            return Ok(());
        }
        let unit = self.config.unit;
        self.with_retry("set", |seq| self.exchange(set_message(seq, command, unit), seq))
            .await?;
        Ok(())
    }

    // -- Single-field helpers --

    pub async fn set_power(&self, power: Switch) -> Result<()> {
        self.send_set_command(&SetCommand {
            power: Some(power),
            ..Default::default()
        })
        .await
    }

    pub async fn set_operation_mode(&self, mode: OperationMode) -> Result<()> {
        self.send_set_command(&SetCommand {
            operation_mode: Some(mode),
            ..Default::default()
        })
        .await
    }

    /// Celsius; converted to the device unit on the wire.
    pub async fn set_target_temperature(&self, celsius: f64) -> Result<()> {
        self.send_set_command(&SetCommand {
            target_temperature: Some(celsius),
            ..Default::default()
        })
        .await
    }

    pub async fn set_fan_speed(&self, speed: FanSpeed) -> Result<()> {
        self.send_set_command(&SetCommand {
            fan_speed: Some(speed),
            ..Default::default()
        })
        .await
    }

    pub async fn set_swing_mode(&self, swing: SwingMode) -> Result<()> {
        self.send_set_command(&SetCommand {
            swing_mode: Some(swing),
            ..Default::default()
        })
        .await
    }

    pub async fn set_turbo_mode(&self, turbo: Switch) -> Result<()> {
        self.send_set_command(&SetCommand {
            turbo_mode: Some(turbo),
            ..Default::default()
        })
        .await
    }

    pub async fn set_sleep_mode(&self, sleep: Switch) -> Result<()> {
        self.send_set_command(&SetCommand {
            sleep_mode: Some(sleep),
            ..Default::default()
        })
        .await
    }

    pub async fn set_eco_mode(&self, eco: Switch) -> Result<()> {
        self.send_set_command(&SetCommand {
            eco_mode: Some(eco),
            ..Default::default()
        })
        .await
    }

    pub async fn set_display_mode(&self, display: Switch) -> Result<()> {
        self.send_set_command(&SetCommand {
            display_mode: Some(display),
            ..Default::default()
        })
        .await
    }

    pub async fn set_beep_mode(&self, beep: Switch) -> Result<()> {
        self.send_set_command(&SetCommand {
            beep_mode: Some(beep),
            ..Default::default()
        })
        .await
    }

    /// Abort in-flight exchanges and backoff sleeps. Safe to call repeatedly.
    pub fn cleanup(&self) {
        if !self.cancel.is_cancelled() {
            debug!(host = %self.address, "closing device client");
        }
        self.cancel.cancel();
    }

    // -- Helpers --

    async fn resolve(&self) -> Result<SocketAddr> {
        lookup_host(&self.address)
            .await
            .map_err(Error::Network)?
            .next()
            .ok_or_else(|| {
                Error::Network(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}", self.address),
                ))
            })
    }

    async fn exchange(&self, payload: String, seq: u32) -> Result<WireResponse> {
        self.send_command(&payload, seq, self.config.timeout()).await
    }

    fn next_seq(&self) -> u32 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was != available {
            if available {
                debug!(host = %self.address, "device reachable again");
            } else {
                warn!(host = %self.address, "device unavailable");
            }
        }
    }

    /// Run `attempt` with a fresh sequence id until it succeeds, fails with
    /// a non-transient error, or the retry budget is spent.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = self.config.retry;
        let mut retries = 0;
        loop {
            match attempt(self.next_seq()).await {
                Ok(value) => {
                    self.set_available(true);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && retries < retry.max_retries => {
                    retries += 1;
                    let delay = retry.delay_for(retries);
                    debug!(op, retries, error = %e, ?delay, "exchange failed, retrying");
                    tokio::select! {
                        () = self.cancel.cancelled() => return Err(Error::Closed),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(op, host = %self.address, attempts = retries + 1, error = %e, "giving up");
                        self.set_available(false);
                    } else if matches!(e, Error::Parse(_)) {
                        // The device answered, just not sensibly.
                        self.set_available(true);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl DeviceApi for DeviceClient {
    async fn update_state(&self) -> Result<StatusRecord> {
        DeviceClient::update_state(self).await
    }

    async fn send_set_command(&self, command: &SetCommand) -> Result<()> {
        DeviceClient::send_set_command(self, command).await
    }

    fn is_available(&self) -> bool {
        DeviceClient::is_available(self)
    }

    fn cleanup(&self) {
        DeviceClient::cleanup(self)
    }
}
