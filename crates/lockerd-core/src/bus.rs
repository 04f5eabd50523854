//! Serialized access to the RS-485 bus.
//!
//! A single worker task owns the port; callers submit requests over an mpsc
//! channel and await a oneshot reply. Nothing else ever touches the port, so
//! frames can never interleave and no lock is needed. The worker enforces
//! the inter-frame idle gap after every reply or timeout.
//!
//! [`BusPort`] is the seam for tests: [`SerialRtuPort`] drives real hardware
//! through `tokio-serial`, [`MockPort`] is an in-memory 16-coil-card
//! simulator with scriptable faults.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::error::BusError;
use crate::frame::{self, decode_reply, decode_request, Reply, Request};

/// Tuning for the bus worker.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Idle time enforced after every reply or timeout. The RTU minimum is
    /// 3.5 character times (~4 ms at 9600 baud); 50 ms absorbs USB-serial
    /// adapter latency.
    pub inter_frame_gap: Duration,
    /// Reply deadline used when the caller does not pass one.
    pub default_timeout: Duration,
    /// Consecutive failures before the transport reports connection lost.
    pub failure_threshold: u32,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            inter_frame_gap: Duration::from_millis(50),
            default_timeout: Duration::from_millis(1000),
            failure_threshold: 3,
        }
    }
}

/// One endpoint capable of an RTU request/reply exchange.
///
/// Exactly one concrete hardware implementation exists ([`SerialRtuPort`]);
/// [`MockPort`] stands in for it in tests.
#[async_trait::async_trait]
pub trait BusPort: Send + 'static {
    /// Write `request` and read the reply, up to `expected_len` bytes or a
    /// complete exception frame, within `timeout`.
    async fn transact(
        &mut self,
        request: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError>;
}

/// The real serial port, 8-N-1.
pub struct SerialRtuPort {
    stream: tokio_serial::SerialStream,
}

/// Open the RS-485 serial port at the given baud rate, 8-N-1.
///
/// # Errors
///
/// Returns [`BusError::Io`] if the port cannot be opened.
pub fn open_serial_port(path: &str, baud_rate: u32) -> Result<SerialRtuPort, BusError> {
    let builder = tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None);

    let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| BusError::Io {
        reason: format!("open {path}: {e}"),
    })?;

    Ok(SerialRtuPort { stream })
}

/// A reply is complete when we have the expected byte count, or a full
/// 5-byte exception frame (function bit 0x80 set).
fn reply_complete(buf: &[u8], expected_len: usize) -> bool {
    buf.len() >= expected_len || (buf.len() >= 5 && buf[1] & 0x80 != 0)
}

#[async_trait::async_trait]
impl BusPort for SerialRtuPort {
    async fn transact(
        &mut self,
        request: &[u8],
        expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        self.stream.write_all(request).await.map_err(|e| BusError::Io {
            reason: e.to_string(),
        })?;
        self.stream.flush().await.map_err(|e| BusError::Io {
            reason: e.to_string(),
        })?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::with_capacity(expected_len);
        let mut chunk = [0u8; 64];

        while !reply_complete(&buf, expected_len) {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BusError::Timeout);
            }
            match tokio::time::timeout(remaining, self.stream.read(&mut chunk)).await {
                Err(_) => return Err(BusError::Timeout),
                Ok(Ok(0)) => {
                    return Err(BusError::Io {
                        reason: "serial port closed".to_owned(),
                    })
                }
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    return Err(BusError::Io {
                        reason: e.to_string(),
                    })
                }
            }
        }

        Ok(buf)
    }
}

/// Scripted fault for the next [`MockPort`] exchange.
#[derive(Debug, Clone, Copy)]
pub enum MockFault {
    /// Swallow the request and time out.
    Timeout,
    /// Fail the write with an I/O error.
    Io,
    /// Answer with a Modbus exception of the given code.
    Exception(u8),
    /// Answer with a corrupted CRC.
    CorruptCrc,
}

#[derive(Default)]
struct MockState {
    requests: Vec<Request>,
    faults: VecDeque<MockFault>,
    dead_slaves: HashSet<u8>,
    coils: HashMap<(u8, u16), bool>,
}

/// In-memory bus port: a rack of well-behaved 16-relay cards.
///
/// Clones share state, so tests keep a clone for assertions while the
/// transport owns the original. Dead slaves swallow requests (timeout);
/// scripted faults apply to the next exchange in FIFO order.
#[derive(Clone, Default)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request decoded so far, in bus order.
    pub async fn requests(&self) -> Vec<Request> {
        self.state.lock().await.requests.clone()
    }

    /// Queue a fault for the next exchange.
    pub async fn push_fault(&self, fault: MockFault) {
        self.state.lock().await.faults.push_back(fault);
    }

    /// Make a slave stop answering until revived.
    pub async fn kill_slave(&self, slave: u8) {
        self.state.lock().await.dead_slaves.insert(slave);
    }

    /// Bring a dead slave back.
    pub async fn revive_slave(&self, slave: u8) {
        self.state.lock().await.dead_slaves.remove(&slave);
    }

    /// Current state of a coil.
    pub async fn coil(&self, slave: u8, coil: u16) -> bool {
        *self
            .state
            .lock()
            .await
            .coils
            .get(&(slave, coil))
            .unwrap_or(&false)
    }
}

#[async_trait::async_trait]
impl BusPort for MockPort {
    async fn transact(
        &mut self,
        request: &[u8],
        _expected_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, BusError> {
        let decoded = decode_request(request)?;

        let mut state = self.state.lock().await;
        state.requests.push(decoded.clone());

        if let Some(fault) = state.faults.pop_front() {
            drop(state);
            return match fault {
                MockFault::Timeout => {
                    tokio::time::sleep(timeout).await;
                    Err(BusError::Timeout)
                }
                MockFault::Io => Err(BusError::Io {
                    reason: "simulated I/O failure".to_owned(),
                }),
                MockFault::Exception(code) => {
                    Ok(frame::exception_reply(decoded.slave(), decoded.function(), code))
                }
                MockFault::CorruptCrc => {
                    let mut reply = frame::success_reply(&decoded)?;
                    let last = reply.len() - 1;
                    reply[last] ^= 0xFF;
                    Ok(reply)
                }
            };
        }

        if state.dead_slaves.contains(&decoded.slave()) {
            drop(state);
            tokio::time::sleep(timeout).await;
            return Err(BusError::Timeout);
        }

        match &decoded {
            Request::ReadCoils {
                slave,
                first_coil,
                count,
            } => {
                let bits: Vec<bool> = (0..*count)
                    .map(|i| *state.coils.get(&(*slave, first_coil + i)).unwrap_or(&false))
                    .collect();
                Ok(frame::coils_reply(*slave, &bits))
            }
            Request::WriteSingleCoil { slave, coil, on } => {
                state.coils.insert((*slave, *coil), *on);
                frame::success_reply(&decoded).map_err(BusError::from)
            }
            Request::WriteMultipleCoils {
                slave,
                first_coil,
                bits,
            } => {
                for (i, &bit) in bits.iter().enumerate() {
                    state.coils.insert((*slave, first_coil + i as u16), bit);
                }
                frame::success_reply(&decoded).map_err(BusError::from)
            }
        }
    }
}

struct Job {
    request: Request,
    timeout: Duration,
    reply: oneshot::Sender<Result<Reply, BusError>>,
}

#[derive(Default)]
struct BusHealthInner {
    consecutive_failures: AtomicU32,
    connection_lost: AtomicBool,
}

/// Handle to the bus worker. Cheap to clone.
#[derive(Clone)]
pub struct BusTransport {
    tx: mpsc::Sender<Job>,
    health: Arc<BusHealthInner>,
    default_timeout: Duration,
}

impl std::fmt::Debug for BusTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusTransport")
            .field("connection_lost", &self.connection_lost())
            .finish_non_exhaustive()
    }
}

impl BusTransport {
    /// Spawn the worker that owns `port` and return a handle to it.
    ///
    /// The worker exits when the last handle is dropped.
    #[must_use]
    pub fn start(port: impl BusPort, settings: BusSettings) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(64);
        let health = Arc::new(BusHealthInner::default());
        let default_timeout = settings.default_timeout;

        tokio::spawn(worker(port, rx, settings, Arc::clone(&health)));

        Self {
            tx,
            health,
            default_timeout,
        }
    }

    /// Whether the transport has seen too many consecutive failures.
    ///
    /// The transport keeps accepting requests while lost; each one fails
    /// fast at the port until the next success clears the flag.
    #[must_use]
    pub fn connection_lost(&self) -> bool {
        self.health.connection_lost.load(Ordering::Relaxed)
    }

    async fn submit(&self, request: Request, timeout: Option<Duration>) -> Result<Reply, BusError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Job {
            request,
            timeout: timeout.unwrap_or(self.default_timeout),
            reply: reply_tx,
        };
        self.tx.send(job).await.map_err(|_| BusError::WorkerGone)?;
        reply_rx.await.map_err(|_| BusError::WorkerGone)?
    }

    /// Modbus function 0x05.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] on timeout, I/O failure, or a protocol error.
    pub async fn write_single_coil(
        &self,
        slave: u8,
        coil: u16,
        on: bool,
        timeout: Option<Duration>,
    ) -> Result<(), BusError> {
        self.submit(Request::WriteSingleCoil { slave, coil, on }, timeout)
            .await
            .map(|_| ())
    }

    /// Modbus function 0x0F. Used by emergency all-off.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] on timeout, I/O failure, or a protocol error.
    pub async fn write_multiple_coils(
        &self,
        slave: u8,
        first_coil: u16,
        bits: &[bool],
        timeout: Option<Duration>,
    ) -> Result<(), BusError> {
        self.submit(
            Request::WriteMultipleCoils {
                slave,
                first_coil,
                bits: bits.to_vec(),
            },
            timeout,
        )
        .await
        .map(|_| ())
    }

    /// Modbus function 0x01.
    ///
    /// # Errors
    ///
    /// Returns a [`BusError`] on timeout, I/O failure, or a protocol error.
    pub async fn read_coils(
        &self,
        slave: u8,
        first_coil: u16,
        count: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<bool>, BusError> {
        match self
            .submit(Request::ReadCoils { slave, first_coil, count }, timeout)
            .await?
        {
            Reply::Coils(bits) => Ok(bits),
            _ => Err(BusError::Frame(crate::error::FrameError::EchoMismatch {
                reason: "unexpected reply kind".to_owned(),
            })),
        }
    }
}

async fn worker(
    mut port: impl BusPort,
    mut rx: mpsc::Receiver<Job>,
    settings: BusSettings,
    health: Arc<BusHealthInner>,
) {
    debug!("bus worker started");

    while let Some(job) = rx.recv().await {
        let result = match job.request.encode() {
            Ok(frame_bytes) => port
                .transact(&frame_bytes, job.request.reply_len(), job.timeout)
                .await
                .and_then(|raw| decode_reply(&job.request, &raw).map_err(BusError::from)),
            Err(e) => Err(BusError::from(e)),
        };

        match &result {
            Ok(_) => {
                health.consecutive_failures.store(0, Ordering::Relaxed);
                if health.connection_lost.swap(false, Ordering::Relaxed) {
                    debug!("bus connection restored");
                }
            }
            Err(e) => {
                let failures = health.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= settings.failure_threshold
                    && !health.connection_lost.swap(true, Ordering::Relaxed)
                {
                    warn!(failures, error = %e, "bus connection lost");
                }
            }
        }

        // Receiver may have given up (deadline); that is fine.
        let _ = job.reply.send(result);

        // Inter-frame idle before the next exchange.
        tokio::time::sleep(settings.inter_frame_gap).await;
    }

    debug!("bus worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> BusSettings {
        BusSettings::default()
    }

    #[tokio::test(start_paused = true)]
    async fn writes_flow_through_the_worker_in_order() {
        let port = MockPort::new();
        let bus = BusTransport::start(port.clone(), settings());

        bus.write_single_coil(1, 5, true, None).await.unwrap();
        bus.write_single_coil(1, 5, false, None).await.unwrap();

        let log = port.requests().await;
        assert_eq!(
            log,
            vec![
                Request::WriteSingleCoil { slave: 1, coil: 5, on: true },
                Request::WriteSingleCoil { slave: 1, coil: 5, on: false },
            ]
        );
        assert!(!port.coil(1, 5).await);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_slave_times_out_but_transport_keeps_serving() {
        let port = MockPort::new();
        let bus = BusTransport::start(port.clone(), settings());
        port.kill_slave(9).await;

        let err = bus.write_single_coil(9, 1, true, None).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout));

        // A healthy slave still works afterwards.
        bus.write_single_coil(2, 1, true, None).await.unwrap();
        assert!(port.coil(2, 1).await);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_lost_after_three_consecutive_failures() {
        let port = MockPort::new();
        let bus = BusTransport::start(port.clone(), settings());
        port.kill_slave(1).await;

        for _ in 0..3 {
            let _ = bus.write_single_coil(1, 1, true, None).await;
        }
        assert!(bus.connection_lost());

        // One success clears the flag.
        bus.write_single_coil(2, 1, true, None).await.unwrap();
        assert!(!bus.connection_lost());
    }

    #[tokio::test(start_paused = true)]
    async fn corrupt_reply_surfaces_as_crc_mismatch() {
        let port = MockPort::new();
        let bus = BusTransport::start(port.clone(), settings());
        port.push_fault(MockFault::CorruptCrc).await;

        let err = bus.write_single_coil(1, 1, true, None).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Frame(crate::error::FrameError::CrcMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn exception_reply_surfaces_code() {
        let port = MockPort::new();
        let bus = BusTransport::start(port.clone(), settings());
        port.push_fault(MockFault::Exception(2)).await;

        let err = bus.write_single_coil(1, 1, true, None).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Frame(crate::error::FrameError::Exception { code: 2, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn read_coils_reflects_written_state() {
        let port = MockPort::new();
        let bus = BusTransport::start(port.clone(), settings());

        bus.write_single_coil(3, 1, true, None).await.unwrap();
        bus.write_single_coil(3, 16, true, None).await.unwrap();

        let bits = bus.read_coils(3, 1, 16, None).await.unwrap();
        assert!(bits[0]);
        assert!(bits[15]);
        assert!(!bits[7]);
    }
}
