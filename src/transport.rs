//! Byte transports for the physical bus.
//!
//! The engine owns exclusive access to one [`Transport`] for the process
//! lifetime. Two real implementations are provided (a serial device and a
//! TCP-tunneled device server) plus [`MockTransport`], a scripted mock
//! that understands outgoing telegram framing well enough to inject
//! collisions, replies, silence and device faults per send attempt.

use crate::frame::{self, Unescaped, Unescaper};
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Heating-bus transceivers run at a fixed low rate.
pub const SERIAL_BAUD: u32 = 2400;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("transport I/O error: {0}")]
pub struct TransportError(pub String);

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        Self(err.to_string())
    }
}

/// Blocking, timeout-capable raw byte access to the bus medium.
pub trait Transport: Send {
    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError>;

    /// Reads one byte, waiting at most `timeout`. `Ok(None)` on timeout;
    /// `Err` only for genuine device faults.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError>;
}

/// Serial device transport.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let port = serialport::new(path, SERIAL_BAUD)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        self.port.write_all(&[byte])?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| TransportError(e.to_string()))?;
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Network-tunneled device (serial-to-TCP bridge hardware).
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self { stream })
    }
}

impl Transport for TcpTransport {
    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        self.stream.write_all(&[byte])?;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        self.stream.set_read_timeout(Some(timeout))?;
        let mut buf = [0u8; 1];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(TransportError("device closed connection".to_string())),
            Ok(_) => Ok(Some(buf[0])),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Script for one expected telegram send attempt on the mock bus.
#[derive(Debug, Clone)]
pub struct MockExchange {
    collide_at: Option<usize>,
    reply: Option<Vec<u8>>,
    fault: bool,
}

impl MockExchange {
    /// Attempt answered with a valid reply carrying `payload`.
    pub fn reply(payload: &[u8]) -> Self {
        Self {
            collide_at: None,
            reply: Some(frame::reply_wire(payload)),
            fault: false,
        }
    }

    /// Attempt answered with the given raw wire bytes (e.g. a corrupted
    /// frame built by the test).
    pub fn reply_raw(wire: Vec<u8>) -> Self {
        Self {
            collide_at: None,
            reply: Some(wire),
            fault: false,
        }
    }

    /// Attempt that goes unanswered.
    pub fn silent() -> Self {
        Self {
            collide_at: None,
            reply: None,
            fault: false,
        }
    }

    /// Attempt whose echo diverges at wire byte `index`.
    pub fn collision(index: usize) -> Self {
        Self {
            collide_at: Some(index),
            reply: None,
            fault: false,
        }
    }

    /// Attempt on which the device itself fails.
    pub fn fault() -> Self {
        Self {
            collide_at: None,
            reply: None,
            fault: true,
        }
    }
}

#[derive(Debug)]
struct MockInner {
    exchanges: VecDeque<MockExchange>,
    rx: VecDeque<u8>,
    sent: Vec<u8>,
    unescaper: Unescaper,
    out_frame: Vec<u8>,
    wire_index: usize,
    attempts: usize,
}

impl MockInner {
    fn reset_attempt(&mut self) {
        self.unescaper = Unescaper::new();
        self.out_frame.clear();
        self.wire_index = 0;
    }
}

/// Scripted in-memory bus. Clones share state, so a test can hand one
/// clone to the engine and keep another for assertions.
///
/// The mock echoes every written byte back (the medium is a shared wire),
/// parses the outgoing telegram to know when it is complete, then queues
/// the scripted reply. A scripted collision corrupts the echo at the
/// configured byte and starts the next exchange, matching the engine's
/// abort-at-first-divergence behavior.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    pub fn new(script: Vec<MockExchange>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                exchanges: script.into(),
                rx: VecDeque::new(),
                sent: Vec::new(),
                unescaper: Unescaper::new(),
                out_frame: Vec::new(),
                wire_index: 0,
                attempts: 0,
            })),
        }
    }

    /// All raw bytes the engine has written, across attempts.
    pub fn sent(&self) -> Vec<u8> {
        self.inner.lock().unwrap().sent.clone()
    }

    /// Number of physical send attempts observed (exchanges consumed).
    pub fn attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts
    }
}

impl Transport for MockTransport {
    fn write_byte(&mut self, byte: u8) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().unwrap();

        let exchange = match inner.exchanges.front() {
            Some(e) => e.clone(),
            // Script exhausted: swallow writes, echo nothing
            None => {
                inner.sent.push(byte);
                return Ok(());
            }
        };

        if exchange.fault {
            return Err(TransportError("device unplugged".to_string()));
        }

        inner.sent.push(byte);

        if exchange.collide_at == Some(inner.wire_index) {
            // Another master drove a different byte onto the wire
            inner.rx.push_back(byte ^ 0x40);
            inner.exchanges.pop_front();
            inner.attempts += 1;
            inner.reset_attempt();
            return Ok(());
        }

        inner.rx.push_back(byte);
        inner.wire_index += 1;

        if let Unescaped::Byte(b) = inner.unescaper.push(byte) {
            inner.out_frame.push(b);
        }

        // src dst pb sb len … payload … crc
        if inner.out_frame.len() >= 5 {
            let total = 6 + inner.out_frame[4] as usize;
            if inner.out_frame.len() == total {
                if let Some(reply) = exchange.reply {
                    inner.rx.extend(reply);
                }
                inner.exchanges.pop_front();
                inner.attempts += 1;
                inner.reset_attempt();
            }
        }

        Ok(())
    }

    fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.rx.pop_front())
    }
}
