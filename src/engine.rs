//! Bus protocol engine.
//!
//! Owns the physical transport and runs one [`Transaction`] at a time:
//! wait for bus idle, transmit with byte-echo collision detection, await
//! and validate the reply, decode it against the originating command
//! definition. Collisions, checksum failures and silence are absorbed
//! into the transaction's retry budget; transport faults are fatal.
//!
//! `execute` takes `&mut self`: single-caller access is enforced by
//! ownership (the bridge dispatch loop holds the engine), not by a lock.

use crate::codec;
use crate::config::BusTimings;
use crate::dump::DumpFile;
use crate::error::BusError;
use crate::frame::{InvalidReason, Payload, ReplyReader, ReplyStatus, Telegram};
use crate::registry::{CommandDefinition, ReplyValues};
use crate::transport::Transport;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// One logical request/response cycle, possibly spanning several physical
/// send attempts. Created by the bridge at dequeue time, owned by the
/// engine for its lifetime.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub def: Arc<CommandDefinition>,
    pub telegram: Telegram,
    /// Deadline for the complete reply of one attempt.
    pub reply_timeout: Duration,
    /// Extra full-transaction attempts after the first.
    pub retries: u8,
}

impl Transaction {
    pub fn build(
        def: Arc<CommandDefinition>,
        src: u8,
        payload: Payload,
        timings: &BusTimings,
    ) -> Self {
        let telegram = Telegram::new(src, def.dst, def.primary, def.secondary, payload);
        Self {
            def,
            telegram,
            reply_timeout: timings.reply_timeout(),
            retries: timings.send_retries,
        }
    }

    /// Total physical send attempts this transaction may consume.
    pub fn max_attempts(&self) -> u8 {
        self.retries + 1
    }
}

/// Counters exposed for diagnostics and status queries.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineStats {
    pub transactions: u64,
    pub retried_attempts: u64,
    pub collisions: u64,
    pub invalid_replies: u64,
    pub no_responses: u64,
    pub malformed_replies: u64,
}

/// Outcome of one physical attempt, before retry policy is applied.
enum AttemptError {
    /// Echo mismatch or missing echo during arbitration. Retryable.
    Collision,
    /// No reply, NAK, framing noise or checksum failure. Retryable.
    NoValidReply,
    /// Non-retryable outcome surfaced as-is.
    Fatal(BusError),
}

pub struct BusEngine {
    transport: Box<dyn Transport>,
    timings: BusTimings,
    dump: Option<DumpFile>,
    stats: EngineStats,
}

impl BusEngine {
    pub fn new(transport: Box<dyn Transport>, timings: BusTimings) -> Self {
        Self {
            transport,
            timings,
            dump: None,
            stats: EngineStats::default(),
        }
    }

    /// Tees all observed raw bytes into a rotating capture file.
    pub fn with_dump(mut self, dump: DumpFile) -> Self {
        self.dump = Some(dump);
        self
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Runs the transaction to completion: a decoded value set, or a
    /// typed failure after the retry budget is spent.
    pub fn execute(&mut self, txn: &Transaction) -> Result<ReplyValues, BusError> {
        self.stats.transactions += 1;
        let wire = txn.telegram.wire_bytes();
        let max_attempts = txn.max_attempts();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                self.stats.retried_attempts += 1;
                debug!(
                    command = %txn.def.name,
                    attempt,
                    max_attempts,
                    "retrying transaction"
                );
            }
            match self.attempt(txn, &wire) {
                Ok(values) => {
                    trace!(command = %txn.def.name, attempt, "transaction complete");
                    return Ok(values);
                }
                Err(AttemptError::Collision) => {
                    // Recovery pause before re-arbitrating; collisions are
                    // address-based, so no escalating backoff
                    std::thread::sleep(self.timings.recovery());
                }
                Err(AttemptError::NoValidReply) => {}
                Err(AttemptError::Fatal(err)) => {
                    if matches!(err, BusError::MalformedReply(_)) {
                        self.stats.malformed_replies += 1;
                    }
                    warn!(command = %txn.def.name, error = %err, "transaction failed");
                    return Err(err);
                }
            }
        }

        self.stats.no_responses += 1;
        warn!(
            command = %txn.def.name,
            attempts = max_attempts,
            "no valid response, retries exhausted"
        );
        Err(BusError::NoResponse {
            attempts: max_attempts,
        })
    }

    fn attempt(&mut self, txn: &Transaction, wire: &[u8]) -> Result<ReplyValues, AttemptError> {
        self.wait_idle()?;
        self.send(wire)?;

        if txn.telegram.is_broadcast() {
            return Ok(ReplyValues::new());
        }

        let payload = self.await_reply(txn.reply_timeout)?;
        codec::decode_fields(&txn.def.replies, &payload).map_err(AttemptError::Fatal)
    }

    /// Blocks until no traffic has been observed for the quiet interval.
    fn wait_idle(&mut self) -> Result<(), AttemptError> {
        loop {
            match self.read(self.timings.quiet()) {
                Ok(None) => return Ok(()),
                Ok(Some(_)) => {}
                Err(err) => return Err(AttemptError::Fatal(err)),
            }
        }
    }

    /// Transmits byte-wise, verifying each echo. Aborts at the first
    /// divergent byte: another master is driving the wire.
    fn send(&mut self, wire: &[u8]) -> Result<(), AttemptError> {
        for (index, &byte) in wire.iter().enumerate() {
            self.write(byte).map_err(AttemptError::Fatal)?;
            match self.read(self.timings.echo_timeout()) {
                Ok(Some(echo)) if echo == byte => {}
                Ok(Some(echo)) => {
                    self.stats.collisions += 1;
                    warn!(index, sent = byte, observed = echo, "bus collision");
                    return Err(AttemptError::Collision);
                }
                Ok(None) => {
                    self.stats.collisions += 1;
                    warn!(index, sent = byte, "no echo within window");
                    return Err(AttemptError::Collision);
                }
                Err(err) => return Err(AttemptError::Fatal(err)),
            }
        }
        Ok(())
    }

    /// Collects a reply frame within the transaction deadline. Checksum
    /// failures, NAKs and framing noise all collapse to `NoValidReply`.
    fn await_reply(&mut self, timeout: Duration) -> Result<Payload, AttemptError> {
        let deadline = Instant::now() + timeout;
        let mut reader = ReplyReader::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("reply deadline elapsed");
                return Err(AttemptError::NoValidReply);
            }
            match self.read(remaining) {
                Ok(Some(byte)) => match reader.push(byte) {
                    ReplyStatus::Pending => {}
                    ReplyStatus::Complete(payload) => return Ok(payload),
                    ReplyStatus::Invalid(reason) => {
                        self.stats.invalid_replies += 1;
                        match reason {
                            InvalidReason::Checksum => {
                                warn!(error = %BusError::ChecksumInvalid, "treating as no reply");
                            }
                            other => debug!(?other, "invalid reply frame"),
                        }
                        return Err(AttemptError::NoValidReply);
                    }
                },
                Ok(None) => {
                    debug!("reply deadline elapsed");
                    return Err(AttemptError::NoValidReply);
                }
                Err(err) => return Err(AttemptError::Fatal(err)),
            }
        }
    }

    fn write(&mut self, byte: u8) -> Result<(), BusError> {
        self.transport
            .write_byte(byte)
            .map_err(|e| BusError::DeviceFault(e.0))?;
        self.record(byte);
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<u8>, BusError> {
        let result = self
            .transport
            .read_byte(timeout)
            .map_err(|e| BusError::DeviceFault(e.0))?;
        if let Some(byte) = result {
            self.record(byte);
        }
        Ok(result)
    }

    fn record(&mut self, byte: u8) {
        if let Some(dump) = &mut self.dump {
            if let Err(err) = dump.record(&[byte]) {
                warn!(error = %err, "dump file write failed, disabling dump");
                self.dump = None;
            }
        }
    }
}
