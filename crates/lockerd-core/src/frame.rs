//! Modbus RTU framing: request encoding, reply decoding, CRC-16.
//!
//! Coil numbers at this level are 1-based (coil 1 of a 16-relay card); the
//! wire carries 0-based addresses, so encoding subtracts one. The CRC is the
//! standard Modbus CRC-16 (polynomial 0xA001) appended low byte first.
//!
//! Function codes supported: 0x01 Read Coils, 0x05 Write Single Coil,
//! 0x0F Write Multiple Coils. Exception replies (function | 0x80) decode to
//! [`FrameError::Exception`].

use crate::error::FrameError;

/// Read Coils.
pub const FN_READ_COILS: u8 = 0x01;
/// Write Single Coil.
pub const FN_WRITE_SINGLE_COIL: u8 = 0x05;
/// Write Multiple Coils.
pub const FN_WRITE_MULTIPLE_COILS: u8 = 0x0F;

/// Coils on one relay card.
pub const COILS_PER_CARD: u16 = 16;

/// Highest addressable slave.
pub const MAX_SLAVE: u8 = 247;

/// A Modbus RTU request this system can issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Function 0x01.
    ReadCoils { slave: u8, first_coil: u16, count: u16 },
    /// Function 0x05.
    WriteSingleCoil { slave: u8, coil: u16, on: bool },
    /// Function 0x0F.
    WriteMultipleCoils {
        slave: u8,
        first_coil: u16,
        bits: Vec<bool>,
    },
}

/// A decoded happy-path reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Coil states, in request order.
    Coils(Vec<bool>),
    /// Echo reply to Write Single Coil, verified.
    WriteSingle,
    /// Ack to Write Multiple Coils with the coil count written.
    WriteMultiple { count: u16 },
}

/// Modbus CRC-16, polynomial 0xA001, initial value 0xFFFF.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn push_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.push((crc & 0xFF) as u8);
    frame.push((crc >> 8) as u8);
}

fn check_slave(slave: u8) -> Result<(), FrameError> {
    if slave == 0 || slave > MAX_SLAVE {
        return Err(FrameError::InvalidRequest {
            reason: format!("slave {slave} outside 1..={MAX_SLAVE}"),
        });
    }
    Ok(())
}

fn check_coil(coil: u16) -> Result<u16, FrameError> {
    if coil == 0 {
        return Err(FrameError::InvalidRequest {
            reason: "coil numbers are 1-based".to_owned(),
        });
    }
    Ok(coil - 1)
}

impl Request {
    /// The addressed slave.
    #[must_use]
    pub fn slave(&self) -> u8 {
        match self {
            Self::ReadCoils { slave, .. }
            | Self::WriteSingleCoil { slave, .. }
            | Self::WriteMultipleCoils { slave, .. } => *slave,
        }
    }

    /// The function code this request uses.
    #[must_use]
    pub fn function(&self) -> u8 {
        match self {
            Self::ReadCoils { .. } => FN_READ_COILS,
            Self::WriteSingleCoil { .. } => FN_WRITE_SINGLE_COIL,
            Self::WriteMultipleCoils { .. } => FN_WRITE_MULTIPLE_COILS,
        }
    }

    /// Length in bytes of the happy-path reply to this request.
    #[must_use]
    pub fn reply_len(&self) -> usize {
        match self {
            Self::ReadCoils { count, .. } => 5 + (usize::from(*count) + 7) / 8,
            Self::WriteSingleCoil { .. } | Self::WriteMultipleCoils { .. } => 8,
        }
    }

    /// Encode the request into a full RTU frame (CRC included).
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidRequest`] for out-of-range parameters.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        check_slave(self.slave())?;

        let mut frame = Vec::with_capacity(16);
        match self {
            Self::ReadCoils {
                slave,
                first_coil,
                count,
            } => {
                if *count == 0 || *count > 2000 {
                    return Err(FrameError::InvalidRequest {
                        reason: format!("coil count {count} outside 1..=2000"),
                    });
                }
                let addr = check_coil(*first_coil)?;
                frame.push(*slave);
                frame.push(FN_READ_COILS);
                frame.extend_from_slice(&addr.to_be_bytes());
                frame.extend_from_slice(&count.to_be_bytes());
            }
            Self::WriteSingleCoil { slave, coil, on } => {
                let addr = check_coil(*coil)?;
                frame.push(*slave);
                frame.push(FN_WRITE_SINGLE_COIL);
                frame.extend_from_slice(&addr.to_be_bytes());
                frame.extend_from_slice(if *on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
            }
            Self::WriteMultipleCoils {
                slave,
                first_coil,
                bits,
            } => {
                if bits.is_empty() || bits.len() > 1968 {
                    return Err(FrameError::InvalidRequest {
                        reason: format!("bit count {} outside 1..=1968", bits.len()),
                    });
                }
                let addr = check_coil(*first_coil)?;
                frame.push(*slave);
                frame.push(FN_WRITE_MULTIPLE_COILS);
                frame.extend_from_slice(&addr.to_be_bytes());
                frame.extend_from_slice(&(bits.len() as u16).to_be_bytes());
                frame.push(((bits.len() + 7) / 8) as u8);
                frame.extend_from_slice(&pack_bits(bits));
            }
        }
        push_crc(&mut frame);
        Ok(frame)
    }
}

/// Pack bits LSB-first into bytes, per the Modbus coil layout.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect()
}

/// Verify the CRC tail of a frame and return the payload without it.
fn strip_crc(raw: &[u8]) -> Result<&[u8], FrameError> {
    if raw.len() < 4 {
        return Err(FrameError::TooShort { actual: raw.len() });
    }
    let (payload, tail) = raw.split_at(raw.len() - 2);
    let expected = crc16(payload);
    let actual = u16::from(tail[0]) | (u16::from(tail[1]) << 8);
    if expected != actual {
        return Err(FrameError::CrcMismatch { expected, actual });
    }
    Ok(payload)
}

/// Decode a reply frame against the request that produced it.
///
/// # Errors
///
/// - [`FrameError::TooShort`] / [`FrameError::CrcMismatch`] for corrupt frames.
/// - [`FrameError::SlaveMismatch`] / [`FrameError::FunctionMismatch`] when
///   the reply does not belong to the request.
/// - [`FrameError::Exception`] when the slave answered with an exception.
/// - [`FrameError::EchoMismatch`] when an echo reply differs from the request.
pub fn decode_reply(request: &Request, raw: &[u8]) -> Result<Reply, FrameError> {
    let payload = strip_crc(raw)?;

    if payload[0] != request.slave() {
        return Err(FrameError::SlaveMismatch {
            expected: request.slave(),
            actual: payload[0],
        });
    }

    let function = payload[1];
    if function == request.function() | 0x80 {
        if payload.len() < 3 {
            return Err(FrameError::TooShort { actual: raw.len() });
        }
        return Err(FrameError::Exception {
            function: request.function(),
            code: payload[2],
        });
    }
    if function != request.function() {
        return Err(FrameError::FunctionMismatch {
            expected: request.function(),
            actual: function,
        });
    }

    match request {
        Request::ReadCoils { count, .. } => {
            let byte_count = usize::from(*payload.get(2).ok_or(FrameError::TooShort {
                actual: raw.len(),
            })?);
            let data = payload.get(3..).ok_or(FrameError::TooShort { actual: raw.len() })?;
            if data.len() != byte_count || byte_count < (usize::from(*count) + 7) / 8 {
                return Err(FrameError::EchoMismatch {
                    reason: format!("read coils byte count {byte_count} for {count} coils"),
                });
            }
            Ok(Reply::Coils(unpack_bits(data, usize::from(*count))))
        }
        Request::WriteSingleCoil { .. } => {
            // The reply is a byte-for-byte echo of the request.
            let encoded = request.encode()?;
            if raw != encoded.as_slice() {
                return Err(FrameError::EchoMismatch {
                    reason: "write single coil echo differs".to_owned(),
                });
            }
            Ok(Reply::WriteSingle)
        }
        Request::WriteMultipleCoils {
            first_coil, bits, ..
        } => {
            if payload.len() != 6 {
                return Err(FrameError::EchoMismatch {
                    reason: "write multiple coils ack has wrong length".to_owned(),
                });
            }
            let addr = u16::from_be_bytes([payload[2], payload[3]]);
            let count = u16::from_be_bytes([payload[4], payload[5]]);
            if addr != first_coil - 1 || usize::from(count) != bits.len() {
                return Err(FrameError::EchoMismatch {
                    reason: format!("write multiple coils ack addr {addr} count {count}"),
                });
            }
            Ok(Reply::WriteMultiple { count })
        }
    }
}

/// Decode a request frame. Used by the in-memory port to interpret what the
/// worker sent, and by tests to assert the round-trip law.
///
/// # Errors
///
/// Returns a [`FrameError`] for corrupt or unsupported frames.
pub fn decode_request(raw: &[u8]) -> Result<Request, FrameError> {
    let payload = strip_crc(raw)?;
    if payload.len() < 4 {
        return Err(FrameError::TooShort { actual: raw.len() });
    }

    let slave = payload[0];
    match payload[1] {
        FN_READ_COILS if payload.len() == 6 => Ok(Request::ReadCoils {
            slave,
            first_coil: u16::from_be_bytes([payload[2], payload[3]]) + 1,
            count: u16::from_be_bytes([payload[4], payload[5]]),
        }),
        FN_WRITE_SINGLE_COIL if payload.len() == 6 => {
            let value = u16::from_be_bytes([payload[4], payload[5]]);
            let on = match value {
                0xFF00 => true,
                0x0000 => false,
                other => {
                    return Err(FrameError::EchoMismatch {
                        reason: format!("bad coil value {other:#06x}"),
                    })
                }
            };
            Ok(Request::WriteSingleCoil {
                slave,
                coil: u16::from_be_bytes([payload[2], payload[3]]) + 1,
                on,
            })
        }
        FN_WRITE_MULTIPLE_COILS if payload.len() >= 7 => {
            let count = u16::from_be_bytes([payload[4], payload[5]]);
            let byte_count = usize::from(payload[6]);
            let data = &payload[7..];
            if data.len() != byte_count || byte_count < (usize::from(count) + 7) / 8 {
                return Err(FrameError::EchoMismatch {
                    reason: "write multiple coils data length".to_owned(),
                });
            }
            Ok(Request::WriteMultipleCoils {
                slave,
                first_coil: u16::from_be_bytes([payload[2], payload[3]]) + 1,
                bits: unpack_bits(data, usize::from(count)),
            })
        }
        other => Err(FrameError::FunctionMismatch {
            expected: 0,
            actual: other,
        }),
    }
}

/// Build the happy-path reply a well-behaved slave would send. Used by the
/// in-memory port.
///
/// # Errors
///
/// Returns [`FrameError::InvalidRequest`] if the request cannot be encoded.
pub fn success_reply(request: &Request) -> Result<Vec<u8>, FrameError> {
    match request {
        // Callers that care about coil state build the reply themselves via
        // `coils_reply`; default to all-off.
        Request::ReadCoils { slave, count, .. } => {
            Ok(coils_reply(*slave, &vec![false; usize::from(*count)]))
        }
        Request::WriteSingleCoil { .. } => request.encode(),
        Request::WriteMultipleCoils {
            slave,
            first_coil,
            bits,
        } => {
            let mut frame = vec![*slave, FN_WRITE_MULTIPLE_COILS];
            frame.extend_from_slice(&(first_coil - 1).to_be_bytes());
            frame.extend_from_slice(&(bits.len() as u16).to_be_bytes());
            push_crc(&mut frame);
            Ok(frame)
        }
    }
}

/// Build a Read Coils reply carrying the given bits.
#[must_use]
pub fn coils_reply(slave: u8, bits: &[bool]) -> Vec<u8> {
    let data = pack_bits(bits);
    let mut frame = vec![slave, FN_READ_COILS, data.len() as u8];
    frame.extend_from_slice(&data);
    push_crc(&mut frame);
    frame
}

/// Build an exception reply for a function code.
#[must_use]
pub fn exception_reply(slave: u8, function: u8, code: u8) -> Vec<u8> {
    let mut frame = vec![slave, function | 0x80, code];
    push_crc(&mut frame);
    frame
}
