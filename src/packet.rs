//! TFTP packet framing.
//!
//! Packets are framed on UDP with a 2-byte big-endian opcode prefix. String
//! fields (filenames, modes, option names/values, error messages) travel as
//! NUL-terminated Latin-1, so decoding maps each byte to the corresponding
//! `char` and encoding substitutes `?` for anything outside that range.

use bytes::{BufMut, BytesMut};

use crate::error::{Result, TftpError};
use crate::{ErrorCode, Opcode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    },
    Wrq {
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    },
    Data {
        block: u16,
        payload: Vec<u8>,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    Oack {
        options: Vec<(String, String)>,
    },
}

impl Packet {
    /// Decode a raw datagram.
    ///
    /// Fails with [`TftpError::Malformed`] when the datagram is shorter than
    /// 4 bytes for DATA/ACK/ERROR, when a NUL terminator is missing in a
    /// string field, or when the opcode is outside 1..=6.
    pub fn decode(buf: &[u8]) -> Result<Packet> {
        if buf.len() < 2 {
            return Err(TftpError::Malformed("datagram shorter than opcode"));
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode =
            Opcode::from_u16(opcode).ok_or(TftpError::Malformed("opcode outside 1..=6"))?;

        match opcode {
            Opcode::Rrq | Opcode::Wrq => {
                let mut pos = 2;
                let filename = read_cstring(buf, &mut pos)?;
                let mode = read_cstring(buf, &mut pos)?;
                let options = read_option_pairs(buf, &mut pos)?;
                if opcode == Opcode::Rrq {
                    Ok(Packet::Rrq {
                        filename,
                        mode,
                        options,
                    })
                } else {
                    Ok(Packet::Wrq {
                        filename,
                        mode,
                        options,
                    })
                }
            }
            Opcode::Data => {
                if buf.len() < 4 {
                    return Err(TftpError::Malformed("DATA shorter than 4 bytes"));
                }
                Ok(Packet::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    payload: buf[4..].to_vec(),
                })
            }
            Opcode::Ack => {
                if buf.len() < 4 {
                    return Err(TftpError::Malformed("ACK shorter than 4 bytes"));
                }
                Ok(Packet::Ack {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                })
            }
            Opcode::Error => {
                if buf.len() < 4 {
                    return Err(TftpError::Malformed("ERROR shorter than 4 bytes"));
                }
                let mut pos = 4;
                let message = read_cstring(buf, &mut pos)?;
                Ok(Packet::Error {
                    code: u16::from_be_bytes([buf[2], buf[3]]),
                    message,
                })
            }
            Opcode::Oack => {
                let mut pos = 2;
                let options = read_option_pairs(buf, &mut pos)?;
                Ok(Packet::Oack { options })
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => encode_request(Opcode::Rrq, filename, mode, options),
            Packet::Wrq {
                filename,
                mode,
                options,
            } => encode_request(Opcode::Wrq, filename, mode, options),
            Packet::Data { block, payload } => data_datagram(*block, payload),
            Packet::Ack { block } => ack_datagram(*block),
            Packet::Error { code, message } => {
                let mut packet = BytesMut::with_capacity(5 + message.len());
                packet.put_u16(Opcode::Error as u16);
                packet.put_u16(*code);
                put_latin1(&mut packet, message);
                packet.put_u8(0);
                packet.to_vec()
            }
            Packet::Oack { options } => oack_datagram(options),
        }
    }
}

/// Build a DATA datagram for `block` with the given payload.
pub fn data_datagram(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(4 + payload.len());
    packet.put_u16(Opcode::Data as u16);
    packet.put_u16(block);
    packet.put_slice(payload);
    packet.to_vec()
}

pub fn ack_datagram(block: u16) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(4);
    packet.put_u16(Opcode::Ack as u16);
    packet.put_u16(block);
    packet.to_vec()
}

/// Build an ERROR datagram: opcode 5, error code, Latin-1 message, NUL.
pub fn error_datagram(code: ErrorCode, message: &str) -> Vec<u8> {
    Packet::Error {
        code: code as u16,
        message: message.to_string(),
    }
    .encode()
}

/// Build an OACK datagram echoing the accepted option pairs in order.
pub fn oack_datagram(options: &[(String, String)]) -> Vec<u8> {
    let mut packet = BytesMut::new();
    packet.put_u16(Opcode::Oack as u16);
    for (name, value) in options {
        put_latin1(&mut packet, name);
        packet.put_u8(0);
        put_latin1(&mut packet, value);
        packet.put_u8(0);
    }
    packet.to_vec()
}

fn encode_request(
    opcode: Opcode,
    filename: &str,
    mode: &str,
    options: &[(String, String)],
) -> Vec<u8> {
    let mut packet = BytesMut::with_capacity(4 + filename.len() + mode.len());
    packet.put_u16(opcode as u16);
    put_latin1(&mut packet, filename);
    packet.put_u8(0);
    put_latin1(&mut packet, mode);
    packet.put_u8(0);
    for (name, value) in options {
        put_latin1(&mut packet, name);
        packet.put_u8(0);
        put_latin1(&mut packet, value);
        packet.put_u8(0);
    }
    packet.to_vec()
}

/// Read a NUL-terminated Latin-1 string starting at `*pos`, advancing past
/// the terminator.
fn read_cstring(buf: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let nul = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(TftpError::Malformed("string field missing NUL terminator"))?;
    let value = latin1_string(&buf[start..start + nul]);
    *pos = start + nul + 1;
    Ok(value)
}

fn read_option_pairs(buf: &[u8], pos: &mut usize) -> Result<Vec<(String, String)>> {
    let mut options = Vec::new();
    while *pos < buf.len() {
        let name = read_cstring(buf, pos)?;
        if *pos >= buf.len() {
            // dangling name without a value; RFC 2347 peers never send this,
            // tolerate it the way the option loop tolerates bad values
            break;
        }
        let value = read_cstring(buf, pos)?;
        options.push((name, value));
    }
    Ok(options)
}

fn latin1_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn put_latin1(packet: &mut BytesMut, s: &str) {
    for ch in s.chars() {
        if (ch as u32) < 256 {
            packet.put_u8(ch as u8);
        } else {
            packet.put_u8(b'?');
        }
    }
}
