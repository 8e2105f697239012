//! RFC 2347 option negotiation for read requests.
//!
//! The server must either accept a recognized option with a valid value or
//! leave it out of the OACK; malformed, out-of-range and unknown options are
//! silently ignored. Accepted pairs keep their request order so the OACK is
//! deterministic.

use std::time::Duration;

use tracing::debug;

use crate::{MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Outcome of negotiating the option tail of an RRQ.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NegotiatedOptions {
    /// RFC 2348 block size, if requested and in range.
    pub block_size: Option<usize>,
    /// RFC 2349 retransmit timeout, if requested and in range.
    pub timeout: Option<Duration>,
    /// Accepted (name, value) pairs, in request order, for the OACK.
    pub reply: Vec<(String, String)>,
}

impl NegotiatedOptions {
    pub fn any_accepted(&self) -> bool {
        !self.reply.is_empty()
    }
}

/// Validate the requested options against a file of `file_size` octets.
pub fn negotiate(requested: &[(String, String)], file_size: u64) -> NegotiatedOptions {
    let mut negotiated = NegotiatedOptions::default();

    for (name, value) in requested {
        let name = name.to_ascii_lowercase();
        if negotiated.reply.iter().any(|(accepted, _)| *accepted == name) {
            debug!("ignoring repeated option '{}'", name);
            continue;
        }
        match name.as_str() {
            "blksize" => match value.parse::<usize>() {
                // RFC 2348: valid range 8..=65464
                Ok(size) if (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) => {
                    negotiated.block_size = Some(size);
                    negotiated.reply.push((name, size.to_string()));
                }
                _ => debug!("ignoring blksize option with value '{}'", value),
            },
            "timeout" => match value.parse::<u64>() {
                // RFC 2349: valid range 1..=255 seconds
                Ok(secs) if (1..=255).contains(&secs) => {
                    negotiated.timeout = Some(Duration::from_secs(secs));
                    negotiated.reply.push((name, secs.to_string()));
                }
                _ => debug!("ignoring timeout option with value '{}'", value),
            },
            "tsize" => match value.parse::<u64>() {
                // RFC 2349: on RRQ the client sends 0 and the server answers
                // with the actual size
                Ok(0) => negotiated.reply.push((name, file_size.to_string())),
                _ => debug!("ignoring tsize option with value '{}'", value),
            },
            other => debug!("ignoring unknown option '{}'", other),
        }
    }

    negotiated
}
