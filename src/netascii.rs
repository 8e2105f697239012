//! NetASCII line-ending translation for outgoing transfers.
//!
//! On the wire every CR becomes `CR NUL` and every LF becomes `CR LF`
//! (RFC 764 as referenced by RFC 1350). Because the expansion can grow a
//! block past the negotiated block size, surplus bytes are carried into the
//! head of the next block. Carried bytes are already in wire form and must
//! not pass through the translation again.

use std::io::Read;

#[derive(Debug, Default)]
pub struct NetasciiEncoder {
    carry: Vec<u8>,
}

impl NetasciiEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if expansion surplus from an earlier block is still pending.
    pub fn has_carry(&self) -> bool {
        !self.carry.is_empty()
    }

    /// Produce the next wire block of at most `block_size` bytes.
    ///
    /// The block starts with any carried-over bytes, then up to the remaining
    /// capacity is read from `src` and translated. Surplus produced by the
    /// translation is retained for the following call.
    pub fn next_block<R: Read>(
        &mut self,
        src: &mut R,
        block_size: usize,
    ) -> std::io::Result<Vec<u8>> {
        let mut block = std::mem::take(&mut self.carry);
        if block.len() > block_size {
            self.carry = block.split_off(block_size);
            return Ok(block);
        }

        let want = (block_size - block.len()) as u64;
        let mut raw = Vec::with_capacity(want as usize);
        src.take(want).read_to_end(&mut raw)?;

        for &byte in &raw {
            match byte {
                0x0d => {
                    block.push(0x0d);
                    block.push(0x00);
                }
                0x0a => {
                    block.push(0x0d);
                    block.push(0x0a);
                }
                other => block.push(other),
            }
        }

        if block.len() > block_size {
            self.carry = block.split_off(block_size);
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn one_block(input: &[u8], block_size: usize) -> Vec<u8> {
        let mut encoder = NetasciiEncoder::new();
        let block = encoder
            .next_block(&mut Cursor::new(input), block_size)
            .unwrap();
        assert!(!encoder.has_carry());
        block
    }

    #[test]
    fn expands_line_endings() {
        assert_eq!(one_block(b"one\ntwo", 64), b"one\r\ntwo");
        assert_eq!(one_block(b"one\rtwo", 64), b"one\r\0two");
        // CR LF in the source expands blindly, byte by byte
        assert_eq!(one_block(b"a\r\nb", 64), b"a\r\0\r\nb");
    }

    #[test]
    fn passes_plain_bytes_through() {
        assert_eq!(one_block(b"no endings here", 64), b"no endings here");
        assert_eq!(one_block(b"", 64), b"");
    }

    #[test]
    fn carries_surplus_into_next_block() {
        // 7 source bytes expand to 9 wire bytes; block size 8 leaves one over
        let mut encoder = NetasciiEncoder::new();
        let mut src = Cursor::new(b"abcde\n\rxyz".to_vec());

        let first = encoder.next_block(&mut src, 8).unwrap();
        assert_eq!(first, b"abcde\r\n\r");
        assert!(encoder.has_carry());

        let second = encoder.next_block(&mut src, 8).unwrap();
        assert_eq!(second, b"\0xyz");
        assert!(!encoder.has_carry());
    }

    #[test]
    fn carried_lf_is_not_translated_again() {
        // expansion of the trailing LF splits exactly across the boundary
        let mut input = vec![b'a'; 7];
        input.push(0x0a);
        input.extend_from_slice(b"tail");
        let mut encoder = NetasciiEncoder::new();
        let mut src = Cursor::new(input);

        let first = encoder.next_block(&mut src, 8).unwrap();
        assert_eq!(&first[..7], &[b'a'; 7]);
        assert_eq!(first[7], 0x0d);

        let second = encoder.next_block(&mut src, 8).unwrap();
        // a second translation would turn the carried LF into CR LF
        assert_eq!(second, b"\ntail");
    }

    #[test]
    fn full_block_of_carry_reads_nothing() {
        let mut encoder = NetasciiEncoder::new();
        let mut src = Cursor::new(vec![0x0d; 4]);

        let first = encoder.next_block(&mut src, 4).unwrap();
        assert_eq!(first, b"\r\0\r\0");
        assert!(encoder.has_carry());

        // the pending carry fills the next block exactly; the source is
        // consumed only after the carry drains
        let second = encoder.next_block(&mut src, 4).unwrap();
        assert_eq!(second, b"\r\0\r\0");
        assert!(!encoder.has_carry());
    }

    #[test]
    fn drains_carry_after_source_is_exhausted() {
        let mut encoder = NetasciiEncoder::new();
        let mut src = Cursor::new(b"ab\n".to_vec());

        let first = encoder.next_block(&mut src, 3).unwrap();
        assert_eq!(first, b"ab\r");
        assert!(encoder.has_carry());

        let second = encoder.next_block(&mut src, 3).unwrap();
        assert_eq!(second, b"\n");
        assert!(!encoder.has_carry());
    }
}
