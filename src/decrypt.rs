//! Sample decryption parameters and chunking arithmetic.
use byteorder::{BigEndian, ByteOrder};

use crate::boundary::{CipherMode, PatternDescriptor};

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Largest buffer handed to the boundary once it reports "buffer too large".
pub const MAX_CHUNK_SIZE: usize = 100 * 1024;

/// Destination buffer kind, resolved once per crypto session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationBufferType {
    Clear,
    Secure,
    Direct,
}

/// Where the caller wants decrypted bytes written.
#[derive(Debug)]
pub enum DecryptOutput<'a> {
    /// Caller memory. Output starts at `DecryptParams::output_offset`.
    Clear(&'a mut [u8]),
    /// Opaque secure buffer of `length` bytes.
    Secure { handle: u64, length: usize },
    /// No caller buffer. Only valid with a direct destination.
    Direct,
}

/// One subsample to decrypt.
#[derive(Debug)]
pub struct DecryptParams<'a> {
    pub key_id: &'a [u8],
    pub is_encrypted: bool,
    /// Output must stay in protected memory.
    pub is_secure: bool,
    pub cipher_mode: CipherMode,
    pub input: &'a [u8],
    pub iv: [u8; 16],
    pub block_offset: usize,
    pub output: DecryptOutput<'a>,
    pub output_offset: usize,
    pub subsample_flags: u8,
    pub is_video: bool,
    pub pattern: PatternDescriptor,
}

impl<'a> DecryptParams<'a> {
    /// Encrypted subsample decrypted into `output`.
    pub fn encrypted(
        key_id: &'a [u8],
        input: &'a [u8],
        iv: [u8; 16],
        cipher_mode: CipherMode,
        output: &'a mut [u8],
    ) -> Self {
        Self {
            key_id,
            is_encrypted: true,
            is_secure: false,
            cipher_mode,
            input,
            iv,
            block_offset: 0,
            output: DecryptOutput::Clear(output),
            output_offset: 0,
            subsample_flags: crate::boundary::FIRST_SUBSAMPLE | crate::boundary::LAST_SUBSAMPLE,
            is_video: true,
            pattern: PatternDescriptor::default(),
        }
    }

    /// Clear subsample copied into `output`.
    pub fn clear(input: &'a [u8], output: &'a mut [u8]) -> Self {
        Self {
            is_encrypted: false,
            ..Self::encrypted(&[], input, [0u8; 16], CipherMode::Ctr, output)
        }
    }

    pub fn with_pattern(mut self, pattern: PatternDescriptor) -> Self {
        self.pattern = pattern;
        self
    }
}

/// Reject patterns the chunked decrypt path cannot step through: a
/// repetition longer than [`MAX_CHUNK_SIZE`], or a cbcs pattern without
/// encrypted blocks.
pub fn check_pattern(pattern: &PatternDescriptor, mode: CipherMode) -> Result<(), &'static str> {
    let pattern_length = pattern
        .checked_length_in_bytes()
        .ok_or("pattern length overflows")?;
    if pattern_length > MAX_CHUNK_SIZE {
        return Err("pattern longer than chunk size");
    }
    if mode == CipherMode::Cbc && pattern_length > 0 && pattern.encrypt == 0 {
        return Err("pattern has no encrypted blocks");
    }
    Ok(())
}

/// Chunk size for a pattern: the largest whole number of pattern
/// repetitions that fits in [`MAX_CHUNK_SIZE`].
pub fn chunk_size_for(pattern: &PatternDescriptor) -> usize {
    let pattern_length = pattern.length_in_bytes();
    if pattern_length > 0 && pattern_length <= MAX_CHUNK_SIZE {
        MAX_CHUNK_SIZE - (MAX_CHUNK_SIZE % pattern_length)
    } else {
        MAX_CHUNK_SIZE
    }
}

/// Add `blocks` to the big-endian counter in the low half of a CTR IV.
pub fn increment_iv(iv: &mut [u8; 16], blocks: u64) {
    let counter = BigEndian::read_u64(&iv[8..]);
    BigEndian::write_u64(&mut iv[8..], counter.wrapping_add(blocks));
}

/// IV for the chunk following `chunk`, which was decrypted with `iv`.
///
/// `chunk` is a whole number of blocks (and pattern repetitions when a
/// pattern is set).
pub fn next_chunk_iv(
    iv: &[u8; 16],
    chunk: &[u8],
    mode: CipherMode,
    pattern: &PatternDescriptor,
) -> [u8; 16] {
    let mut next = *iv;
    let pattern_length = pattern.length_in_bytes();
    match mode {
        CipherMode::Ctr => {
            let blocks = if pattern_length == 0 {
                chunk.len() / AES_BLOCK_SIZE
            } else {
                (chunk.len() / pattern_length) * pattern.encrypt
            };
            increment_iv(&mut next, blocks as u64);
        }
        CipherMode::Cbc => {
            // cbcs: the trailing skip blocks are clear, so step back over them.
            let block_end = if pattern_length == 0 {
                chunk.len()
            } else {
                chunk.len() - AES_BLOCK_SIZE * pattern.skip
            };
            next.copy_from_slice(&chunk[block_end - AES_BLOCK_SIZE..block_end]);
        }
    }
    next
}
