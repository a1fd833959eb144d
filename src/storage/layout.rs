#![forbid(unsafe_code)]

//! Key/value layouts the tree is generic over.

use std::cmp::Ordering;
use std::fmt;

use crate::types::{page::read_array, Result, TreeError};

/// Binary encoding and ordering contract for the keys and values of a tree.
///
/// Every key occupies exactly [`Layout::key_size`] bytes on a page and every
/// value [`Layout::value_size`] bytes. The encoded ordering must agree with
/// [`Layout::compare`].
pub trait Layout: Send + Sync + 'static {
    /// Decoded key type.
    type Key: Clone + fmt::Debug + Send;
    /// Decoded value type.
    type Value: Clone + fmt::Debug + Send;

    /// Stable identifier recorded in the tree header.
    fn identifier(&self) -> u64;
    /// Major format version recorded in the tree header.
    fn major_version(&self) -> u32;
    /// Minor format version recorded in the tree header.
    fn minor_version(&self) -> u32;
    /// Size of an encoded key in bytes.
    fn key_size(&self) -> usize;
    /// Size of an encoded value in bytes.
    fn value_size(&self) -> usize;

    /// Orders two decoded keys.
    fn compare(&self, a: &Self::Key, b: &Self::Key) -> Ordering;

    /// Encodes `key` into `dst` (exactly `key_size` bytes).
    fn write_key(&self, key: &Self::Key, dst: &mut [u8]) -> Result<()>;
    /// Decodes a key from `src`.
    fn read_key(&self, src: &[u8]) -> Result<Self::Key>;
    /// Encodes `value` into `dst` (exactly `value_size` bytes).
    fn write_value(&self, value: &Self::Value, dst: &mut [u8]) -> Result<()>;
    /// Decodes a value from `src`.
    fn read_value(&self, src: &[u8]) -> Result<Self::Value>;

    /// Orders two encoded keys. Defaults to decoding both sides.
    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (self.read_key(a), self.read_key(b)) {
            (Ok(a), Ok(b)) => self.compare(&a, &b),
            _ => a.cmp(b),
        }
    }
}

/// Layouts able to generate deterministic keys and values from a seed.
pub trait TestLayout: Layout {
    /// Key derived from `seed`. Keys order the same way their seeds do.
    fn key(&self, seed: u64) -> Self::Key;
    /// Value derived from `seed`.
    fn value(&self, seed: u64) -> Self::Value;
    /// Recovers the seed a key was generated from.
    fn key_seed(&self, key: &Self::Key) -> u64;
    /// Recovers the seed a value was generated from.
    fn value_seed(&self, value: &Self::Value) -> u64;
}

const LONG_LAYOUT_ID: u64 = u64::from_be_bytes(*b"gbtLONG\0");
const BYTES_LAYOUT_ID: u64 = u64::from_be_bytes(*b"gbtBYTES");

/// `u64 -> u64` layout whose keys carry optional zero padding.
///
/// Padding inflates the on-page key size so small trees still exercise deep
/// structures.
#[derive(Clone, Copy, Debug)]
pub struct LongLayout {
    key_padding: usize,
}

impl LongLayout {
    /// Layout with unpadded 8-byte keys.
    pub fn new() -> Self {
        Self { key_padding: 0 }
    }

    /// Layout whose keys are `8 + padding` bytes.
    pub fn with_key_padding(padding: usize) -> Self {
        Self {
            key_padding: padding,
        }
    }
}

impl Default for LongLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl Layout for LongLayout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        LONG_LAYOUT_ID
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        self.key_padding as u32
    }

    fn key_size(&self) -> usize {
        8 + self.key_padding
    }

    fn value_size(&self) -> usize {
        8
    }

    fn compare(&self, a: &u64, b: &u64) -> Ordering {
        a.cmp(b)
    }

    fn write_key(&self, key: &u64, dst: &mut [u8]) -> Result<()> {
        if dst.len() != self.key_size() {
            return Err(TreeError::Invalid("key buffer has wrong size"));
        }
        dst[..8].copy_from_slice(&key.to_be_bytes());
        dst[8..].fill(0);
        Ok(())
    }

    fn read_key(&self, src: &[u8]) -> Result<u64> {
        if src.len() < 8 {
            return Err(TreeError::Corruption("long key truncated"));
        }
        Ok(u64::from_be_bytes(read_array(&src[..8])?))
    }

    fn write_value(&self, value: &u64, dst: &mut [u8]) -> Result<()> {
        if dst.len() != 8 {
            return Err(TreeError::Invalid("value buffer has wrong size"));
        }
        dst.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn read_value(&self, src: &[u8]) -> Result<u64> {
        Ok(u64::from_be_bytes(read_array(src)?))
    }

    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Ordering {
        a[..8].cmp(&b[..8])
    }
}

impl TestLayout for LongLayout {
    fn key(&self, seed: u64) -> u64 {
        seed
    }

    fn value(&self, seed: u64) -> u64 {
        seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }

    fn key_seed(&self, key: &u64) -> u64 {
        *key
    }

    fn value_seed(&self, value: &u64) -> u64 {
        // 0x9E37_79B9_7F4A_7C15 is odd, so its inverse mod 2^64 exists.
        value.wrapping_mul(0xF1DE_83E1_9937_733D)
    }
}

/// Layout for byte-string keys and values bounded by fixed maxima.
///
/// Each side is stored as a `u16` length followed by the bytes, zero padded.
/// Keys order lexicographically.
#[derive(Clone, Copy, Debug)]
pub struct BytesLayout {
    max_key_len: usize,
    max_value_len: usize,
}

impl BytesLayout {
    /// Layout accepting keys up to `max_key_len` and values up to `max_value_len` bytes.
    pub fn new(max_key_len: usize, max_value_len: usize) -> Self {
        Self {
            max_key_len: max_key_len.min(u16::MAX as usize),
            max_value_len: max_value_len.min(u16::MAX as usize),
        }
    }

    fn write_bytes(src: &[u8], dst: &mut [u8], max: usize, what: &'static str) -> Result<()> {
        if src.len() > max {
            return Err(TreeError::CapacityExceeded { what, limit: max });
        }
        if dst.len() != max + 2 {
            return Err(TreeError::Invalid("byte buffer has wrong size"));
        }
        dst[..2].copy_from_slice(&(src.len() as u16).to_be_bytes());
        dst[2..2 + src.len()].copy_from_slice(src);
        dst[2 + src.len()..].fill(0);
        Ok(())
    }

    fn bytes_of(src: &[u8]) -> Result<&[u8]> {
        if src.len() < 2 {
            return Err(TreeError::Corruption("byte entry truncated"));
        }
        let len = u16::from_be_bytes(read_array(&src[..2])?) as usize;
        src.get(2..2 + len)
            .ok_or(TreeError::Corruption("byte entry length beyond slot"))
    }
}

impl Layout for BytesLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn identifier(&self) -> u64 {
        BYTES_LAYOUT_ID
    }

    fn major_version(&self) -> u32 {
        1
    }

    fn minor_version(&self) -> u32 {
        0
    }

    fn key_size(&self) -> usize {
        self.max_key_len + 2
    }

    fn value_size(&self) -> usize {
        self.max_value_len + 2
    }

    fn compare(&self, a: &Vec<u8>, b: &Vec<u8>) -> Ordering {
        a.cmp(b)
    }

    fn write_key(&self, key: &Vec<u8>, dst: &mut [u8]) -> Result<()> {
        Self::write_bytes(key, dst, self.max_key_len, "key length")
    }

    fn read_key(&self, src: &[u8]) -> Result<Vec<u8>> {
        Ok(Self::bytes_of(src)?.to_vec())
    }

    fn write_value(&self, value: &Vec<u8>, dst: &mut [u8]) -> Result<()> {
        Self::write_bytes(value, dst, self.max_value_len, "value length")
    }

    fn read_value(&self, src: &[u8]) -> Result<Vec<u8>> {
        Ok(Self::bytes_of(src)?.to_vec())
    }

    fn compare_encoded(&self, a: &[u8], b: &[u8]) -> Ordering {
        match (Self::bytes_of(a), Self::bytes_of(b)) {
            (Ok(a), Ok(b)) => a.cmp(b),
            _ => a.cmp(b),
        }
    }
}

impl TestLayout for BytesLayout {
    fn key(&self, seed: u64) -> Vec<u8> {
        seed.to_be_bytes().to_vec()
    }

    fn value(&self, seed: u64) -> Vec<u8> {
        seed.to_le_bytes().to_vec()
    }

    fn key_seed(&self, key: &Vec<u8>) -> u64 {
        let mut buf = [0u8; 8];
        let n = key.len().min(8);
        buf[8 - n..].copy_from_slice(&key[key.len() - n..]);
        u64::from_be_bytes(buf)
    }

    fn value_seed(&self, value: &Vec<u8>) -> u64 {
        let mut buf = [0u8; 8];
        let n = value.len().min(8);
        buf[..n].copy_from_slice(&value[..n]);
        u64::from_le_bytes(buf)
    }
}
