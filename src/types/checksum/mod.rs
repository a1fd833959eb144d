#![forbid(unsafe_code)]

use super::page::{header, PAGE_HDR_LEN};

/// Computes the crc32 for a page image, treating the crc field itself as zero.
pub fn page_crc32(page_no: u64, buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page_no.to_be_bytes());
    if buf.len() < PAGE_HDR_LEN {
        hasher.update(buf);
        return hasher.finalize();
    }
    hasher.update(&buf[..header::CRC32.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[header::CRC32.end..]);
    hasher.finalize()
}

/// Writes the crc32 of `buf` into its header.
pub fn stamp_page_crc32(page_no: u64, buf: &mut [u8]) {
    if buf.len() < PAGE_HDR_LEN {
        return;
    }
    let crc = page_crc32(page_no, buf);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
}

/// Returns true when the crc stored in `buf` matches its contents.
pub fn verify_page_crc32(page_no: u64, buf: &[u8]) -> bool {
    if buf.len() < PAGE_HDR_LEN {
        return false;
    }
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&buf[header::CRC32]);
    u32::from_be_bytes(stored) == page_crc32(page_no, buf)
}
