//! Time-sortable record keys
//!
//! Rkeys are TIDs: 13 characters of sortable base32 encoding
//! `(microseconds << 10) | clock_id`. Generation is monotonic within the
//! process so two writes in the same microsecond still sort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

const S32_ALPHABET: &[u8; 32] = b"234567abcdefghijklmnopqrstuvwxyz";

static LAST: AtomicU64 = AtomicU64::new(0);

fn clock_id() -> u64 {
    static ID: OnceLock<u64> = OnceLock::new();
    *ID.get_or_init(|| rand::random::<u64>() & 0x3ff)
}

/// Generate the next TID.
pub fn next_tid() -> String {
    let micros = chrono::Utc::now().timestamp_micros() as u64;
    let candidate = (micros << 10) | clock_id();
    loop {
        let last = LAST.load(Ordering::SeqCst);
        let value = candidate.max(last + 1);
        if LAST
            .compare_exchange(last, value, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return encode_s32(value);
        }
    }
}

fn encode_s32(value: u64) -> String {
    let mut out = [0u8; 13];
    let mut v = value;
    for slot in out.iter_mut().rev() {
        *slot = S32_ALPHABET[(v & 0x1f) as usize];
        v >>= 5;
    }
    String::from_utf8(out.to_vec()).expect("alphabet is ascii")
}

/// Whether a string is a well-formed TID.
pub fn is_tid(s: &str) -> bool {
    s.len() == 13 && s.bytes().all(|b| S32_ALPHABET.contains(&b))
}
