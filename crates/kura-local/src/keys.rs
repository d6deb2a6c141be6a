//! Local key layout.
//!
//! ```text
//! b!<id>!x            metadata
//! b!<id>!m            confirmed model + seq
//! b!<id>!f!<time>!<sid>  one frontier patch
//! b!<id>!h!<seq>      one confirmed history batch
//! s!<id>              dirty marker
//! l!<name>            lock lease
//! ```
//!
//! Numbers are zero-padded base-36 so lexicographic key order is numeric
//! order. Thirteen digits cover the whole `u64` range.

use kura_types::{BlockId, SessionId};

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Width of an encoded number.
pub const WIDTH: usize = 13;

/// Zero-padded base-36 form of `n`.
pub fn encode_num(mut n: u64) -> String {
    let mut buf = [b'0'; WIDTH];
    let mut i = WIDTH;
    while n > 0 {
        i -= 1;
        buf[i] = DIGITS[(n % 36) as usize];
        n /= 36;
    }
    buf.iter().map(|&b| b as char).collect()
}

pub fn decode_num(s: &str) -> Option<u64> {
    if s.is_empty() || s.len() > WIDTH {
        return None;
    }
    u64::from_str_radix(s, 36).ok()
}

pub fn block_prefix(id: &BlockId) -> String {
    format!("b!{id}!")
}

pub fn meta(id: &BlockId) -> String {
    format!("b!{id}!x")
}

pub fn model(id: &BlockId) -> String {
    format!("b!{id}!m")
}

pub fn frontier_prefix(id: &BlockId) -> String {
    format!("b!{id}!f!")
}

pub fn frontier(id: &BlockId, time: u64, sid: SessionId) -> String {
    format!("b!{id}!f!{}!{}", encode_num(time), encode_num(sid.get()))
}

pub fn history_prefix(id: &BlockId) -> String {
    format!("b!{id}!h!")
}

pub fn history(id: &BlockId, seq: u64) -> String {
    format!("b!{id}!h!{}", encode_num(seq))
}

pub const DIRTY_PREFIX: &str = "s!";

pub fn dirty(id: &BlockId) -> String {
    format!("{DIRTY_PREFIX}{id}")
}

/// Block id of a dirty marker key.
pub fn parse_dirty(key: &str) -> Option<BlockId> {
    key.strip_prefix(DIRTY_PREFIX).and_then(|id| BlockId::new(id).ok())
}

pub fn lease(name: &str) -> String {
    format!("l!{name}")
}

/// Seq of a history key.
pub fn parse_history(id: &BlockId, key: &str) -> Option<u64> {
    key.strip_prefix(&history_prefix(id)).and_then(decode_num)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> BlockId {
        BlockId::new(s).unwrap()
    }

    #[test]
    fn test_numbers_sort_as_strings() {
        let samples = [0u64, 1, 35, 36, 1_000, 46_655, 46_656, 1 << 40, u64::MAX];
        let encoded: Vec<String> = samples.iter().map(|&n| encode_num(n)).collect();
        assert!(encoded.iter().all(|s| s.len() == WIDTH));
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));
        for (n, s) in samples.iter().zip(&encoded) {
            assert_eq!(decode_num(s), Some(*n));
        }
        assert_eq!(encode_num(35), "000000000000z");
    }

    #[test]
    fn test_layout() {
        let b = id("users/7");
        assert_eq!(meta(&b), "b!users/7!x");
        assert_eq!(dirty(&b), "s!users/7");
        assert_eq!(parse_dirty("s!users/7"), Some(b.clone()));
        assert!(frontier(&b, 5, SessionId::new(70_000)).starts_with(&frontier_prefix(&b)));
        assert_eq!(parse_history(&b, &history(&b, 42)), Some(42));
    }

    #[test]
    fn test_prefixes_do_not_collide() {
        // "doc" must not see the keys of "doc2"
        let a = block_prefix(&id("doc"));
        assert!(!meta(&id("doc2")).starts_with(&a));
    }
}
