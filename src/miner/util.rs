//! Small helpers shared by the dispatch and response paths.

use crate::challenge::Challenge;

/// Deterministic byte string combined with the nonce to form the hash
/// pre-image. Plain concatenation, no separators; empty fields permitted.
/// Must be bit-identical across restarts, which is why the cache stores
/// complete challenge objects.
pub fn build_salt_prefix(wallet_address: &str, challenge: &Challenge) -> Vec<u8> {
    let mut salt = String::with_capacity(
        wallet_address.len()
            + challenge.challenge_id.len()
            + challenge.difficulty.len()
            + challenge.no_pre_mine.len()
            + challenge.latest_submission.len()
            + challenge.no_pre_mine_hour.len(),
    );
    salt.push_str(wallet_address);
    salt.push_str(&challenge.challenge_id);
    salt.push_str(&challenge.difficulty);
    salt.push_str(&challenge.no_pre_mine);
    salt.push_str(&challenge.latest_submission);
    salt.push_str(&challenge.no_pre_mine_hour);
    salt.into_bytes()
}

/// Nonces go over the wire as zero-padded 16-char hex.
pub fn format_nonce_hex(nonce: u64) -> String {
    format!("{:016x}", nonce)
}

/// Random 64-bit starting nonce for a search.
pub fn random_start_nonce() -> u64 {
    rand::random::<u64>()
}
