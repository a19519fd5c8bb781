//! Deterministic-shape id minting.
//!
//! Task ids are `tx-` + 8 lowercase alphanumerics from a CSPRNG (uuid v4
//! bytes). Run ids are `run-` + the first 8 hex chars of a SHA-256 over
//! fresh entropy. The `*_from_seed` variants hash a seed string instead,
//! so tests get stable ids.

use sha2::{Digest, Sha256};
use uuid::Uuid;

const TASK_ID_PREFIX: &str = "tx-";
const RUN_ID_PREFIX: &str = "run-";
const TASK_ID_LEN: usize = 8;
const TASK_ID_CHARSET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Mint a fresh task id: `tx-` + 8 lowercase alphanumerics.
pub fn new_task_id() -> String {
    let entropy = Uuid::new_v4();
    encode_task_id(entropy.as_bytes())
}

/// Deterministic task id for tests: SHA-256 of `seed`, first 8 hex chars.
pub fn task_id_from_seed(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    format!("{}{}", TASK_ID_PREFIX, &hex::encode(digest)[..TASK_ID_LEN])
}

/// Mint a fresh run id: `run-` + 8 hex chars.
pub fn new_run_id() -> String {
    let digest = Sha256::digest(Uuid::new_v4().as_bytes());
    format!("{}{}", RUN_ID_PREFIX, &hex::encode(digest)[..8])
}

/// Deterministic run id for tests.
pub fn run_id_from_seed(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    format!("{}{}", RUN_ID_PREFIX, &hex::encode(digest)[..8])
}

/// True iff `id` has the `tx-xxxxxxxx` shape (lowercase alphanumerics).
pub fn is_task_id(id: &str) -> bool {
    id.len() == TASK_ID_PREFIX.len() + TASK_ID_LEN
        && id.starts_with(TASK_ID_PREFIX)
        && id[TASK_ID_PREFIX.len()..]
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

fn encode_task_id(entropy: &[u8; 16]) -> String {
    let mut out = String::with_capacity(TASK_ID_PREFIX.len() + TASK_ID_LEN);
    out.push_str(TASK_ID_PREFIX);
    for byte in entropy.iter().take(TASK_ID_LEN) {
        out.push(TASK_ID_CHARSET[(*byte as usize) % TASK_ID_CHARSET.len()] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn task_ids_have_expected_shape() {
        for _ in 0..64 {
            let id = new_task_id();
            assert!(is_task_id(&id), "bad id: {id}");
        }
    }

    #[test]
    fn run_ids_are_prefixed_hex() {
        let id = new_run_id();
        assert_eq!(id.len(), 12);
        assert!(id.starts_with("run-"));
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn seeded_ids_are_stable() {
        assert_eq!(task_id_from_seed("alpha"), task_id_from_seed("alpha"));
        assert_ne!(task_id_from_seed("alpha"), task_id_from_seed("beta"));
        assert_eq!(run_id_from_seed("r1"), run_id_from_seed("r1"));
    }

    #[test]
    fn seeded_task_ids_validate() {
        assert!(is_task_id(&task_id_from_seed("any seed at all")));
    }

    proptest! {
        #[test]
        fn seeded_ids_always_validate(seed in ".*") {
            prop_assert!(is_task_id(&task_id_from_seed(&seed)));
        }
    }
}
