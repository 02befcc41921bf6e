//! Random identifier generation for pods, VMs, and log-stream tags.

use crate::constants::{
    ID_RANDOM_LEN, LOG_TAG_PREFIX, LOG_TAG_RANDOM_LEN, POD_ID_PREFIX, VM_ID_PREFIX,
};
use rand::Rng;

const ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const ALPHANUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Returns a random lowercase alphabetic string of the given length.
pub fn rand_str_alpha(len: usize) -> String {
    rand_from(ALPHA, len)
}

/// Returns a random lowercase alphanumeric string of the given length.
pub fn rand_str_alphanum(len: usize) -> String {
    rand_from(ALPHANUM, len)
}

fn rand_from(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}

/// Generates a fresh pod identifier: `pod-<10 alpha chars>`.
pub fn new_pod_id() -> String {
    format!("{}{}", POD_ID_PREFIX, rand_str_alpha(ID_RANDOM_LEN))
}

/// Generates a fresh VM identifier: `vm-<10 alpha chars>`.
pub fn new_vm_id() -> String {
    format!("{}{}", VM_ID_PREFIX, rand_str_alpha(ID_RANDOM_LEN))
}

/// Generates a fresh log-stream tag: `log-<8 alphanumeric chars>`.
pub fn new_log_tag() -> String {
    format!("{}{}", LOG_TAG_PREFIX, rand_str_alphanum(LOG_TAG_RANDOM_LEN))
}
