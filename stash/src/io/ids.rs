//! Identifier and timestamp generation.

use chrono::{SecondsFormat, Utc};
use rand::{Rng, distributions::Alphanumeric};

use crate::core::types::Timestamp;

const ID_LEN: usize = 16;

/// `<prefix>_<16 lowercase alphanumerics>`, e.g. `conv_k3v9...`.
pub fn new_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(ID_LEN)
        .collect::<String>()
        .to_lowercase();
    format!("{prefix}_{suffix}")
}

/// Current UTC time with microsecond precision; sorts lexicographically.
pub fn now_timestamp() -> Timestamp {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
