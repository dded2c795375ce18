//! Serde helpers that read and write `std::time::Duration` as whole seconds,
//! which is how rule files and configuration spell durations.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub mod secs {
    use super::*;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(raw).map_err(serde::de::Error::custom)
    }
}
