//! Stable identifiers for calls, recordings and runs.
//!
//! - Call ids: `YYYYMMDD_HHMMSS_<guid8>` in UTC, so lexicographic order is
//!   chronological order
//! - Recording ids: `<call_id>_pNN`, numbered by (recording date, upstream id)
//! - Run ids: monotonic ULIDs
//!
//! Call and recording ids are pure functions of upstream data. Every run
//! re-derives the same id for the same upstream object without a lookup table.

use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;
use ulid::{Generator, Ulid};

/// Number of upstream guid characters kept in a call id
pub const GUID_PREFIX_LEN: usize = 8;

const CALL_TS_FORMAT: &str = "%Y%m%d_%H%M%S";
const CALL_ID_LEN: usize = 15 + 1 + GUID_PREFIX_LEN;

/// Process-wide generator so run ids created within one millisecond still sort
static RUN_IDS: OnceLock<Mutex<Generator>> = OnceLock::new();

/// Errors from identifier derivation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Call guid must have at least 8 characters: {0:?}")]
    GuidTooShort(String),

    #[error("Call guid must start with 8 ASCII alphanumeric characters: {0:?}")]
    InvalidGuid(String),

    #[error("Timestamp must be a positive epoch millisecond value: {0}")]
    InvalidTimestamp(i64),

    #[error("Malformed call id: {0}")]
    MalformedCallId(String),
}

/// Derive the call id from the upstream last-update timestamp and call guid.
///
/// `call_id(1724305416000, "71da9579-7730-...")` is `20240822_054336_71da9579`.
pub fn call_id(last_update_ms: i64, call_guid: &str) -> Result<String, IdError> {
    if last_update_ms <= 0 {
        return Err(IdError::InvalidTimestamp(last_update_ms));
    }

    let prefix: String = call_guid.chars().take(GUID_PREFIX_LEN).collect();
    if prefix.chars().count() < GUID_PREFIX_LEN {
        return Err(IdError::GuidTooShort(call_guid.to_string()));
    }
    // The id ends up in file names
    if !prefix.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(IdError::InvalidGuid(call_guid.to_string()));
    }

    let ts = Utc
        .timestamp_millis_opt(last_update_ms)
        .single()
        .ok_or(IdError::InvalidTimestamp(last_update_ms))?;

    Ok(format!("{}_{}", ts.format(CALL_TS_FORMAT), prefix))
}

/// A recording as seen upstream, reduced to what numbering needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingKey<'a> {
    pub upstream_id: &'a str,
    pub date_ms: Option<i64>,
}

/// Assign `<call_id>_pNN` ids to one call's recordings.
///
/// Recordings are ordered by (date, upstream id) before numbering, so the
/// result does not depend on the order the API returned them in. Recordings
/// without a date (or with a negative one) are dropped. Returns
/// `(upstream_id, recording_id)` pairs in numbering order.
pub fn make_recording_ids(call_id: &str, recordings: &[RecordingKey<'_>]) -> Vec<(String, String)> {
    let mut dated: Vec<(i64, &str)> = recordings
        .iter()
        .filter_map(|r| match r.date_ms {
            Some(date) if date >= 0 => Some((date, r.upstream_id)),
            _ => None,
        })
        .collect();

    dated.sort();

    dated
        .into_iter()
        .enumerate()
        .map(|(idx, (_, upstream_id))| {
            (
                upstream_id.to_string(),
                format!("{}_p{:02}", call_id, idx + 1),
            )
        })
        .collect()
}

/// Generate a new run id.
///
/// ULIDs from this process are strictly increasing even within the same
/// millisecond.
pub fn new_run_id() -> String {
    let generator = RUN_IDS.get_or_init(|| Mutex::new(Generator::new()));
    let mut generator = match generator.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    // Overflow only happens after 2^80 ids in one millisecond
    generator
        .generate()
        .unwrap_or_else(|_| Ulid::new())
        .to_string()
}

/// Check `YYYYMMDD_HHMMSS_xxxxxxxx` shape (alphanumeric guid prefix)
pub fn is_valid_call_id(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != CALL_ID_LEN {
        return false;
    }

    bytes.iter().enumerate().all(|(idx, b)| match idx {
        0..=7 | 9..=14 => b.is_ascii_digit(),
        8 | 15 => *b == b'_',
        _ => b.is_ascii_alphanumeric(),
    })
}

/// Check `<call_id>_pNN` shape
pub fn is_valid_recording_id(value: &str) -> bool {
    match (value.get(..CALL_ID_LEN), value.get(CALL_ID_LEN..)) {
        (Some(call), Some(suffix)) => {
            let Some(seq) = suffix.strip_prefix("_p") else {
                return false;
            };
            is_valid_call_id(call) && seq.len() >= 2 && seq.bytes().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

/// Check a 26-character Crockford base32 ULID
pub fn is_valid_run_id(value: &str) -> bool {
    let bytes = value.as_bytes();
    // First character carries only 3 bits of the 128-bit value
    bytes.len() == 26
        && matches!(bytes[0], b'0'..=b'7')
        && bytes.iter().all(|b| is_crockford_byte(*b))
}

const fn is_crockford_byte(byte: u8) -> bool {
    matches!(
        byte,
        b'0'..=b'9' | b'A'..=b'H' | b'J' | b'K' | b'M' | b'N' | b'P'..=b'T' | b'V'..=b'Z'
    )
}

/// Recover the call timestamp encoded in a call id (or recording id)
pub fn timestamp_from_call_id(value: &str) -> Result<DateTime<Utc>, IdError> {
    let head = value
        .get(..15)
        .ok_or_else(|| IdError::MalformedCallId(value.to_string()))?;

    NaiveDateTime::parse_from_str(head, CALL_TS_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|_| IdError::MalformedCallId(value.to_string()))
}

/// Strip the `_pNN` suffix from a recording id
pub fn call_id_of_recording(recording_id: &str) -> Option<&str> {
    if !is_valid_recording_id(recording_id) {
        return None;
    }
    recording_id.get(..CALL_ID_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUID: &str = "71da9579-7730-11ee-9300-a3a8e273fd52";

    #[test]
    fn test_call_id_format() {
        let id = call_id(1_724_305_416_000, GUID).unwrap();
        assert_eq!(id, "20240822_054336_71da9579");
        assert!(is_valid_call_id(&id));
    }

    #[test]
    fn test_call_id_is_deterministic() {
        assert_eq!(
            call_id(1_724_305_416_123, GUID).unwrap(),
            call_id(1_724_305_416_999, GUID).unwrap()
        );
    }

    #[test]
    fn test_call_id_sorts_chronologically() {
        let earlier = call_id(1_724_305_416_000, "ffffffff-0000").unwrap();
        let later = call_id(1_724_305_417_000, "00000000-0000").unwrap();
        assert!(earlier < later);
    }

    #[test]
    fn test_call_id_rejects_bad_input() {
        assert_eq!(
            call_id(1_724_305_416_000, "short"),
            Err(IdError::GuidTooShort("short".to_string()))
        );
        assert_eq!(
            call_id(1_724_305_416_000, "../../etcxx"),
            Err(IdError::InvalidGuid("../../etcxx".to_string()))
        );
        assert_eq!(
            call_id(1_724_305_416_000, "71da/579-7730"),
            Err(IdError::InvalidGuid("71da/579-7730".to_string()))
        );
        assert_eq!(call_id(0, GUID), Err(IdError::InvalidTimestamp(0)));
        assert_eq!(call_id(-5, GUID), Err(IdError::InvalidTimestamp(-5)));
    }

    #[test]
    fn test_recording_ids_sorted_by_date_then_id() {
        let recs = [
            RecordingKey { upstream_id: "rec-b", date_ms: Some(2_000) },
            RecordingKey { upstream_id: "rec-z", date_ms: Some(1_000) },
            RecordingKey { upstream_id: "rec-a", date_ms: Some(2_000) },
            RecordingKey { upstream_id: "rec-nodate", date_ms: None },
        ];

        let ids = make_recording_ids("20240822_054336_71da9579", &recs);
        assert_eq!(
            ids,
            vec![
                ("rec-z".to_string(), "20240822_054336_71da9579_p01".to_string()),
                ("rec-a".to_string(), "20240822_054336_71da9579_p02".to_string()),
                ("rec-b".to_string(), "20240822_054336_71da9579_p03".to_string()),
            ]
        );
    }

    #[test]
    fn test_recording_ids_ignore_input_order() {
        let forward = [
            RecordingKey { upstream_id: "a", date_ms: Some(1) },
            RecordingKey { upstream_id: "b", date_ms: Some(2) },
        ];
        let reversed = [forward[1].clone(), forward[0].clone()];

        assert_eq!(
            make_recording_ids("20240822_054336_71da9579", &forward),
            make_recording_ids("20240822_054336_71da9579", &reversed)
        );
    }

    #[test]
    fn test_run_ids_are_valid_and_increasing() {
        let ids: Vec<String> = (0..100).map(|_| new_run_id()).collect();
        for id in &ids {
            assert!(is_valid_run_id(id), "invalid run id {id}");
        }
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_run_id_validation() {
        assert!(is_valid_run_id("01JAH9A2W8F8Q6GQ4C7M3N2P1R"));
        assert!(!is_valid_run_id("01JAH9A2W8F8Q6GQ4C7M3N2P1"));
        assert!(!is_valid_run_id("01JAH9A2W8F8Q6GQ4C7M3N2P1I"));
        assert!(!is_valid_run_id("81JAH9A2W8F8Q6GQ4C7M3N2P1R"));
        assert!(!is_valid_run_id(""));
    }

    #[test]
    fn test_recording_id_validation() {
        assert!(is_valid_recording_id("20240822_054336_71da9579_p01"));
        assert!(is_valid_recording_id("20240822_054336_71da9579_p123"));
        assert!(!is_valid_recording_id("20240822_054336_71da9579_p1"));
        assert!(!is_valid_recording_id("20240822_054336_71da9579"));
        assert!(!is_valid_recording_id("20240822_054336_71da-579_p01"));
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let id = call_id(1_724_305_416_000, GUID).unwrap();
        let ts = timestamp_from_call_id(&id).unwrap();
        assert_eq!(ts.timestamp_millis(), 1_724_305_416_000);

        assert!(timestamp_from_call_id("garbage").is_err());
    }

    #[test]
    fn test_call_id_of_recording() {
        assert_eq!(
            call_id_of_recording("20240822_054336_71da9579_p02"),
            Some("20240822_054336_71da9579")
        );
        assert_eq!(call_id_of_recording("nope"), None);
    }
}
