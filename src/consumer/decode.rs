use chrono::DateTime;

use crate::events::{DecodedEvent, MAX_PARAMS};
use crate::rpc::RawLog;

const WORD_HEX_LEN: usize = 64;

/// Positional parameters of a log: indexed values from `topics[1..]`, then
/// the data payload split into 32-byte words. A trailing partial word is
/// ignored and the result is capped at [`MAX_PARAMS`].
pub fn extract_parameters(topics: &[String], data: &str) -> Vec<String> {
    let mut params: Vec<String> = topics.iter().skip(1).cloned().collect();

    let hex = data.strip_prefix("0x").unwrap_or(data);
    params.extend(
        hex.as_bytes()
            .chunks_exact(WORD_HEX_LEN)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
            .map(|word| format!("0x{}", word)),
    );

    params.truncate(MAX_PARAMS);
    params
}

pub fn decode_log(log: &RawLog, event_name: Option<String>) -> DecodedEvent {
    DecodedEvent {
        block_hash: log.block_hash.clone(),
        transaction_hash: log.transaction_hash.clone(),
        block_number: log.block_number,
        transaction_index: log.transaction_index,
        log_index: log.log_index,
        contract_address: log.address.clone(),
        event_name,
        event_signature: log.signature().to_string(),
        params: extract_parameters(&log.topics, &log.data),
        block_timestamp: log
            .block_timestamp
            .and_then(|secs| DateTime::from_timestamp(secs as i64, 0)),
    }
}
