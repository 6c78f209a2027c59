//! JSON encoding of persisted records.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{QueueError, QueueResult};
use crate::store::Txn;

pub fn encode<T: Serialize>(value: &T) -> QueueResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| QueueError::Codec(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> QueueResult<T> {
    serde_json::from_slice(bytes).map_err(|e| QueueError::Codec(e.to_string()))
}

pub fn get_json<T: DeserializeOwned>(txn: &mut Txn<'_>, key: &str) -> QueueResult<Option<T>> {
    txn.get(key)?.map(|bytes| decode(&bytes)).transpose()
}

pub fn hget_json<T: DeserializeOwned>(
    txn: &mut Txn<'_>,
    key: &str,
    field: &str,
) -> QueueResult<Option<T>> {
    txn.hget(key, field)?.map(|bytes| decode(&bytes)).transpose()
}
