//! Wire shape of the source store's event envelope as delivered through the
//! queue. Keys arrive URL-encoded with `+` standing for space.

use percent_encoding::percent_decode_str;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct EventEnvelope {
    #[serde(rename = "Records", default)]
    pub records: Vec<EventRecord>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventRecord {
    #[serde(rename = "eventName")]
    pub event_name: String,
    pub s3: StoreEntity,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StoreEntity {
    pub bucket: BucketEntity,
    pub object: ObjectEntity,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BucketEntity {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ObjectEntity {
    pub key: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(rename = "eTag", default)]
    pub etag: Option<String>,
}

/// Decodes an envelope key: `+` is a space, then percent-escapes are resolved.
/// Invalid escape sequences decode lossily rather than failing the record.
pub(crate) fn decode_key(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8_lossy()
        .into_owned()
}
