use time::OffsetDateTime;

/// Identifier of a pipeline template / running pipeline.
pub type PipelineId = String;

/// Identifier of a concrete upstream instance.
pub type InstanceId = String;

/// `provider.model` key shared by the pool and the blacklist.
pub type CompositeId = String;

pub fn composite_id(provider: &str, model: &str) -> CompositeId {
    format!("{provider}.{model}")
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_epoch_ms() -> i64 {
    let now = OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}
