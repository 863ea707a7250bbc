/// Rate limit counter key prefix
const RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// Counter key for one sub-bucket of an identity's sliding window
pub fn window_bucket_key(identity: &str, bucket: i64) -> String {
    format!("{}{}:{}", RATE_LIMIT_PREFIX, identity, bucket)
}
