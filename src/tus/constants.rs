pub const TUS_RESUMABLE: &str = "1.0.0";

pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// 请求超时（秒）
pub const DEFAULT_TIMEOUT: u64 = 60;
