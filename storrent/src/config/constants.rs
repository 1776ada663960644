pub const LISTEN_PORT: &str = "LISTEN_PORT";
pub const LOG_DIRECTORY: &str = "LOG_DIRECTORY";
pub const DOWNLOAD_DIRECTORY: &str = "DOWNLOAD_DIRECTORY";
pub const MAX_TOTAL_CONNECTIONS: &str = "MAX_TOTAL_CONNECTIONS";
pub const MAX_CONNECTIONS_PER_TORRENT: &str = "MAX_CONNECTIONS_PER_TORRENT";
pub const MAX_LOG_FILE_KB_SIZE: &str = "MAX_LOG_FILE_KB_SIZE";

pub const DEFAULT_LISTEN_PORT: u16 = 27007;
pub const DEFAULT_MAX_TOTAL_CONNECTIONS: u64 = 100;
pub const DEFAULT_MAX_CONNECTIONS_PER_TORRENT: u64 = 10;
pub const DEFAULT_MAX_LOG_FILE_KB_SIZE: u32 = 1024;
