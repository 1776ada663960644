/// Posible `Logger` errors.
#[derive(Debug)]
pub enum LoggerError {
    LogDirectoryError(String),
    LogFileError(String),
    SpawnThreadError,
}
