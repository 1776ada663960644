pub mod logger_error;
pub mod logger_receiver;
pub mod logger_sender;

mod constants {
    pub const LOGGER_THREAD_NAME: &str = "logger";
}
