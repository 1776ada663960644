use std::sync::mpsc::Sender;
use std::thread;

use chrono::Local;

/// A LoggerSender representing the sender channel connected to a Logger.
///
/// There are three ways to write to the log:
///  - `info()` to log information.
///  - `warn()` to log a non critical warning.
///  - `error()` to log a critical error.
///
/// To clone the LoggerSender simply call the `clone()` method.
#[derive(Debug, Clone)]
pub struct LoggerSender {
    sender: Sender<String>,
}

impl LoggerSender {
    /// Creates a new LoggerSender from a clone of an existing sender.
    pub fn new(sender: Sender<String>) -> Self {
        Self { sender }
    }

    /// Writes an Info type log to the connected logger.
    pub fn info(&self, value: &str) {
        self.send(self.format_msg(value, "INFO"))
    }

    /// Writes a Warn type log to the connected logger.
    pub fn warn(&self, value: &str) {
        self.send(self.format_msg(value, "WARN"))
    }

    /// Writes an Error type log to the connected logger.
    pub fn error(&self, value: &str) {
        self.send(self.format_msg(value, "ERROR"))
    }

    fn send(&self, value: String) {
        if let Err(err) = self.sender.send(value.to_string()) {
            eprintln!(
                "Error({err}) writing: {value} to the log. The logger receiver is probably dead."
            )
        }
    }

    fn thread_name(&self) -> String {
        let current_thread = thread::current();
        match current_thread.name() {
            Some(name) => name.to_string(),
            None => "unnamed-thread".to_string(),
        }
    }

    fn format_msg(&self, value: &str, log_type: &str) -> String {
        let time = Local::now().format("[%Y/%m/%d %H:%M:%S]");
        format!(
            "[{}] [{}] [{}] - {}\n",
            time,
            self.thread_name(),
            log_type,
            value
        )
    }
}
