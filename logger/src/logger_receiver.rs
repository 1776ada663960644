use super::constants::LOGGER_THREAD_NAME;
use super::logger_error::LoggerError;
use super::logger_sender::LoggerSender;
use std::fs;
use std::fs::File;
use std::io;
use std::io::Write;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;

use chrono::prelude::*;

/// A logger that writes into a file on its own thread.
///
/// The logger works with channels. It has one channel to receive the
/// messages and as many sender clones as there are threads that want to log.
/// When the current log file grows past the configured cap, the receiver
/// rotates to a fresh timestamped file in the same directory.
///
/// To clone the sender's channel use the `new_sender()` method, which
/// returns a LoggerSender struct.
#[derive(Debug)]
pub struct Logger {
    sender: LoggerSender,
}

impl Logger {
    /// Constructs a new Logger.
    ///
    /// In case of success it returns a Logger struct and creates a new log
    /// file at the directory path.
    ///
    /// It returns a LoggerError if:
    /// - There was a problem creating the logging directory.
    /// - A new file could not be created at the logging directory.
    /// - There was a problem spawning the logger receiver thread.
    pub fn new(dir_path: &str, max_log_file_kb_size: u32) -> Result<Self, LoggerError> {
        let (sender, receiver): (Sender<String>, Receiver<String>) = channel();

        Self::create_log_directory(dir_path)?;
        let file = Self::create_log_file(dir_path)?;
        Self::spawn_log_receiver(receiver, file, dir_path.to_string(), max_log_file_kb_size)?;

        Ok(Self {
            sender: LoggerSender::new(sender),
        })
    }

    /// Creates a new LoggerSender for the current Logger.
    pub fn new_sender(&self) -> LoggerSender {
        self.sender.clone()
    }

    fn create_log_directory(dir_path: &str) -> Result<(), LoggerError> {
        match fs::create_dir_all(dir_path) {
            Ok(_) => Ok(()),
            Err(error) => {
                if error.kind() == io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(LoggerError::LogDirectoryError(format!("{}", error)))
                }
            }
        }
    }

    fn spawn_log_receiver(
        receiver: Receiver<String>,
        file: File,
        dir_path: String,
        max_log_file_kb_size: u32,
    ) -> Result<(), LoggerError> {
        let builder = thread::Builder::new().name(LOGGER_THREAD_NAME.to_string());
        let result = builder.spawn(move || {
            let mut file = file;
            let max_bytes = max_log_file_kb_size as u64 * 1024;

            while let Ok(msg) = receiver.recv() {
                if let Err(err) = file.write_all(msg.as_bytes()) {
                    eprintln!("Error({err}) writing to the log");
                }
                match file.metadata() {
                    Ok(metadata) if metadata.len() > max_bytes => {
                        match Self::create_log_file(&dir_path) {
                            Ok(next) => file = next,
                            Err(err) => {
                                eprintln!("Error({err:?}) rotating the log, keeping current file")
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => eprintln!("Error({err}) reading log file metadata"),
                }
            }
        });
        match result {
            Ok(_) => Ok(()),
            Err(_) => Err(LoggerError::SpawnThreadError),
        }
    }

    fn create_log_file(dir_path: &str) -> Result<File, LoggerError> {
        let time = Local::now();

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(format!(
                "{}/{}.log",
                dir_path,
                time.format("%Y-%m-%d_%H-%M-%S%.3f")
            ));

        match file {
            Ok(file) => Ok(file),
            Err(_) => Err(LoggerError::LogFileError(dir_path.to_string())),
        }
    }
}
