use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// `Cfg` struct containing the engine configuration.
///
/// - `listen_port`: port on which incoming peer connections are accepted,
/// - `log_directory`: directory where the log files will be stored,
/// - `download_directory`: directory where torrent data is stored,
/// - `max_total_connections`: maximum number of peer connections overall,
/// - `max_connections_per_torrent`: maximum number of peer connections a single torrent may use,
/// - `max_log_file_kb_size`: size in kilobytes at which the log file rotates,
///
/// Every setting has a default; a config file only overrides the keys it
/// names. The file format is `{config_name}={config_value}`, one per line.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub listen_port: u16,
    pub log_directory: String,
    pub download_directory: String,
    pub max_total_connections: u64,
    pub max_connections_per_torrent: u64,
    pub max_log_file_kb_size: u32,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            listen_port: constants::DEFAULT_LISTEN_PORT,
            log_directory: String::from("./log"),
            download_directory: String::from("./download"),
            max_total_connections: constants::DEFAULT_MAX_TOTAL_CONNECTIONS,
            max_connections_per_torrent: constants::DEFAULT_MAX_CONNECTIONS_PER_TORRENT,
            max_log_file_kb_size: constants::DEFAULT_MAX_LOG_FILE_KB_SIZE,
        }
    }
}

impl Cfg {
    /// Builds a Cfg struct from the config file at the given path, on top of
    /// the defaults.
    ///
    /// It returns an io::Error if:
    /// - The path to the config file does not exist or could not be open/read.
    /// - The config file has wrong format.
    /// - A wrong config_name was in the config file.
    /// - A numeric setting is not a valid number in the config file.
    pub fn new(path: &str) -> io::Result<Self> {
        let mut cfg = Self::default();

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let current_line = line?;
            if current_line.trim().is_empty() {
                continue;
            }
            let setting: Vec<&str> = current_line.split('=').collect();

            if setting.len() != 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config input: {}", current_line),
                ));
            }
            cfg = Self::load_setting(cfg, setting[0], setting[1])?;
        }
        Ok(cfg)
    }

    fn load_setting(mut self, name: &str, value: &str) -> io::Result<Self> {
        match name {
            constants::LISTEN_PORT => {
                self.listen_port = self.parse_value(value, constants::LISTEN_PORT)?;
            }
            constants::LOG_DIRECTORY => self.log_directory = String::from(value),

            constants::DOWNLOAD_DIRECTORY => self.download_directory = String::from(value),

            constants::MAX_TOTAL_CONNECTIONS => {
                self.max_total_connections =
                    self.parse_value(value, constants::MAX_TOTAL_CONNECTIONS)?;
            }

            constants::MAX_CONNECTIONS_PER_TORRENT => {
                self.max_connections_per_torrent =
                    self.parse_value(value, constants::MAX_CONNECTIONS_PER_TORRENT)?;
            }

            constants::MAX_LOG_FILE_KB_SIZE => {
                self.max_log_file_kb_size =
                    self.parse_value(value, constants::MAX_LOG_FILE_KB_SIZE)?;
            }

            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config setting name: {}", name),
                ))
            }
        }
        Ok(self)
    }

    fn parse_value<F>(&self, value: &str, setting: &str) -> io::Result<F>
    where
        F: FromStr,
    {
        match value.parse::<F>() {
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Invalid setting: {}, is not a valid type: {}",
                    setting, value
                ),
            )),
            Ok(parsed) => Ok(parsed),
        }
    }
}
