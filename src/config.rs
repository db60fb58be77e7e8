//! Configuration of the service.
//!
//! The configuration is read from a TOML file. Every setting has a default,
//! so an empty file (or no file at all) results in a usable configuration
//! for the stock smartcard deployment.

use std::{env, fmt, fs, io};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use log::{LevelFilter, info};
use serde::{Deserialize, Deserializer, de};
#[cfg(unix)]
use syslog::Facility;
use crate::constants::{
    TOKENSIGN_DEFAULT_CONFIG_FILE, TOKENSIGN_ENV_KEY_ID,
    TOKENSIGN_ENV_LOG_LEVEL, TOKENSIGN_SERVER_APP,
};


//------------ Options -------------------------------------------------------

/// The command line options for the server.
#[derive(Clone, Debug, Default, clap::Parser)]
#[command(
    version,
    about = "Signs uploaded binaries with a key held on a PKCS#11 token.",
)]
pub struct Options {
    /// Path to the config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl Options {
    /// Creates the options from the process arguments.
    ///
    /// If the arguments won’t result in usable options, exits the process.
    pub fn from_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    pub fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    pub fn port() -> u16 {
        8000
    }

    pub fn https_mode() -> HttpsMode {
        HttpsMode::Disable
    }

    pub fn log_level() -> LevelFilter {
        match env::var(TOKENSIGN_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {}, \
                         using 'info'",
                        TOKENSIGN_ENV_LOG_LEVEL
                    );
                    LevelFilter::Info
                }
            },
            _ => LevelFilter::Info,
        }
    }

    pub fn log_type() -> LogType {
        LogType::Stderr
    }

    pub fn syslog_facility() -> String {
        "daemon".to_string()
    }

    pub fn pkcs11_module() -> PathBuf {
        PathBuf::from("/opt/proCertumCardManager/sc30pkcs11-3.0.6.72-MS.so")
    }

    pub fn cert_file() -> PathBuf {
        PathBuf::from("/certs/signing_cert.pem")
    }

    pub fn timestamp_url() -> String {
        "http://timestamp.digicert.com".to_string()
    }

    pub fn hash_algorithm() -> String {
        "sha256".to_string()
    }

    pub fn signature_description() -> String {
        "Signature".to_string()
    }

    pub fn manage_pcscd() -> bool {
        true
    }

    pub fn pcscd_command() -> Vec<String> {
        vec!["pcscd".to_string(), "--disable-polkit".to_string()]
    }

    pub fn pkcs11_tool_command() -> Vec<String> {
        vec!["pkcs11-tool".to_string()]
    }

    pub fn signtool_command() -> Vec<String> {
        vec!["osslsigncode".to_string()]
    }

    pub fn pcscd_grace_seconds() -> u64 {
        2
    }

    pub fn token_probe_timeout_seconds() -> u64 {
        5
    }

    pub fn token_probe_max_seconds() -> u64 {
        30
    }

    pub fn sign_timeout_seconds() -> u64 {
        300
    }

    pub fn verify_timeout_seconds() -> u64 {
        60
    }

    pub fn shutdown_grace_seconds() -> u64 {
        30
    }

    pub fn scratch_suffix() -> String {
        ".exe".to_string()
    }

    pub fn post_limit_sign() -> u64 {
        256 * 1024 * 1024 // 256MB, generous for installers
    }
}


//------------ Config --------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::ip")]
    pub ip: IpAddr,

    #[serde(default = "ConfigDefaults::port")]
    pub port: u16,

    #[serde(default = "ConfigDefaults::https_mode")]
    pub https_mode: HttpsMode,

    pub tls_cert_file: Option<PathBuf>,

    pub tls_key_file: Option<PathBuf>,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    pub log_file: Option<PathBuf>,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    /// The key identifier, overriding the `KEY_ID` environment variable.
    pub key_id: Option<String>,

    #[serde(default = "ConfigDefaults::pkcs11_module")]
    pub pkcs11_module: PathBuf,

    #[serde(default = "ConfigDefaults::cert_file")]
    pub cert_file: PathBuf,

    #[serde(default = "ConfigDefaults::timestamp_url")]
    pub timestamp_url: String,

    #[serde(default = "ConfigDefaults::hash_algorithm")]
    pub hash_algorithm: String,

    #[serde(default = "ConfigDefaults::signature_description")]
    pub signature_description: String,

    /// Whether we start the smartcard daemon ourselves.
    #[serde(default = "ConfigDefaults::manage_pcscd")]
    pub manage_pcscd: bool,

    #[serde(default = "ConfigDefaults::pcscd_command")]
    pub pcscd_command: Vec<String>,

    #[serde(default = "ConfigDefaults::pkcs11_tool_command")]
    pub pkcs11_tool_command: Vec<String>,

    #[serde(default = "ConfigDefaults::signtool_command")]
    pub signtool_command: Vec<String>,

    #[serde(default = "ConfigDefaults::pcscd_grace_seconds")]
    pub pcscd_grace_seconds: u64,

    #[serde(default = "ConfigDefaults::token_probe_timeout_seconds")]
    pub token_probe_timeout_seconds: u64,

    #[serde(default = "ConfigDefaults::token_probe_max_seconds")]
    pub token_probe_max_seconds: u64,

    #[serde(default = "ConfigDefaults::sign_timeout_seconds")]
    pub sign_timeout_seconds: u64,

    #[serde(default = "ConfigDefaults::verify_timeout_seconds")]
    pub verify_timeout_seconds: u64,

    /// How long requests in progress may take to finish on shutdown.
    #[serde(default = "ConfigDefaults::shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    pub scratch_dir: Option<PathBuf>,

    #[serde(default = "ConfigDefaults::scratch_suffix")]
    pub scratch_suffix: String,

    #[serde(default = "ConfigDefaults::post_limit_sign")]
    pub post_limit_sign: u64,
}

/// # Accessors
impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn https_mode(&self) -> &HttpsMode {
        &self.https_mode
    }

    /// Returns the key identifier to sign with.
    ///
    /// Unless set in the config file, the environment is consulted on every
    /// call so that a missing variable only fails the request at hand.
    pub fn key_id(&self) -> Option<String> {
        match &self.key_id {
            Some(key_id) => Some(key_id.clone()),
            None => env::var(TOKENSIGN_ENV_KEY_ID).ok().filter(|id| {
                !id.is_empty()
            }),
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(env::temp_dir)
    }

    pub fn pcscd_grace(&self) -> Duration {
        Duration::from_secs(self.pcscd_grace_seconds)
    }

    pub fn token_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.token_probe_timeout_seconds)
    }

    pub fn token_probe_max(&self) -> Duration {
        Duration::from_secs(self.token_probe_max_seconds)
    }

    pub fn sign_timeout(&self) -> Duration {
        Duration::from_secs(self.sign_timeout_seconds)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// # Loading and checking
impl Config {
    /// Creates the config at startup and initializes logging.
    ///
    /// An explicitly given config file must exist. The default config file
    /// is optional.
    pub fn create(options: &Options) -> Result<Self, ConfigError> {
        let (path, explicit) = match &options.config {
            Some(path) => (path.clone(), true),
            None => (PathBuf::from(TOKENSIGN_DEFAULT_CONFIG_FILE), false),
        };

        let config = if explicit || path.exists() {
            Self::read_config(&path).map_err(|err| {
                ConfigError::Other(format!(
                    "Error parsing config file: {}, error: {}",
                    path.display(), err
                ))
            })?
        }
        else {
            Self::parse_str("")?
        };

        config.verify()?;
        config.init_logging()?;

        if explicit || path.exists() {
            info!(
                "{} uses configuration file: {}",
                TOKENSIGN_SERVER_APP, path.display()
            );
        }
        else {
            info!("{} uses built-in default configuration", TOKENSIGN_SERVER_APP);
        }

        Ok(config)
    }

    pub fn read_config(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_str(&content)
    }

    pub fn parse_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::other("port must not be 0"))
        }

        if matches!(self.https_mode, HttpsMode::Existing)
            && (self.tls_cert_file.is_none() || self.tls_key_file.is_none())
        {
            return Err(ConfigError::other(
                "https_mode 'existing' requires tls_cert_file and tls_key_file"
            ))
        }

        if matches!(self.log_type, LogType::File) && self.log_file.is_none() {
            return Err(ConfigError::other(
                "log_type 'file' requires log_file"
            ))
        }

        if self.manage_pcscd && self.pcscd_command.is_empty() {
            return Err(ConfigError::other("pcscd_command must not be empty"))
        }

        if self.pkcs11_tool_command.is_empty() {
            return Err(ConfigError::other(
                "pkcs11_tool_command must not be empty"
            ))
        }

        if self.signtool_command.is_empty() {
            return Err(ConfigError::other("signtool_command must not be empty"))
        }

        if self.token_probe_timeout_seconds == 0
            || self.sign_timeout_seconds == 0
            || self.verify_timeout_seconds == 0
        {
            return Err(ConfigError::other("tool timeouts must be at least 1"))
        }

        if self.post_limit_sign == 0 {
            return Err(ConfigError::other("post_limit_sign must not be 0"))
        }

        if self.scratch_suffix.contains('/') {
            return Err(ConfigError::other(
                "scratch_suffix must not contain '/'"
            ))
        }

        Ok(())
    }
}

/// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::Stderr => self.stderr_logger(),
            LogType::File => match &self.log_file {
                Some(path) => self.file_logger(path),
                None => Err(ConfigError::other("no log_file configured")),
            },
            LogType::Syslog => self.syslog_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!(
                    "Failed to init stderr logging: {e}"
                ))
            })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = fern::log_file(path).map_err(|err| {
            ConfigError::Other(format!(
                "Failed to open log file '{}': {}", path.display(), err
            ))
        })?;
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!("Failed to init file logging: {e}"))
            })
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        let facility = Facility::from_str(&self.syslog_facility)
            .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("tokensign"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| {
                syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
            });
        match logger {
            Ok(logger) => {
                self.fern_logger()
                    .chain(logger)
                    .apply()
                    .map_err(|e| {
                        ConfigError::Other(format!(
                            "Failed to init syslog: {e}"
                        ))
                    })
            }
            Err(err) => {
                Err(ConfigError::Other(format!(
                    "Cannot connect to syslog: {err}"
                )))
            }
        }
    }

    #[cfg(not(unix))]
    fn syslog_logger(&self) -> Result<(), ConfigError> {
        Err(ConfigError::other("syslog is only supported on unix"))
    }

    /// Creates and returns a fern logger with log level tweaks.
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("rustls", framework_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("h2", framework_level)
            .level_for("mio", framework_level)
            .level_for("multer", framework_level)
            .level_for("want", framework_level)
    }
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{string}\""
            ))),
        }
    }
}


//------------ HttpsMode -----------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HttpsMode {
    /// Serve plain HTTP, e.g. behind a TLS terminating proxy.
    Disable,

    /// Serve HTTPS using the configured key and certificate files.
    Existing,
}

impl HttpsMode {
    pub fn is_disable_https(&self) -> bool {
        matches!(self, HttpsMode::Disable)
    }
}

impl<'de> Deserialize<'de> for HttpsMode {
    fn deserialize<D>(d: D) -> Result<HttpsMode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "disable" => Ok(HttpsMode::Disable),
            "existing" => Ok(HttpsMode::Existing),
            _ => Err(de::Error::custom(format!(
                "expected \"disable\" or \"existing\", found: \"{string}\""
            ))),
        }
    }
}


//------------ Helpers -------------------------------------------------------

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ Tests ---------------------------------------------------------
