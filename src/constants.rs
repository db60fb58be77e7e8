//! Various service-wide constants.


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `tokensign` binary.
pub const TOKENSIGN_SERVER_APP: &str = "Tokensign";


//------------ Config Files Paths -------------------------------------------

/// The default path to the config file.
///
/// The file is optional. If it does not exist and no other file was given
/// on the command line, the built-in defaults are used.
pub const TOKENSIGN_DEFAULT_CONFIG_FILE: &str = "/etc/tokensign.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the identifier of the signing key.
///
/// It is consulted for every signing request unless `key_id` is set in the
/// config file.
pub const TOKENSIGN_ENV_KEY_ID: &str = "KEY_ID";

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const TOKENSIGN_ENV_LOG_LEVEL: &str = "TOKENSIGN_LOG_LEVEL";


//------------ HTTP ---------------------------------------------------------

/// The name of the multipart field carrying the binary.
pub const FORM_FIELD_FILE: &str = "file";

/// The name of the multipart field carrying the PIN.
pub const FORM_FIELD_PIN: &str = "pin";

/// The size of the chunks used when streaming the signed file back.
pub const RESPONSE_CHUNK_SIZE: usize = 64 * 1024;


//------------ Scratch Files ------------------------------------------------

/// The prefix of every scratch file name.
pub const SCRATCH_PREFIX: &str = "tokensign-";

/// The extension appended to the input path to name the signed output.
pub const SIGNED_SUFFIX: &str = ".signed";


//------------ Token Probing ------------------------------------------------

/// The marker `pkcs11-tool --list-slots` prints before listing slots.
pub const SLOT_LIST_MARKER: &str = "Available slots";

/// The prefix of each slot line in the slot listing.
pub const SLOT_LINE_PREFIX: &str = "Slot ";

/// The replacement text for redacted secrets.
pub const REDACTED: &str = "***";
