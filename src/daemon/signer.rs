//! Signing and verifying binaries with the key on the token.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use log::{debug, info, warn};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Semaphore;
use crate::commons::error::{Error, ToolFailure};
use crate::config::Config;
use crate::constants::REDACTED;
use super::scratch::ScratchPair;
use super::tool::{Redactor, ToolCommand, ToolOutput};


/// The characters escaped in a PIN placed in a PKCS#11 URI.
///
/// Everything but the unreserved characters of RFC 3986.
const PIN_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// The name of the sign run in log and error messages.
const SIGN_TOOL: &str = "signing tool";

/// The name of the verify run in log and error messages.
const VERIFY_TOOL: &str = "verification tool";


//------------ KeyId ---------------------------------------------------------

/// The identifier of the signing key on the token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyId(String);

impl KeyId {
    /// Returns the key identifier currently configured.
    ///
    /// Fails with [`Error::MissingKeyId`] if there is none.
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        config.key_id().map(KeyId).ok_or(Error::MissingKeyId)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}


//------------ Pin -----------------------------------------------------------

/// The PIN unlocking the token.
///
/// The value is only ever exposed when building the tool's command line.
pub struct Pin(SecretString);

impl Pin {
    pub fn new(pin: String) -> Result<Self, Error> {
        if pin.is_empty() {
            Err(Error::invalid_form("the 'pin' field must not be empty"))
        }
        else {
            Ok(Pin(SecretString::new(pin)))
        }
    }

    fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// Returns the PIN as it appears inside a PKCS#11 URI.
    fn uri_encoded(&self) -> String {
        utf8_percent_encode(self.expose(), PIN_ENCODE_SET).to_string()
    }
}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Pin({REDACTED})")
    }
}


//------------ CodeSigner ----------------------------------------------------

/// Runs the signing tool against the token.
///
/// The token can only be used by one signing operation at a time. Signing
/// requests queue for a single permit that is held for as long as the sign
/// command runs. Verification does not touch the token and runs freely.
pub struct CodeSigner {
    config: Arc<Config>,
    token: Semaphore,
}

impl CodeSigner {
    pub fn new(config: Arc<Config>) -> Self {
        CodeSigner { config, token: Semaphore::new(1) }
    }

    /// Signs the input of `pair` into its output.
    pub async fn sign(
        &self,
        pair: &ScratchPair,
        key_id: &KeyId,
        pin: &Pin,
    ) -> Result<(), Error> {
        let encoded_pin = pin.uri_encoded();
        let locator = format!("pkcs11:id={key_id};type=private?pin-value=");
        let cmd = ToolCommand::new(
            SIGN_TOOL,
            &self.config.signtool_command,
            self.config.sign_timeout(),
        )?
            .arg("sign")
            .arg("-pkcs11module").path_arg(&self.config.pkcs11_module)
            .arg("-certs").path_arg(&self.config.cert_file)
            .arg("-key")
            .secret_arg(
                SecretString::new(format!("{locator}{encoded_pin}")),
                format!("{locator}{REDACTED}"),
            )
            .arg("-h").arg(&self.config.hash_algorithm)
            .arg("-ts").arg(&self.config.timestamp_url)
            .arg("-in").path_arg(pair.input())
            .arg("-out").path_arg(pair.output())
            .arg("-verbose")
            .arg("-n").arg(&self.config.signature_description);

        let redactor = Redactor::new()
            .secret(pin.expose())
            .secret(&encoded_pin)
            .path(pair.input(), "<input>")
            .path(pair.output(), "<output>");

        let output = {
            let _permit = self.token.acquire().await.map_err(|_| {
                Error::custom("token access has been shut down")
            })?;
            info!(
                "Signing {} with key {}", file_name(pair.input()), key_id
            );
            debug!("Running {}", cmd);
            cmd.run().await?
        };

        if !output.success() {
            let failure = failure(&output, &redactor);
            warn!(
                "Signing {} failed (exit {:?}): {}",
                file_name(pair.input()), failure.code, failure.diagnostics
            );
            return Err(Error::SigningFailed(failure))
        }

        let produced = tokio::fs::try_exists(pair.output()).await
            .unwrap_or(false);
        if !produced {
            warn!(
                "{} reported success but wrote no output", cmd.name()
            );
            return Err(Error::SigningFailed(ToolFailure::new(
                output.code(),
                format!(
                    "no signed file was produced{}",
                    match redactor.redact(output.diagnostics()) {
                        diag if diag.is_empty() => String::new(),
                        diag => format!(": {diag}"),
                    }
                ),
            )))
        }

        debug!("Signed {}", file_name(pair.output()));
        Ok(())
    }

    /// Checks the signature on the output of `pair`.
    pub async fn verify(&self, pair: &ScratchPair) -> Result<(), Error> {
        let cmd = ToolCommand::new(
            VERIFY_TOOL,
            &self.config.signtool_command,
            self.config.verify_timeout(),
        )?
            .arg("verify")
            .path_arg(pair.output());

        debug!("Running {}", cmd);
        let output = cmd.run().await?;

        if !output.success() {
            let redactor = Redactor::new()
                .path(pair.input(), "<input>")
                .path(pair.output(), "<output>");
            let failure = failure(&output, &redactor);
            warn!(
                "Verification of {} failed (exit {:?}): {}",
                file_name(pair.output()), failure.code, failure.diagnostics
            );
            return Err(Error::VerificationFailed(failure))
        }

        debug!("Verified {}", file_name(pair.output()));
        Ok(())
    }
}


//------------ Helpers -------------------------------------------------------

fn failure(output: &ToolOutput, redactor: &Redactor) -> ToolFailure {
    ToolFailure::new(output.code(), redactor.redact(output.diagnostics()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}


//------------ Tests ---------------------------------------------------------
