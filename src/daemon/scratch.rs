//! Scratch files for the binaries passing through the signer.
//!
//! Every signing request gets its own [`ScratchPair`]: a freshly created
//! input file holding the upload and the path next to it where the signing
//! tool writes its output. The pair deletes both files when it is dropped.
//! Since the pair is owned by the request, this happens exactly once on
//! every way out of a request: after the response body has been sent, on
//! an error, or when the request is abandoned halfway.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use bytes::Bytes;
use log::{debug, error};
use crate::commons::error::{Error, IoError};
use crate::config::Config;
use crate::constants::{SCRATCH_PREFIX, SIGNED_SUFFIX};


//------------ ScratchStore --------------------------------------------------

/// Creates scratch files in a configured directory.
#[derive(Clone, Debug)]
pub struct ScratchStore {
    dir: PathBuf,
    suffix: String,
}

impl ScratchStore {
    pub fn new(dir: PathBuf, suffix: impl Into<String>) -> Self {
        ScratchStore { dir, suffix: suffix.into() }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.scratch_dir(), config.scratch_suffix.clone())
    }

    /// Writes `content` to a new, uniquely named file.
    ///
    /// Returns the pair of the new input file and its output path.
    pub async fn acquire_input(
        &self, content: Bytes
    ) -> Result<ScratchPair, Error> {
        let dir = self.dir.clone();
        let suffix = self.suffix.clone();
        tokio::task::spawn_blocking(move || {
            Self::write_input(&dir, &suffix, &content)
        }).await.map_err(|err| {
            Error::custom(format!("scratch file writer failed: {err}"))
        })?
    }

    fn write_input(
        dir: &Path, suffix: &str, content: &[u8]
    ) -> Result<ScratchPair, Error> {
        let mut file = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .suffix(suffix)
            .tempfile_in(dir)
            .map_err(|err| {
                IoError::new(
                    format!("Cannot create scratch file in {}", dir.display()),
                    err,
                )
            })?;

        // The temporary file removes itself if we bail out here.
        file.write_all(content).and_then(|_| file.flush()).map_err(|err| {
            IoError::new(
                format!("Cannot write scratch file {}", file.path().display()),
                err,
            )
        })?;

        let input = file.into_temp_path().keep().map_err(|err| {
            IoError::new("Cannot keep scratch file", err.error)
        })?;
        debug!("Stored {} bytes at {}", content.len(), input.display());
        Ok(ScratchPair::new(input))
    }
}


//------------ ScratchPair ---------------------------------------------------

/// The input and output scratch paths of a single request.
///
/// Both paths are deleted when the value is dropped.
#[derive(Debug)]
pub struct ScratchPair {
    input: PathBuf,
    output: PathBuf,
}

impl ScratchPair {
    fn new(input: PathBuf) -> Self {
        let output = derive_output_path(&input);
        ScratchPair { input, output }
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn output(&self) -> &Path {
        &self.output
    }
}

impl Drop for ScratchPair {
    fn drop(&mut self) {
        release(&[&self.input, &self.output]);
    }
}


//------------ Helpers -------------------------------------------------------

/// Returns the path the signed version of `input` is written to.
pub fn derive_output_path(input: &Path) -> PathBuf {
    let mut path = input.as_os_str().to_owned();
    path.push(SIGNED_SUFFIX);
    path.into()
}

/// Deletes the given files if they exist.
///
/// Errors are logged rather than returned, so that cleaning up never hides
/// whatever went wrong before.
pub fn release(paths: &[&Path]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Cleaned up: {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => { }
            Err(err) => {
                error!("Error cleaning up {}: {}", path.display(), err)
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------
