//! Supervision of the smartcard daemon and the token.
//!
//! Before the service accepts any request, the smartcard resource manager
//! has to be running and the token has to be visible through the PKCS#11
//! module. The [`SmartcardDaemon`] takes care of both: it starts the
//! resource manager, waits for it to settle, and then probes the token
//! until it shows up or we run out of patience.

use std::process::Stdio;
use std::time::Duration;
use backoff::ExponentialBackoff;
use log::{debug, error, info, warn};
use tokio::process::{Child, Command};
use crate::commons::error::Error;
use crate::config::Config;
use crate::constants::{SLOT_LINE_PREFIX, SLOT_LIST_MARKER};
use super::tool::ToolCommand;


//------------ Constants -----------------------------------------------------

/// The delay before the first retry of a failed token probe.
const PROBE_RETRY_AFTER: Duration = Duration::from_secs(1);

/// The growth factor of the delay between token probes.
const PROBE_RETRY_MULTIPLIER: f64 = 1.5;


//------------ SmartcardDaemon -----------------------------------------------

/// A handle to the smartcard resource manager.
///
/// If we started the daemon ourselves, the handle owns its process. The
/// process is killed when [`shutdown`][Self::shutdown] is called or when
/// the handle is dropped.
#[derive(Debug)]
pub struct SmartcardDaemon {
    child: Option<Child>,
}

impl SmartcardDaemon {
    /// Starts the daemon and checks that the token is available.
    ///
    /// Any error returned is fatal: the service must not start.
    pub async fn start(config: &Config) -> Result<Self, Error> {
        let child = if config.manage_pcscd {
            Some(Self::spawn(config).await?)
        }
        else {
            info!("Smartcard daemon is managed externally");
            None
        };

        // Dropping the handle on error kills the daemon again.
        let daemon = SmartcardDaemon { child };
        Self::probe_token(config).await?;
        Ok(daemon)
    }

    async fn spawn(config: &Config) -> Result<Child, Error> {
        let (program, args) = config.pcscd_command.split_first().ok_or_else(
            || Error::StartupHealthCheckFailed(
                "no smartcard daemon command configured".into()
            )
        )?;

        info!("Starting smartcard daemon: {}", config.pcscd_command.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                Error::StartupHealthCheckFailed(format!(
                    "cannot start smartcard daemon '{program}': {err}"
                ))
            })?;

        tokio::time::sleep(config.pcscd_grace()).await;

        match child.try_wait() {
            Ok(None) => {
                debug!("Smartcard daemon is running");
                Ok(child)
            }
            Ok(Some(status)) if status.success() => {
                // The daemon forked into the background.
                info!("Smartcard daemon detached into the background");
                Ok(child)
            }
            Ok(Some(status)) => {
                Err(Error::StartupHealthCheckFailed(format!(
                    "smartcard daemon exited early with {status}"
                )))
            }
            Err(err) => {
                Err(Error::StartupHealthCheckFailed(format!(
                    "cannot check on smartcard daemon: {err}"
                )))
            }
        }
    }

    /// Probes the token until it lists a slot.
    ///
    /// Probes are retried with exponential backoff for at most the
    /// configured time.
    async fn probe_token(config: &Config) -> Result<(), Error> {
        let backoff_policy = ExponentialBackoff {
            initial_interval: PROBE_RETRY_AFTER,
            multiplier: PROBE_RETRY_MULTIPLIER,
            max_elapsed_time: Some(config.token_probe_max()),
            ..Default::default()
        };

        let notify = |err, next: Duration| {
            warn!(
                "Token not available, retrying in {} ms: {}",
                next.as_millis(), err
            );
        };

        let op = || async move {
            match Self::list_slots(config).await {
                Ok(slots) => Ok(slots),
                // A tool we cannot start won't start next time either.
                Err(err @ Error::IoError(_)) => {
                    Err(backoff::Error::permanent(err))
                }
                Err(err) => Err(backoff::Error::transient(err)),
            }
        };

        let slots = backoff::future::retry_notify(backoff_policy, op, notify)
            .await
            .map_err(|err| {
                error!("Token probe failed, giving up: {}", err);
                match err {
                    Error::StartupHealthCheckFailed(_) => err,
                    other => Error::StartupHealthCheckFailed(other.to_string()),
                }
            })?;

        for slot in slots {
            info!("Token slot: {}", slot);
        }
        Ok(())
    }

    /// Runs the slot listing once and returns the slot lines.
    async fn list_slots(config: &Config) -> Result<Vec<String>, Error> {
        let output = ToolCommand::new(
            "pkcs11-tool",
            &config.pkcs11_tool_command,
            config.token_probe_timeout(),
        )?
            .arg("--module")
            .path_arg(&config.pkcs11_module)
            .arg("--list-slots")
            .run().await?;

        if !output.success() {
            return Err(Error::StartupHealthCheckFailed(format!(
                "slot listing failed with {}: {}",
                output.code().map(|code| format!("exit code {code}"))
                    .unwrap_or_else(|| "a signal".into()),
                output.diagnostics(),
            )))
        }

        if !output.stdout().contains(SLOT_LIST_MARKER) {
            return Err(Error::StartupHealthCheckFailed(format!(
                "unexpected slot listing: {}", output.stdout().trim()
            )))
        }

        let slots = parse_slots(output.stdout());
        if slots.is_empty() {
            return Err(Error::StartupHealthCheckFailed(
                "no token slot available".into()
            ))
        }
        Ok(slots)
    }

    /// Stops the daemon if we started it.
    pub async fn shutdown(mut self) {
        let Some(mut child) = self.child.take() else {
            return
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Smartcard daemon already finished with {}", status)
            }
            _ => {
                info!("Stopping smartcard daemon");
                if let Err(err) = child.kill().await {
                    warn!("Cannot stop smartcard daemon: {}", err);
                }
            }
        }
    }
}


//------------ Helpers -------------------------------------------------------

/// Returns the slot lines of a slot listing.
fn parse_slots(listing: &str) -> Vec<String> {
    listing.lines()
        .map(str::trim)
        .filter(|line| line.starts_with(SLOT_LINE_PREFIX))
        .map(ToString::to_string)
        .collect()
}


//------------ Tests ---------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use super::*;

    const LISTING: &str = "Available slots:\n\
        Slot 0 (0x0): SCM Microsystems SCR 3310\n  \
        token label        : Certum\n";

    fn sh(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into(), "pkcs11-tool".into()]
    }

    fn config(probe: &str) -> Config {
        let mut config = Config::parse_str("").unwrap();
        config.manage_pcscd = false;
        config.pkcs11_tool_command = sh(probe);
        config.token_probe_timeout_seconds = 5;
        config.token_probe_max_seconds = 0;
        config
    }

    #[test]
    fn parses_slot_lines() {
        assert_eq!(
            parse_slots(LISTING),
            vec!["Slot 0 (0x0): SCM Microsystems SCR 3310"]
        );
        assert!(parse_slots("Available slots:\n").is_empty());
    }

    #[tokio::test]
    async fn accepts_token_with_slot() {
        let script = format!(
            r#"[ "$1" = --module ] && [ "$3" = --list-slots ] || exit 2
            printf '{}'"#,
            LISTING.replace('\n', "\\n")
        );
        let daemon = SmartcardDaemon::start(&config(&script)).await.unwrap();
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_listing_without_slot() {
        let err = SmartcardDaemon::start(
            &config("echo 'Available slots:'")
        ).await.unwrap_err();
        assert!(matches!(err, Error::StartupHealthCheckFailed(_)));
    }

    #[tokio::test]
    async fn rejects_failing_probe() {
        let err = SmartcardDaemon::start(
            &config("echo 'No slots.' >&2; exit 1")
        ).await.unwrap_err();
        match err {
            Error::StartupHealthCheckFailed(msg) => {
                assert!(msg.contains("No slots."), "{msg}")
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn retries_until_token_appears() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("seen");
        let script = format!(
            r#"if [ -e '{marker}' ]; then printf '{listing}'; else touch '{marker}'; exit 1; fi"#,
            marker = marker.display(),
            listing = LISTING.replace('\n', "\\n"),
        );
        let mut config = config(&script);
        config.token_probe_max_seconds = 10;

        let daemon = SmartcardDaemon::start(&config).await.unwrap();
        assert!(marker.exists());
        daemon.shutdown().await;
    }

    #[tokio::test]
    async fn fails_when_daemon_dies() {
        let mut config = config(&format!("printf '{}'", LISTING.replace('\n', "\\n")));
        config.manage_pcscd = true;
        config.pcscd_command = vec!["/bin/sh".into(), "-c".into(), "exit 3".into()];
        config.pcscd_grace_seconds = 1;

        let err = SmartcardDaemon::start(&config).await.unwrap_err();
        assert!(matches!(err, Error::StartupHealthCheckFailed(_)));
    }

    #[tokio::test]
    async fn shutdown_stops_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let mut config = config(&format!("printf '{}'", LISTING.replace('\n', "\\n")));
        config.manage_pcscd = true;
        config.pcscd_command = vec![
            "/bin/sh".into(), "-c".into(),
            format!("echo $$ > '{}'; exec sleep 30", pid_file.display()),
        ];
        config.pcscd_grace_seconds = 1;

        let daemon = SmartcardDaemon::start(&config).await.unwrap();
        let pid = fs::read_to_string(&pid_file).unwrap().trim().to_string();
        daemon.shutdown().await;

        let alive = std::process::Command::new("kill")
            .args(["-0", &pid])
            .status()
            .unwrap();
        assert!(!alive.success());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn daemon_output_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let mut config = config(&format!("printf '{}'", LISTING.replace('\n', "\\n")));
        config.manage_pcscd = true;
        config.pcscd_command = vec![
            "/bin/sh".into(), "-c".into(),
            format!("echo $$ > '{}'; exec sleep 30", pid_file.display()),
        ];
        config.pcscd_grace_seconds = 1;

        let daemon = SmartcardDaemon::start(&config).await.unwrap();
        let pid = fs::read_to_string(&pid_file).unwrap().trim().to_string();
        for fd in ["0", "1", "2"] {
            let target = fs::read_link(format!("/proc/{pid}/fd/{fd}")).unwrap();
            assert_eq!(target, std::path::Path::new("/dev/null"), "fd {fd}");
        }
        daemon.shutdown().await;
    }
}
