#![allow(dead_code)] // Different tests use different parts.

use std::{env, fs};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::LevelFilter;
use reqwest::multipart::{Form, Part};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokensign::commons::error::Error;
use tokensign::config::{Config, LogType};
use tokensign::daemon::start::start_daemon_until;


//------------ Behaviour of the fake tools -----------------------------------

/// What the fake signing tool does when asked to sign.
#[derive(Clone, Debug)]
pub enum Sign {
    /// Writes "SIGNED:" followed by the input to the output.
    Succeed,

    /// Prints the message to stderr and exits with 1.
    Fail(&'static str),

    /// Prints "token locked" and its full command line, exits with 1.
    EchoArgsAndFail,

    /// Sleeps for the given seconds, then succeeds.
    Sleep(u64),

    /// Succeeds after half a second, fails if another sign is running.
    Exclusive,

    /// Exits with 0 without writing any output.
    NoOutput,
}

/// What the fake signing tool does when asked to verify.
#[derive(Clone, Debug)]
pub enum Verify {
    Succeed,
    Fail(&'static str),
}

/// The listing printed by the fake slot probe.
pub const SLOT_LISTING: &str = "Available slots:\n\
    Slot 0 (0x0): Gemalto USB Shell Token V2\n  \
    token label        : Code Signing\n";


//------------ TestConfig ----------------------------------------------------

/// A test config builder.
pub struct TestConfig {
    dir: TempDir,
    sign: Sign,
    verify: Verify,
    probe: String,
    key_id: Option<String>,
    post_limit_sign: Option<u64>,
    sign_timeout_seconds: u64,
    log_file: bool,
}

impl TestConfig {
    pub fn new() -> Self {
        TestConfig {
            dir: TempDir::new().unwrap(),
            sign: Sign::Succeed,
            verify: Verify::Succeed,
            probe: format!("printf '{}'", SLOT_LISTING.replace('\n', "\\n")),
            key_id: Some("01".into()),
            post_limit_sign: None,
            sign_timeout_seconds: 10,
            log_file: false,
        }
    }

    pub fn sign(mut self, sign: Sign) -> Self {
        self.sign = sign;
        self
    }

    pub fn verify(mut self, verify: Verify) -> Self {
        self.verify = verify;
        self
    }

    /// Replaces the slot probe by the given shell script.
    pub fn probe(mut self, script: &str) -> Self {
        self.probe = script.into();
        self
    }

    pub fn without_key_id(mut self) -> Self {
        self.key_id = None;
        self
    }

    pub fn post_limit_sign(mut self, limit: u64) -> Self {
        self.post_limit_sign = Some(limit);
        self
    }

    pub fn sign_timeout_seconds(mut self, seconds: u64) -> Self {
        self.sign_timeout_seconds = seconds;
        self
    }

    /// Logs everything at trace level to `service.log` in the test dir.
    pub fn log_to_file(mut self) -> Self {
        self.log_file = true;
        self
    }

    pub fn finalize(self) -> (Config, TempDir) {
        let dir = self.dir;
        let scratch = dir.path().join("scratch");
        fs::create_dir(&scratch).unwrap();

        let mut config = Config::parse_str("").unwrap();
        config.port = 0;
        config.manage_pcscd = false;
        config.pkcs11_tool_command = shell(&self.probe, "pkcs11-tool");
        config.signtool_command = shell(
            &signtool_script(dir.path(), &self.sign, &self.verify),
            "osslsigncode",
        );
        config.key_id = self.key_id;
        config.scratch_dir = Some(scratch);
        config.pcscd_grace_seconds = 0;
        config.token_probe_max_seconds = 0;
        config.sign_timeout_seconds = self.sign_timeout_seconds;
        config.verify_timeout_seconds = 10;
        if let Some(limit) = self.post_limit_sign {
            config.post_limit_sign = limit;
        }

        if self.log_file {
            config.log_type = LogType::File;
            config.log_file = Some(dir.path().join("service.log"));
            config.log_level = LevelFilter::Trace;
        }
        else {
            config.log_level = if env::var("TOKENSIGN_TEST_DEBUG").is_ok() {
                LevelFilter::Debug
            }
            else {
                LevelFilter::Error
            };
        }
        let _ = config.init_logging(); // Allow failing on repeat attempts.

        (config, dir)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the command line running `script` with the given `$0`.
pub fn shell(script: &str, name: &str) -> Vec<String> {
    vec!["/bin/sh".into(), "-c".into(), script.into(), name.into()]
}

/// Returns the script standing in for the signing tool.
///
/// Every invocation appends its sub-command to `calls` in the test dir.
fn signtool_script(dir: &Path, sign: &Sign, verify: &Verify) -> String {
    let dir = dir.display();
    let write_output = r#"{ printf 'SIGNED:'; cat "$in"; } > "$out""#;
    let sign = match sign {
        Sign::Succeed => write_output.to_string(),
        Sign::Fail(msg) => format!("echo '{msg}' >&2; exit 1"),
        Sign::EchoArgsAndFail => {
            r#"echo "token locked, command: $all" >&2; exit 1"#.to_string()
        }
        Sign::Sleep(secs) => format!("sleep {secs}; {write_output}"),
        Sign::Exclusive => format!(
            "mkdir '{dir}/lock' || {{ echo 'ran in parallel' >&2; exit 1; }}
            sleep 0.5
            rmdir '{dir}/lock'
            {write_output}"
        ),
        Sign::NoOutput => "exit 0".to_string(),
    };
    let verify = match verify {
        Verify::Succeed => "exit 0".to_string(),
        Verify::Fail(msg) => format!("echo '{msg}' >&2; exit 1"),
    };
    format!(
        r#"cmd="$1"; shift
        all="$*"
        echo "$cmd" >> '{dir}/calls'
        case "$cmd" in
            sign)
                while [ $# -gt 0 ]; do
                    case "$1" in
                        -in) shift; in="$1" ;;
                        -out) shift; out="$1" ;;
                    esac
                    shift
                done
                {sign}
                ;;
            verify)
                {verify}
                ;;
            *)
                exit 64
                ;;
        esac"#
    )
}


//------------ TestServer ----------------------------------------------------

/// A running test service.
pub struct TestServer {
    addr: SocketAddr,
    join: JoinHandle<Result<(), Error>>,
    stop: Option<oneshot::Sender<()>>,
    dir: TempDir,
    scratch: PathBuf,
    client: reqwest::Client,
}

impl TestServer {
    /// Starts a server with the default test config.
    pub async fn start() -> Self {
        Self::start_with(TestConfig::new()).await
    }

    /// Starts a server and waits for it to become ready.
    pub async fn start_with(config: TestConfig) -> Self {
        let (config, dir) = config.finalize();
        let scratch = config.scratch_dir();
        let (tx, running) = oneshot::channel();
        let (stop, stopped) = oneshot::channel::<()>();
        let join = tokio::spawn(start_daemon_until(
            Arc::new(config),
            Some(tx),
            async move { let _ = stopped.await; },
        ));
        let addr = timeout(Duration::from_secs(10), running)
            .await
            .expect("service did not start in time")
            .expect("service failed to start");
        TestServer {
            addr,
            join,
            stop: Some(stop),
            dir,
            scratch,
            client: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Posts a signing request.
    pub async fn sign(
        &self, content: &[u8], file_name: &str, pin: &str
    ) -> reqwest::Response {
        self.post_form(sign_form(content, file_name, pin)).await
    }

    pub async fn post_form(&self, form: Form) -> reqwest::Response {
        self.client.post(self.url("/sign"))
            .multipart(form)
            .send()
            .await
            .unwrap()
    }

    /// Returns the sub-commands the signing tool was called with.
    pub fn calls(&self) -> Vec<String> {
        match fs::read_to_string(self.dir.path().join("calls")) {
            Ok(calls) => calls.lines().map(ToString::to_string).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Waits for the signing tool to be called with `cmd`.
    ///
    /// Panics if that doesn’t happen within five seconds.
    pub async fn wait_for_call(&self, cmd: &str) {
        for _ in 0..100 {
            if self.calls().iter().any(|call| call == cmd) {
                return
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("signing tool never called with '{cmd}'");
    }

    /// Returns the files currently in the scratch directory.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        fs::read_dir(&self.scratch).unwrap()
            .map(|entry| entry.unwrap().path())
            .collect()
    }

    /// Waits a little for the scratch directory to become empty.
    ///
    /// Panics if it doesn’t.
    pub async fn assert_scratch_empty(&self) {
        for _ in 0..50 {
            if self.scratch_files().is_empty() {
                return
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("scratch files left behind: {:?}", self.scratch_files());
    }

    /// Asks the service to shut down and waits until it has.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        timeout(Duration::from_secs(10), &mut self.join)
            .await
            .expect("service did not shut down in time")
            .expect("service task failed")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Returns the form of a signing request.
pub fn sign_form(content: &[u8], file_name: &str, pin: &str) -> Form {
    Form::new()
        .part(
            "file",
            Part::bytes(content.to_vec()).file_name(file_name.to_string())
        )
        .text("pin", pin.to_string())
}
