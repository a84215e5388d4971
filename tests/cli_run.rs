//! Behavioural tests for the `landfall provision` CLI.
//!
//! The end-to-end case replaces the `aws` executable with a shell script and
//! serves an SSH banner on a loopback port, so the whole workflow runs
//! without touching a real provider.

use std::io::Write;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::thread;
use std::time::Duration;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};
use predicates::str::contains;
use tempfile::TempDir;

const FAKE_AWS: &str = r#"#!/bin/sh
echo "$*" >> "$LANDFALL_TEST_AWS_LOG"
case "$2" in
  describe-instances)
    cat <<'JSON'
{"Reservations":[{"Instances":[{"InstanceId":"i-0e2e","State":{"Name":"running"},"PublicDnsName":"","PublicIpAddress":"127.0.0.1","PrivateIpAddress":"10.0.0.9"}]}]}
JSON
    ;;
  create-tags)
    ;;
  *)
    echo "unexpected command $2" >&2
    exit 2
    ;;
esac
"#;

struct Sandbox {
    _tmp: TempDir,
    root: Utf8PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
        Self { _tmp: tmp, root }
    }

    fn write_executable(&self, name: &str, contents: &str) -> Utf8PathBuf {
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .unwrap_or_else(|err| panic!("open sandbox: {err}"));
        dir.write(name, contents)
            .unwrap_or_else(|err| panic!("write {name}: {err}"));
        let path = self.root.join(name);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .unwrap_or_else(|err| panic!("chmod {name}: {err}"));
        path
    }

    fn read(&self, name: &str) -> String {
        Dir::open_ambient_dir(&self.root, ambient_authority())
            .and_then(|dir| dir.read_to_string(name))
            .unwrap_or_else(|err| panic!("read {name}: {err}"))
    }

    /// Command isolated from the caller's configuration files.
    fn command(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("landfall");
        cmd.env("HOME", self.root.as_str())
            .env("XDG_CONFIG_HOME", self.root.join("xdg").as_str())
            .env("LANDFALL_SSH_CONFIG_FILE", self.root.join("ssh_config").as_str())
            .current_dir(&self.root)
            .timeout(Duration::from_secs(60));
        cmd
    }
}

fn banner_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap_or_else(|err| panic!("bind: {err}"));
    let port = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"))
        .port();
    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").ok();
        }
    });
    port
}

#[test]
fn provision_existing_instance_runs_bootstrap_command_and_propagates_exit_code() {
    let sandbox = Sandbox::new();
    let aws = sandbox.write_executable("aws", FAKE_AWS);
    let port = banner_port();

    let mut cmd = sandbox.command();
    cmd.env("LANDFALL_AWS_BIN", aws.as_str())
        .env("LANDFALL_TEST_AWS_LOG", sandbox.root.join("aws.log").as_str())
        .env("LANDFALL_SSH_PORT", port.to_string())
        .env("LANDFALL_PROBE_INITIAL_DELAY_SECS", "0")
        .env("LANDFALL_READINESS_POLL_INTERVAL_SECS", "0")
        .args([
            "provision",
            "--instance-id",
            "i-0e2e",
            "--node-name",
            "web-01",
            "--bootstrap-command",
            "printf '%s:%s %s' \"$LANDFALL_CONNECT_ADDRESS\" \"$LANDFALL_CONNECT_PORT\" \"$LANDFALL_PROTOCOL\"; exit 3",
        ]);

    cmd.assert()
        .code(3)
        .stdout(contains(format!("127.0.0.1:{port} ssh")));

    let log = sandbox.read("aws.log");
    assert!(
        log.lines()
            .any(|line| line.starts_with("ec2 create-tags --resources i-0e2e")
                && line.contains("web-01")),
        "tags should name the node: {log}"
    );
}

#[test]
fn provision_without_bootstrap_command_prints_summary() {
    let sandbox = Sandbox::new();
    let aws = sandbox.write_executable("aws", FAKE_AWS);
    let port = banner_port();

    let mut cmd = sandbox.command();
    cmd.env("LANDFALL_AWS_BIN", aws.as_str())
        .env("LANDFALL_TEST_AWS_LOG", sandbox.root.join("aws.log").as_str())
        .env("LANDFALL_SSH_PORT", port.to_string())
        .env("LANDFALL_PROBE_INITIAL_DELAY_SECS", "0")
        .env("LANDFALL_READINESS_POLL_INTERVAL_SECS", "0")
        .args(["provision", "--instance-id", "i-0e2e"]);

    cmd.assert()
        .success()
        .stdout(contains("Instance ID: i-0e2e"))
        .stdout(contains("Public IP Address: 127.0.0.1"))
        .stdout(contains("Tag Name: i-0e2e"));
}

#[test]
fn provision_reports_aws_failure_with_exit_code_one() {
    let sandbox = Sandbox::new();
    let aws = sandbox.write_executable(
        "aws",
        "#!/bin/sh\necho 'An error occurred (UnauthorizedOperation) when calling the DescribeInstances operation: denied' >&2\nexit 254\n",
    );

    let mut cmd = sandbox.command();
    cmd.env("LANDFALL_AWS_BIN", aws.as_str())
        .args(["provision", "--instance-id", "i-0e2e"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("i-0e2e"))
        .stderr(contains("UnauthorizedOperation"));
}

#[test]
fn provision_rejects_unknown_protocol() {
    let sandbox = Sandbox::new();
    let mut cmd = sandbox.command();
    cmd.args([
        "provision",
        "--instance-id",
        "i-0e2e",
        "--bootstrap-protocol",
        "telnet",
    ]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("unsupported bootstrap protocol 'telnet'"));
}

#[test]
fn provision_rejects_windows_without_identity_file() {
    let sandbox = Sandbox::new();
    let mut cmd = sandbox.command();
    cmd.args(["provision", "--instance-id", "i-0e2e", "--platform", "windows"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("Cannot find SSH Identity file"));
}

#[test]
fn provision_requires_an_instance_or_image() {
    let sandbox = Sandbox::new();
    let mut cmd = sandbox.command();
    cmd.args(["provision"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("either --instance-id or --image-id"));
}

#[test]
fn provision_rejects_invalid_configuration() {
    let sandbox = Sandbox::new();
    let mut cmd = sandbox.command();
    cmd.env("LANDFALL_TAG_RETRY_ATTEMPTS", "0")
        .args(["provision", "--instance-id", "i-0e2e"]);

    cmd.assert()
        .failure()
        .code(1)
        .stderr(contains("LANDFALL_TAG_RETRY_ATTEMPTS"));
}
