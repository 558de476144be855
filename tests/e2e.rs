//! End-to-end tests for gpumon, run against the local shell instead of sshd.

#![cfg(unix)]

use std::collections::HashMap;
use std::io::Write;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::Command;

use gpumon_ssh::{
    resolve_target, CompletionMode, CompletionQuery, HostTarget, HostsFile, Monitor, Settings,
    SshConfigInventory, Transport,
};

/// Runs remote commands with `sh -c`, as sshd would. Batch transfers accept a
/// single `get "src" "dst"` line.
struct LocalShell;

impl Transport for LocalShell {
    fn exec(&self, _host: &HostTarget, remote_command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(remote_command);
        cmd
    }

    fn batch_transfer(&self, _host: &HostTarget) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(
            r#"read -r line; eval "set -- $line"; [ "$1" = get ] || exit 1; cp -- "$2" "$3""#,
        );
        cmd
    }
}

/// Each host alias runs its own canned script, ignoring the remote command.
struct FakeFleet {
    scripts: HashMap<String, String>,
}

impl FakeFleet {
    fn new(scripts: &[(&str, &str)]) -> Self {
        Self {
            scripts: scripts
                .iter()
                .map(|(alias, script)| (alias.to_string(), script.to_string()))
                .collect(),
        }
    }
}

impl Transport for FakeFleet {
    fn exec(&self, host: &HostTarget, _remote_command: &str) -> Command {
        let script = self
            .scripts
            .get(&host.alias)
            .cloned()
            .unwrap_or_else(|| "echo 'ssh: Could not resolve hostname' >&2; exit 255".to_string());
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(format!("cat >/dev/null; {}", script));
        cmd
    }

    fn batch_transfer(&self, host: &HostTarget) -> Command {
        self.exec(host, "")
    }
}

/// Yields `remaining` bytes, then fails as a dropped client connection would.
struct FlakySource {
    remaining: usize,
}

impl AsyncRead for FlakySource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "peer reset",
            )));
        }
        let n = self.remaining.min(buf.remaining());
        buf.put_slice(&vec![9u8; n]);
        self.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

fn local_monitor(settings: Settings) -> Monitor {
    Monitor::with_transport(settings, Arc::new(LocalShell))
}

fn local() -> HostTarget {
    HostTarget::new("local")
}

fn dir_str(dir: &Path) -> String {
    dir.to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_e2e_exec_reports_exit_code_and_cwd() {
    let base = TempDir::new().unwrap();
    let odd = base.path().join("it's a dir");
    std::fs::create_dir(&odd).unwrap();
    let monitor = local_monitor(Settings::default());

    for code in [0, 1, 3, 42, 255] {
        let invocation = monitor.invocation(
            local(),
            format!("echo hi; exit {}", code),
            Some(dir_str(&odd)),
        );
        let result = monitor.execute(&invocation).await;
        assert_eq!(result.exit_code, Some(code));
        assert_eq!(result.ok, code == 0);
        assert_eq!(result.cwd, dir_str(&odd));
        assert!(result.stdout.trim_end().ends_with("hi"));
        assert!(!result.stdout.contains("__GPUMON_"));
    }
}

#[tokio::test]
async fn test_e2e_exec_tracks_directory_changes() {
    let base = TempDir::new().unwrap();
    std::fs::create_dir(base.path().join("sub")).unwrap();
    let monitor = local_monitor(Settings::default());

    let invocation = monitor.invocation(local(), "cd sub && exit 4", Some(dir_str(base.path())));
    let result = monitor.execute(&invocation).await;
    assert_eq!(result.exit_code, Some(4));
    assert_eq!(result.cwd, dir_str(&base.path().join("sub")));
    assert!(!result.ok);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_e2e_exec_missing_directory() {
    let monitor = local_monitor(Settings::default());
    let invocation = monitor.invocation(
        local(),
        "echo unreachable",
        Some("/nonexistent/gpumon/dir".to_string()),
    );
    let result = monitor.execute(&invocation).await;
    assert!(!result.ok);
    assert_ne!(result.exit_code, Some(0));
    assert!(!result.stdout.contains("unreachable"));
    assert!(result.stderr.contains("/nonexistent/gpumon/dir"));
}

#[tokio::test]
async fn test_e2e_exec_output_resembling_trailer_is_kept() {
    let monitor = local_monitor(Settings::default());
    let invocation = monitor.invocation(
        local(),
        "printf '__GPUMON_deadbeef__7|/nowhere\\n'",
        Some("/".to_string()),
    );
    let result = monitor.execute(&invocation).await;
    assert!(result.ok);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.cwd, "/");
    assert!(result.stdout.contains("__GPUMON_deadbeef__7|/nowhere"));
}

#[tokio::test]
async fn test_e2e_exec_truncated_output_keeps_exit_code() {
    let settings = Settings {
        output_cap: 1024,
        ..Settings::default()
    };
    let monitor = local_monitor(settings);
    let invocation = monitor.invocation(
        local(),
        "head -c 100000 /dev/zero | tr '\\0' a; exit 2",
        Some("/".to_string()),
    );
    let result = monitor.execute(&invocation).await;
    assert_eq!(result.exit_code, Some(2));
    assert_eq!(result.cwd, "/");
    assert!(result.stdout.starts_with(&"a".repeat(1024)));
    assert!(result.stdout.contains("[output truncated:"));
}

#[tokio::test]
async fn test_e2e_exec_timeout() {
    let monitor = local_monitor(Settings::default());
    let mut invocation = monitor.invocation(local(), "sleep 5", Some("/tmp".to_string()));
    invocation.timeout = Duration::from_millis(300);
    let result = monitor.execute(&invocation).await;
    assert!(!result.ok);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.error.as_deref(), Some("timed out"));
    assert_eq!(result.cwd, "/tmp");
}

#[tokio::test]
async fn test_e2e_statuses_mixed_fleet() {
    let mut settings = Settings::default();
    settings.timeouts.status = Duration::from_millis(500);
    let fleet = FakeFleet::new(&[
        ("good", "printf '0, A100, 40, 50, 1000, 4000\\n1, A100, 42, 100, 3000, 4000\\n'"),
        ("bad", "echo 'nvidia-smi: command not found' >&2; exit 127"),
        ("slow", "sleep 5"),
        ("empty", "true"),
    ]);
    let monitor = Monitor::with_transport(settings, Arc::new(fleet));
    let hosts: Vec<HostTarget> = ["slow", "good", "bad", "unknown", "empty"]
        .into_iter()
        .map(HostTarget::new)
        .collect();

    let statuses = monitor.statuses(&hosts).await;
    let names: Vec<&str> = statuses.iter().map(|s| s.host.as_str()).collect();
    assert_eq!(names, vec!["slow", "good", "bad", "unknown", "empty"]);

    assert_eq!(statuses[0].error.as_deref(), Some("timed out"));
    assert!(statuses[1].ok);
    let summary = statuses[1].summary.as_ref().unwrap();
    assert_eq!(summary.count, 2);
    assert_eq!(summary.util_avg, 75);
    assert_eq!(summary.mem_used, 4000);
    assert_eq!(summary.mem_total, 8000);
    assert_eq!(summary.mem_pct, 50);
    assert_eq!(
        statuses[2].error.as_deref(),
        Some("nvidia-smi: command not found")
    );
    assert_eq!(
        statuses[3].error.as_deref(),
        Some("ssh: Could not resolve hostname")
    );
    assert_eq!(statuses[4].error.as_deref(), Some("no data"));
    assert!(statuses.iter().filter(|s| !s.ok).all(|s| s.gpus.is_empty()));

    let single = monitor.status(&HostTarget::new("good")).await;
    assert_eq!(single, statuses[1]);
}

#[tokio::test]
async fn test_e2e_processes_filtered_by_gpu() {
    let helper_output = r#"printf '%s' '[{"gpu_index":0,"pid":42,"name":"python","mem_used":100,"cwd":"/work","cwd_error":""},{"gpu_index":1,"pid":43,"name":"trainer","mem_used":2000,"cwd":"","cwd_error":"permission denied"}]'"#;
    let fleet = FakeFleet::new(&[
        ("gpu1", helper_output),
        ("idle", "printf 'No running processes found\\n'"),
        ("broken", "printf 'not json'"),
    ]);
    let monitor = Monitor::with_transport(Settings::default(), Arc::new(fleet));

    let result = monitor.processes(&HostTarget::new("gpu1"), 1).await;
    assert!(result.ok);
    assert_eq!(result.index, 1);
    assert_eq!(result.processes.len(), 1);
    assert_eq!(result.processes[0].pid, Some(43));
    assert_eq!(result.processes[0].cwd_error, "permission denied");

    let hosts: Vec<HostTarget> = ["gpu1", "idle", "broken"]
        .into_iter()
        .map(HostTarget::new)
        .collect();
    let all = monitor.processes_all(&hosts, 0).await;
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].processes[0].cwd, "/work");
    assert!(all[1].ok);
    assert!(all[1].processes.is_empty());
    assert!(!all[2].ok);
    assert!(all[2].error.is_some());
}

#[tokio::test]
async fn test_e2e_file_completion() {
    let base = TempDir::new().unwrap();
    std::fs::write(base.path().join("foo.txt"), b"").unwrap();
    std::fs::write(base.path().join("foobar.txt"), b"").unwrap();
    std::fs::create_dir(base.path().join("food")).unwrap();
    std::fs::write(base.path().join("other"), b"").unwrap();
    let monitor = local_monitor(Settings::default());

    let query = CompletionQuery {
        host: local(),
        prefix: "foo".to_string(),
        working_dir: Some(dir_str(base.path())),
        mode: CompletionMode::File,
    };
    let result = monitor.complete(&query).await;
    assert!(result.ok);
    let mut matches = result.matches.clone();
    matches.sort();
    assert_eq!(matches, vec!["foo.txt", "foobar.txt", "food/"]);
    assert!(!result.truncated);
    assert_eq!(gpumon_ssh::completion::common_prefix(&result.matches), "foo");

    let query = CompletionQuery {
        prefix: "zzz".to_string(),
        ..query
    };
    let result = monitor.complete(&query).await;
    assert!(result.ok);
    assert!(result.matches.is_empty());
}

#[tokio::test]
async fn test_e2e_completion_output_over_cap_is_marked_truncated() {
    let base = TempDir::new().unwrap();
    let names: Vec<String> = (0..10).map(|i| format!("foo_{:02}_abcdefghij", i)).collect();
    for name in &names {
        std::fs::write(base.path().join(name), b"").unwrap();
    }
    let monitor = local_monitor(Settings {
        output_cap: 64,
        ..Settings::default()
    });

    let query = CompletionQuery {
        host: local(),
        prefix: "foo".to_string(),
        working_dir: Some(dir_str(base.path())),
        mode: CompletionMode::File,
    };
    let result = monitor.complete(&query).await;
    assert!(result.ok);
    assert!(result.truncated);
    // 64 bytes hold three whole 18-byte lines.
    assert_eq!(result.matches.len(), 3);
    assert!(result.matches.iter().all(|m| names.contains(m)));
}

#[tokio::test]
async fn test_e2e_completion_count_cap() {
    let base = TempDir::new().unwrap();
    for i in 0..5 {
        std::fs::write(base.path().join(format!("bar{}", i)), b"").unwrap();
    }
    let monitor = local_monitor(Settings {
        completion_cap: 3,
        ..Settings::default()
    });

    let query = CompletionQuery {
        host: local(),
        prefix: "bar".to_string(),
        working_dir: Some(dir_str(base.path())),
        mode: CompletionMode::File,
    };
    let result = monitor.complete(&query).await;
    assert!(result.ok);
    assert!(result.truncated);
    assert_eq!(result.matches.len(), 3);
}

#[tokio::test]
async fn test_e2e_completion_in_missing_directory_fails() {
    let monitor = local_monitor(Settings::default());
    let query = CompletionQuery {
        host: local(),
        prefix: "a".to_string(),
        working_dir: Some("/nonexistent/gpumon/dir".to_string()),
        mode: CompletionMode::File,
    };
    let result = monitor.complete(&query).await;
    assert!(!result.ok);
    assert!(result.matches.is_empty());
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_e2e_command_completion() {
    let monitor = local_monitor(Settings::default());
    let query = CompletionQuery {
        host: local(),
        prefix: "ech".to_string(),
        working_dir: None,
        mode: CompletionMode::Command,
    };
    let result = monitor.complete(&query).await;
    assert!(result.ok);
    assert!(result.matches.iter().any(|m| m == "echo"));
}

#[tokio::test]
async fn test_e2e_upload_into_directory() {
    let base = TempDir::new().unwrap();
    let monitor = local_monitor(Settings {
        chunk_size: 4096,
        ..Settings::default()
    });
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let remote = format!("{}/", dir_str(base.path()));
    let outcome = monitor
        .upload(&local(), &remote, Some("weights.bin"), &data[..], data.len() as u64)
        .await;
    assert!(outcome.ok, "{:?}", outcome.error);
    assert_eq!(outcome.bytes, data.len() as u64);
    assert_eq!(std::fs::read(base.path().join("weights.bin")).unwrap(), data);
    // Only the destination remains.
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 1);
}

#[tokio::test]
async fn test_e2e_short_upload_writes_nothing() {
    let base = TempDir::new().unwrap();
    let monitor = local_monitor(Settings::default());
    let data = vec![7u8; 400];

    let dest = dir_str(&base.path().join("partial.bin"));
    let outcome = monitor.upload(&local(), &dest, None, &data[..], 1000).await;
    assert!(!outcome.ok);
    assert_eq!(
        outcome.error.as_deref(),
        Some("transfer interrupted: sent 400 of 1000 bytes")
    );
    assert!(!base.path().join("partial.bin").exists());
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_e2e_upload_rejected_by_remote() {
    let monitor = local_monitor(Settings::default());
    let data = vec![1u8; 10];
    let outcome = monitor
        .upload(&local(), "/nonexistent/gpumon/dir/file", None, &data[..], 10)
        .await;
    assert!(!outcome.ok);
    assert!(outcome
        .error
        .unwrap()
        .starts_with("remote rejected transfer:"));
}

#[tokio::test]
async fn test_e2e_large_upload_rejected_by_remote() {
    // Far more than a pipe buffer, so the remote's early exit breaks the pipe.
    let monitor = local_monitor(Settings::default());
    let data = vec![3u8; 4 * 1024 * 1024];
    let outcome = monitor
        .upload(
            &local(),
            "/nonexistent/gpumon/dir/file",
            None,
            &data[..],
            data.len() as u64,
        )
        .await;
    assert!(!outcome.ok);
    let error = outcome.error.unwrap();
    assert!(error.starts_with("remote rejected transfer:"), "{}", error);
    assert!(error.contains("nothing written"));
}

#[tokio::test]
async fn test_e2e_client_disconnect_during_upload() {
    let base = TempDir::new().unwrap();
    let monitor = local_monitor(Settings {
        chunk_size: 100,
        ..Settings::default()
    });

    let dest = base.path().join("dropped.bin");
    let outcome = monitor
        .upload(
            &local(),
            &dir_str(&dest),
            None,
            FlakySource { remaining: 300 },
            1000,
        )
        .await;
    assert!(!outcome.ok);
    let error = outcome.error.unwrap();
    assert!(
        error.starts_with("transfer interrupted: client disconnected: peer reset"),
        "{}",
        error
    );
    assert!(!dest.exists());
    assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_e2e_download_full_read_cleans_up() {
    let mut remote = NamedTempFile::new().unwrap();
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 13) as u8).collect();
    remote.write_all(&data).unwrap();
    remote.flush().unwrap();
    let monitor = local_monitor(Settings::default());

    let staged = monitor
        .download(&local(), &dir_str(remote.path()))
        .await
        .unwrap();
    assert_eq!(staged.len(), data.len() as u64);
    let staging = staged.staging_dir().unwrap().to_path_buf();
    assert!(staging.exists());

    let mut out = Vec::new();
    let n = staged.stream_to(&mut out).await.unwrap();
    assert_eq!(n, data.len() as u64);
    assert_eq!(out, data);
    assert!(!staging.exists());
}

#[tokio::test]
async fn test_e2e_download_dropped_early_cleans_up() {
    let mut remote = NamedTempFile::new().unwrap();
    remote.write_all(&[5u8; 50_000]).unwrap();
    remote.flush().unwrap();
    let monitor = local_monitor(Settings::default());

    let mut staged = monitor
        .download(&local(), &dir_str(remote.path()))
        .await
        .unwrap();
    let staging = staged.staging_dir().unwrap().to_path_buf();
    let mut head = [0u8; 10];
    staged.read_exact(&mut head).await.unwrap();
    assert_eq!(head, [5u8; 10]);
    drop(staged);
    assert!(!staging.exists());
}

#[tokio::test]
async fn test_e2e_download_missing_file() {
    let monitor = local_monitor(Settings::default());
    let outcome = monitor
        .download(&local(), "/nonexistent/gpumon/file")
        .await
        .unwrap_err();
    assert!(!outcome.ok);
    assert_eq!(outcome.bytes, 0);
    assert!(outcome.error.is_some());
}

#[test]
fn test_e2e_inventory_resolution() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(
        config,
        "Host gpu1 gpu2\n  User alice\nHost *.internal\n  User nobody\nHost gpu3\n  HostName 10.0.0.3"
    )
    .unwrap();
    let inventory = SshConfigInventory::load(config.path()).unwrap();
    use gpumon_ssh::Inventory;
    assert_eq!(inventory.list_hosts(), vec!["gpu1", "gpu2", "gpu3"]);
    assert_eq!(
        resolve_target(&inventory, "gpu2", Some("bob")),
        HostTarget::new("gpu2").with_user("alice")
    );
    assert_eq!(
        resolve_target(&inventory, "gpu3", Some("bob")),
        HostTarget::new("gpu3").with_user("bob")
    );
    assert_eq!(resolve_target(&inventory, "gpu3", None), HostTarget::new("gpu3"));

    let hosts = HostsFile::parse("- gpu7\n- hostname: gpu8\n  user: carol\n").unwrap();
    assert_eq!(hosts.list_hosts(), vec!["gpu7", "gpu8"]);
    assert_eq!(
        resolve_target(&hosts, "gpu8", None),
        HostTarget::new("gpu8").with_user("carol")
    );
}
