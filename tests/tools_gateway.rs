#![cfg(unix)]

use docsmith::tools::{FailureKind, ToolError, ToolGateway, ToolInvocation};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn write_script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).expect("write script");
    let mut perms = fs::metadata(&path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod");
    path.display().to_string()
}

fn invocation(binary: String, args: Vec<&str>, dir: &Path, timeout_secs: u64) -> ToolInvocation {
    ToolInvocation::new(
        binary,
        args.into_iter().map(str::to_string).collect(),
        dir,
        Duration::from_secs(timeout_secs),
    )
}

#[test]
fn missing_executable_is_tool_not_found() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 64 * 1024);
    let err = gateway
        .invoke(&invocation(
            dir.path().join("does-not-exist").display().to_string(),
            vec![],
            dir.path(),
            5,
        ))
        .expect_err("must fail");
    assert!(matches!(err, ToolError::NotFound { .. }));
}

#[test]
fn success_captures_stdout_and_duration() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 64 * 1024);
    let script = write_script(dir.path(), "ok-tool", "#!/bin/sh\necho ready\n");

    let outcome = gateway
        .invoke(&invocation(script, vec![], dir.path(), 5))
        .expect("success");
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout.trim(), "ready");
}

#[test]
fn timeout_kills_the_child_and_its_process_group() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 64 * 1024);
    // The script forks a grandchild and waits; a plain child kill would
    // leave the sleeper running.
    let script = write_script(dir.path(), "hang-tool", "#!/bin/sh\nsleep 60 &\nwait\n");

    let started = Instant::now();
    let err = gateway
        .invoke(&invocation(script, vec![], dir.path(), 1))
        .expect_err("must time out");
    assert!(matches!(err, ToolError::Timeout { .. }));
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "timeout must not wait for the sleeper"
    );
}

#[test]
fn nonzero_exit_is_classified_from_stderr() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 64 * 1024);
    let script = write_script(
        dir.path(),
        "gs",
        "#!/bin/sh\necho 'Error: /syntaxerror in obj' >&2\nexit 1\n",
    );

    let err = gateway
        .invoke(&invocation(script, vec!["in.pdf"], dir.path(), 5))
        .expect_err("must fail");
    match err {
        ToolError::Execution {
            exit_code,
            classified,
            ..
        } => {
            assert_eq!(exit_code, 1);
            assert_eq!(classified.kind, FailureKind::CorruptInput);
        }
        other => panic!("expected execution error, got {other}"),
    }
}

#[test]
fn signal_death_is_a_crash() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 64 * 1024);
    let script = write_script(dir.path(), "crash-tool", "#!/bin/sh\nkill -KILL $$\n");

    let err = gateway
        .invoke(&invocation(script, vec![], dir.path(), 5))
        .expect_err("must crash");
    assert!(matches!(err, ToolError::Crash { .. }));
    assert!(err.is_transient());
}

#[test]
fn capture_is_bounded() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 512);
    let script = write_script(
        dir.path(),
        "noisy-tool",
        "#!/bin/sh\ni=0\nwhile [ $i -lt 1000 ]; do echo 'spam spam spam spam'; i=$((i+1)); done\n",
    );

    let outcome = gateway
        .invoke(&invocation(script, vec![], dir.path(), 10))
        .expect("success");
    assert!(outcome.stdout.len() < 1024);
    assert!(outcome.stdout.ends_with("[output truncated]"));
}

#[test]
fn chain_short_circuits_on_first_success() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 64 * 1024);
    let failing = write_script(dir.path(), "first", "#!/bin/sh\necho nope >&2\nexit 1\n");
    let marker = dir.path().join("ran-second");
    let succeeding = write_script(
        dir.path(),
        "second",
        &format!("#!/bin/sh\ntouch {}\n", marker.display()),
    );
    let third = write_script(dir.path(), "third", "#!/bin/sh\ntouch should-not-run\nexit 0\n");

    let outcome = gateway
        .run_chain(
            &[
                invocation(failing, vec![], dir.path(), 5),
                invocation(succeeding, vec![], dir.path(), 5),
                invocation(third, vec![], dir.path(), 5),
            ],
            || false,
        )
        .expect("chain succeeds");
    assert_eq!(outcome.exit_code, Some(0));
    assert!(marker.exists());
    assert!(!dir.path().join("should-not-run").exists());
}

#[test]
fn exhausted_chain_aggregates_every_attempt() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 64 * 1024);
    let first = write_script(dir.path(), "first", "#!/bin/sh\necho 'parse error' >&2\nexit 1\n");
    let second = write_script(dir.path(), "second", "#!/bin/sh\necho 'not found' >&2\nexit 2\n");

    let err = gateway
        .run_chain(
            &[
                invocation(first, vec![], dir.path(), 5),
                invocation(second, vec![], dir.path(), 5),
            ],
            || false,
        )
        .expect_err("chain fails");
    match err {
        ToolError::ChainExhausted { attempts, summary } => {
            assert_eq!(attempts, 2);
            assert!(summary.contains("first"));
            assert!(summary.contains("second"));
        }
        other => panic!("expected chain exhaustion, got {other}"),
    }
}

#[test]
fn invocations_are_logged() {
    let dir = tempdir().expect("tempdir");
    let gateway = ToolGateway::new(dir.path(), 64 * 1024);
    let script = write_script(dir.path(), "ok-tool", "#!/bin/sh\nexit 0\n");
    gateway
        .invoke(&invocation(script, vec![], dir.path(), 5))
        .expect("success");

    let log = fs::read_to_string(dir.path().join("logs/tools.log")).expect("log file");
    assert!(log.contains("event=tool.ok"));
    assert!(log.contains("duration_ms="));
}
