//! End-to-end CLI tests for the hydrofetch binary.

use assert_cmd::Command;
use predicates::prelude::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;

use support::socket_guard::start_mock_server_or_skip;

/// A command with no provider credentials or overrides inherited from the
/// developer's shell.
fn hydrofetch() -> Command {
    let mut cmd = Command::cargo_bin("hydrofetch").unwrap();
    for (name, _) in std::env::vars() {
        if name.starts_with("HYDROFETCH_") && name != "HYDROFETCH_REQUIRE_SOCKET_TESTS" {
            cmd.env_remove(name);
        }
    }
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Test that --help displays usage information and exits with code 0.
#[test]
fn test_binary_help_displays_usage() {
    hydrofetch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Retrieve river gauge time series"));
}

/// Test that --version displays version and exits with code 0.
#[test]
fn test_binary_version_displays_version() {
    hydrofetch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("hydrofetch"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    hydrofetch()
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_providers_lists_all_and_marks_disabled() {
    hydrofetch()
        .arg("providers")
        .assert()
        .success()
        .stdout(predicate::str::contains("lithuania"))
        .stdout(predicate::str::contains("southafrica"))
        .stdout(predicate::str::contains("norway\tdisabled"));
}

#[test]
fn test_providers_enables_norway_with_key() {
    hydrofetch()
        .arg("providers")
        .env("HYDROFETCH_NORWAY_API_KEY", "secret")
        .assert()
        .success()
        .stdout(predicate::str::contains("norway\t3 variables"));
}

#[test]
fn test_variables_prints_ids_with_si_units() {
    hydrofetch()
        .args(["variables", "lithuania"])
        .assert()
        .success()
        .stdout(predicate::str::contains("discharge-daily-mean\tm³/s"))
        .stdout(predicate::str::contains("stage-daily-mean\tm"));
}

#[test]
fn test_variables_unknown_provider_fails() {
    hydrofetch()
        .args(["variables", "atlantis"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown provider: atlantis"));
}

#[test]
fn test_invalid_environment_concurrency_fails() {
    hydrofetch()
        .arg("providers")
        .env("HYDROFETCH_CONCURRENCY", "500")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid concurrency value 500"));
}

#[test]
fn test_fetch_with_invalid_date_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    hydrofetch()
        .args(["fetch", "lithuania", "stage-daily-mean", "1234", "--start", "2020-13-01"])
        .arg("--output-dir")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("0 completed, 0 empty, 1 failed"));
}

#[test]
fn test_build_cache_on_api_provider_fails() {
    hydrofetch()
        .args(["build-cache", "lithuania"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no bulk archive"));
}

#[test]
fn test_metadata_without_catalog_or_snapshot_fails() {
    let dir = tempfile::tempdir().unwrap();
    hydrofetch()
        .args(["metadata", "southafrica"])
        .arg("--snapshot-dir")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("publishes no station catalog"));
}

#[test]
fn test_metadata_reads_snapshot_for_provider_without_catalog() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("southafrica.json"),
        r#"[{"gauge_id":"A2H012","name":"Krokodil River","river":"Krokodil"}]"#,
    )
    .unwrap();
    hydrofetch()
        .args(["metadata", "southafrica"])
        .arg("--snapshot-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("A2H012,Krokodil River,Krokodil"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fetch_writes_one_csv_per_gauge() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    Mock::given(method("GET"))
        .and(path("/hydro-stations/1234/observations/historical/2021-06"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"observations":[{"observationDateUtc":"2021-06-15 00:00:00","waterLevel":250}]}"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hydro-stations/5678/observations/historical/2021-06"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().to_path_buf();
    let uri = server.uri();
    let assert = tokio::task::spawn_blocking(move || {
        hydrofetch()
            .env("HYDROFETCH_LITHUANIA_BASE_URL", uri)
            .args(["fetch", "lithuania", "stage-daily-mean", "1234", "5678"])
            .args(["--start", "2021-06-01", "--end", "2021-06-30", "-c", "2"])
            .arg("--output-dir")
            .arg(&out)
            .assert()
    })
    .await
    .unwrap();
    assert
        .success()
        .stderr(predicate::str::contains("1 completed, 1 empty, 0 failed"));

    let csv = std::fs::read_to_string(dir.path().join("lithuania_1234_stage-daily-mean.csv")).unwrap();
    assert!(csv.starts_with("time,stage-daily-mean\n"));
    assert!(csv.contains("2021-06-15"));
    assert!(csv.contains(",2.5"));
    assert!(!dir.path().join("lithuania_5678_stage-daily-mean.csv").exists());
}
