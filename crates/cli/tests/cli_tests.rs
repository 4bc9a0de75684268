//! CLI integration tests

use clap::Parser;
use fas_cli::client::{ApiClient, ApiError, Service};
use fas_cli::commands::services::{resolve_service, run_action, Action};
use fas_cli::output::OutputFormat;
use fas_cli::{ApiCommands, Cli, Commands, ConfigCommands, ServicesCommands};
use serde_json::json;
use std::process::Command;

const SERVICE_ID: &str = "3f2b8c1e-4d5a-4b6c-8d7e-9f0a1b2c3d4e";

fn service_json(name: &str, status: &str) -> serde_json::Value {
    json!({
        "id": SERVICE_ID,
        "team_id": "payments",
        "workspace_id": "ws-1",
        "name": name,
        "folder_path": "api",
        "service_type": "nodejs",
        "confidence": 0.9,
        "status": status,
        "container_id": null,
        "config": {
            "ports": [{ "container_port": 3000, "host_port": 8080, "protocol": "tcp" }],
            "scaling": { "min_replicas": 1, "max_replicas": 10, "target_replicas": 1, "current_replicas": 0 }
        },
        "created_at": "2026-01-01T00:00:00Z",
        "deployed_at": null
    })
}

// ── Argument parsing ───────────────────────────────────────────────

#[test]
fn test_scale_takes_service_and_replicas() {
    let cli = Cli::try_parse_from(["fas", "--team", "payments", "scale", "api", "3"]).unwrap();

    assert_eq!(cli.team.as_deref(), Some("payments"));
    match cli.command {
        Commands::Api(ApiCommands::Scale { service, replicas }) => {
            assert_eq!(service, "api");
            assert_eq!(replicas, 3);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_logs_defaults_to_100_lines() {
    let cli = Cli::try_parse_from(["fas", "logs", "api"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Api(ApiCommands::Logs { lines: 100, .. })
    ));

    let cli = Cli::try_parse_from(["fas", "logs", "api", "-n", "20"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Api(ApiCommands::Logs { lines: 20, .. })
    ));
}

#[test]
fn test_services_create_parses_overrides() {
    let cli = Cli::try_parse_from([
        "fas",
        "--format",
        "json",
        "services",
        "create",
        "ws-1",
        "services/api",
        "--env",
        "NODE_ENV=production",
        "--env",
        "DATABASE_URL=postgres://db/app?sslmode=disable",
        "--port",
        "8080:3000",
        "--memory-mb",
        "1024",
    ])
    .unwrap();

    assert_eq!(cli.format, Some(OutputFormat::Json));
    match cli.command {
        Commands::Api(ApiCommands::Services(ServicesCommands::Create {
            workspace,
            folder,
            env,
            ports,
            memory_mb,
            ..
        })) => {
            assert_eq!(workspace, "ws-1");
            assert_eq!(folder, "services/api");
            assert_eq!(env[1].1, "postgres://db/app?sslmode=disable");
            assert_eq!(ports, vec![(3000, 8080)]);
            assert_eq!(memory_mb, Some(1024));
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_malformed_overrides_are_rejected() {
    assert!(Cli::try_parse_from(["fas", "services", "create", "ws", "api", "--env", "NOEQUALS"]).is_err());
    assert!(Cli::try_parse_from(["fas", "services", "create", "ws", "api", "--port", "8080"]).is_err());
    assert!(Cli::try_parse_from(["fas", "services", "create", "ws", "api", "--port", "x:3000"]).is_err());
    assert!(Cli::try_parse_from(["fas", "scale", "api", "-1"]).is_err());
}

#[test]
fn test_config_set_parses_format() {
    let cli = Cli::try_parse_from(["fas", "config", "set", "--default-format", "json"]).unwrap();
    assert!(matches!(
        cli.command,
        Commands::Config(ConfigCommands::Set {
            default_format: Some(OutputFormat::Json),
            ..
        })
    ));
}

// ── API client ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_client_parses_error_bodies() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", format!("/teams/payments/services/{SERVICE_ID}/scale").as_str())
        .with_status(409)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "error": "invalid state transition from pending to scaling",
                "code": "invalid_transition",
                "details": { "from": "pending", "to": "scaling" }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let err = client
        .post::<Service, _>(
            &format!("teams/payments/services/{SERVICE_ID}/scale"),
            &json!({ "replica_count": 2 }),
        )
        .await
        .unwrap_err();

    mock.assert_async().await;
    let api_error = err.downcast_ref::<ApiError>().unwrap();
    assert_eq!(api_error.status, 409);
    assert_eq!(api_error.code, "invalid_transition");
    assert_eq!(api_error.details.as_ref().unwrap()["from"], "pending");
}

#[tokio::test]
async fn test_delete_accepts_empty_204() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("DELETE", format!("/teams/payments/services/{SERVICE_ID}").as_str())
        .with_status(204)
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    client
        .delete(&format!("teams/payments/services/{SERVICE_ID}"))
        .await
        .unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn test_service_names_resolve_through_the_list() {
    let mut server = mockito::Server::new_async().await;
    let list = server
        .mock("GET", "/teams/payments/services")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!([service_json("billing", "running")]).to_string())
        .expect(2)
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    assert_eq!(resolve_service(&client, "payments", "billing").await.unwrap(), SERVICE_ID);
    assert!(resolve_service(&client, "payments", "orders").await.is_err());
    // Ids skip the lookup
    assert_eq!(resolve_service(&client, "payments", SERVICE_ID).await.unwrap(), SERVICE_ID);

    list.assert_async().await;
}

#[tokio::test]
async fn test_start_posts_to_the_service() {
    let mut server = mockito::Server::new_async().await;
    let start = server
        .mock("POST", format!("/teams/payments/services/{SERVICE_ID}/start").as_str())
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(service_json("billing", "pending").to_string())
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    run_action(&client, "payments", SERVICE_ID, Action::Start, OutputFormat::Json)
        .await
        .unwrap();

    start.assert_async().await;
}

// ── Binary ─────────────────────────────────────────────────────────

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_fas"))
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("folder-as-a-service"), "Should show app description");
    for command in ["analyze", "services", "start", "scale", "logs", "events", "config"] {
        assert!(stdout.contains(command), "Should show {} command", command);
    }
}

/// Commands that need a team fail without one
#[test]
fn test_missing_team_fails() {
    let home = tempfile::TempDir::new().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_fas"))
        .args(["services", "list"])
        .env("HOME", home.path())
        .env_remove("FAS_TEAM")
        .env("FAS_API_URL", "http://127.0.0.1:9")
        .output()
        .expect("Failed to execute command");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("No team set"), "stderr: {}", stderr);
}
