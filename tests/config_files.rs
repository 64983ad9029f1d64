use std::fs;
use tempfile::TempDir;

use polygate::config::{Config, LoadBalancerMethod, ServerKind};

const GLOBAL: &str = r#"
[[upstreams]]
name = "app1"
url = "http://127.0.0.1:9001"
weight = 3
health_check = "/healthz"

[[upstreams]]
name = "app2"
url = "http://127.0.0.1:9002"
weight = 1

[[websocket_upstreams]]
name = "chat"
url = "ws://127.0.0.1:9100"

[load_balancer]
method = "round_robin"
timeout = "30s"
max_retries = 2

[proxy]
max_body_size = 10485760

[cors]
enabled = false

[logging]
level = "info"
"#;

const EDGE: &str = r#"
[server]
name = "edge"
host = "127.0.0.1"
port = 8080
upstreams = ["app1", "app2"]
enabled = true

[load_balancer]
method = "weighted_round_robin"
timeout = "10s"
max_retries = 3

[cors]
enabled = true
allowed_origins = ["https://app"]
allowed_methods = ["GET", "POST"]
max_age = 600
"#;

const CHAT: &str = r#"
[server]
name = "chat-edge"
host = "127.0.0.1"
port = 8090
websocket_port = 8091
kind = "websocket"
upstreams = ["chat"]
enabled = true
"#;

const DISABLED: &str = r#"
[server]
name = "staging"
host = "127.0.0.1"
port = 8085
upstreams = ["app1"]
enabled = false
"#;

fn write_config_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, content) in files {
        fs::write(dir.path().join(name), content).unwrap();
    }
    dir
}

#[test]
fn test_multi_file_load_merges_servers() {
    let dir = write_config_dir(&[
        ("global.toml", GLOBAL),
        ("edge.toml", EDGE),
        ("chat.toml", CHAT),
        ("staging.toml", DISABLED),
    ]);

    let config = Config::load_dir(dir.path()).unwrap();

    // disabled server file is skipped entirely
    assert_eq!(config.servers.len(), 2);
    assert!(config.servers.iter().all(|s| s.name != "staging"));

    let edge = config.servers.iter().find(|s| s.name == "edge").unwrap();
    assert_eq!(edge.kind, ServerKind::Http);

    let chat = config.servers.iter().find(|s| s.name == "chat-edge").unwrap();
    assert_eq!(chat.kind, ServerKind::Websocket);
    assert_eq!(chat.websocket_port, Some(8091));

    // the upstream catalog comes from global.toml
    assert_eq!(config.upstreams.len(), 2);
    assert_eq!(config.websocket_upstreams.len(), 1);
    assert_eq!(config.upstreams_by_names(&edge.upstreams).len(), 2);
    assert_eq!(config.websocket_upstreams_by_names(&chat.upstreams).len(), 1);
}

#[test]
fn test_server_local_sections_override_global() {
    let dir = write_config_dir(&[("global.toml", GLOBAL), ("edge.toml", EDGE), ("chat.toml", CHAT)]);
    let config = Config::load_dir(dir.path()).unwrap();

    let edge = config.servers.iter().find(|s| s.name == "edge").unwrap();
    let chat = config.servers.iter().find(|s| s.name == "chat-edge").unwrap();

    // edge.toml overrides the load balancer and CORS sections
    let edge_lb = config.load_balancer_for(edge);
    assert_eq!(edge_lb.method, LoadBalancerMethod::WeightedRoundRobin);
    assert_eq!(edge_lb.max_retries, 3);
    assert!(config.cors_for(edge).enabled);

    // chat.toml declares nothing extra and falls back to globals
    let chat_lb = config.load_balancer_for(chat);
    assert_eq!(chat_lb.method, LoadBalancerMethod::RoundRobin);
    assert_eq!(chat_lb.max_retries, 2);
    assert!(!config.cors_for(chat).enabled);
}

#[test]
fn test_missing_global_file_fails() {
    let dir = write_config_dir(&[("edge.toml", EDGE)]);
    assert!(Config::load_dir(dir.path()).is_err());
}

#[test]
fn test_single_file_legacy_mode() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("polygate.toml");
    fs::write(
        &path,
        r#"
[[servers]]
name = "edge"
host = "127.0.0.1"
port = 8080
upstreams = ["app1"]

[[upstreams]]
name = "app1"
url = "http://127.0.0.1:9001"
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.servers.len(), 1);
    assert_eq!(config.enabled_servers().len(), 1);
    assert_eq!(config.upstreams[0].weight, 1);
}

#[test]
fn test_unknown_upstream_reference_fails_validation() {
    let mut edge = EDGE.replace("[\"app1\", \"app2\"]", "[\"ghost\"]");
    edge.truncate(edge.find("[load_balancer]").unwrap());
    let dir = write_config_dir(&[("global.toml", GLOBAL), ("edge.toml", &edge)]);

    assert!(Config::load_dir(dir.path()).is_err());
}
