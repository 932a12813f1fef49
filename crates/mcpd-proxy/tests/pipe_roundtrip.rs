//! End-to-end: a stdio child bridged by a live proxy, driven through
//! the client's connection manager over the pipe transport.

use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use mcpd_client::{
    ConnectionManager, ConnectionState, DefaultTransportFactory, NoCredentials,
    ServerRegistration,
};
use mcpd_proxy::{router, ProxyConfig, ProxyState};
use serde_json::json;
use tokio::time::{sleep, timeout, Duration};

/// Minimal JSON-RPC echo server in shell, enough for the handshake and
/// one tool.
const ECHO_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  case "$line" in
    *initialize*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"echo","version":"0.1"}}}\n' "$id"
      ;;
    *tools/list*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","description":"echoes","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *tools/call*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hi from child"}]}}\n' "$id"
      ;;
    *ping*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
      ;;
  esac
done
"#;

fn write_script(contents: &str) -> tempfile::TempPath {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    let path = file.into_temp_path();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Serve the proxy router on an ephemeral port, returning its base URL.
async fn start_proxy() -> String {
    let state = ProxyState::new(ProxyConfig::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

async fn wait_for_state(manager: &Arc<ConnectionManager>, want: ConnectionState) {
    timeout(Duration::from_secs(10), async {
        loop {
            if manager.state().await == want {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("state not reached in time");
}

#[tokio::test]
async fn pipe_transport_full_roundtrip() {
    let script = write_script(ECHO_SERVER);
    let proxy_url = start_proxy().await;

    let factory = Arc::new(DefaultTransportFactory::new(proxy_url.clone(), None));
    let mut registration = ServerRegistration::pipe(
        "srv-e2e",
        "echo server",
        script.to_str().unwrap(),
        Vec::new(),
    );
    registration.capabilities = vec!["tools".to_string()];
    let manager = ConnectionManager::new(registration, factory, Arc::new(NoCredentials));

    manager.connect().await.expect("connect failed");
    wait_for_state(&manager, ConnectionState::Connected).await;

    // The registration's declared capabilities reach the proxy listing.
    let listing: serde_json::Value = reqwest::get(format!("{proxy_url}/servers"))
        .await
        .expect("listing request failed")
        .json()
        .await
        .expect("listing body not json");
    assert_eq!(listing["servers"][0]["id"], "srv-e2e");
    assert_eq!(listing["servers"][0]["capabilities"], json!(["tools"]));

    let info = manager.server_info().await.expect("no server info");
    assert_eq!(info.server_info.name, "echo");

    let tools = manager.list_tools().await.expect("tools/list failed");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");

    let result = manager
        .call_tool("echo", Some(json!({"text": "x"})))
        .await
        .expect("tools/call failed");
    assert!(!result.is_error);
    assert!(matches!(
        result.content.first(),
        Some(mcpd_client::ToolContent::Text { text }) if text.contains("hi from child")
    ));

    manager.disconnect().await;
    wait_for_state(&manager, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn pipe_transport_surfaces_child_crash() {
    let script = write_script(
        r#"#!/bin/sh
read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{},"serverInfo":{"name":"flaky","version":"0.1"}}}\n' "$id"
read -r line
sleep 1
exit 3
"#,
    );
    let proxy_url = start_proxy().await;

    let factory = Arc::new(DefaultTransportFactory::new(proxy_url, None));
    let mut registration = ServerRegistration::pipe(
        "srv-crash-e2e",
        "flaky server",
        script.to_str().unwrap(),
        Vec::new(),
    );
    registration.backoff.max_attempts = 1;
    registration.backoff.initial_delay = Duration::from_millis(10);

    let manager = ConnectionManager::new(registration, factory, Arc::new(NoCredentials));
    manager.connect().await.expect("connect failed");
    wait_for_state(&manager, ConnectionState::Connected).await;

    // The child exits nonzero shortly after the handshake; the manager
    // should leave Connected and end up in a non-connected state once
    // its bounded reconnection gives up.
    timeout(Duration::from_secs(15), async {
        loop {
            match manager.state().await {
                ConnectionState::Connected => sleep(Duration::from_millis(50)).await,
                _ => return,
            }
        }
    })
    .await
    .expect("crash never surfaced");
}
