use assert_cmd::prelude::*;
use futures_util::{SinkExt, StreamExt};
use std::{fs, net::TcpListener, process::Command, time::Duration};
use tempfile::TempDir;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::Message;

const SECRET: &str = "0202020202020202020202020202020202020202020202020202020202020202";

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

struct Served {
    child: std::process::Child,
    env: String,
    port: u16,
    _dir: TempDir,
}

impl Drop for Served {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

async fn serve() -> Served {
    let dir = TempDir::new().unwrap();
    let port = free_port();
    let env_path = dir.path().join("env");
    fs::write(
        &env_path,
        format!(
            "BIND_WS=127.0.0.1:{port}\nRELAY_NAME=itest\nNIP05_NAMES=bob=b0b\nVERIFY_SIG=1\n"
        ),
    )
    .unwrap();
    let env = env_path.to_str().unwrap().to_string();
    let child = Command::cargo_bin("nostrwire")
        .unwrap()
        .args(["--env", &env, "serve"])
        .spawn()
        .unwrap();

    // allow the relay to start
    sleep(Duration::from_millis(300)).await;
    Served {
        child,
        env,
        port,
        _dir: dir,
    }
}

async fn next_text<S>(ws: &mut S) -> String
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        match timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
        {
            Message::Text(t) => return t,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn serve_answers_ws_and_http() {
    let relay = serve().await;

    let ws_url = format!("ws://127.0.0.1:{}/", relay.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    ws.send(Message::Text(r#"["REQ","s",{"kinds":[1]}]"#.into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, r#"["EOSE","s"]"#);

    let http = reqwest::Client::new();
    let doc: serde_json::Value = http
        .get(format!("http://127.0.0.1:{}/", relay.port))
        .header("Accept", "application/nostr+json")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(doc["name"], "itest");
    assert!(doc["supported_nips"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!(1)));

    let names: serde_json::Value = http
        .get(format!(
            "http://127.0.0.1:{}/.well-known/nostr.json?name=bob",
            relay.port
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(names["names"]["bob"], "b0b");
}

#[tokio::test]
async fn publish_cli_reaches_subscribers() {
    let relay = serve().await;

    let ws_url = format!("ws://127.0.0.1:{}/", relay.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    ws.send(Message::Text(r#"["REQ","live",{}]"#.into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await, r#"["EOSE","live"]"#);

    let relay_url = format!("ws://127.0.0.1:{}", relay.port);
    let env = relay.env.clone();
    let out = tokio::task::spawn_blocking(move || {
        Command::cargo_bin("nostrwire")
            .unwrap()
            .args([
                "--env",
                &env,
                "publish",
                "--relay",
                &relay_url,
                "--key",
                SECRET,
                "--content",
                "from the cli",
            ])
            .output()
            .unwrap()
    })
    .await
    .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(String::from_utf8(out.stdout).unwrap().starts_with("accepted "));

    let delivered: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
    assert_eq!(delivered[0], "EVENT");
    assert_eq!(delivered[1], "live");
    assert_eq!(delivered[2]["content"], "from the cli");
}

#[tokio::test]
async fn req_cli_stops_at_eose() {
    let relay = serve().await;
    let relay_url = format!("ws://127.0.0.1:{}", relay.port);
    let env = relay.env.clone();
    let out = tokio::task::spawn_blocking(move || {
        Command::cargo_bin("nostrwire")
            .unwrap()
            .args([
                "--env", &env, "req", "--relay", &relay_url, "--kinds", "1", "--limit", "5",
            ])
            .output()
            .unwrap()
    })
    .await
    .unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(out.stdout.is_empty());
}
