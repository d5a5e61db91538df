//! Command line interface: run a relay, manage keys, sign and verify events,
//! and talk to remote relays.

use std::{
    collections::{HashMap, HashSet},
    fs,
    net::SocketAddr,
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use nostrwire::{
    config::{csv_strings, Settings},
    keys, subscription, Client, ClientOptions, Context, ConnectionId, Event, Filter, Message,
    MessageType, Relay, RelayOptions, Tag,
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "nostrwire", author, version, about = "Nostr relay and client toolkit")]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Run a relay on `BIND_WS` that forwards every event to every open
    /// subscription.
    Serve,
    /// Print a new secret key and its public key.
    Keygen,
    /// Print a signed event.
    Sign {
        #[command(flatten)]
        event: EventArgs,
    },
    /// Check the id and signature of an event file.
    Verify { file: String },
    /// Sign an event, send it to a relay and wait for its OK.
    Publish {
        /// Relay URL, e.g. `wss://relay.example.com`.
        #[arg(long)]
        relay: String,
        #[command(flatten)]
        event: EventArgs,
        /// Seconds to wait for the relay's answer.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
    /// Subscribe on a relay and print matching events until EOSE.
    Req {
        #[arg(long)]
        relay: String,
        /// Comma-separated kind numbers.
        #[arg(long)]
        kinds: Option<String>,
        /// Comma-separated hex pubkeys.
        #[arg(long)]
        authors: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

#[derive(clap::Args)]
struct EventArgs {
    /// Hex secret key.
    #[arg(long)]
    key: String,
    #[arg(long, default_value_t = 1)]
    kind: u16,
    #[arg(long, default_value = "")]
    content: String,
    /// Tag as comma-separated elements, e.g. `t,news`. Repeatable.
    #[arg(long = "tag")]
    tags: Vec<String>,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve => {
            let cfg = load_settings(&cli.env)?;
            let addr: SocketAddr = cfg.bind_ws.as_str().parse().context("parsing BIND_WS")?;
            let relay = firehose_relay(&cfg, Subscriptions::default());
            relay
                .serve(addr, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        Commands::Keygen => {
            let secret = keys::generate();
            println!("secret: {secret}");
            println!("public: {}", keys::public_key(&secret)?);
        }
        Commands::Sign { event } => {
            println!("{}", event.build()?.to_json()?);
        }
        Commands::Verify { file } => {
            let data = fs::read_to_string(&file).with_context(|| format!("reading {file}"))?;
            let ev = Event::from_json(&data)?;
            ev.verify()?;
            println!("ok {}", ev.id);
        }
        Commands::Publish {
            relay,
            event,
            timeout,
        } => {
            let cfg = load_settings(&cli.env)?;
            let ev = event.build()?;
            let (accepted, message) = publish(&cfg, &relay, ev.clone(), timeout).await?;
            if !accepted {
                bail!("relay rejected {}: {message}", ev.id);
            }
            println!("accepted {}", ev.id);
        }
        Commands::Req {
            relay,
            kinds,
            authors,
            limit,
            timeout,
        } => {
            let cfg = load_settings(&cli.env)?;
            let filter = build_filter(kinds.as_deref(), authors.as_deref(), limit)?;
            for ev in request(&cfg, &relay, filter, timeout).await? {
                println!("{}", ev.to_json()?);
            }
        }
    }
    Ok(())
}

impl EventArgs {
    fn build(&self) -> anyhow::Result<Event> {
        let tags = self
            .tags
            .iter()
            .map(|raw| parse_tag(raw))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut ev = Event::new(self.kind, self.content.clone(), tags);
        ev.sign(&self.key).context("signing event")?;
        Ok(ev)
    }
}

fn parse_tag(raw: &str) -> anyhow::Result<Tag> {
    let values: Vec<Value> = raw
        .split(',')
        .map(|s| Value::String(s.trim().to_string()))
        .collect();
    Tag::from_values(values).with_context(|| format!("invalid tag `{raw}`"))
}

fn build_filter(
    kinds: Option<&str>,
    authors: Option<&str>,
    limit: Option<u64>,
) -> anyhow::Result<Filter> {
    let mut filter = Filter::new();
    if let Some(kinds) = kinds {
        let kinds = csv_strings(kinds)
            .iter()
            .map(|k| k.parse::<u16>().with_context(|| format!("invalid kind `{k}`")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        filter = filter.kinds(kinds);
    }
    if let Some(authors) = authors {
        filter = filter.authors(csv_strings(authors));
    }
    if let Some(limit) = limit {
        filter = filter.limit(limit);
    }
    Ok(filter)
}

/// Open subscriptions per connection.
type Subscriptions = Arc<Mutex<HashMap<ConnectionId, HashSet<String>>>>;

/// Relay that acknowledges every event and forwards it to every open
/// subscription without filtering.
fn firehose_relay(cfg: &Settings, subs: Subscriptions) -> Relay {
    let relay = Relay::new(RelayOptions::from(cfg));
    let verify_sig = cfg.verify_sig;

    relay.handle(MessageType::Event, {
        let subs = subs.clone();
        move |cx: Context, msg: Message| {
            let subs = subs.clone();
            async move {
                let Message::Event { event, .. } = msg else {
                    return;
                };
                if verify_sig {
                    if let Err(e) = event.verify() {
                        let _ = cx.reply(&Message::ok(event.id.clone(), false, format!("invalid: {e}")));
                        return;
                    }
                }
                let _ = cx.reply(&Message::ok(event.id.clone(), true, ""));
                let targets: Vec<(ConnectionId, Vec<String>)> = lock(&subs)
                    .iter()
                    .map(|(id, ids)| (*id, ids.iter().cloned().collect()))
                    .collect();
                for (id, sub_ids) in targets {
                    for sub_id in sub_ids {
                        let delivery = Message::event(sub_id, event.clone())
                            .and_then(|m| cx.send_to(id, &m));
                        if delivery.is_err() {
                            lock(&subs).remove(&id);
                            break;
                        }
                    }
                }
            }
        }
    });

    relay.handle(MessageType::Req, {
        let subs = subs.clone();
        move |cx: Context, msg: Message| {
            let subs = subs.clone();
            async move {
                let Message::Req {
                    subscription_id, ..
                } = msg
                else {
                    return;
                };
                let id = cx.connection_id();
                let first = {
                    let mut subs = lock(&subs);
                    let first = !subs.contains_key(&id);
                    subs.entry(id).or_default().insert(subscription_id.clone());
                    first
                };
                if first {
                    // Forget the connection's subscriptions once it closes.
                    let closed = cx.cancel_token().clone();
                    let subs = subs.clone();
                    tokio::spawn(async move {
                        closed.cancelled().await;
                        lock(&subs).remove(&id);
                    });
                }
                if let Ok(eose) = Message::eose(subscription_id) {
                    let _ = cx.reply(&eose);
                }
            }
        }
    });

    relay.handle(MessageType::Close, {
        let subs = subs.clone();
        move |cx: Context, msg: Message| {
            let subs = subs.clone();
            async move {
                if let Message::Close { subscription_id } = msg {
                    let id = cx.connection_id();
                    let mut subs = lock(&subs);
                    let emptied = subs.get_mut(&id).is_some_and(|ids| {
                        ids.remove(&subscription_id);
                        ids.is_empty()
                    });
                    if emptied {
                        subs.remove(&id);
                    }
                }
            }
        }
    });

    relay.handle(MessageType::Count, |cx: Context, msg: Message| async move {
        if let Message::Count {
            subscription_id, ..
        } = msg
        {
            if let Ok(res) = Message::count_result(subscription_id, 0) {
                let _ = cx.reply(&res);
            }
        }
    });

    relay.handle(MessageType::Auth, |_cx: Context, _msg: Message| async {});

    relay.handle_error(|e| warn!(error = %e, "client connection failed"));
    relay
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Connect a client to `relay` whose messages are forwarded to the returned
/// channel.
async fn connect_forwarding(
    cfg: &Settings,
    relay: &str,
) -> anyhow::Result<(Client, mpsc::UnboundedReceiver<Message>, CancellationToken)> {
    let client = Client::new(ClientOptions::from(cfg));
    let (tx, rx) = mpsc::unbounded_channel();
    client.on_message(move |_cx: Context, msg: Message| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
        }
    });
    client.on_error(|e| warn!(error = %e, "relay connection failed"));
    client
        .connect(relay)
        .await
        .with_context(|| format!("connecting to {relay}"))?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let client = client.clone();
        let cancel = cancel.clone();
        async move { client.listen(cancel).await }
    });
    Ok((client, rx, cancel))
}

async fn publish(
    cfg: &Settings,
    relay: &str,
    ev: Event,
    timeout: u64,
) -> anyhow::Result<(bool, String)> {
    let (client, mut rx, cancel) = connect_forwarding(cfg, relay).await?;
    let id = ev.id.clone();
    client.publish(&Message::publish(ev))?;
    info!(%id, relay, "event sent");
    let answer = tokio::time::timeout(Duration::from_secs(timeout), async {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Ok {
                    event_id,
                    accepted,
                    message,
                } if event_id == id => return Some((accepted, message)),
                Message::Notice { message } => warn!(%message, "relay notice"),
                _ => {}
            }
        }
        None
    })
    .await;
    cancel.cancel();
    client.close();
    match answer {
        Ok(Some(answer)) => Ok(answer),
        Ok(None) => bail!("{relay} closed the connection before answering"),
        Err(_) => bail!("no answer from {relay} within {timeout}s"),
    }
}

async fn request(
    cfg: &Settings,
    relay: &str,
    filter: Filter,
    timeout: u64,
) -> anyhow::Result<Vec<Event>> {
    let (client, mut rx, cancel) = connect_forwarding(cfg, relay).await?;
    let sub_id = subscription::generate();
    client.publish(&Message::req(sub_id.clone(), vec![filter])?)?;
    let mut events = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(timeout), async {
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Event {
                    subscription_id: Some(sub),
                    event,
                } if sub == sub_id => events.push((*event).clone()),
                Message::Eose { subscription_id } if subscription_id == sub_id => return true,
                Message::Notice { message } => warn!(%message, "relay notice"),
                _ => {}
            }
        }
        false
    })
    .await;
    let _ = client.publish(&Message::close(sub_id)?);
    cancel.cancel();
    client.close();
    match finished {
        Ok(true) => Ok(events),
        Ok(false) => bail!("{relay} closed the connection before EOSE"),
        Err(_) => bail!("no EOSE from {relay} within {timeout}s"),
    }
}

fn load_settings(path: &str) -> anyhow::Result<Settings> {
    ensure_env_file(path)?;
    Settings::from_env(path)
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let content = concat!(
        "BIND_WS=127.0.0.1:7778\n",
        "RELAY_NAME=nostrwire\n",
        "RELAY_DESCRIPTION=\n",
        "RELAY_PUBKEY=\n",
        "RELAY_CONTACT=\n",
        "NIP05_NAMES=\n",
        "VERIFY_SIG=1\n",
        "MAX_HANDLERS=64\n",
        "MAX_MESSAGE_LENGTH=64000000\n",
        "TOR_SOCKS=\n",
    );
    fs::write(env_path, content)?;
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};
    use tokio_tungstenite::tungstenite::Message as TMsg;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 10] = [
        "BIND_WS",
        "RELAY_NAME",
        "RELAY_DESCRIPTION",
        "RELAY_PUBKEY",
        "RELAY_CONTACT",
        "NIP05_NAMES",
        "VERIFY_SIG",
        "MAX_HANDLERS",
        "MAX_MESSAGE_LENGTH",
        "TOR_SOCKS",
    ];

    fn clear_env() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    fn key() -> String {
        format!("{:0>64}", "7")
    }

    async fn free_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn next_text<S>(ws: &mut S) -> String
    where
        S: futures_util::Stream<
                Item = Result<TMsg, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let TMsg::Text(t) = msg {
                return t;
            }
        }
    }

    #[test]
    fn event_args_build_signed_events() {
        let args = EventArgs {
            key: key(),
            kind: 1,
            content: "hi".into(),
            tags: vec!["t,news".into(), "e,abc,,root".into()],
        };
        let ev = args.build().unwrap();
        ev.verify().unwrap();
        assert_eq!(ev.tags[0], Tag::hashtag("news"));
        assert_eq!(ev.tags[1].to_values().len(), 4);

        let bad = EventArgs {
            key: "nope".into(),
            kind: 1,
            content: String::new(),
            tags: vec![],
        };
        assert!(bad.build().is_err());
    }

    #[test]
    fn filter_from_flags() {
        let f = build_filter(Some("1, 30023"), Some("ab,cd"), Some(5)).unwrap();
        assert_eq!(f.kinds, Some(vec![1, 30023]));
        assert_eq!(f.authors, Some(vec!["ab".to_string(), "cd".to_string()]));
        assert_eq!(f.limit, Some(5));
        assert!(build_filter(Some("x"), None, None).is_err());
        assert_eq!(build_filter(None, None, None).unwrap(), Filter::new());
    }

    #[test]
    fn default_env_file_is_loadable() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("nested/.env");
        let cfg = load_settings(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.bind_ws, "127.0.0.1:7778");
        assert!(cfg.verify_sig);
        assert_eq!(cfg.relay_name.as_deref(), Some("nostrwire"));
    }

    fn test_settings() -> Settings {
        Settings {
            bind_ws: String::new(),
            relay_name: None,
            relay_description: None,
            relay_pubkey: None,
            relay_contact: None,
            nip05_names: Default::default(),
            verify_sig: true,
            max_handlers: 4,
            max_message_length: 1 << 20,
            tor_socks: None,
        }
    }

    async fn start_firehose(subs: Subscriptions) -> (Relay, SocketAddr, task::JoinHandle<()>) {
        let relay = firehose_relay(&test_settings(), subs);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = task::spawn({
            let relay = relay.clone();
            async move {
                relay
                    .serve_listener(listener, std::future::pending())
                    .await
                    .unwrap()
            }
        });
        (relay, addr, server)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn subscriptions_are_forgotten_on_close_and_disconnect() {
        let subs = Subscriptions::default();
        let (relay, addr, server) = start_firehose(subs.clone()).await;
        let url = format!("ws://{addr}/");

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        ws.send(TMsg::Text(r#"["AUTH","challenge"]"#.into()))
            .await
            .unwrap();
        ws.send(TMsg::Text(r#"["REQ","a",{}]"#.into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, r#"["EOSE","a"]"#);
        assert_eq!(lock(&subs).len(), 1);
        ws.send(TMsg::Text(r#"["CLOSE","a"]"#.into())).await.unwrap();
        wait_until(|| lock(&subs).is_empty()).await;

        ws.send(TMsg::Text(r#"["REQ","b",{}]"#.into())).await.unwrap();
        assert_eq!(next_text(&mut ws).await, r#"["EOSE","b"]"#);
        assert_eq!(lock(&subs).len(), 1);
        ws.close(None).await.unwrap();
        drop(ws);
        wait_until(|| lock(&subs).is_empty()).await;
        wait_until(|| relay.connections().is_empty()).await;

        relay.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn firehose_forwards_events_to_subscribers() {
        let (relay, addr, server) = start_firehose(Subscriptions::default()).await;

        let url = format!("ws://{addr}/");
        let (mut sub, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut publisher, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        sub.send(TMsg::Text(r#"["REQ","feed",{}]"#.into()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut sub).await, r#"["EOSE","feed"]"#);
        sub.send(TMsg::Text(r#"["COUNT","c",{}]"#.into()))
            .await
            .unwrap();
        assert_eq!(next_text(&mut sub).await, r#"["COUNT","c",{"count":0}]"#);

        let mut ev = Event::new(1, "firehose", vec![]);
        ev.sign(&key()).unwrap();
        publisher
            .send(TMsg::Text(Message::publish(ev.clone()).to_json().unwrap()))
            .await
            .unwrap();
        let ok = Message::from_json(&next_text(&mut publisher).await).unwrap();
        assert_eq!(ok, Message::ok(ev.id.clone(), true, ""));
        let delivered = Message::from_json(&next_text(&mut sub).await).unwrap();
        assert_eq!(delivered, Message::event("feed", ev.clone()).unwrap());

        let mut forged = ev.clone();
        forged.content = "tampered".into();
        publisher
            .send(TMsg::Text(Message::publish(forged).to_json().unwrap()))
            .await
            .unwrap();
        match Message::from_json(&next_text(&mut publisher).await).unwrap() {
            Message::Ok {
                accepted, message, ..
            } => {
                assert!(!accepted);
                assert!(message.starts_with("invalid:"));
            }
            other => panic!("unexpected {other:?}"),
        }

        relay.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn run_publish_and_req_against_served_relay() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = TempDir::new().unwrap();
        let addr = free_addr().await;
        let env_path = dir.path().join(".env");
        fs::write(&env_path, format!("BIND_WS={addr}\nVERIFY_SIG=1\n")).unwrap();
        let env = env_path.to_str().unwrap().to_string();

        let server = task::spawn(run(Cli {
            env: env.clone(),
            command: Commands::Serve,
        }));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let cfg = Settings::from_env(&env).unwrap();
        let relay_url = format!("ws://{addr}");
        let ev = EventArgs {
            key: key(),
            kind: 1,
            content: "via cli".into(),
            tags: vec![],
        }
        .build()
        .unwrap();
        let (accepted, _) = publish(&cfg, &relay_url, ev, 5).await.unwrap();
        assert!(accepted);

        let events = request(&cfg, &relay_url, Filter::new().limit(1), 5)
            .await
            .unwrap();
        assert!(events.is_empty());
        server.abort();
    }
}
