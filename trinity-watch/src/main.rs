// Trinity watch: command handler, simulated sensor store, phone link.

mod config;
mod sensor_store;
mod transport;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use trinity_core::{CommandHandler, Envelope, WatchAction};

use sensor_store::{SensorStore, StoreEvent};
use transport::{ConnId, LinkEvent};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("trinity-watch {}", VERSION);
            return Ok(());
        }
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = config::load();
    log::info!("config: {:?}", cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

/// Currently connected phone.
struct Phone {
    conn: ConnId,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Single owner of the command handler; every other task only sends events in.
async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let listener = transport::bind(cfg.listen_port).await?;
    log::info!("listening for phone on port {}", cfg.listen_port);

    let (link_tx, mut link_rx) = mpsc::unbounded_channel();
    let (store_tx, mut store_rx) = mpsc::unbounded_channel();
    tokio::spawn(transport::run_listener(listener, link_tx));

    let mut store = SensorStore::new(store_tx, cfg.sample_interval(), cfg.authorization);
    let mut handler = CommandHandler::new();
    let mut phone: Option<Phone> = None;
    let mut console = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        let actions = tokio::select! {
            res = &mut shutdown => {
                res?;
                log::info!("shutting down");
                break;
            }
            Some(ev) = link_rx.recv() => match ev {
                LinkEvent::Connected(conn, tx) => {
                    phone = Some(Phone { conn, tx });
                    handler.on_reachability(true);
                    vec![]
                }
                LinkEvent::Disconnected(conn) => {
                    if is_current(phone.as_ref(), conn) {
                        phone = None;
                        handler.on_reachability(false);
                    }
                    vec![]
                }
                LinkEvent::Received(conn, env) => {
                    if is_current(phone.as_ref(), conn) {
                        handler.on_envelope(env, cfg.authorization.access(), now_ms())
                    } else {
                        log::debug!("frame from replaced phone link {}; dropped", conn);
                        vec![]
                    }
                }
            },
            Some(ev) = store_rx.recv() => match ev {
                StoreEvent::Authorization(granted) => handler.on_authorization(granted),
                StoreEvent::Reading(query, reading) => {
                    if store.is_current(query, reading.metric()) {
                        handler.on_reading(reading, now_ms())
                    } else {
                        log::debug!("reading from closed query {}; dropped", query);
                        vec![]
                    }
                }
                StoreEvent::QueryFailed(metric, reason) => handler.on_query_failed(metric, &reason),
            },
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "start" => handler.start_local(cfg.authorization.access()),
                    "stop" => handler.stop_local(),
                    "" => vec![],
                    other => {
                        println!("unknown command {:?}; use start | stop", other);
                        vec![]
                    }
                },
                _ => {
                    console_open = false;
                    vec![]
                }
            },
        };
        dispatch(actions, &mut store, phone.as_ref());
    }

    let actions = handler.stop_local();
    dispatch(actions, &mut store, phone.as_ref());
    store.shutdown();
    Ok(())
}

/// Only the latest phone connection is served.
fn is_current(phone: Option<&Phone>, conn: ConnId) -> bool {
    phone.map(|p| p.conn) == Some(conn)
}

fn dispatch(actions: Vec<WatchAction>, store: &mut SensorStore, phone: Option<&Phone>) {
    for action in actions {
        match action {
            WatchAction::Sensor(a) => store.perform(a),
            WatchAction::Reply(id, payload) => send(phone, Envelope::Reply { id, payload }),
            WatchAction::Push(payload) => send(phone, Envelope::Push { payload }),
        }
    }
}

fn send(phone: Option<&Phone>, env: Envelope) {
    let delivered = match phone {
        Some(p) => p.tx.send(env).is_ok(),
        None => false,
    };
    if !delivered {
        log::debug!("phone link gone; message dropped");
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
