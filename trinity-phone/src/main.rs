// Trinity phone: session controller, watch link, console standing in for the app UI.

mod config;
mod transport;

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval};

use trinity_core::{AppState, Envelope, Payload, PhoneAction, RequestId, SessionController};

use transport::LinkEvent;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("trinity-phone {}", VERSION);
            return Ok(());
        }
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = config::load();
    log::info!("config: {:?}", cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

/// Host-side resources driven by `PhoneAction`s.
struct Host {
    link: Option<mpsc::UnboundedSender<Envelope>>,
    /// Requests written to the current link and not yet answered.
    in_flight: HashSet<RequestId>,
    sync_timer: Option<Interval>,
    background_fetch: Option<Interval>,
    fetch_count: u64,
}

impl Host {
    fn new() -> Self {
        Self {
            link: None,
            in_flight: HashSet::new(),
            sync_timer: None,
            background_fetch: None,
            fetch_count: 0,
        }
    }

    /// Perform actions, feeding transport failures back into the controller.
    fn dispatch(&mut self, controller: &mut SessionController, actions: Vec<PhoneAction>) {
        let mut queue: VecDeque<PhoneAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                PhoneAction::Send { id, command } => {
                    let env = Envelope::Request {
                        id,
                        payload: Payload::command(command),
                    };
                    let sent = self.link.as_ref().map(|tx| tx.send(env).is_ok()).unwrap_or(false);
                    if sent {
                        self.in_flight.insert(id);
                    } else {
                        queue.extend(controller.on_send_error(id, "watch not reachable"));
                    }
                }
                PhoneAction::Alert(e) => {
                    log::error!("{}", e);
                    println!("! {}", e);
                }
                PhoneAction::SessionFinished(Some(stats)) => {
                    match serde_json::to_string(&stats) {
                        Ok(json) => log::info!("session statistics: {}", json),
                        Err(e) => log::warn!("statistics not serializable: {}", e),
                    }
                    println!(
                        "session: {}s, {} measurements, avg {} bpm (min {}, max {}), {} steps, {:.1} kcal",
                        stats.duration,
                        stats.total_measurements,
                        stats.avg_heart_rate,
                        stats.min_heart_rate,
                        stats.max_heart_rate,
                        stats.total_steps,
                        stats.total_calories
                    );
                }
                PhoneAction::SessionFinished(None) => {
                    log::info!("session finished without samples");
                }
                PhoneAction::StartSyncTimer(period) => {
                    self.sync_timer = Some(tokio::time::interval_at(Instant::now() + period, period));
                }
                PhoneAction::StopSyncTimer => self.sync_timer = None,
                PhoneAction::RegisterBackgroundFetch(period) => {
                    log::info!("background fetch registered every {:?}", period);
                    self.background_fetch =
                        Some(tokio::time::interval_at(Instant::now() + period, period));
                }
                PhoneAction::UnregisterBackgroundFetch => self.background_fetch = None,
                PhoneAction::FinishBackgroundFetch(task_id) => {
                    log::debug!("background fetch {} complete", task_id);
                }
            }
        }
    }

    /// Link dropped: nothing in flight will be answered.
    fn link_lost(&mut self, controller: &mut SessionController) -> Vec<PhoneAction> {
        self.link = None;
        let mut actions = Vec::new();
        for id in self.in_flight.drain() {
            actions.extend(controller.on_send_error(id, "connection lost"));
        }
        actions
    }

    fn next_task_id(&mut self) -> String {
        self.fetch_count += 1;
        format!("fetch-{}", self.fetch_count)
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Single owner of the session controller; the link and console only send events in.
async fn run(cfg: config::Config) -> anyhow::Result<()> {
    let (link_tx, mut link_rx) = mpsc::unbounded_channel();
    tokio::spawn(transport::run_connector(
        cfg.watch_addr.clone(),
        cfg.reconnect_interval(),
        link_tx,
    ));

    let mut controller = SessionController::new(cfg.controller_config());
    let mut host = Host::new();
    let mut console = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    println!("commands: start | stop | bg | fg | status");

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
                LinkEvent::Connected(tx) => {
                    host.link = Some(tx);
                    controller.on_reachability(true);
                    vec![]
                }
                LinkEvent::Disconnected => {
                    controller.on_reachability(false);
                    host.link_lost(&mut controller)
                }
                LinkEvent::Received(env) => {
                    if let Envelope::Reply { id, .. } = &env {
                        host.in_flight.remove(id);
                    }
                    controller.on_envelope(env, now_ms())
                }
            },
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) => console_command(&mut controller, line.trim()),
                _ => {
                    console_open = false;
                    vec![]
                }
            },
            _ = tick(&mut host.sync_timer) => controller.on_sync_timer(now_ms()),
            _ = tick(&mut host.background_fetch) => {
                let task_id = host.next_task_id();
                controller.on_background_fetch(task_id, now_ms())
            }
            _ = housekeeping.tick() => controller.tick(now_ms()),
        };
        host.dispatch(&mut controller, actions);
    }

    let actions = controller.shutdown();
    host.dispatch(&mut controller, actions);
    Ok(())
}

fn console_command(controller: &mut SessionController, line: &str) -> Vec<PhoneAction> {
    let now = now_ms();
    let result = match line {
        "start" => controller.start_monitoring(now),
        "stop" => controller.stop_monitoring(now),
        "bg" => Ok(controller.on_app_state(AppState::Background, now)),
        "fg" => Ok(controller.on_app_state(AppState::Foreground, now)),
        "status" => {
            print_status(controller, now);
            Ok(vec![])
        }
        "" => Ok(vec![]),
        other => {
            println!("unknown command {:?}", other);
            Ok(vec![])
        }
    };
    result.unwrap_or_else(|e| vec![PhoneAction::Alert(e)])
}

fn print_status(controller: &SessionController, now: u64) {
    println!(
        "watch {:?}, session {:?}{}, app {:?}",
        controller.connection(),
        controller.session_state(),
        if controller.is_loading() { " (waiting)" } else { "" },
        controller.app_state()
    );
    if controller.is_monitoring() {
        let hr = controller
            .heart_rate()
            .map(|h| format!("{:.0} bpm", h))
            .unwrap_or_else(|| "-- bpm".to_string());
        println!(
            "  {}s elapsed, {}, {} steps, {:.1} kcal",
            controller.elapsed_seconds(now),
            hr,
            controller.steps(),
            controller.calories()
        );
        for s in controller.recent().iter() {
            let at = chrono::DateTime::from_timestamp_millis(s.timestamp as i64)
                .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
                .unwrap_or_default();
            println!("  {} {:.0} bpm", at, s.heart_rate);
        }
    } else if let Some(stats) = controller.statistics() {
        println!(
            "  last session: {}s, {} measurements, avg {} bpm",
            stats.duration, stats.total_measurements, stats.avg_heart_rate
        );
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
