use clap::{App, Arg};
use hvbusd::bridge::{Bridge, RequestOrigin, RequestQueue, TransactionResult};
use hvbusd::codec;
use hvbusd::config::{DaemonConfig, DEFAULT_QUEUE_CAPACITY};
use hvbusd::cyclic::{CyclicCache, PollScheduler};
use hvbusd::dump::DumpFile;
use hvbusd::engine::BusEngine;
use hvbusd::error::BusError;
use hvbusd::frame::Payload;
use hvbusd::loader;
use hvbusd::registry::{CommandRegistry, Direction, ReplyValues, Value};
use hvbusd::transport::{SerialTransport, TcpTransport, Transport};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{error, info, warn};

/// Upper bound on the poll loop's sleep, so new completions and due
/// entries are observed promptly even with long intervals.
const POLL_TICK_MS: u64 = 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("hvbusd")
        .version("0.1.0")
        .about("Heating bus daemon: bridges a multi-master serial bus to TCP clients")
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .value_name("HEX")
                .help("Own master address on the bus")
                .takes_value(true)
                .default_value("ff")
                .validator(|v| {
                    u8::from_str_radix(v.trim_start_matches("0x"), 16)
                        .map(|_| ())
                        .map_err(|_| "address must be a hex byte".into())
                }),
        )
        .arg(
            Arg::with_name("device")
                .short("d")
                .long("device")
                .value_name("DEVICE")
                .help("Serial device path, or host:port for a TCP-tunneled device")
                .takes_value(true)
                .default_value("/dev/ttyUSB0"),
        )
        .arg(
            Arg::with_name("configdir")
                .short("c")
                .long("configdir")
                .value_name("DIR")
                .help("Directory with CSV command definitions")
                .takes_value(true)
                .default_value("conf"),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("TCP listen port for client sessions")
                .takes_value(true)
                .default_value("8888")
                .validator(|v| {
                    v.parse::<u16>()
                        .map(|_| ())
                        .map_err(|_| "port must be a number".into())
                }),
        )
        .arg(
            Arg::with_name("localhost")
                .long("localhost")
                .help("Accept client connections from localhost only"),
        )
        .arg(
            Arg::with_name("dumpfile")
                .short("D")
                .long("dumpfile")
                .value_name("FILE")
                .help("Capture raw bus bytes into a rotating dump file")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("dumpsize")
                .long("dumpsize")
                .value_name("KB")
                .help("Dump file rotation threshold in kilobytes")
                .takes_value(true)
                .default_value("100")
                .validator(|v| {
                    v.parse::<u64>()
                        .map(|_| ())
                        .map_err(|_| "dump size must be a number".into())
                }),
        )
        .arg(
            Arg::with_name("loglevel")
                .short("l")
                .long("loglevel")
                .value_name("LEVEL")
                .help("Log level")
                .takes_value(true)
                .possible_values(&["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .get_matches();

    let level: tracing::Level = matches
        .value_of("loglevel")
        .unwrap_or("info")
        .parse()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = DaemonConfig {
        address: matches
            .value_of("address")
            .map(|v| u8::from_str_radix(v.trim_start_matches("0x"), 16).unwrap_or(0xFF))
            .unwrap_or(0xFF),
        device: matches.value_of("device").unwrap_or_default().to_string(),
        config_dir: matches.value_of("configdir").unwrap_or_default().to_string(),
        port: matches
            .value_of("port")
            .and_then(|v| v.parse().ok())
            .unwrap_or(8888),
        localhost_only: matches.is_present("localhost"),
        timings: Default::default(),
        queue_capacity: DEFAULT_QUEUE_CAPACITY,
        dump_file: matches.value_of("dumpfile").map(str::to_string),
        dump_size_kb: matches
            .value_of("dumpsize")
            .and_then(|v| v.parse().ok())
            .unwrap_or(100),
    };

    info!(
        address = %format!("0x{:02X}", config.address),
        device = %config.device,
        port = config.port,
        "hvbusd starting"
    );

    let registry = Arc::new(loader::load_dir(&config.config_dir)?);

    let transport: Box<dyn Transport> = if config.device.contains(':') {
        Box::new(TcpTransport::connect(&config.device)?)
    } else {
        Box::new(SerialTransport::open(&config.device)?)
    };

    let mut engine = BusEngine::new(transport, config.timings);
    if let Some(path) = &config.dump_file {
        engine = engine.with_dump(DumpFile::create(path, config.dump_size_kb)?);
        info!(file = %path, size_kb = config.dump_size_kb, "bus dump enabled");
    }

    let queue = RequestQueue::new(config.queue_capacity);
    let bridge = Bridge::new(engine, Arc::clone(&queue), config.address, config.timings);
    let dispatch = bridge.spawn()?;

    let (scheduler, cache) = PollScheduler::new(registry.cyclic_entries(), now_ms());

    let poll_task = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { poll_loop(scheduler, queue).await })
    };

    let server_task = {
        let registry = Arc::clone(&registry);
        let cache = Arc::clone(&cache);
        let queue = Arc::clone(&queue);
        let host = if config.localhost_only {
            "127.0.0.1"
        } else {
            "0.0.0.0"
        };
        let addr = format!("{}:{}", host, config.port);
        tokio::spawn(async move {
            if let Err(e) = serve_clients(&addr, registry, cache, queue).await {
                error!("client listener error: {}", e);
            }
        })
    };

    // The dispatch loop only returns on shutdown or a device fault; a
    // fault must end the process so the supervisor can restart it.
    let mut dispatch_done = tokio::task::spawn_blocking(move || dispatch.join());
    let faulted = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            false
        }
        _ = &mut dispatch_done => {
            error!("bus dispatch loop terminated, shutting down");
            true
        }
    };

    server_task.abort();
    poll_task.abort();
    queue.close();
    if !faulted && dispatch_done.await.map(|r| r.is_err()).unwrap_or(true) {
        error!("dispatch thread panicked during shutdown");
    }
    info!("hvbusd stopped");
    if faulted {
        std::process::exit(1);
    }
    Ok(())
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Drives the poll schedule: enqueues due commands at poll priority and
/// feeds completions back without ever blocking on a transaction.
async fn poll_loop(mut scheduler: PollScheduler, queue: Arc<RequestQueue>) {
    let (completions_tx, mut completions_rx) =
        mpsc::channel::<(String, TransactionResult)>(64);

    loop {
        let now = now_ms();
        for def in scheduler.tick(now) {
            match queue.enqueue(RequestOrigin::Poll, Arc::clone(&def), Payload::new()) {
                Ok(rx) => {
                    let tx = completions_tx.clone();
                    let name = def.name.clone();
                    tokio::spawn(async move {
                        let result = rx.await.unwrap_or(Err(BusError::EngineDown));
                        let _ = tx.send((name, result)).await;
                    });
                }
                Err(err) => {
                    warn!(command = %def.name, error = %err, "poll submission rejected");
                    scheduler.complete(&def.name, Err(err), now);
                }
            }
        }

        let sleep_ms = scheduler
            .next_due_ms()
            .map_or(POLL_TICK_MS, |due| {
                due.saturating_sub(now_ms()).min(POLL_TICK_MS)
            })
            .max(10);

        tokio::select! {
            completion = completions_rx.recv() => {
                if let Some((name, result)) = completion {
                    scheduler.complete(&name, result, now_ms());
                }
            }
            _ = time::sleep(Duration::from_millis(sleep_ms)) => {}
        }
    }
}

async fn serve_clients(
    addr: &str,
    registry: Arc<CommandRegistry>,
    cache: Arc<CyclicCache>,
    queue: Arc<RequestQueue>,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "client listener ready");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(peer = %peer, "client connected");
                let registry = Arc::clone(&registry);
                let cache = Arc::clone(&cache);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    if let Err(e) = handle_session(stream, registry, cache, queue).await {
                        warn!(peer = %peer, "session error: {}", e);
                    }
                    info!(peer = %peer, "client disconnected");
                });
            }
            Err(e) => error!("accept failed: {}", e),
        }
    }
}

/// One client session: newline-delimited requests, one reply line each,
/// strictly in request order.
async fn handle_session(
    stream: TcpStream,
    registry: Arc<CommandRegistry>,
    cache: Arc<CyclicCache>,
    queue: Arc<RequestQueue>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (reply, quit) = respond(line, &registry, &cache, &queue).await;
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        if quit {
            break;
        }
    }
    Ok(())
}

async fn respond(
    line: &str,
    registry: &CommandRegistry,
    cache: &CyclicCache,
    queue: &Arc<RequestQueue>,
) -> (String, bool) {
    let mut tokens = line.split_whitespace();
    let verb = tokens.next().unwrap_or_default();
    let args: Vec<&str> = tokens.collect();

    let reply = match verb {
        "get" => run_command(registry, queue, &args, Direction::Read).await,
        "set" => run_command(registry, queue, &args, Direction::Write).await,
        "cyc" => cyc_reply(registry, cache, &args),
        "defs" => {
            let mut names: Vec<&str> = registry.iter().map(|d| d.name.as_str()).collect();
            names.sort_unstable();
            format!("ok {}", names.join(" "))
        }
        "quit" => return ("ok bye".to_string(), true),
        _ => "err unknown request".to_string(),
    };
    (reply, false)
}

/// Executes a `get` or `set` over the bus at client priority.
async fn run_command(
    registry: &CommandRegistry,
    queue: &Arc<RequestQueue>,
    args: &[&str],
    wanted: Direction,
) -> String {
    let Some((name, params)) = args.split_first() else {
        return "err missing command name".to_string();
    };
    let Some(def) = registry.lookup(name) else {
        return format!("err {}", BusError::UnknownCommand((*name).to_string()));
    };
    let allowed = match wanted {
        Direction::Read => def.direction == Direction::Read,
        // `set` covers writes and broadcasts
        _ => def.direction != Direction::Read,
    };
    if !allowed {
        return format!("err direction mismatch for '{}'", def.name);
    }

    let payload = match codec::encode_args(&def.params, params) {
        Ok(payload) => payload,
        Err(err) => return format!("err {}", err),
    };

    match queue.enqueue(RequestOrigin::Client, def, payload) {
        Ok(rx) => match rx.await {
            Ok(Ok(values)) => format_values(&values),
            Ok(Err(err)) => format!("err {}", err),
            Err(_) => format!("err {}", BusError::EngineDown),
        },
        Err(err) => format!("err {}", err),
    }
}

/// Serves a cached cyclic value without touching the bus. Without a
/// command name, dumps the whole cache as one JSON object.
fn cyc_reply(registry: &CommandRegistry, cache: &CyclicCache, args: &[&str]) -> String {
    let Some(name) = args.first() else {
        return cyc_snapshot(cache);
    };
    let Some(entry) = cache.get(name) else {
        return if registry.lookup(name).is_some() {
            format!("err '{}' is not polled", name)
        } else {
            format!("err {}", BusError::UnknownCommand((*name).to_string()))
        };
    };

    match &entry.values {
        Some(values) => {
            let mut reply = format_values(values);
            if let Some(updated) = entry.updated_ms {
                reply.push_str(&format!(" age={}ms", now_ms().saturating_sub(updated)));
            }
            if let Some(err) = &entry.last_error {
                reply.push_str(&format!(" stale={}", err));
            }
            reply
        }
        None => match &entry.last_error {
            Some(err) => format!("err no data: {}", err),
            None => "err no data yet".to_string(),
        },
    }
}

fn cyc_snapshot(cache: &CyclicCache) -> String {
    let mut commands = serde_json::Map::new();
    for (name, entry) in cache.snapshot() {
        let mut state = serde_json::Map::new();
        if let Some(values) = &entry.values {
            let fields: serde_json::Map<String, serde_json::Value> = values
                .iter()
                .map(|(field, value)| {
                    let json = match value {
                        Value::Number(n) => serde_json::json!(n),
                        Value::Text(s) => serde_json::json!(s),
                    };
                    (field.clone(), json)
                })
                .collect();
            state.insert("values".to_string(), serde_json::Value::Object(fields));
        }
        if let Some(updated) = entry.updated_ms {
            state.insert("updated_ms".to_string(), serde_json::json!(updated));
        }
        if let Some(err) = &entry.last_error {
            state.insert("error".to_string(), serde_json::json!(err.to_string()));
        }
        commands.insert(name, serde_json::Value::Object(state));
    }
    format!("ok {}", serde_json::Value::Object(commands))
}

fn format_values(values: &ReplyValues) -> String {
    if values.is_empty() {
        return "ok".to_string();
    }
    let fields: Vec<String> = values
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect();
    format!("ok {}", fields.join(" "))
}
