use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use telelink::config::AppConfig;
use telelink::console::{self, ConsoleCommand};
use telelink::mqtt::{SessionHandle, SessionStatus};
use telelink::persistence::{ConnectionStore, PersistedConnection};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path).await?;

    let store = ConnectionStore::default_location();
    if let Some(saved) = store.load_or_warn().await {
        info!("Using saved broker {}:{}", saved.host, saved.port);
        saved.apply_to(&mut config.mqtt);
    }

    info!(
        "Updates on {}, commands on {}",
        config.mqtt.update_topic(),
        config.mqtt.command_topic()
    );

    let (session, session_task) = SessionHandle::spawn(config.mqtt.clone());
    let printer = tokio::spawn(print_inbound(session.inbound()));

    session
        .connect_configured()
        .await
        .map_err(|e| eyre!("Failed to start session: {}", e))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };

        match console::parse_line(&line) {
            Ok(Some(ConsoleCommand::Quit)) => break,
            Ok(Some(command)) => {
                if let Err(e) = run_command(&session, &store, command).await {
                    error!("{}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("{} (type `help`)", e),
        }
    }

    if let Err(e) = session.unsubscribe_all().await {
        warn!("Could not unsubscribe on exit: {}", e);
    }
    session.shutdown();
    session_task
        .await
        .map_err(|e| eyre!("Session task failed: {}", e))?;
    printer.abort();
    Ok(())
}

async fn run_command(
    session: &SessionHandle,
    store: &ConnectionStore,
    command: ConsoleCommand,
) -> Result<()> {
    match command {
        ConsoleCommand::Connect { host, port } => {
            let host = host.unwrap_or_else(|| session.config().host.clone());
            let port = port.unwrap_or(session.config().port);
            session.connect(host.clone(), port).await?;
            store.save(&PersistedConnection { host, port }).await?;
        }
        ConsoleCommand::Disconnect => session.disconnect().await?,
        ConsoleCommand::Subscribe(topic) => session.subscribe(topic).await?,
        ConsoleCommand::Unsubscribe(topic) => session.unsubscribe(topic).await?,
        ConsoleCommand::UnsubscribeAll => session.unsubscribe_all().await?,
        ConsoleCommand::Publish { topic, body } => session.publish(topic, body).await?,
        ConsoleCommand::Toggle(device) => session.toggle(device).await?,
        ConsoleCommand::Status => print_status(&session.status().borrow()),
        ConsoleCommand::Help => println!("{}", console::HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

fn print_status(status: &SessionStatus) {
    println!("state:    {:?}", status.connection_state);
    if let Some((host, port)) = &status.broker {
        println!("broker:   {}:{}", host, port);
    }
    if let Some(client_id) = &status.client_id {
        println!("client:   {}", client_id);
    }
    println!(
        "messages: {} in / {} out",
        status.messages_received, status.messages_sent
    );
    for (topic, state) in &status.topics {
        println!("topic:    {} ({:?})", topic, state);
    }
    if let Some(failure) = status.last_failure() {
        println!("last failure: {}", failure);
    }
}

async fn print_inbound(mut inbound: watch::Receiver<telelink::mqtt::InboundRecord>) {
    while inbound.changed().await.is_ok() {
        let record = inbound.borrow_and_update().clone();
        match record.telemetry() {
            Some(t) => println!(
                "[{}] number={} ledA={} ledB={}",
                record.topic, t.number, t.led_a, t.led_b
            ),
            None => println!("{}", record),
        }
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
