use color_eyre::{eyre::eyre, Result};
use mqtt_session::config::AppConfig;
use mqtt_session::mqtt::{MessageHandler, MqttHandler, RumqttTransport};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(AppConfig::default_path);
    info!("Loading configuration from {}", path.display());
    let config = AppConfig::load(&path)
        .await
        .map_err(|e| eyre!("Failed to load configuration: {}", e))?;

    let params = config
        .connection
        .to_params()
        .await
        .map_err(|e| eyre!("Failed to prepare connection parameters: {}", e))?;
    let transport = RumqttTransport::new(&params, &config.session)
        .map_err(|e| eyre!("Failed to set up MQTT client: {}", e))?;

    let (session, mut notifications) = MqttHandler::new(config.session.clone());
    session.init(params, transport)?;
    session.connect()?;

    let logger = MessageHandler::new(|message| info!("{}", message));
    for topic in &config.topics {
        if let Err(e) = session.subscribe(&topic.topic, logger.clone(), topic.qos) {
            warn!("Could not subscribe to {}: {}", topic.topic, e);
        }
    }
    info!("{} subscriptions registered", session.subscription_count());

    let mut status = session.status();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            notification = notifications.recv() => match notification {
                Some(notification) => info!("Notification: {:?}", notification),
                None => break,
            },
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                info!(
                    "Connection state: {:?} (received: {}, published: {})",
                    current.connection_state, current.messages_received, current.messages_published
                );
            }
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    session.deinit();
    Ok(())
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
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
