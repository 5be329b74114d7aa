use std::time::Duration;

use popsub_session::broker::{self, Broker};
use popsub_session::config::{Settings, load_config};
use popsub_session::utils::logging;
use popsub_session::{Credentials, Session, SessionOptions, TopicType};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

const TOPIC: &str = "random/Double";

/// `popsub-session` publishes a random double every 300ms until interrupted.
/// `popsub-session broker` serves the in-memory broker instead.
#[tokio::main]
async fn main() {
    logging::init("info");

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let result = match std::env::args().nth(1).as_deref() {
        Some("broker") => run_broker(&settings).await,
        _ => run_publisher(&settings).await,
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_broker(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", settings.broker.host, settings.broker.port);
    let listener = TcpListener::bind(&addr).await?;
    let broker = Broker::new()
        .with_retention(Duration::from_secs(settings.broker.session_retention_secs))
        .with_user(&settings.session.principal, &settings.session.password);
    broker::websocket::serve(listener, broker::shared(broker)).await;
    Ok(())
}

async fn run_publisher(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let credentials = Credentials::new(
        settings.session.principal.as_str(),
        settings.session.password.as_str(),
    );
    let session = Session::connect(
        &settings.session.url,
        credentials,
        SessionOptions::from(settings),
    )
    .await?;
    info!("Connected as session {}", session.id());

    let mut events = session.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!("Session event: {event:?}");
        }
    });

    session.add_topic(TOPIC, TopicType::Double).await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(300));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let value = pseudo_random();
                if let Err(e) = session.update(TOPIC, value).await {
                    warn!("Update failed: {e}");
                    if session.is_closed() {
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if !session.is_closed() {
        session.remove_topic(TOPIC).await?;
    }
    session.close().await;
    Ok(())
}

/// A value in `[0, 1)` derived from the current time.
fn pseudo_random() -> f64 {
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    f64::from(nanos % 1_000_000) / 1_000_000.0
}
