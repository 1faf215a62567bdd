//! Process assembly: builds every component from the configuration, starts
//! the long-running tasks and serves the OpAMP endpoint until shutdown.
//! There is no container magic here; each component takes exactly the
//! collaborators it needs.

use crate::agent::usecase::AgentUsecase;
use crate::command::dispatcher::CommandDispatcher;
use crate::command::reconciler::Reconciler;
use crate::config::{CommanderConfig, EventProtocol};
use crate::eventbus::handler::InboundEventHandler;
use crate::eventbus::in_memory::{DEFAULT_CHANNEL_CAPACITY, InMemoryEventBus};
use crate::eventbus::nats::NatsEventBus;
use crate::eventbus::{EventBusPublisher, EventBusReceiver, ReceiverCounters};
use crate::opamp::endpoint::{self, AppState};
use crate::opamp::registry::ConnectionRegistry;
use crate::server::identity::ServerIdentityService;
use crate::server::record::ServerId;
use crate::storage::in_memory::InMemoryStore;
use crate::storage::{AgentRepository, CommandRepository, ServerRepository, StorageError};
use crate::utils::retry::retry;
use crate::utils::time::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("persistence unreachable: {0}")]
    Persistence(String),

    #[error("event bus failure: {0}")]
    Bus(String),

    #[error("server failure: {0}")]
    Server(String),
}

impl RunError {
    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Persistence(_) => 2,
            Self::Bus(_) => 3,
            Self::Server(_) => 1,
        }
    }
}

/// Runs the server until a shutdown signal or a fatal component failure.
pub async fn run(config: CommanderConfig) -> Result<(), RunError> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStore::new());
    let agents: Arc<dyn AgentRepository> = store.clone();
    let commands: Arc<dyn CommandRepository> = store.clone();
    let servers: Arc<dyn ServerRepository> = store.clone();

    let registry = Arc::new(ConnectionRegistry::new());
    let server_id = ServerId::from(config.server_id.as_str());

    let identity = Arc::new(ServerIdentityService::new(
        server_id.clone(),
        config.heartbeat_period,
        servers,
        clock.clone(),
    ));
    let store_timeout = config.store_timeout;
    retry(3, Duration::from_millis(500), || {
        let identity = identity.clone();
        async move {
            tokio::time::timeout(store_timeout, identity.start())
                .await
                .map_err(|_| StorageError::Unavailable("store timeout exceeded".to_string()))?
        }
    })
    .await
    .map_err(|err| RunError::Persistence(err.to_string()))?;

    let counters = Arc::new(ReceiverCounters::default());
    let (publisher, receiver) = build_event_bus(&config, clock.clone(), counters.clone()).await?;

    let usecase = Arc::new(AgentUsecase::new(
        agents.clone(),
        commands.clone(),
        server_id.clone(),
        clock.clone(),
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        identity.clone(),
        registry.clone(),
        agents.clone(),
        commands.clone(),
        publisher,
    ));
    let handler = Arc::new(InboundEventHandler::new(
        server_id.clone(),
        registry.clone(),
        commands.clone(),
        clock.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        registry.clone(),
        agents.clone(),
        commands.clone(),
        clock.clone(),
        config.reconcile_period,
    ));

    let root = CancellationToken::new();

    let heartbeat_task = {
        let identity = identity.clone();
        let token = root.clone();
        tokio::spawn(async move { identity.run(token).await })
    };
    let reconciler_task = {
        let reconciler = reconciler.clone();
        let token = root.clone();
        tokio::spawn(async move { reconciler.run(token).await })
    };
    let receiver_task = {
        let token = root.clone();
        let handler = handler.clone() as Arc<dyn crate::eventbus::ServerMessageHandler>;
        tokio::spawn(async move {
            let result = receiver.run(token.clone(), handler).await;
            if let Err(err) = &result {
                // A dead receiver means cross-replica delivery is gone;
                // better to exit and let the supervisor restart us.
                error!(error_msg = %err, "event receiver failed, shutting down");
                token.cancel();
            }
            result
        })
    };

    spawn_signal_listener(root.clone());

    let state = Arc::new(AppState {
        registry: registry.clone(),
        processor: usecase,
        identity: identity.clone(),
        command_sink: dispatcher,
        session_config: config.session_config(),
        clock: clock.clone(),
        shutdown: root.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.listen_address)
        .await
        .map_err(|err| RunError::Server(format!("cannot bind {}: {err}", config.listen_address)))?;
    info!(
        listen_address = %config.listen_address,
        server_id = %server_id,
        "opampcommander listening"
    );

    axum::serve(listener, endpoint::router(state))
        .with_graceful_shutdown(root.clone().cancelled_owned())
        .await
        .map_err(|err| RunError::Server(err.to_string()))?;

    root.cancel();
    info!("shutting down");

    let drain = async {
        let _ = heartbeat_task.await;
        let _ = reconciler_task.await;
        receiver_task.await
    };
    match tokio::time::timeout(config.shutdown_grace, drain).await {
        Ok(Ok(Err(err))) => return Err(RunError::Bus(err.to_string())),
        Ok(_) => {}
        Err(_elapsed) => {
            warn!(
                grace_secs = config.shutdown_grace.as_secs(),
                "shutdown grace exceeded, abandoning outstanding tasks"
            );
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn build_event_bus(
    config: &CommanderConfig,
    clock: Arc<dyn Clock>,
    counters: Arc<ReceiverCounters>,
) -> Result<(Arc<dyn EventBusPublisher>, Box<dyn EventBusReceiver>), RunError> {
    match config.event_protocol {
        EventProtocol::InMemory => {
            let bus = InMemoryEventBus::new(DEFAULT_CHANNEL_CAPACITY, clock);
            let receiver = bus.subscribe(counters);
            Ok((Arc::new(bus), Box::new(receiver)))
        }
        EventProtocol::Nats => {
            let bus = NatsEventBus::connect(&config.nats.endpoint, &config.nats.subject_prefix, clock)
                .await
                .map_err(|err| RunError::Bus(err.to_string()))?;
            let receiver = bus.receiver(counters);
            Ok((Arc::new(bus), Box::new(receiver)))
        }
        #[cfg(feature = "kafka")]
        EventProtocol::Kafka => {
            let bus = crate::eventbus::kafka::KafkaEventBus::new(
                &config.kafka.brokers,
                &config.kafka.topic,
                config.send_timeout,
                clock,
            )
            .map_err(|err| RunError::Bus(err.to_string()))?;
            let receiver = crate::eventbus::kafka::KafkaEventBusReceiver::new(
                &config.kafka.brokers,
                &config.kafka.topic,
                counters,
            )
            .map_err(|err| RunError::Bus(err.to_string()))?;
            Ok((Arc::new(bus), Box::new(receiver)))
        }
        #[cfg(not(feature = "kafka"))]
        EventProtocol::Kafka => Err(RunError::Config(
            "event_protocol is kafka but this build has no kafka support".to_string(),
        )),
    }
}

fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error_msg = %err, "cannot listen for SIGINT");
                std::future::pending::<()>().await;
            }
        };
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(err) => {
                    warn!(error_msg = %err, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
        info!("shutdown signal received");
        token.cancel();
    });
}
