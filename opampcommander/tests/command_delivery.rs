//! End-to-end command delivery scenarios: several replicas wired to one
//! in-memory bus and one shared store, with agent connections simulated at
//! the session-handle level (the mailbox receiver plays the agent's socket).

use chrono::Utc;
use opampcommander::agent::config::yaml_config;
use opampcommander::agent::usecase::{AgentUsecase, ReportProcessor};
use opampcommander::command::dispatcher::{CommandDispatcher, CommandSink, DispatchOutcome};
use opampcommander::command::reconciler::Reconciler;
use opampcommander::command::{Command, CommandId, CommandPayload, CommandState};
use opampcommander::eventbus::envelope::{self, EVENT_TYPE_SEND_SERVER_TO_AGENT};
use opampcommander::eventbus::handler::InboundEventHandler;
use opampcommander::eventbus::in_memory::InMemoryEventBus;
use opampcommander::eventbus::{
    ReceiverCounters, ServerMessage, ServerMessageHandler, ServerMessagePayload,
    EventBusPublisher, EventBusReceiver,
};
use opampcommander::opamp::instance_uid::InstanceUid;
use opampcommander::opamp::registry::ConnectionRegistry;
use opampcommander::opamp::session::{CloseReason, SessionHandle};
use opampcommander::server::identity::ServerIdentityService;
use opampcommander::server::record::ServerId;
use opampcommander::storage::in_memory::InMemoryStore;
use opampcommander::storage::CommandRepository;
use opampcommander::utils::time::{Clock, SystemClock};
use opamp_proto::proto::{
    AgentConfigFile, AgentConfigMap, AgentToServer, EffectiveConfig, RemoteConfigStatus,
    RemoteConfigStatuses, ServerToAgent,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const AGENT_A: &str = "11111111-1111-1111-1111-111111111111";
const COMMAND_C: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";

struct Replica {
    id: ServerId,
    registry: Arc<ConnectionRegistry>,
    identity: Arc<ServerIdentityService>,
    usecase: Arc<AgentUsecase>,
    dispatcher: CommandDispatcher,
    reconciler: Reconciler,
    counters: Arc<ReceiverCounters>,
    token: CancellationToken,
}

impl Drop for Replica {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn spawn_replica(
    id: &str,
    store: Arc<InMemoryStore>,
    bus: &InMemoryEventBus,
    clock: Arc<dyn Clock>,
) -> Replica {
    let server_id = ServerId::from(id);
    let registry = Arc::new(ConnectionRegistry::new());
    let identity = Arc::new(ServerIdentityService::new(
        server_id.clone(),
        Duration::from_secs(10),
        store.clone(),
        clock.clone(),
    ));
    identity.start().await.unwrap();

    let usecase = Arc::new(AgentUsecase::new(
        store.clone(),
        store.clone(),
        server_id.clone(),
        clock.clone(),
    ));
    let dispatcher = CommandDispatcher::new(
        identity.clone(),
        registry.clone(),
        store.clone(),
        store.clone(),
        Arc::new(bus.clone()),
    );
    let reconciler = Reconciler::new(
        registry.clone(),
        store.clone(),
        store.clone(),
        clock.clone(),
        Duration::from_secs(15),
    );

    let counters = Arc::new(ReceiverCounters::default());
    let handler = Arc::new(InboundEventHandler::new(
        server_id.clone(),
        registry.clone(),
        store.clone(),
        clock.clone(),
    )) as Arc<dyn ServerMessageHandler>;
    let token = CancellationToken::new();
    let receiver = bus.subscribe(counters.clone());
    tokio::spawn({
        let token = token.clone();
        async move { Box::new(receiver).run(token, handler).await }
    });

    Replica {
        id: server_id,
        registry,
        identity,
        usecase,
        dispatcher,
        reconciler,
        counters,
        token,
    }
}

/// Opens a simulated agent connection on a replica. The returned mailbox is
/// what the agent's socket would transmit.
fn connect_agent(replica: &Replica, queue_cap: usize) -> (Arc<SessionHandle>, mpsc::Receiver<ServerToAgent>) {
    let (handle, mailbox) =
        SessionHandle::new(Uuid::new_v4(), queue_cap, replica.token.child_token());
    replica.registry.register(handle.clone());
    (handle, mailbox)
}

/// Feeds one AgentToServer through the replica's usecase the way the session
/// reader does: apply, bind on first contact, enqueue whatever came back.
async fn agent_reports(replica: &Replica, session: &Arc<SessionHandle>, report: AgentToServer) {
    let outcome = replica.usecase.apply(report).await.unwrap();
    if session.bound_instance_uid() != Some(outcome.instance_uid) {
        session.set_bound(outcome.instance_uid);
        replica
            .registry
            .bind(session.connection_id(), outcome.instance_uid);
    }
    if let Some(push) = outcome.push {
        let _ = session.enqueue(push);
    }
}

fn agent_uid() -> InstanceUid {
    InstanceUid::try_from(AGENT_A).unwrap()
}

fn report(sequence_num: u64) -> AgentToServer {
    AgentToServer {
        instance_uid: agent_uid().into_bytes(),
        sequence_num,
        ..Default::default()
    }
}

fn update_config_command() -> Command {
    Command::new(
        CommandId::try_from(COMMAND_C).unwrap(),
        agent_uid(),
        CommandPayload::UpdateAgentConfig {
            config: yaml_config("", r#"{"key":"v1"}"#),
        },
        "operator@example.com",
        Utc::now(),
        Duration::from_secs(600),
    )
}

async fn recv_frame(mailbox: &mut mpsc::Receiver<ServerToAgent>) -> ServerToAgent {
    tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
        .await
        .expect("frame should arrive within 2s")
        .expect("mailbox closed")
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn happy_path_local_delivery_and_acknowledgement() {
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = InMemoryEventBus::new(8, clock.clone());
    let s1 = spawn_replica("S1", store.clone(), &bus, clock).await;

    let (session, mut mailbox) = connect_agent(&s1, 8);
    agent_reports(&s1, &session, report(1)).await;

    let command = update_config_command();
    let outcome = s1.dispatcher.dispatch(command.clone()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::DeliveredLocally);

    let frame = recv_frame(&mut mailbox).await;
    let remote = frame.remote_config.expect("frame must carry the config");
    let offered = remote.config.unwrap().config_map;
    assert_eq!(offered[""].body, br#"{"key":"v1"}"#.to_vec());

    // The agent applies the config and reports the matching hash.
    let mut ack = report(2);
    let mut config_map = HashMap::new();
    config_map.insert(
        "".to_string(),
        AgentConfigFile {
            body: br#"{"key":"v1"}"#.to_vec(),
            content_type: "text/yaml".to_string(),
        },
    );
    ack.effective_config = Some(EffectiveConfig {
        config_map: Some(AgentConfigMap { config_map }),
    });
    ack.remote_config_status = Some(RemoteConfigStatus {
        last_remote_config_hash: remote.config_hash.clone(),
        status: RemoteConfigStatuses::Applied as i32,
        error_message: String::new(),
    });
    agent_reports(&s1, &session, ack).await;

    let stored = CommandRepository::get(store.as_ref(), &command.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, CommandState::Acknowledged);
}

#[tokio::test]
async fn cross_replica_routing_delivers_exactly_once() {
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = InMemoryEventBus::new(8, clock.clone());
    let s1 = spawn_replica("S1", store.clone(), &bus, clock.clone()).await;
    let s2 = spawn_replica("S2", store.clone(), &bus, clock).await;

    // Agent A holds its WebSocket on S2.
    let (session, mut mailbox) = connect_agent(&s2, 8);
    agent_reports(&s2, &session, report(1)).await;

    // The operator issues the command on S1.
    let outcome = s1.dispatcher.dispatch(update_config_command()).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Published {
            targets: vec![ServerId::from("S2")]
        }
    );

    // S2's receiver picks it up and enqueues on the local session.
    let frame = recv_frame(&mut mailbox).await;
    assert!(frame.remote_config.is_some());

    // Exactly one frame: S1 enqueued nothing and S2 enqueued once.
    assert!(mailbox.try_recv().is_err());
    // S1 also consumed the event (shared hub) but dropped it on the subject
    // filter without touching any session.
    wait_until("s1 to drop the foreign event", || {
        s1.counters.handled() == 1
    })
    .await;
}

#[tokio::test]
async fn poison_event_does_not_kill_the_receiver() {
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = InMemoryEventBus::new(8, clock.clone());
    let s1 = spawn_replica("S1", store.clone(), &bus, clock.clone()).await;

    // An event with an unknown type reaches every receiver.
    let good = envelope::encode_to_bytes(
        &ServerMessage {
            source: ServerId::from("S9"),
            target: ServerId::from("S1"),
            payload: ServerMessagePayload::SendServerToAgent {
                target_agent_instance_uids: vec![agent_uid()],
            },
        },
        Uuid::new_v4(),
        Utc::now(),
    )
    .unwrap();
    let mut poisoned: serde_json::Value = serde_json::from_slice(&good).unwrap();
    poisoned["type"] =
        serde_json::Value::String("io.opampcommander.server.unknown.v1".to_string());
    bus.publish_raw(serde_json::to_vec(&poisoned).unwrap()).await;

    wait_until("the poison event to be counted", || {
        s1.counters.unknown_event_type() == 1
    })
    .await;

    // The receiver is still alive: a well-formed event is processed.
    bus.send_message_to_server(
        &ServerId::from("S1"),
        ServerMessage {
            source: ServerId::from("S9"),
            target: ServerId::from("S1"),
            payload: ServerMessagePayload::SendServerToAgent {
                target_agent_instance_uids: vec![agent_uid()],
            },
        },
    )
    .await
    .unwrap();
    wait_until("the follow-up event to be handled", || {
        s1.counters.handled() == 1
    })
    .await;
    assert_eq!(s1.counters.unknown_event_type(), 1);
}

#[tokio::test]
async fn displaced_connection_loses_delivery() {
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = InMemoryEventBus::new(8, clock.clone());
    let s1 = spawn_replica("S1", store.clone(), &bus, clock).await;

    // A connects twice without closing the first connection.
    let (c1, mut mailbox1) = connect_agent(&s1, 8);
    agent_reports(&s1, &c1, report(1)).await;
    let (c2, mut mailbox2) = connect_agent(&s1, 8);
    agent_reports(&s1, &c2, report(2)).await;

    assert!(c1.is_closed());
    assert_eq!(c1.close_reason(), Some(CloseReason::SupersededConnection));
    assert_eq!(
        s1.registry.lookup_by_agent(&agent_uid()).unwrap().connection_id(),
        c2.connection_id()
    );

    // A pending command delivers exactly once, to the winner.
    let outcome = s1.dispatcher.dispatch(update_config_command()).await.unwrap();
    assert_eq!(outcome, DispatchOutcome::DeliveredLocally);
    assert!(recv_frame(&mut mailbox2).await.remote_config.is_some());
    assert!(mailbox2.try_recv().is_err());
    assert!(mailbox1.try_recv().is_err());
}

#[tokio::test]
async fn dead_replica_fanout_and_reconciliation_delivery() {
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = InMemoryEventBus::new(8, clock.clone());
    let s1 = spawn_replica("S1", store.clone(), &bus, clock.clone()).await;
    let s2 = spawn_replica("S2", store.clone(), &bus, clock.clone()).await;
    let s3 = spawn_replica("S3", store.clone(), &bus, clock.clone()).await;

    // A was last seen on S2, then S2 dies (tombstone stands in for the
    // heartbeat aging out; the dispatcher asks only "is it live").
    let (session, _mailbox) = connect_agent(&s2, 8);
    agent_reports(&s2, &session, report(1)).await;
    session.close(CloseReason::TransportError);
    s2.registry.remove(session.connection_id());
    s2.identity.stop().await;
    s2.token.cancel();

    // Issued on S1: the last owner is gone, so the command fans out to the
    // remaining live peers and stays pending.
    let outcome = s1.dispatcher.dispatch(update_config_command()).await.unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Published {
            targets: vec![ServerId::from("S3")]
        }
    );

    // S3 consumes the fan-out event first; A is not bound there yet, so the
    // event is dropped and only the reconciliation sweep can deliver.
    wait_until("s3 to consume the fan-out event", || {
        s3.counters.handled() == 1
    })
    .await;

    // A reconnects to S3; the reconciliation sweep delivers the still
    // pending command.
    let (reconnected, mut mailbox) = connect_agent(&s3, 8);
    reconnected.set_bound(agent_uid());
    s3.registry.bind(reconnected.connection_id(), agent_uid());

    s3.reconciler.sweep().await.unwrap();
    assert!(recv_frame(&mut mailbox).await.remote_config.is_some());

    let stored = CommandRepository::get(store.as_ref(), &CommandId::try_from(COMMAND_C).unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, CommandState::Pending);
    assert_eq!(stored.delivery_attempts, 1);
}

#[tokio::test]
async fn queue_full_backpressure_drains_through_reconciliation() {
    let store = Arc::new(InMemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = InMemoryEventBus::new(8, clock.clone());
    let s1 = spawn_replica("S1", store.clone(), &bus, clock).await;

    // Outbound queue capacity 2.
    let (session, mut mailbox) = connect_agent(&s1, 2);
    agent_reports(&s1, &session, report(1)).await;

    let commands: Vec<Command> = (0..3)
        .map(|n| {
            Command::new(
                CommandId::create(),
                agent_uid(),
                CommandPayload::UpdateAgentConfig {
                    config: yaml_config("collector.yaml", &format!("key: v{n}")),
                },
                "operator",
                Utc::now(),
                Duration::from_secs(600),
            )
        })
        .collect();

    assert_eq!(
        s1.dispatcher.dispatch(commands[0].clone()).await.unwrap(),
        DispatchOutcome::DeliveredLocally
    );
    assert_eq!(
        s1.dispatcher.dispatch(commands[1].clone()).await.unwrap(),
        DispatchOutcome::DeliveredLocally
    );
    // Third hits the full queue: deferred, not published.
    assert_eq!(
        s1.dispatcher.dispatch(commands[2].clone()).await.unwrap(),
        DispatchOutcome::Deferred
    );
    assert_eq!(s1.counters.handled(), 0);

    // The agent drains its socket, then one reconciliation period later the
    // deferred command arrives.
    assert!(mailbox.try_recv().is_ok());
    assert!(mailbox.try_recv().is_ok());
    s1.reconciler.sweep().await.unwrap();
    assert!(recv_frame(&mut mailbox).await.remote_config.is_some());
}

#[tokio::test]
async fn event_type_constant_is_frozen() {
    // The wire constant the fleet depends on; renaming it orphans in-flight
    // events.
    assert_eq!(
        EVENT_TYPE_SEND_SERVER_TO_AGENT,
        "io.opampcommander.server.sendtoagent.v1"
    );
}
