use std::sync::Arc;
use std::time::Duration;

use taskd_agent::{
    ClientError, CommandExecutor, CycleReport, ExecutorSet, HttpChannel, MessageExecutor,
    MessageSurface, Poller,
};
use taskd_common::{Channel, NewTask, SecretRing, TaskId, TaskKind, TaskStatus};
use taskd_server::{serve_listener, store::SqliteStore, TaskServer};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const SECRET: &str = "e2e-secret";

struct Harness {
    server: Arc<TaskServer>,
    base_url: String,
    stop: Option<oneshot::Sender<()>>,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("tasks.db")).unwrap();
        let server = Arc::new(TaskServer::new(Arc::new(store), SecretRing::new(SECRET)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(serve_listener(listener, Arc::clone(&server), None, async move {
            let _ = stopped.await;
        }));

        Self {
            server,
            base_url,
            stop: Some(stop),
            _dir: dir,
        }
    }

    fn enqueue(&self, kind: TaskKind, payload: &str) -> TaskId {
        self.server
            .enqueue(NewTask {
                target: "HOST1".into(),
                channel: Channel::Host,
                title: "e2e".into(),
                kind,
                payload: payload.into(),
                due_at: None,
            })
            .unwrap()
            .id
    }

    fn status(&self, id: TaskId) -> TaskStatus {
        self.server.store().get(id).unwrap().unwrap().status
    }

    fn poller(&self, secret: &str) -> Poller<HttpChannel> {
        let channel = HttpChannel::new(
            &self.base_url,
            "HOST1",
            &SecretRing::new(secret),
            Duration::from_secs(5),
        )
        .unwrap();
        Poller::new(
            channel,
            ExecutorSet::new(
                MessageExecutor::new(MessageSurface::Log, Duration::from_secs(5)),
                CommandExecutor::new(Duration::from_secs(10)),
            ),
        )
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[tokio::test]
async fn agent_runs_and_confirms_tasks() {
    let harness = Harness::start().await;
    let message = harness.enqueue(TaskKind::Message, "Backup done");
    let failing = harness.enqueue(TaskKind::Command, if cfg!(windows) { "exit 1" } else { "false" });

    let poller = harness.poller(SECRET);
    let report = poller.run_cycle().await.unwrap();
    assert_eq!(
        report,
        CycleReport {
            fetched: 2,
            succeeded: 1,
            failed: 1,
            unconfirmed: 0,
        }
    );

    assert_eq!(harness.status(message), TaskStatus::Success);
    let failed = harness.server.store().get(failing).unwrap().unwrap();
    assert_eq!(failed.status, TaskStatus::Error);
    assert_eq!(failed.message.as_deref(), Some("command exited with status 1"));

    // Nothing left to deliver.
    let report = poller.run_cycle().await.unwrap();
    assert_eq!(report, CycleReport::default());
}

#[tokio::test]
async fn wrong_secret_is_rejected_and_tasks_stay_pending() {
    let harness = Harness::start().await;
    let id = harness.enqueue(TaskKind::Message, "hello");

    let poller = harness.poller("not-the-secret");
    assert!(matches!(
        poller.run_cycle().await,
        Err(ClientError::Unauthorized)
    ));
    assert_eq!(harness.status(id), TaskStatus::Pending);
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let channel = HttpChannel::new(
        &format!("http://{addr}"),
        "HOST1",
        &SecretRing::new(SECRET),
        Duration::from_secs(2),
    )
    .unwrap();
    assert!(matches!(
        channel.fetch_tasks().await,
        Err(ClientError::Transport(_))
    ));
}
