use mailvault::Error;
use mailvault::adapters::{SimulatedSnapshot, StaticDirectory};
use mailvault::config::AppConfig;
use mailvault::context::AppContext;
use mailvault::core::transfer_engine::SimulatedTransfer;
use mailvault::core::transfer_engine::simulated::CallKind;
use mailvault::core::{
    BackupOrchestrator, BackupRequest, BackupTarget, ContentType, DirectoryBackupStatus,
    SessionStatus, SnapshotMode,
};
use mailvault::db::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ACCOUNTS: [&str; 3] = ["a@example.org", "b@example.org", "c@example.org"];

struct Harness {
    temp: TempDir,
    directory: Arc<StaticDirectory>,
    transfer: Arc<SimulatedTransfer>,
    store: SessionStore,
    orchestrator: BackupOrchestrator,
}

async fn harness(snapshot: SimulatedSnapshot, transfer: SimulatedTransfer) -> Harness {
    let temp = tempfile::tempdir().unwrap();
    let config = AppConfig {
        backup_root: temp.path().to_path_buf(),
        metadata_store: temp.path().join("mailvault.db"),
        ..AppConfig::default()
    };
    let directory = Arc::new(StaticDirectory::active(ACCOUNTS));
    let transfer = Arc::new(transfer);
    let store = SessionStore::open(&config.metadata_store).await.unwrap();
    let ctx = AppContext::new(
        config,
        directory.clone(),
        Arc::new(snapshot),
        transfer.clone(),
    );
    Harness {
        temp,
        directory,
        transfer,
        store,
        orchestrator: BackupOrchestrator::new(ctx),
    }
}

async fn wait_for_first_transfer(transfer: &SimulatedTransfer) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while transfer.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for the first transfer");
}

#[tokio::test]
async fn test_failed_account_does_not_stop_the_run() {
    let h = harness(
        SimulatedSnapshot::default(),
        SimulatedTransfer::failing(["b@example.org"]),
    )
    .await;

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();
    let session = h.orchestrator.run(&h.store, &plan).await.unwrap();

    assert_eq!(session.status, SessionStatus::CompletedWithErrors);
    assert_eq!(session.accounts, vec!["a@example.org", "c@example.org"]);
    assert_eq!(session.fail_accounts.len(), 1);
    assert!(!session.fail_accounts["b@example.org"].is_empty());
    assert_eq!(
        session.total_accounts as usize,
        session.accounts.len() + session.fail_accounts.len()
    );
    assert_eq!(
        session.directory_backup_status,
        Some(DirectoryBackupStatus::Completed)
    );
    assert!(session.end_time.is_some());

    // every account was attempted, in enumeration order
    let attempted: Vec<String> = h
        .transfer
        .calls()
        .iter()
        .map(|call| call.url.path().to_string())
        .collect();
    assert_eq!(
        attempted,
        vec![
            "/home/a@example.org/",
            "/home/b@example.org/",
            "/home/c@example.org/"
        ]
    );

    let accounts_dir = plan.accounts_dir();
    assert!(accounts_dir.join("a@example.org.tgz").is_file());
    assert!(accounts_dir.join("c@example.org.tgz").is_file());
    assert!(plan.directory_dir().join("ldap.bak").is_file());
    assert!(h.store.lock_holder().await.unwrap().is_none());
}

#[tokio::test]
async fn test_repeated_enumerated_account_is_backed_up_once() {
    let mut h = harness(SimulatedSnapshot::default(), SimulatedTransfer::default()).await;
    let directory = Arc::new(StaticDirectory::active([
        "a@example.org",
        "a@example.org",
        "b@example.org",
    ]));
    let config = AppConfig {
        backup_root: h.temp.path().to_path_buf(),
        ..AppConfig::default()
    };
    h.orchestrator = BackupOrchestrator::new(AppContext::new(
        config,
        directory,
        Arc::new(SimulatedSnapshot::default()),
        h.transfer.clone(),
    ));

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();
    assert_eq!(plan.accounts, vec!["a@example.org", "b@example.org"]);
    let session = h.orchestrator.run(&h.store, &plan).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.accounts, vec!["a@example.org", "b@example.org"]);
    assert_eq!(session.total_accounts, 2);
    assert_eq!(h.transfer.calls().len(), 2);
}

#[tokio::test]
async fn test_unsafe_enumerated_name_fails_only_that_account() {
    let mut h = harness(SimulatedSnapshot::default(), SimulatedTransfer::default()).await;
    let directory = Arc::new(StaticDirectory::active(["../escape@example.org", "b@example.org"]));
    let config = AppConfig {
        backup_root: h.temp.path().to_path_buf(),
        ..AppConfig::default()
    };
    h.orchestrator = BackupOrchestrator::new(AppContext::new(
        config,
        directory,
        Arc::new(SimulatedSnapshot::default()),
        h.transfer.clone(),
    ));

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();
    let session = h.orchestrator.run(&h.store, &plan).await.unwrap();

    assert_eq!(session.status, SessionStatus::CompletedWithErrors);
    assert_eq!(session.accounts, vec!["b@example.org"]);
    assert!(session.fail_accounts.contains_key("../escape@example.org"));
    assert_eq!(h.transfer.calls().len(), 1);
    assert!(!plan.label_dir.join("escape@example.org.tgz").exists());
}

#[tokio::test]
async fn test_clean_run_completes() {
    let h = harness(SimulatedSnapshot::default(), SimulatedTransfer::default()).await;

    let mut request = BackupRequest::new(BackupTarget::parse("c@example.org, a@example.org").unwrap());
    request.types = vec![ContentType::Message, ContentType::Contact];
    let plan = h.orchestrator.plan(request).await.unwrap();
    let session = h.orchestrator.run(&h.store, &plan).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.accounts, vec!["c@example.org", "a@example.org"]);
    assert!(session.fail_accounts.is_empty());

    let calls = h.transfer.calls();
    assert!(calls.iter().all(|call| call.kind == CallKind::Download));
    assert!(
        calls[0]
            .url
            .query_pairs()
            .any(|(k, v)| k == "types" && v == "message,contact")
    );
}

#[tokio::test]
async fn test_directory_only_backup() {
    let h = harness(SimulatedSnapshot::default(), SimulatedTransfer::default()).await;

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::DirectoryOnly))
        .await
        .unwrap();
    let session = h.orchestrator.run(&h.store, &plan).await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.total_accounts, 0);
    assert!(!plan.accounts_dir().exists());
    assert!(plan.directory_dir().join("ldap.bak").is_file());
    assert_eq!(h.directory.queries(), 0);
    assert!(h.transfer.calls().is_empty());
}

#[tokio::test]
async fn test_fatal_directory_backup_fails_the_session() {
    let h = harness(
        SimulatedSnapshot::failing_on(SnapshotMode::Config),
        SimulatedTransfer::default(),
    )
    .await;

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();
    let err = h.orchestrator.run(&h.store, &plan).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Backup(_))));

    let session = h.store.session(&plan.label).await.unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(
        session.directory_backup_status,
        Some(DirectoryBackupStatus::Failed)
    );
    assert!(session.end_time.is_some());
    assert!(h.transfer.calls().is_empty());
    assert!(h.store.lock_holder().await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_access_log_is_not_fatal() {
    let h = harness(
        SimulatedSnapshot::failing_on(SnapshotMode::AccessLog),
        SimulatedTransfer::default(),
    )
    .await;

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();
    let session = h.orchestrator.run(&h.store, &plan).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.accounts.len(), 3);
}

#[tokio::test]
async fn test_lock_held_by_live_process() {
    let h = harness(SimulatedSnapshot::default(), SimulatedTransfer::default()).await;
    let guard = h.store.acquire_lock().await.unwrap();

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();
    let err = h.orchestrator.run(&h.store, &plan).await.unwrap_err();

    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::Locking { .. })
    ));
    assert!(h.store.session(&plan.label).await.unwrap().is_none());
    assert!(h.transfer.calls().is_empty());
    guard.release().await.unwrap();
}

#[tokio::test]
async fn test_invalid_account_fails_before_the_run() {
    let h = harness(SimulatedSnapshot::default(), SimulatedTransfer::default()).await;

    let target = BackupTarget::parse("a@example.org,nobody@example.org").unwrap();
    let err = h
        .orchestrator
        .plan(BackupRequest::new(target))
        .await
        .unwrap_err();

    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Backup(_))));
    assert!(h.store.sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_backup_root() {
    let h = harness(SimulatedSnapshot::default(), SimulatedTransfer::default()).await;
    let root = h.temp.path().join("gone");
    let config = AppConfig {
        backup_root: root,
        ..AppConfig::default()
    };
    let ctx = AppContext::new(
        config,
        h.directory.clone(),
        Arc::new(SimulatedSnapshot::default()),
        h.transfer.clone(),
    );

    let err = BackupOrchestrator::new(ctx)
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Backup(_))));
}

#[tokio::test]
async fn test_cancelled_before_first_account() {
    let token = CancellationToken::new();
    let mut h = harness(SimulatedSnapshot::default(), SimulatedTransfer::default()).await;
    h.orchestrator = h.orchestrator.with_cancellation(token.clone());

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();
    token.cancel();
    let session = h.orchestrator.run(&h.store, &plan).await.unwrap();

    assert_eq!(session.status, SessionStatus::Aborted);
    assert!(session.accounts.is_empty());
    assert!(h.transfer.calls().is_empty());
    assert!(h.store.lock_holder().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_discards_partial_archive() {
    let token = CancellationToken::new();
    let mut h = harness(
        SimulatedSnapshot::default(),
        SimulatedTransfer::default().with_chunk_delay(Duration::from_millis(200)),
    )
    .await;
    h.orchestrator = h.orchestrator.with_cancellation(token.clone());

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();

    let (session, ()) = tokio::join!(h.orchestrator.run(&h.store, &plan), async {
        wait_for_first_transfer(&h.transfer).await;
        token.cancel();
    });
    let session = session.unwrap();

    assert_eq!(session.status, SessionStatus::Aborted);
    assert!(session.accounts.is_empty());
    assert_eq!(h.transfer.calls().len(), 1);
    assert!(!plan.accounts_dir().join("a@example.org.tgz").exists());
}

#[tokio::test]
async fn test_external_abort_stops_at_next_account() {
    let mut transfer = SimulatedTransfer::default().with_chunk_delay(Duration::from_millis(100));
    transfer.archive_size = 16 * 1024;
    let h = harness(SimulatedSnapshot::default(), transfer).await;

    let plan = h
        .orchestrator
        .plan(BackupRequest::new(BackupTarget::All))
        .await
        .unwrap();

    // Marks the session aborted while the first account is transferring.
    let (session, marked) = tokio::join!(h.orchestrator.run(&h.store, &plan), async {
        wait_for_first_transfer(&h.transfer).await;
        h.store
            .abort_session(&plan.label, chrono::Local::now())
            .await
            .unwrap()
    });
    assert!(marked);

    let session = session.unwrap();
    assert_eq!(session.status, SessionStatus::Aborted);
    assert_eq!(
        session.directory_backup_status,
        Some(DirectoryBackupStatus::Completed)
    );
    assert_eq!(h.transfer.calls().len(), 1);
    assert!(session.accounts.len() + session.fail_accounts.len() < 3);
}
