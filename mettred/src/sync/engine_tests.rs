use super::*;
use crate::sync::testing::FakeRemote;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

struct Harness {
    remote: Arc<FakeRemote>,
    engine: SyncEngine,
    downloads: UnboundedReceiver<Downloadable>,
    discards: UnboundedReceiver<PathBuf>,
}

fn harness() -> Harness {
    harness_with(Arc::new(FakeRemote::default()))
}

fn harness_with(remote: Arc<FakeRemote>) -> Harness {
    let (downloads_tx, downloads) = unbounded_channel();
    let (discards_tx, discards) = unbounded_channel();
    let engine = SyncEngine::new(
        remote.clone(),
        EngineOutputs {
            downloads: downloads_tx,
            discards: discards_tx,
        },
    );
    Harness {
        remote,
        engine,
        downloads,
        discards,
    }
}

fn torrent_drop(hash: &str) -> LocalDrop {
    LocalDrop {
        kind: DropKind::Torrent,
        hash: hash.into(),
        payload: hash.as_bytes().to_vec(),
        path: PathBuf::from(format!("/watch/{hash}.torrent")),
        size: hash.len() as u64,
    }
}

fn reported(hash: &str) -> TransferReported {
    TransferReported {
        hash: hash.into(),
        remote_transfer_id: None,
    }
}

fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

fn season_remote() -> Arc<FakeRemote> {
    let remote = Arc::new(FakeRemote::default());
    remote.add_folder(1, None, "Show");
    remote.add_file(2, Some(1), "ep1.mkv", 10);
    remote.add_file(3, Some(1), "ep2.mkv", 20);
    remote.add_transfer(7, "def", Some(1), TransferStatus::Completed, 30, 30);
    remote
}

#[tokio::test(start_paused = true)]
async fn dropped_torrent_becomes_one_downloadable_and_is_cleaned() {
    let mut h = harness();

    let state = h.engine.submit(torrent_drop("abc")).await.unwrap();
    assert_eq!(state, ItemState::AwaitingRemoteCompletion);
    assert_eq!(h.remote.submissions(), 1);
    assert_eq!(drain(&mut h.discards), vec![PathBuf::from("/watch/abc.torrent")]);

    h.remote.add_file(10, None, "movie.mkv", 100);
    h.remote.update_transfer(1, |t| {
        t.status = TransferStatus::Completed;
        t.file_id = Some(10);
        t.size = 100;
        t.downloaded = 100;
    });
    tokio::time::advance(DEFAULT_DEBOUNCE * 2).await;

    let state = h.engine.on_transfer_reported(reported("abc")).await.unwrap();
    assert_eq!(state, ItemState::AwaitingLocalCompletion);
    let downloads = drain(&mut h.downloads);
    assert_eq!(downloads.len(), 1);
    assert_eq!(downloads[0].path, "movie.mkv");
    assert_eq!(downloads[0].file_id, 10);
    assert_eq!(downloads[0].url.as_str(), "https://dl.example/files/10");

    let state = h.engine.on_local_complete("movie.mkv").await.unwrap();
    assert_eq!(state, ItemState::Cleaned);
    assert_eq!(h.remote.deleted_files(), vec![10]);
    assert_eq!(h.remote.deleted_transfers(), vec![1]);
    assert_eq!(h.engine.item_state("ABC"), Some(ItemState::Cleaned));
}

#[tokio::test(start_paused = true)]
async fn second_drop_of_same_hash_does_not_submit_again() {
    let mut h = harness();

    h.engine.submit(torrent_drop("abc")).await.unwrap();
    let mut again = torrent_drop("abc");
    again.path = PathBuf::from("/watch/copy.torrent");
    let state = h.engine.submit(again).await.unwrap();

    assert_eq!(state, ItemState::AwaitingRemoteCompletion);
    assert_eq!(h.remote.submissions(), 1);
    assert_eq!(h.remote.transfer_count(), 1);
    assert_eq!(
        drain(&mut h.discards),
        vec![
            PathBuf::from("/watch/abc.torrent"),
            PathBuf::from("/watch/copy.torrent")
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn drop_matching_existing_remote_transfer_is_a_lookup_hit() {
    let remote = Arc::new(FakeRemote::default());
    remote.add_transfer(4, "ABC", None, TransferStatus::Downloading, 100, 40);
    let mut h = harness_with(remote);

    let state = h.engine.submit(torrent_drop("abc")).await.unwrap();

    assert_eq!(state, ItemState::AwaitingRemoteCompletion);
    assert_eq!(h.remote.submissions(), 0);
    assert_eq!(drain(&mut h.discards).len(), 1);
    assert!(drain(&mut h.downloads).is_empty());
}

#[tokio::test(start_paused = true)]
async fn drop_matching_finished_transfer_goes_straight_to_download() {
    let mut h = harness_with(season_remote());

    let state = h.engine.submit(torrent_drop("def")).await.unwrap();

    assert_eq!(state, ItemState::AwaitingLocalCompletion);
    assert_eq!(h.remote.submissions(), 0);
    let paths: Vec<_> = drain(&mut h.downloads).into_iter().map(|d| d.path).collect();
    assert_eq!(paths, vec!["Show/ep1.mkv", "Show/ep2.mkv"]);
}

#[tokio::test(start_paused = true)]
async fn magnet_drop_submits_the_uri() {
    let h = harness();
    let hash = "0123456789abcdef0123456789abcdef01234567";
    let drop = LocalDrop {
        kind: DropKind::Magnet,
        hash: hash.into(),
        payload: format!("magnet:?xt=urn:btih:{hash}&dn=movie\n").into_bytes(),
        path: PathBuf::from("/watch/movie.magnet"),
        size: 0,
    };

    h.engine.submit(drop).await.unwrap();

    let snapshot = h.engine.refresh().await.unwrap();
    assert_eq!(snapshot.transfers.by_hash(hash).unwrap().id, 1);
    assert_eq!(h.engine.item_state(hash), Some(ItemState::AwaitingRemoteCompletion));
}

#[tokio::test(start_paused = true)]
async fn failed_submission_keeps_descriptor_and_forgets_item() {
    let mut h = harness();
    h.remote.fail_listings(true);

    let err = h.engine.submit(torrent_drop("abc")).await.unwrap_err();

    assert!(matches!(err, EngineError::RemoteUnavailable(_)));
    assert!(err.is_transient());
    assert_eq!(h.remote.submissions(), 0);
    assert!(drain(&mut h.discards).is_empty());
    assert_eq!(h.engine.item_state("abc"), None);
}

#[tokio::test(start_paused = true)]
async fn missing_transfer_is_retried_once_then_abandoned() {
    let mut h = harness();

    let state = h.engine.on_transfer_reported(reported("zzz")).await.unwrap();

    assert_eq!(state, ItemState::Abandoned);
    assert_eq!(h.remote.file_listings(), 2);
    assert_eq!(h.engine.item_state("zzz"), Some(ItemState::Abandoned));
    assert!(drain(&mut h.downloads).is_empty());
}

#[tokio::test(start_paused = true)]
async fn transfer_appearing_before_retry_is_picked_up() {
    let remote = season_remote();
    remote.hide_transfers(true);
    let mut h = harness_with(remote.clone());

    let reveal = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        remote.hide_transfers(false);
    });
    let state = h.engine.on_transfer_reported(reported("def")).await.unwrap();
    reveal.await.unwrap();

    assert_eq!(state, ItemState::AwaitingLocalCompletion);
    assert_eq!(h.remote.file_listings(), 2);
    assert_eq!(drain(&mut h.downloads).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn url_failure_abandons_without_emitting_partial_downloads() {
    let remote = season_remote();
    remote.break_url(3);
    let mut h = harness_with(remote);

    let err = h.engine.on_transfer_reported(reported("def")).await.unwrap_err();

    assert!(matches!(err, EngineError::RemoteUnavailable(_)));
    assert!(drain(&mut h.downloads).is_empty());
    assert_eq!(h.engine.item_state("def"), Some(ItemState::Abandoned));
}

#[tokio::test(start_paused = true)]
async fn local_complete_never_deletes_partially_downloaded_transfer() {
    let remote = Arc::new(FakeRemote::default());
    remote.add_file(10, None, "movie.mkv", 100);
    remote.add_transfer(1, "abc", Some(10), TransferStatus::Completed, 100, 50);
    let h = harness_with(remote);

    let state = h.engine.on_local_complete("movie.mkv").await.unwrap();

    assert_eq!(state, ItemState::AwaitingLocalCompletion);
    assert_eq!(h.remote.transfer_lookups(), 1);
    assert!(h.remote.deleted_files().is_empty());
    assert!(h.remote.deleted_transfers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn seeding_transfer_is_not_deleted() {
    let remote = Arc::new(FakeRemote::default());
    remote.add_file(10, None, "movie.mkv", 100);
    remote.add_transfer(1, "abc", Some(10), TransferStatus::Seeding, 100, 100);
    let h = harness_with(remote);

    h.engine.on_local_complete("/movie.mkv").await.unwrap();

    assert!(h.remote.deleted_transfers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn folder_transfer_is_cleaned_after_every_leaf_completes() {
    let mut h = harness_with(season_remote());

    assert_eq!(h.engine.resume_completed().await.unwrap(), 1);
    assert_eq!(drain(&mut h.downloads).len(), 2);

    let state = h.engine.on_local_complete("Show/ep1.mkv").await.unwrap();
    assert_eq!(state, ItemState::AwaitingLocalCompletion);
    assert!(h.remote.deleted_files().is_empty());

    let state = h.engine.on_local_complete("Show/ep2.mkv").await.unwrap();
    assert_eq!(state, ItemState::Cleaned);
    assert_eq!(h.remote.deleted_files(), vec![2, 3, 1]);
    assert_eq!(h.remote.deleted_transfers(), vec![7]);

    let state = h.engine.on_local_complete("Show/ep2.mkv").await.unwrap();
    assert_eq!(state, ItemState::Cleaned);
    assert_eq!(h.remote.deleted_transfers(), vec![7]);
}

#[tokio::test(start_paused = true)]
async fn non_empty_folder_is_kept_while_transfer_is_removed() {
    let h = harness_with(season_remote());
    h.engine.resume_completed().await.unwrap();
    h.remote.add_file(4, Some(1), "extra.nfo", 1);

    h.engine.on_local_complete("Show/ep1.mkv").await.unwrap();
    let state = h.engine.on_local_complete("Show/ep2.mkv").await.unwrap();

    assert_eq!(state, ItemState::Cleaned);
    assert_eq!(h.remote.deleted_files(), vec![2, 3]);
    assert_eq!(h.remote.deleted_transfers(), vec![7]);
}

#[tokio::test(start_paused = true)]
async fn local_complete_for_unknown_path_is_reported() {
    let remote = season_remote();
    remote.add_file(40, None, "stray.mkv", 1);
    let h = harness_with(remote);

    let missing = h.engine.on_local_complete("nope.mkv").await.unwrap_err();
    assert!(matches!(missing, EngineError::NotFound(TreeError::PathNotFound(_))));

    let unowned = h.engine.on_local_complete("stray.mkv").await.unwrap_err();
    assert!(matches!(unowned, EngineError::ConsistencyAnomaly(_)));
    assert!(h.remote.deleted_files().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resume_skips_unfinished_and_tracked_transfers() {
    let remote = season_remote();
    remote.add_file(10, None, "movie.mkv", 100);
    remote.add_transfer(8, "ghi", Some(10), TransferStatus::Downloading, 100, 20);
    let mut h = harness_with(remote);

    assert_eq!(h.engine.resume_completed().await.unwrap(), 1);
    assert_eq!(h.engine.resume_completed().await.unwrap(), 0);
    assert_eq!(drain(&mut h.downloads).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn status_report_summarizes_snapshot() {
    let h = harness_with(season_remote());

    let report = h.engine.status_report().await.unwrap();

    assert_eq!(report.username, "fake");
    assert_eq!(report.used, 250);
    assert_eq!(report.files, 3);
    assert_eq!(report.transfers.get("completed"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn descriptor_copy_arriving_during_submission_is_discarded_afterwards() {
    let remote = Arc::new(FakeRemote::default());
    remote.set_list_delay(Duration::from_millis(100));
    let mut h = harness_with(remote);
    let mut copy = torrent_drop("abc");
    copy.path = PathBuf::from("/watch/copy.torrent");

    let (first, second) = tokio::join!(
        h.engine.submit(torrent_drop("abc")),
        h.engine.submit(copy)
    );

    assert_eq!(first.unwrap(), ItemState::AwaitingRemoteCompletion);
    assert_eq!(second.unwrap(), ItemState::Dropped);
    assert_eq!(h.remote.submissions(), 1);
    assert_eq!(
        drain(&mut h.discards),
        vec![
            PathBuf::from("/watch/abc.torrent"),
            PathBuf::from("/watch/copy.torrent")
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn finished_existing_transfer_without_files_is_abandoned_after_retry() {
    let remote = Arc::new(FakeRemote::default());
    remote.add_transfer(5, "abc", Some(10), TransferStatus::Completed, 100, 100);
    let mut h = harness_with(remote);

    let state = h.engine.submit(torrent_drop("abc")).await.unwrap();

    assert_eq!(state, ItemState::Abandoned);
    assert_eq!(h.engine.item_state("abc"), Some(ItemState::Abandoned));
    assert_eq!(h.remote.file_listings(), 2);
    assert_eq!(h.remote.submissions(), 0);
    assert_eq!(drain(&mut h.discards), vec![PathBuf::from("/watch/abc.torrent")]);
    assert!(drain(&mut h.downloads).is_empty());
}

#[tokio::test(start_paused = true)]
async fn concurrent_reports_for_one_item_emit_each_leaf_once() {
    let remote = season_remote();
    remote.set_url_delay(Duration::from_millis(50));
    let mut h = harness_with(remote);

    let (first, second) = tokio::join!(
        h.engine.on_transfer_reported(reported("def")),
        h.engine.on_transfer_reported(reported("def"))
    );

    assert_eq!(first.unwrap(), ItemState::AwaitingLocalCompletion);
    assert_eq!(second.unwrap(), ItemState::AwaitingRemoteCompletion);
    let paths: Vec<_> = drain(&mut h.downloads).into_iter().map(|d| d.path).collect();
    assert_eq!(paths, vec!["Show/ep1.mkv", "Show/ep2.mkv"]);
    assert_eq!(h.remote.transfer_listings(), 1);
    assert_eq!(h.engine.item_state("def"), Some(ItemState::AwaitingLocalCompletion));
}

#[tokio::test(start_paused = true)]
async fn report_racing_startup_resume_downloads_once() {
    let remote = season_remote();
    remote.set_url_delay(Duration::from_millis(50));
    let mut h = harness_with(remote);

    let (resumed, reported_state) = tokio::join!(
        h.engine.resume_completed(),
        h.engine.on_transfer_reported(reported("def"))
    );

    assert_eq!(resumed.unwrap(), 1);
    assert!(!reported_state.unwrap().is_terminal());
    assert_eq!(drain(&mut h.downloads).len(), 2);
    assert_eq!(h.engine.item_state("def"), Some(ItemState::AwaitingLocalCompletion));
}

#[tokio::test(start_paused = true)]
async fn repeated_report_after_downloads_were_emitted_is_ignored() {
    let mut h = harness_with(season_remote());

    h.engine.on_transfer_reported(reported("def")).await.unwrap();
    assert_eq!(drain(&mut h.downloads).len(), 2);

    let state = h.engine.on_transfer_reported(reported("DEF")).await.unwrap();

    assert_eq!(state, ItemState::AwaitingLocalCompletion);
    assert!(drain(&mut h.downloads).is_empty());
    assert_eq!(h.remote.transfer_listings(), 1);
}

#[test]
fn transient_errors_follow_remote_classification() {
    let outage = EngineError::from(PutioError::Api {
        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
        body: String::new(),
    });
    let missing = EngineError::from(PutioError::Api {
        status: reqwest::StatusCode::NOT_FOUND,
        body: String::new(),
    });

    assert!(outage.is_transient());
    assert!(!missing.is_transient());
    assert!(!EngineError::ConsistencyAnomaly("no owner".into()).is_transient());
}
