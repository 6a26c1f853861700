use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use learnpath_runtime::models::StudentState;
use learnpath_runtime::persistence::{
    LocalStore, MemoryStore, PersistenceConfig, ProgressPersistence, RemoteSync, SyncStatus,
    DEFAULT_STORAGE_KEY,
};
use learnpath_runtime::SyncError;
use tokio::time::{sleep, Instant};

/// Scripted remote: pops one outcome per push (success once the script
/// runs out) and records what it saw.
#[derive(Default)]
struct Recorder {
    outcomes: Mutex<VecDeque<bool>>,
    latency: Duration,
    attempts: Mutex<Vec<(Instant, StudentState)>>,
    accepted: Mutex<Vec<StudentState>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Recorder {
    fn new(outcomes: &[bool], latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            latency,
            ..Default::default()
        })
    }

    fn remote(self: &Arc<Self>) -> Arc<dyn RemoteSync> {
        let rec = Arc::clone(self);
        Arc::new(move |snapshot: StudentState| {
            let rec = Arc::clone(&rec);
            async move {
                let now = rec.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                rec.max_in_flight.fetch_max(now, Ordering::SeqCst);
                rec.attempts.lock().unwrap().push((Instant::now(), snapshot.clone()));
                sleep(rec.latency).await;
                rec.in_flight.fetch_sub(1, Ordering::SeqCst);

                let ok = rec.outcomes.lock().unwrap().pop_front().unwrap_or(true);
                if ok {
                    rec.accepted.lock().unwrap().push(snapshot);
                    Ok(())
                } else {
                    Err(SyncError::Remote("503 from remote".into()))
                }
            }
        })
    }

    fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    fn accepted_minutes(&self) -> Vec<u32> {
        self.accepted.lock().unwrap().iter().map(|s| s.total_time_spent_minutes).collect()
    }
}

/// Snapshots are told apart by their time counter.
fn snapshot(minutes: u32) -> StudentState {
    let mut s = StudentState::new("learner-1", Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    s.total_time_spent_minutes = minutes;
    s
}

fn local_minutes(store: &MemoryStore) -> u32 {
    let body = store.read(DEFAULT_STORAGE_KEY).unwrap().expect("local copy");
    serde_json::from_str::<StudentState>(&body).unwrap().total_time_spent_minutes
}

fn setup(rec: &Arc<Recorder>) -> (ProgressPersistence, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let persistence = ProgressPersistence::new(store.clone(), Some(rec.remote()), PersistenceConfig::default());
    (persistence, store)
}

#[tokio::test(start_paused = true)]
async fn burst_of_saves_is_sent_once() {
    let rec = Recorder::new(&[], Duration::ZERO);
    let (persistence, store) = setup(&rec);

    for minutes in 1..=5 {
        persistence.save(&snapshot(minutes)).unwrap();
        sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(rec.attempts(), 0, "debounce window still open");
    assert_eq!(local_minutes(&store), 5, "every save lands locally at once");

    sleep(Duration::from_millis(600)).await;
    assert_eq!(rec.accepted_minutes(), vec![5]);
    assert_eq!(persistence.status(), SyncStatus::Synced);
    assert!(!persistence.has_pending_sync());
    assert_eq!(persistence.last_synced().map(|s| s.total_time_spent_minutes), Some(5));
}

#[tokio::test(start_paused = true)]
async fn never_two_sends_in_flight() {
    let rec = Recorder::new(&[], Duration::from_millis(1000));
    let (persistence, _store) = setup(&rec);

    persistence.save(&snapshot(1)).unwrap();
    // first send is on the wire from 500ms to 1500ms
    sleep(Duration::from_millis(600)).await;
    persistence.save(&snapshot(2)).unwrap();

    sleep(Duration::from_millis(3000)).await;
    assert_eq!(rec.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(rec.accepted_minutes(), vec![1, 2]);
    assert_eq!(persistence.status(), SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn failed_send_rolls_local_copy_back_until_newer_save() {
    // S0 ok, A fails, B ok
    let rec = Recorder::new(&[true, false, true], Duration::ZERO);
    let (persistence, store) = setup(&rec);

    persistence.save(&snapshot(0)).unwrap();
    sleep(Duration::from_millis(600)).await;
    assert_eq!(rec.accepted_minutes(), vec![0]);

    persistence.save(&snapshot(10)).unwrap();
    sleep(Duration::from_millis(600)).await;
    assert_eq!(local_minutes(&store), 0, "rolled back to last synced snapshot");
    assert!(matches!(persistence.status(), SyncStatus::Retrying { attempt: 2, .. }));

    persistence.save(&snapshot(20)).unwrap();
    assert_eq!(local_minutes(&store), 20);

    sleep(Duration::from_secs(5)).await;
    assert_eq!(local_minutes(&store), 20);
    assert_eq!(rec.accepted_minutes(), vec![0, 20], "A never reached the remote");
    assert_eq!(persistence.status(), SyncStatus::Synced);
    assert!(!persistence.has_pending_sync());
}

#[tokio::test(start_paused = true)]
async fn retries_back_off_then_give_up() {
    let rec = Recorder::new(&[false; 10], Duration::ZERO);
    let (persistence, store) = setup(&rec);
    let start = Instant::now();

    persistence.save(&snapshot(7)).unwrap();
    sleep(Duration::from_secs(30)).await;

    let times: Vec<Duration> = rec.attempts.lock().unwrap().iter().map(|(t, _)| *t - start).collect();
    assert_eq!(times.len(), 3, "three attempts in total");
    let gaps = [times[1] - times[0], times[2] - times[1]];
    assert!(gaps[0] >= Duration::from_millis(1000) && gaps[0] < Duration::from_millis(1010));
    assert!(gaps[1] >= Duration::from_millis(2000) && gaps[1] < Duration::from_millis(2010));

    assert!(matches!(persistence.status(), SyncStatus::Failed { attempts: 3, .. }));
    // nothing was ever synced, so there was nothing to roll back to
    assert_eq!(local_minutes(&store), 7);
}

#[tokio::test(start_paused = true)]
async fn force_sync_skips_the_debounce_window() {
    let rec = Recorder::new(&[], Duration::ZERO);
    let (persistence, _store) = setup(&rec);

    persistence.save(&snapshot(3)).unwrap();
    persistence.force_sync_now().await.unwrap();
    assert_eq!(rec.accepted_minutes(), vec![3]);
    assert_eq!(persistence.status(), SyncStatus::Synced);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(rec.attempts(), 1, "debounce timer was cancelled");

    // nothing pending: no request at all
    persistence.force_sync_now().await.unwrap();
    assert_eq!(rec.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_force_sync_is_reported_and_retried() {
    let rec = Recorder::new(&[false], Duration::ZERO);
    let (persistence, _store) = setup(&rec);

    persistence.save(&snapshot(4)).unwrap();
    let err = persistence.force_sync_now().await.unwrap_err();
    assert!(err.to_string().contains("503"));
    assert!(matches!(persistence.status(), SyncStatus::Retrying { attempt: 2, .. }));

    sleep(Duration::from_secs(2)).await;
    assert_eq!(rec.accepted_minutes(), vec![4]);
    assert_eq!(persistence.status(), SyncStatus::Synced);
}

#[tokio::test(start_paused = true)]
async fn local_only_persistence_never_pends() {
    let store = Arc::new(MemoryStore::new());
    let persistence = ProgressPersistence::local(store.clone());

    persistence.save(&snapshot(9)).unwrap();
    assert!(!persistence.has_pending_sync());
    assert_eq!(persistence.status(), SyncStatus::Idle);
    persistence.force_sync_now().await.unwrap();
    assert_eq!(persistence.load().unwrap().map(|s| s.total_time_spent_minutes), Some(9));

    persistence.clear().unwrap();
    assert!(persistence.load().unwrap().is_none());
}
