//! # Watch Manager
//!
//! One long-lived task owning every watch subscription. It listens to two
//! inputs: subscription requests from command workers and key-change events
//! from the shards. On a change it re-runs each affected watched command on
//! the owning shard, once per live subscriber, with the reply routed to that
//! subscriber's preprocessing channel.
//!
//! Subscribers whose command worker has exited are noticed through their
//! closed reply channel and dropped the next time one of their keys changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use skv_common::Command;
use skv_engine::{KeyChange, ShardManager, ShardOp, ShardResponse};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::ServerError;
use crate::id::WorkerId;

/// Requests sent by command workers.
#[derive(Debug)]
pub enum WatchSubscription {
    Subscribe {
        subscriber: WorkerId,
        fingerprint: u64,
        /// The plain read command to re-run, e.g. `GET k`.
        command: Command,
        reply_to: mpsc::UnboundedSender<ShardResponse>,
    },
    Unsubscribe {
        subscriber: WorkerId,
        fingerprint: u64,
    },
    UnsubscribeAll {
        subscriber: WorkerId,
    },
}

struct Subscriber {
    id: WorkerId,
    reply_to: mpsc::UnboundedSender<ShardResponse>,
}

struct WatchEntry {
    command: Command,
    subscribers: Vec<Subscriber>,
}

pub struct WatchManager {
    requests: mpsc::Receiver<WatchSubscription>,
    events: mpsc::UnboundedReceiver<KeyChange>,
    shards: Arc<ShardManager>,
    entries: HashMap<u64, WatchEntry>,
    by_key: HashMap<Bytes, HashSet<u64>>,
}

impl WatchManager {
    pub fn new(
        requests: mpsc::Receiver<WatchSubscription>,
        events: mpsc::UnboundedReceiver<KeyChange>,
        shards: Arc<ShardManager>,
    ) -> Self {
        WatchManager {
            requests,
            events,
            shards,
            entries: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Runs until `cancel` fires.
    ///
    /// Fails with `WatchStopped` if the shard event stream ends first, or
    /// with the shard error if a notification cannot be dispatched.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ServerError> {
        info!("watch manager started");
        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                Some(request) = self.requests.recv() => self.apply(request),
                event = self.events.recv() => match event {
                    Some(event) => {
                        if let Err(err) = self.notify(event).await {
                            break Err(err);
                        }
                    }
                    None => break Err(ServerError::WatchStopped),
                },
            }
        };
        match result {
            Err(_) if cancel.is_cancelled() => Ok(()),
            other => {
                info!(watches = self.entries.len(), "watch manager stopped");
                other
            }
        }
    }

    fn apply(&mut self, request: WatchSubscription) {
        match request {
            WatchSubscription::Subscribe {
                subscriber,
                fingerprint,
                command,
                reply_to,
            } => {
                for key in command.keys() {
                    self.by_key
                        .entry(key.clone())
                        .or_default()
                        .insert(fingerprint);
                }
                let entry = self.entries.entry(fingerprint).or_insert_with(|| WatchEntry {
                    command,
                    subscribers: Vec::new(),
                });
                match entry.subscribers.iter_mut().find(|s| s.id == subscriber) {
                    Some(existing) => existing.reply_to = reply_to,
                    None => {
                        debug!(subscriber = %subscriber, fingerprint, "watch added");
                        entry.subscribers.push(Subscriber {
                            id: subscriber,
                            reply_to,
                        });
                    }
                }
            }
            WatchSubscription::Unsubscribe {
                subscriber,
                fingerprint,
            } => {
                let now_empty = match self.entries.get_mut(&fingerprint) {
                    Some(entry) => {
                        entry.subscribers.retain(|s| s.id != subscriber);
                        entry.subscribers.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.remove_entry(fingerprint);
                }
                debug!(subscriber = %subscriber, fingerprint, "watch removed");
            }
            WatchSubscription::UnsubscribeAll { subscriber } => {
                let mut empty = Vec::new();
                for (fingerprint, entry) in self.entries.iter_mut() {
                    entry.subscribers.retain(|s| s.id != subscriber);
                    if entry.subscribers.is_empty() {
                        empty.push(*fingerprint);
                    }
                }
                for fingerprint in empty {
                    self.remove_entry(fingerprint);
                }
                trace!(subscriber = %subscriber, "all watches removed");
            }
        }
    }

    async fn notify(&mut self, event: KeyChange) -> Result<(), ServerError> {
        let fingerprints: Vec<u64> = match self.by_key.get(&event.key) {
            Some(set) => set.iter().copied().collect(),
            None => return Ok(()),
        };

        let mut ops = Vec::new();
        let mut stale = Vec::new();
        for fingerprint in fingerprints {
            let Some(entry) = self.entries.get_mut(&fingerprint) else {
                continue;
            };
            entry.subscribers.retain(|s| {
                let live = !s.reply_to.is_closed();
                if !live {
                    debug!(subscriber = %s.id, fingerprint, "pruned stale watcher");
                }
                live
            });
            if entry.subscribers.is_empty() {
                stale.push(fingerprint);
                continue;
            }
            for subscriber in &entry.subscribers {
                ops.push(ShardOp {
                    request_id: fingerprint,
                    command: entry.command.clone(),
                    reply_to: subscriber.reply_to.clone(),
                });
            }
        }
        for fingerprint in stale {
            self.remove_entry(fingerprint);
        }

        for op in ops {
            self.shards.dispatch(event.shard_id, op).await?;
        }
        Ok(())
    }

    fn remove_entry(&mut self, fingerprint: u64) {
        let Some(entry) = self.entries.remove(&fingerprint) else {
            return;
        };
        for key in entry.command.keys() {
            if let Some(set) = self.by_key.get_mut(key) {
                set.remove(&fingerprint);
                if set.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self, fingerprint: u64) -> usize {
        self.entries
            .get(&fingerprint)
            .map_or(0, |entry| entry.subscribers.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use skv_common::Reply;
    use skv_engine::ShardConfig;
    use tokio::time::timeout;

    use super::*;

    struct Fixture {
        manager: WatchManager,
        shards: Arc<ShardManager>,
        _requests: mpsc::Sender<WatchSubscription>,
        _events: mpsc::UnboundedSender<KeyChange>,
        cancel: CancellationToken,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    fn fixture() -> Fixture {
        let cancel = CancellationToken::new();
        let (shard_events, _) = mpsc::unbounded_channel();
        let config = ShardConfig {
            count: 2,
            ..ShardConfig::default()
        };
        let shards = Arc::new(ShardManager::start(&config, shard_events, cancel.clone()));
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Fixture {
            manager: WatchManager::new(requests_rx, events_rx, Arc::clone(&shards)),
            shards,
            _requests: requests_tx,
            _events: events_tx,
            cancel,
        }
    }

    fn get(key: &'static str) -> Command {
        Command::new("GET", vec![Bytes::from_static(key.as_bytes())])
    }

    fn subscribe(
        manager: &mut WatchManager,
        id: &str,
        command: &Command,
    ) -> mpsc::UnboundedReceiver<ShardResponse> {
        let (tx, rx) = mpsc::unbounded_channel();
        manager.apply(WatchSubscription::Subscribe {
            subscriber: WorkerId::from(id),
            fingerprint: command.fingerprint(),
            command: command.clone(),
            reply_to: tx,
        });
        rx
    }

    fn change(shards: &ShardManager, key: &'static str) -> KeyChange {
        KeyChange {
            key: Bytes::from_static(key.as_bytes()),
            shard_id: shards.shard_for(key.as_bytes()),
        }
    }

    #[tokio::test]
    async fn change_notifies_subscriber_exactly_once() {
        let mut f = fixture();
        let watched = get("k");
        let mut rx = subscribe(&mut f.manager, "C-0-1", &watched);

        f.manager.notify(change(&f.shards, "k")).await.unwrap();

        let response = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.request_id, watched.fingerprint());
        assert_eq!(response.reply, Reply::Nil);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unrelated_key_sends_nothing() {
        let mut f = fixture();
        let mut rx = subscribe(&mut f.manager, "C-0-1", &get("k"));

        f.manager.notify(change(&f.shards, "other")).await.unwrap();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn duplicate_subscribe_keeps_one_entry() {
        let mut f = fixture();
        let watched = get("k");
        let _first = subscribe(&mut f.manager, "C-0-1", &watched);
        let mut second = subscribe(&mut f.manager, "C-0-1", &watched);
        assert_eq!(f.manager.subscriber_count(watched.fingerprint()), 1);

        f.manager.notify(change(&f.shards, "k")).await.unwrap();
        assert!(timeout(Duration::from_secs(1), second.recv()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_subscriber_is_pruned() {
        let mut f = fixture();
        let watched = get("k");
        let rx = subscribe(&mut f.manager, "C-0-1", &watched);
        let mut live = subscribe(&mut f.manager, "C-0-2", &watched);
        drop(rx);

        f.manager.notify(change(&f.shards, "k")).await.unwrap();
        assert_eq!(f.manager.subscriber_count(watched.fingerprint()), 1);
        assert!(timeout(Duration::from_secs(1), live.recv()).await.unwrap().is_some());

        drop(live);
        f.manager.notify(change(&f.shards, "k")).await.unwrap();
        assert_eq!(f.manager.subscriber_count(watched.fingerprint()), 0);
        assert!(f.manager.by_key.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_all_removes_every_watch() {
        let mut f = fixture();
        let a = get("a");
        let b = get("b");
        let _ra = subscribe(&mut f.manager, "C-0-1", &a);
        let _rb = subscribe(&mut f.manager, "C-0-1", &b);
        let _other = subscribe(&mut f.manager, "C-0-2", &a);

        f.manager.apply(WatchSubscription::UnsubscribeAll {
            subscriber: WorkerId::from("C-0-1"),
        });
        assert_eq!(f.manager.subscriber_count(a.fingerprint()), 1);
        assert_eq!(f.manager.subscriber_count(b.fingerprint()), 0);
        assert!(!f.manager.by_key.contains_key(&Bytes::from_static(b"b")));
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let manager = WatchManager::new(
            mpsc::channel(1).1,
            mpsc::unbounded_channel().1,
            Arc::clone(&f.shards),
        );
        cancel.cancel();
        assert!(manager.run(cancel).await.is_ok());
    }

    #[tokio::test]
    async fn run_fails_when_event_stream_ends() {
        let f = fixture();
        let (_requests, requests_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel::<KeyChange>();
        drop(events_tx);
        let manager = WatchManager::new(requests_rx, events_rx, Arc::clone(&f.shards));
        let result = manager.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ServerError::WatchStopped)));
    }
}
