//! Forward engine: routes inbound messages through the pipeline.
//!
//! Flow per message:
//! 1. Task lookup for the source chat (store errors skip the message)
//! 2. Filter evaluation per task
//! 3. Grouped messages → album aggregator; the rest → transform + dispatch
//!
//! Album flushes are delivered by [`AlbumDelivery`], which runs on its own
//! task and consumes the aggregator's flush channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pipeline::album::{
    Admission, AlbumAggregator, AlbumConfig, FlushedAlbum, caption_source,
};
use crate::pipeline::dispatcher::{DispatchReport, Dispatcher};
use crate::pipeline::filter::evaluate_task;
use crate::pipeline::matcher::TaskMatcher;
use crate::pipeline::transform::ContentTransformer;
use crate::pipeline::types::MessageEnvelope;
use crate::tasks::model::Task;

/// What happened to one inbound message.
#[derive(Debug, Default)]
pub struct HandleOutcome {
    /// Active tasks for the source.
    pub matched: usize,
    /// Tasks whose filters kept the message.
    pub kept: usize,
    /// Handed to the album aggregator.
    pub buffered: bool,
    /// Store lookup failed; nothing was attempted.
    pub skipped: bool,
    /// Handed to a delayed task's lane; delivered in the background.
    pub queued: usize,
    /// Reports for tasks without a delay, dispatched inline.
    pub reports: Vec<DispatchReport>,
}

/// Forward engine.
///
/// Handles messages one at a time, in arrival order. Tasks with a delay
/// get their own delivery lane so their waits never hold up the engine.
pub struct ForwardEngine {
    matcher: Arc<TaskMatcher>,
    dispatcher: Arc<Dispatcher>,
    transformer: Arc<ContentTransformer>,
    albums: AlbumAggregator,
    lanes: Mutex<HashMap<(i64, String), DelayedLane>>,
}

impl ForwardEngine {
    /// Create an engine plus the album flush receiver to hand to
    /// [`AlbumDelivery::spawn`].
    pub fn new(
        matcher: Arc<TaskMatcher>,
        dispatcher: Arc<Dispatcher>,
        transformer: Arc<ContentTransformer>,
        album_config: AlbumConfig,
    ) -> (Self, mpsc::UnboundedReceiver<FlushedAlbum>) {
        let (albums, flush_rx) = AlbumAggregator::new(album_config);
        let engine = Self {
            matcher,
            dispatcher,
            transformer,
            albums,
            lanes: Mutex::new(HashMap::new()),
        };
        (engine, flush_rx)
    }

    /// Process a single inbound message.
    pub async fn handle(&self, message: MessageEnvelope) -> HandleOutcome {
        let mut outcome = HandleOutcome::default();

        let tasks = match self.matcher.active_tasks_for_source(message.source_id).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(
                    source = message.source_id,
                    message_id = message.message_id,
                    error = %e,
                    "Task lookup failed, skipping message"
                );
                outcome.skipped = true;
                return outcome;
            }
        };
        outcome.matched = tasks.len();
        if tasks.is_empty() {
            return outcome;
        }

        let kept: Vec<Task> = tasks
            .into_iter()
            .filter(|task| evaluate_task(task, &message).is_keep())
            .collect();
        outcome.kept = kept.len();
        if kept.is_empty() {
            return outcome;
        }

        debug!(
            source = message.source_id,
            message_id = message.message_id,
            tasks = kept.len(),
            "Message kept"
        );

        let (message, kept) = if message.group_id.is_some() {
            match self.albums.admit(message, kept).await {
                Admission::Opened | Admission::Buffered => {
                    outcome.buffered = true;
                    return outcome;
                }
                Admission::Late { envelope, tasks } => (envelope, tasks),
            }
        } else {
            (message, kept)
        };

        for task in kept {
            let caption = self.transformer.transform(&task.modifications, &message.text);
            if task.delay.is_zero() {
                let report = self
                    .dispatcher
                    .dispatch(&task, std::slice::from_ref(&message), &caption)
                    .await;
                outcome.reports.push(report);
            } else {
                self.enqueue_delayed(DelayedSend {
                    task,
                    message: message.clone(),
                    caption,
                });
                outcome.queued += 1;
            }
        }
        outcome
    }

    /// Queue a send on the task's lane, starting the lane if needed.
    fn enqueue_delayed(&self, send: DelayedSend) {
        let key = (send.task.owner_id, send.task.label.clone());
        let mut lanes = self.lock_lanes();
        let send = match lanes.get(&key) {
            Some(lane) => match lane.tx.send(send) {
                Ok(()) => return,
                // Lane task is gone; start a fresh one.
                Err(mpsc::error::SendError(send)) => send,
            },
            None => send,
        };
        let lane = DelayedLane::spawn(Arc::clone(&self.dispatcher));
        if lane.tx.send(send).is_err() {
            warn!(task = %key.1, "Delayed lane closed before first send");
        }
        lanes.insert(key, lane);
    }

    fn lock_lanes(&self) -> std::sync::MutexGuard<'_, HashMap<(i64, String), DelayedLane>> {
        self.lanes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Flush all buffered albums now. Call before shutting down.
    pub async fn drain_albums(&self) -> usize {
        self.albums.drain().await
    }

    /// Stop accepting messages. Returns the delayed lanes, which finish
    /// their queued sends and then exit.
    pub fn shutdown(self) -> Vec<JoinHandle<()>> {
        let lanes = std::mem::take(&mut *self.lock_lanes());
        lanes.into_values().map(|lane| lane.handle).collect()
    }
}

// ── Delayed lanes ───────────────────────────────────────────────────

struct DelayedSend {
    task: Task,
    message: MessageEnvelope,
    caption: String,
}

/// Sequential delivery for one delayed task. Owns the task's next
/// allowed send time.
struct DelayedLane {
    tx: mpsc::UnboundedSender<DelayedSend>,
    handle: JoinHandle<()>,
}

impl DelayedLane {
    fn spawn(dispatcher: Arc<Dispatcher>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DelayedSend>();
        let handle = tokio::spawn(async move {
            let mut ready_at: Option<Instant> = None;
            while let Some(send) = rx.recv().await {
                if let Some(at) = ready_at {
                    if at > Instant::now() {
                        debug!(task = %send.task.label, "Waiting for task delay");
                        tokio::time::sleep_until(at).await;
                    }
                }
                let report = dispatcher
                    .dispatch(&send.task, std::slice::from_ref(&send.message), &send.caption)
                    .await;
                // Nothing went out, so nothing to space from.
                if !report.is_empty() {
                    ready_at = Some(Instant::now() + send.task.delay);
                }
            }
        });
        Self { tx, handle }
    }
}

// ── Album delivery ──────────────────────────────────────────────────

/// Delivers flushed albums: one caption per task, one post per destination.
#[derive(Clone)]
pub struct AlbumDelivery {
    dispatcher: Arc<Dispatcher>,
    transformer: Arc<ContentTransformer>,
}

impl AlbumDelivery {
    pub fn new(dispatcher: Arc<Dispatcher>, transformer: Arc<ContentTransformer>) -> Self {
        Self {
            dispatcher,
            transformer,
        }
    }

    pub async fn deliver(&self, album: FlushedAlbum) -> Vec<DispatchReport> {
        let mut reports = Vec::with_capacity(album.per_task.len());
        for (task, members) in &album.per_task {
            let caption = self
                .transformer
                .transform(&task.modifications, caption_source(members));
            let report = self.dispatcher.dispatch(task, members, &caption).await;
            info!(
                dispatch = %report.id,
                group = %album.group_id,
                task = %task.label,
                items = members.len(),
                delivered = report.delivered(),
                failed = report.failed(),
                "Album dispatched"
            );
            reports.push(report);
        }
        reports
    }

    /// Consume flushes until every sender is gone.
    pub fn spawn(self, mut flush_rx: mpsc::UnboundedReceiver<FlushedAlbum>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(album) = flush_rx.recv().await {
                self.deliver(album).await;
            }
            debug!("Album delivery stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::test_support::{
        MemoryStats, MemoryTaskStore, RecordingSender, StaticResolver, make_task,
    };
    use crate::pipeline::types::{MediaKind, MediaRef};
    use crate::tasks::model::ReplaceRule;

    const SOURCE: i64 = -1001234567890;

    struct Harness {
        engine: ForwardEngine,
        store: Arc<MemoryTaskStore>,
        sender: Arc<RecordingSender>,
        stats: Arc<MemoryStats>,
        delivery: AlbumDelivery,
        flush_rx: Option<mpsc::UnboundedReceiver<FlushedAlbum>>,
    }

    fn harness(tasks: Vec<Task>, sender: RecordingSender) -> Harness {
        let store = Arc::new(MemoryTaskStore::with_tasks(tasks));
        let sender = Arc::new(sender);
        let stats = Arc::new(MemoryStats::default());
        let dispatcher = Arc::new(Dispatcher::new(
            sender.clone(),
            Arc::new(StaticResolver::default()),
            stats.clone(),
        ));
        let transformer = Arc::new(ContentTransformer::with_defaults().unwrap());
        let matcher = Arc::new(TaskMatcher::new(store.clone()));
        let (engine, flush_rx) = ForwardEngine::new(
            matcher,
            dispatcher.clone(),
            transformer.clone(),
            AlbumConfig::default(),
        );
        Harness {
            engine,
            store,
            sender,
            stats,
            delivery: AlbumDelivery::new(dispatcher, transformer),
            flush_rx: Some(flush_rx),
        }
    }

    fn text(id: i64, body: &str) -> MessageEnvelope {
        MessageEnvelope::text(SOURCE, id, 42, body)
    }

    fn album_item(id: i64, group: &str, caption: &str) -> MessageEnvelope {
        text(id, caption)
            .with_group(group)
            .with_media(MediaRef::new(MediaKind::Photo, format!("photo-{id}")))
    }

    #[tokio::test]
    async fn blacklisted_message_not_dispatched() {
        let mut task = make_task("news", vec![SOURCE], vec![10]);
        task.filters.blacklist = vec!["promo".into()];
        let h = harness(vec![task], RecordingSender::default());

        let outcome = h.engine.handle(text(1, "Check this promo code")).await;

        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.kept, 0);
        assert!(h.sender.sent().is_empty());
        assert!(h.stats.records().is_empty());
    }

    #[tokio::test]
    async fn kept_message_is_transformed_and_sent() {
        let mut task = make_task("news", vec![SOURCE], vec![10, 20]);
        task.modifications.replace_rules = vec![ReplaceRule {
            find: "cat".into(),
            replace: "dog".into(),
        }];
        task.modifications.footer = Some("via @relay".into());
        let h = harness(vec![task], RecordingSender::default());

        let outcome = h.engine.handle(text(1, "I love cat")).await;

        assert_eq!(outcome.reports.len(), 1);
        assert_eq!(outcome.reports[0].delivered(), 2);
        let sent = h.sender.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].caption, "I love dog\n\nvia @relay");
    }

    #[tokio::test]
    async fn bare_source_id_matches_marked_message() {
        let task = make_task("news", vec![1234567890], vec![10]);
        let h = harness(vec![task], RecordingSender::default());

        let outcome = h.engine.handle(text(1, "hello")).await;
        assert_eq!(outcome.matched, 1);
        assert_eq!(h.sender.sent().len(), 1);
    }

    #[tokio::test]
    async fn unmatched_source_is_ignored() {
        let h = harness(
            vec![make_task("news", vec![777], vec![10])],
            RecordingSender::default(),
        );
        let outcome = h.engine.handle(text(1, "hello")).await;
        assert_eq!(outcome.matched, 0);
        assert!(h.sender.sent().is_empty());
    }

    #[tokio::test]
    async fn store_outage_skips_only_current_message() {
        let h = harness(
            vec![make_task("news", vec![SOURCE], vec![10])],
            RecordingSender::default(),
        );

        h.store.set_offline(true);
        let outcome = h.engine.handle(text(1, "lost")).await;
        assert!(outcome.skipped);

        h.store.set_offline(false);
        h.engine.handle(text(2, "delivered")).await;
        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].caption, "delivered");
    }

    #[tokio::test]
    async fn filters_apply_per_task() {
        let mut picky = make_task("picky", vec![SOURCE], vec![10]);
        picky.filters.whitelist = vec!["rust".into()];
        let open = make_task("open", vec![SOURCE], vec![20]);
        let h = harness(vec![picky, open], RecordingSender::default());

        let outcome = h.engine.handle(text(1, "python news")).await;

        assert_eq!(outcome.matched, 2);
        assert_eq!(outcome.kept, 1);
        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn task_delay_throttles_next_message() {
        let mut task = make_task("slow", vec![SOURCE], vec![10, 20]);
        task.delay = Duration::from_secs(5);
        let h = harness(vec![task], RecordingSender::default());

        assert_eq!(h.engine.handle(text(1, "first")).await.queued, 1);
        assert_eq!(h.engine.handle(text(2, "second")).await.queued, 1);
        tokio::time::sleep(Duration::from_secs(6)).await;

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[0].caption, "first");
        assert_eq!(sent[2].caption, "second");
        // Destinations of one message are not spaced out.
        assert_eq!(sent[0].at, sent[1].at);
        assert!(sent[2].at - sent[1].at >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_does_not_hold_up_others() {
        let mut slow = make_task("slow", vec![SOURCE], vec![10]);
        slow.delay = Duration::from_secs(5);
        let fast = make_task("fast", vec![SOURCE], vec![20]);
        let other = make_task("other", vec![-1009], vec![30]);
        let h = harness(vec![slow, fast, other], RecordingSender::default());

        let start = Instant::now();
        h.engine.handle(text(1, "one")).await;
        h.engine.handle(text(2, "two")).await;
        h.engine
            .handle(MessageEnvelope::text(-1009, 1, 42, "unrelated"))
            .await;
        assert!(start.elapsed() < Duration::from_millis(100));
        tokio::time::sleep(Duration::from_secs(6)).await;

        let sent = h.sender.sent();
        let at = |dest: i64, caption: &str| {
            sent.iter()
                .find(|p| p.destination == dest && p.caption == caption)
                .map(|p| p.at - start)
                .unwrap()
        };
        assert!(at(20, "two") < Duration::from_millis(100));
        assert!(at(30, "unrelated") < Duration::from_millis(100));
        assert!(at(10, "two") >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_task_does_not_split_albums() {
        let mut slow = make_task("slow", vec![-1009], vec![10]);
        slow.delay = Duration::from_secs(5);
        let albums = make_task("albums", vec![SOURCE], vec![20]);
        let mut h = harness(vec![slow, albums], RecordingSender::default());
        let consumer = h.delivery.clone().spawn(h.flush_rx.take().unwrap());

        let slow_text = |id| MessageEnvelope::text(-1009, id, 42, "tick");
        h.engine.handle(slow_text(1)).await;
        h.engine.handle(album_item(1, "G", "cap")).await;
        h.engine.handle(slow_text(2)).await;
        assert!(h.engine.handle(album_item(2, "G", "")).await.buffered);
        assert!(h.engine.handle(album_item(3, "G", "")).await.buffered);
        tokio::time::sleep(Duration::from_secs(6)).await;

        let album_posts: Vec<_> = h
            .sender
            .sent()
            .into_iter()
            .filter(|p| p.destination == 20)
            .collect();
        assert_eq!(album_posts.len(), 1);
        assert_eq!(album_posts[0].items.as_ref().unwrap().len(), 3);

        for lane in h.engine.shutdown() {
            lane.await.unwrap();
        }
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn album_delivered_as_single_post() {
        let mut h = harness(
            vec![make_task("news", vec![SOURCE], vec![10, 20])],
            RecordingSender::default(),
        );
        let consumer = h.delivery.clone().spawn(h.flush_rx.take().unwrap());
        let start = Instant::now();

        for (i, caption) in ["", "The caption", "ignored"].iter().enumerate() {
            let outcome = h
                .engine
                .handle(album_item(i as i64 + 1, "G", caption))
                .await;
            assert!(outcome.buffered);
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        assert!(h.sender.sent().is_empty());

        tokio::time::sleep(Duration::from_secs(5)).await;

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 2);
        for post in &sent {
            assert_eq!(post.items.as_ref().unwrap().len(), 3);
            assert_eq!(post.caption, "The caption");
            let at = post.at - start;
            assert!(at >= Duration::from_secs(4) && at < Duration::from_millis(4100));
        }

        drop(h.engine);
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn late_album_member_forwarded_alone() {
        let mut h = harness(
            vec![make_task("news", vec![SOURCE], vec![10])],
            RecordingSender::default(),
        );
        let consumer = h.delivery.clone().spawn(h.flush_rx.take().unwrap());

        h.engine.handle(album_item(1, "G", "cap")).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.sender.sent().len(), 1);

        let outcome = h.engine.handle(album_item(2, "G", "straggler")).await;
        assert!(!outcome.buffered);
        assert_eq!(outcome.reports.len(), 1);

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].items.as_ref().unwrap().len(), 1);
        assert_eq!(sent[1].caption, "straggler");

        drop(h.engine);
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_delivers_pending_album_on_shutdown() {
        let mut h = harness(
            vec![make_task("news", vec![SOURCE], vec![10])],
            RecordingSender::default(),
        );
        let consumer = h.delivery.clone().spawn(h.flush_rx.take().unwrap());

        h.engine.handle(album_item(1, "G", "cap")).await;
        h.engine.handle(album_item(2, "G", "")).await;
        assert_eq!(h.engine.drain_albums().await, 1);

        drop(h.engine);
        consumer.await.unwrap();

        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].items.as_ref().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn album_filtering_is_per_member() {
        let mut no_video = make_task("photos-only", vec![SOURCE], vec![10]);
        no_video.filters.block_videos = true;
        let mut h = harness(vec![no_video], RecordingSender::default());
        let consumer = h.delivery.clone().spawn(h.flush_rx.take().unwrap());

        h.engine.handle(album_item(1, "G", "")).await;
        let video = text(2, "")
            .with_group("G")
            .with_media(MediaRef::new(MediaKind::Video, "clip"));
        let outcome = h.engine.handle(video).await;
        assert_eq!(outcome.kept, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let sent = h.sender.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].items.as_ref().unwrap().len(), 1);

        drop(h.engine);
        consumer.await.unwrap();
    }
}
