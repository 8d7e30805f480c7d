//! Fixed-cadence render loop that hides variable inference latency.

use std::{sync::Arc, time::Duration};

use tintcam_hub::EventHub;
use tintcam_source::FrameSource;
use tintcam_types::{
    config::{RenderConfig, VisionConfig},
    events::{LifecyclePhase, SystemEvent},
    frame::{FilterColor, SegmentationMask, SurfaceHandle, VideoFrame},
    telemetry::RenderStats,
    Result, TintcamError,
};
use tintcam_vision::{FrameCompositor, MaskProvider};
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

mod fps;
mod skip_cache;

pub use fps::FpsCounter;
pub use skip_cache::FrameSkipCache;

type InferenceTask = JoinHandle<Result<Option<SegmentationMask>>>;

/// Why a ready tick presented nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No fresh mask arrived and nothing was cached.
    NoMask,
    /// The cached mask no longer matches the frame; it was dropped.
    MaskMismatch,
    CompositeFailed,
}

/// Branch taken by a single render tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    NotReady,
    Presented { fresh: bool },
    Skipped(SkipReason),
}

pub struct RenderScheduler<S, H>
where
    S: FrameSource,
    H: EventHub,
{
    source: S,
    provider: Arc<dyn MaskProvider>,
    hub: H,
    compositor: FrameCompositor,
    cache: FrameSkipCache,
    fps: FpsCounter,
    surface: SurfaceHandle,
    filter_tx: Arc<watch::Sender<FilterColor>>,
    filter_rx: watch::Receiver<FilterColor>,
    stats: RenderStats,
    stats_tx: watch::Sender<RenderStats>,
    in_flight: Option<InferenceTask>,
    inference_budget: Option<Duration>,
    tick_period: Duration,
}

impl<S, H> RenderScheduler<S, H>
where
    S: FrameSource,
    H: EventHub,
{
    pub fn new(
        render: &RenderConfig,
        vision: &VisionConfig,
        source: S,
        provider: Arc<dyn MaskProvider>,
        hub: H,
    ) -> Self {
        let (filter_tx, filter_rx) = watch::channel(render.filter_color);
        let (stats_tx, _) = watch::channel(RenderStats::default());
        Self {
            source,
            provider,
            hub,
            compositor: FrameCompositor::from(vision),
            cache: FrameSkipCache::new(render.segment_every, render.max_reuse_ticks),
            fps: FpsCounter::new(render.fps_window),
            surface: SurfaceHandle::default(),
            filter_tx: Arc::new(filter_tx),
            filter_rx,
            stats: RenderStats::default(),
            stats_tx,
            in_flight: None,
            inference_budget: render.inference_budget_ms.map(Duration::from_millis),
            tick_period: Duration::from_secs_f64(1.0 / f64::from(render.tick_rate_hz.max(1))),
        }
    }

    pub fn surface(&self) -> SurfaceHandle {
        self.surface.clone()
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<RenderStats> {
        self.stats_tx.subscribe()
    }

    pub fn set_filter(&self, color: FilterColor) {
        self.filter_tx.send_replace(color);
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs one render tick. Errors never escape; they degrade the tick to a skip.
    pub async fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;
        self.harvest_late_mask().await;

        let outcome = match self.source.current_frame().filter(VideoFrame::is_ready) {
            Some(frame) => self.render_frame(&frame).await,
            None => {
                self.stats.not_ready_ticks += 1;
                TickOutcome::NotReady
            }
        };

        if let TickOutcome::Skipped(_) = outcome {
            self.stats.skipped_composites += 1;
        }
        self.stats_tx.send_replace(self.stats);
        outcome
    }

    async fn render_frame(&mut self, frame: &VideoFrame) -> TickOutcome {
        self.cache.advance();
        let filter = *self.filter_rx.borrow();

        let fresh = if self.cache.should_segment_this_tick() {
            self.request_mask(frame).await
        } else {
            None
        };
        let (mask, is_fresh) = match fresh {
            Some(mask) => {
                self.cache.record_mask(mask.clone());
                self.stats.fresh_masks += 1;
                (mask, true)
            }
            None => match self.cache.reuse() {
                Some(mask) => {
                    self.stats.reused_masks += 1;
                    (mask, false)
                }
                None => return TickOutcome::Skipped(SkipReason::NoMask),
            },
        };

        if let Err(err) = self.present(frame, &mask, filter) {
            return match err {
                TintcamError::MaskMismatch { .. } => {
                    debug!("Dropping cached mask: {err}");
                    self.cache.discard();
                    TickOutcome::Skipped(SkipReason::MaskMismatch)
                }
                other => {
                    warn!("Composite failed: {other}");
                    TickOutcome::Skipped(SkipReason::CompositeFailed)
                }
            };
        }

        self.stats.composites += 1;
        let fps = self.fps.update();
        self.stats.fps = fps;
        if fps > 0 {
            if let Err(err) = self.hub.publish(SystemEvent::fps(fps)).await {
                warn!("Failed to publish fps: {err}");
            }
        }
        TickOutcome::Presented { fresh: is_fresh }
    }

    fn present(&self, frame: &VideoFrame, mask: &SegmentationMask, filter: FilterColor) -> Result<()> {
        let mut surface = self.surface.write()?;
        self.compositor.composite(&mut surface, frame, mask, filter)
    }

    /// Starts inference for `frame` and waits for it within the budget.
    ///
    /// Returns `None` when inference missed, failed, overran the budget or
    /// another request is still in flight.
    async fn request_mask(&mut self, frame: &VideoFrame) -> Option<SegmentationMask> {
        if self.in_flight.is_some() {
            debug!("Inference still in flight; reusing cached mask");
            return None;
        }
        self.stats.segment_requests += 1;

        let provider = Arc::clone(&self.provider);
        let frame = frame.clone();
        let mut task: InferenceTask = tokio::spawn(async move { provider.segment(&frame).await });

        let joined = match self.inference_budget {
            None => task.await,
            Some(budget) => match time::timeout(budget, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!("Inference exceeded {:?}; presenting cached mask", budget);
                    self.in_flight = Some(task);
                    return None;
                }
            },
        };
        settle(joined)
    }

    /// Stores the result of an overrun inference task once it has finished.
    async fn harvest_late_mask(&mut self) {
        if !self.in_flight.as_ref().is_some_and(JoinHandle::is_finished) {
            return;
        }
        let Some(task) = self.in_flight.take() else {
            return;
        };
        if let Some(mask) = settle(task.await) {
            self.stats.late_masks += 1;
            self.cache.record_mask(mask);
        }
    }

    /// Ticks at the configured rate until `armed` turns false or its sender drops.
    pub async fn run(mut self, mut armed: watch::Receiver<bool>) -> RenderStats {
        let mut interval = time::interval(self.tick_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.announce(LifecyclePhase::RenderStarted).await;
        info!("Render loop started at {:?} per tick", self.tick_period);

        loop {
            if !*armed.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                changed = armed.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        // The in-flight task runs to completion detached; its mask is dropped.
        self.in_flight = None;
        self.announce(LifecyclePhase::RenderStopped).await;
        info!(
            "Render loop stopped after {} ticks ({} composites)",
            self.stats.ticks, self.stats.composites
        );
        self.stats
    }

    async fn announce(&self, phase: LifecyclePhase) {
        if let Err(err) = self.hub.publish(SystemEvent::lifecycle(phase, None)).await {
            warn!("Failed to publish {:?}: {err}", phase);
        }
    }
}

impl<S, H> RenderScheduler<S, H>
where
    S: FrameSource + 'static,
    H: EventHub + 'static,
{
    /// Moves the scheduler onto its own task.
    pub fn spawn(self) -> SchedulerHandle {
        let (armed_tx, armed_rx) = watch::channel(true);
        let filter_tx = Arc::clone(&self.filter_tx);
        let stats_rx = self.subscribe_stats();
        let surface = self.surface();
        let join = tokio::spawn(self.run(armed_rx));
        SchedulerHandle {
            armed_tx,
            filter_tx,
            stats_rx,
            surface,
            join,
        }
    }
}

fn settle(
    joined: std::result::Result<Result<Option<SegmentationMask>>, JoinError>,
) -> Option<SegmentationMask> {
    match joined {
        Ok(Ok(mask)) => mask,
        Ok(Err(err)) => {
            warn!("Segmentation failed: {err}");
            None
        }
        Err(err) => {
            warn!("Segmentation task aborted: {err}");
            None
        }
    }
}

/// Control surface for a scheduler running on its own task.
pub struct SchedulerHandle {
    armed_tx: watch::Sender<bool>,
    filter_tx: Arc<watch::Sender<FilterColor>>,
    stats_rx: watch::Receiver<RenderStats>,
    surface: SurfaceHandle,
    join: JoinHandle<RenderStats>,
}

impl SchedulerHandle {
    pub fn set_filter(&self, color: FilterColor) {
        self.filter_tx.send_replace(color);
    }

    pub fn filter(&self) -> FilterColor {
        *self.filter_tx.borrow()
    }

    pub fn stats(&self) -> watch::Receiver<RenderStats> {
        self.stats_rx.clone()
    }

    pub fn surface(&self) -> SurfaceHandle {
        self.surface.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Disarms the loop and waits for it to exit.
    pub async fn stop(self) -> Result<RenderStats> {
        self.armed_tx.send_replace(false);
        self.join
            .await
            .map_err(|err| render_error(format!("render task failed: {err}")))
    }
}

pub fn render_error(message: impl Into<String>) -> TintcamError {
    TintcamError::Render(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };
    use tintcam_hub::LocalHub;
    use tintcam_source::SourceMetrics;
    use tintcam_types::events::EventPayload;

    const GOLD: [u8; 3] = [0xA8, 0x79, 0x32];

    #[derive(Clone, Default)]
    struct SharedSource {
        frame: Arc<Mutex<Option<VideoFrame>>>,
    }

    impl SharedSource {
        fn showing(frame: VideoFrame) -> Self {
            let source = Self::default();
            source.show(frame);
            source
        }

        fn show(&self, frame: VideoFrame) {
            *self.frame.lock().expect("frame lock") = Some(frame);
        }
    }

    #[async_trait]
    impl FrameSource for SharedSource {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn current_frame(&self) -> Option<VideoFrame> {
            self.frame.lock().expect("frame lock").clone()
        }

        fn resolution(&self) -> (u32, u32) {
            self.current_frame()
                .map(|f| f.dimensions())
                .unwrap_or((0, 0))
        }

        fn metrics(&self) -> SourceMetrics {
            SourceMetrics::default()
        }
    }

    enum Reply {
        Matching,
        Miss,
        Fail,
    }

    /// Answers with a full-foreground mask sized to the frame unless scripted otherwise.
    #[derive(Default)]
    struct ScriptedProvider {
        calls: AtomicUsize,
        replies: Mutex<VecDeque<Reply>>,
        delay: Option<Duration>,
    }

    impl ScriptedProvider {
        fn with_replies(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Self::default()
            }
        }

        fn delayed(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MaskProvider for ScriptedProvider {
        async fn load(&self) -> Result<()> {
            Ok(())
        }

        async fn segment(&self, frame: &VideoFrame) -> Result<Option<SegmentationMask>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                time::sleep(delay).await;
            }
            let reply = self
                .replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or(Reply::Matching);
            match reply {
                Reply::Matching => Ok(Some(SegmentationMask::filled(
                    frame.width(),
                    frame.height(),
                    SegmentationMask::FOREGROUND,
                ))),
                Reply::Miss => Ok(None),
                Reply::Fail => Err(tintcam_vision::vision_error("backend lost")),
            }
        }

        fn dispose(&self) {}

        fn is_ready(&self) -> bool {
            true
        }
    }

    fn frame(width: u32, height: u32) -> VideoFrame {
        VideoFrame::solid(width, height, [50, 60, 70, 255])
    }

    fn scheduler(
        render: RenderConfig,
        source: SharedSource,
        provider: Arc<ScriptedProvider>,
    ) -> RenderScheduler<SharedSource, LocalHub> {
        RenderScheduler::new(
            &render,
            &VisionConfig::default(),
            source,
            provider,
            LocalHub::new(64),
        )
    }

    #[tokio::test]
    async fn modulus_two_segments_every_other_ready_tick() {
        let provider = Arc::new(ScriptedProvider::default());
        let mut scheduler = scheduler(
            RenderConfig::default(),
            SharedSource::showing(frame(4, 2)),
            Arc::clone(&provider),
        );

        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(scheduler.tick().await);
        }

        assert_eq!(provider.calls(), 3);
        assert_eq!(
            outcomes,
            vec![
                TickOutcome::Presented { fresh: true },
                TickOutcome::Presented { fresh: false },
                TickOutcome::Presented { fresh: true },
                TickOutcome::Presented { fresh: false },
                TickOutcome::Presented { fresh: true },
                TickOutcome::Presented { fresh: false },
            ]
        );
        let stats = scheduler.stats();
        assert_eq!((stats.fresh_masks, stats.reused_masks, stats.composites), (3, 3, 6));
    }

    #[tokio::test]
    async fn not_ready_ticks_do_not_advance_cadence() {
        let provider = Arc::new(ScriptedProvider::default());
        let source = SharedSource::showing(frame(4, 2).with_ready(false));
        let mut scheduler = scheduler(RenderConfig::default(), source.clone(), Arc::clone(&provider));

        assert_eq!(scheduler.tick().await, TickOutcome::NotReady);
        assert_eq!(scheduler.tick().await, TickOutcome::NotReady);
        assert_eq!(provider.calls(), 0);
        assert!(scheduler.surface().snapshot().expect("surface").is_empty());

        source.show(frame(4, 2));
        assert_eq!(scheduler.tick().await, TickOutcome::Presented { fresh: true });
        assert_eq!(provider.calls(), 1);
        assert_eq!(scheduler.stats().not_ready_ticks, 2);
        assert_eq!(scheduler.stats().fps, 0);
    }

    #[tokio::test]
    async fn missing_frame_is_not_ready() {
        let provider = Arc::new(ScriptedProvider::default());
        let mut scheduler = scheduler(RenderConfig::default(), SharedSource::default(), provider);
        assert_eq!(scheduler.tick().await, TickOutcome::NotReady);
    }

    #[tokio::test]
    async fn soft_miss_falls_back_to_cached_mask() {
        let provider = Arc::new(ScriptedProvider::with_replies(vec![
            Reply::Matching,
            Reply::Miss,
            Reply::Fail,
        ]));
        let render = RenderConfig {
            segment_every: 1,
            ..RenderConfig::default()
        };
        let mut scheduler = scheduler(render, SharedSource::showing(frame(4, 2)), Arc::clone(&provider));

        assert_eq!(scheduler.tick().await, TickOutcome::Presented { fresh: true });
        assert_eq!(scheduler.tick().await, TickOutcome::Presented { fresh: false });
        assert_eq!(scheduler.tick().await, TickOutcome::Presented { fresh: false });
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn no_mask_leaves_surface_untouched() {
        let provider = Arc::new(ScriptedProvider::with_replies(vec![Reply::Miss]));
        let mut scheduler = scheduler(
            RenderConfig::default(),
            SharedSource::showing(frame(4, 2)),
            provider,
        );

        assert_eq!(scheduler.tick().await, TickOutcome::Skipped(SkipReason::NoMask));
        assert_eq!(scheduler.tick().await, TickOutcome::Skipped(SkipReason::NoMask));
        assert!(scheduler.surface().snapshot().expect("surface").is_empty());
        assert_eq!(scheduler.stats().skipped_composites, 2);
    }

    #[tokio::test]
    async fn resolution_change_drops_stale_mask_without_drawing() {
        let provider = Arc::new(ScriptedProvider::with_replies(vec![
            Reply::Matching,
            Reply::Miss,
        ]));
        let source = SharedSource::showing(frame(4, 2));
        let mut scheduler = scheduler(RenderConfig::default(), source.clone(), provider);

        assert_eq!(scheduler.tick().await, TickOutcome::Presented { fresh: true });
        let before = scheduler.surface().snapshot().expect("surface");

        source.show(frame(8, 4));
        assert_eq!(
            scheduler.tick().await,
            TickOutcome::Skipped(SkipReason::MaskMismatch)
        );
        assert_eq!(scheduler.surface().snapshot().expect("surface"), before);

        // the next segmenting tick misses and nothing is cached any more
        assert_eq!(scheduler.tick().await, TickOutcome::Skipped(SkipReason::NoMask));
    }

    #[tokio::test]
    async fn filter_change_applies_on_next_tick() {
        let provider = Arc::new(ScriptedProvider::with_replies(vec![Reply::Miss, Reply::Miss]));
        let mut scheduler = scheduler(
            RenderConfig {
                segment_every: 1,
                ..RenderConfig::default()
            },
            SharedSource::showing(frame(1, 1)),
            provider,
        );
        scheduler.cache.record_mask(SegmentationMask::filled(1, 1, 0));

        assert_eq!(scheduler.tick().await, TickOutcome::Presented { fresh: false });
        let surface = scheduler.surface().snapshot().expect("surface");
        assert_eq!(&surface.pixels()[..3], &GOLD);

        scheduler.set_filter(FilterColor::new(1, 2, 3));
        scheduler.tick().await;
        let surface = scheduler.surface().snapshot().expect("surface");
        assert_eq!(surface.pixels(), &[1, 2, 3, 255]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_mask_feeds_a_later_tick_only() {
        let provider = Arc::new(ScriptedProvider::delayed(Duration::from_millis(50)));
        let render = RenderConfig {
            inference_budget_ms: Some(10),
            ..RenderConfig::default()
        };
        let mut scheduler = scheduler(render, SharedSource::showing(frame(4, 2)), Arc::clone(&provider));

        // budget elapses before the mask arrives
        assert_eq!(scheduler.tick().await, TickOutcome::Skipped(SkipReason::NoMask));
        assert_eq!(scheduler.tick().await, TickOutcome::Skipped(SkipReason::NoMask));
        // segmenting tick with a request still in flight does not start another
        assert_eq!(scheduler.tick().await, TickOutcome::Skipped(SkipReason::NoMask));
        assert_eq!(provider.calls(), 1);

        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(scheduler.tick().await, TickOutcome::Presented { fresh: false });
        assert_eq!(scheduler.stats().late_masks, 1);
        assert_eq!(scheduler.stats().fresh_masks, 0);
    }

    #[tokio::test]
    async fn presented_ticks_publish_fps() {
        let provider = Arc::new(ScriptedProvider::default());
        let hub = LocalHub::new(64);
        let mut fps_events = hub.subscribe_kind(tintcam_types::events::EventKind::Fps);
        let mut scheduler = RenderScheduler::new(
            &RenderConfig::default(),
            &VisionConfig::default(),
            SharedSource::showing(frame(2, 2)),
            provider,
            hub,
        );
        let stats = scheduler.subscribe_stats();

        scheduler.tick().await;
        std::thread::sleep(Duration::from_millis(5));
        scheduler.tick().await;

        let event = fps_events.next().await.expect("fps event");
        assert!(matches!(event.payload, EventPayload::Fps(fps) if fps.fps > 0));
        assert_eq!(stats.borrow().composites, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_halts_the_loop() {
        let provider = Arc::new(ScriptedProvider::default());
        let handle = scheduler(
            RenderConfig::default(),
            SharedSource::showing(frame(4, 2)),
            Arc::clone(&provider),
        )
        .spawn();
        assert!(handle.is_running());

        time::sleep(Duration::from_millis(200)).await;
        let stats = handle.stop().await.expect("stop");
        assert!(stats.composites > 0);

        let calls = provider.calls();
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(provider.calls(), calls);
    }

    #[tokio::test]
    async fn handle_exposes_filter_and_stats() {
        let provider = Arc::new(ScriptedProvider::default());
        let handle = scheduler(
            RenderConfig::default(),
            SharedSource::showing(frame(4, 2)),
            provider,
        )
        .spawn();

        assert_eq!(handle.filter(), FilterColor::default());
        handle.set_filter(FilterColor::BLACK);
        assert_eq!(handle.filter(), FilterColor::BLACK);

        let mut stats = handle.stats();
        stats.changed().await.expect("stats update");
        assert!(stats.borrow().ticks > 0);
        assert!(handle.surface().snapshot().is_ok());
        handle.stop().await.expect("stop");
    }
}
