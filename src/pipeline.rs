use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;

use crate::background::{BackgroundAssetCache, CacheEvent};
use crate::capture::CaptureSource;
use crate::compositor;
use crate::config::PipelineConfig;
use crate::detection::DetectionState;
use crate::frame::{BackgroundMode, DetectionResult, SegmentationMask, VideoFrame};
use crate::offload::{ChannelEvent, OffloadChannel};
use crate::output::OutputSink;
use crate::scheduler::FrameScheduler;
use crate::segmentation::SegmentationEngine;

/// Where frames are processed: the local engine/compositor or the remote
/// offload worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingKind {
    Local,
    Remote,
}

impl std::fmt::Display for ProcessingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ProcessingKind::Local => "local",
            ProcessingKind::Remote => "remote",
        })
    }
}

impl std::str::FromStr for ProcessingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ProcessingKind::Local),
            "remote" => Ok(ProcessingKind::Remote),
            other => Err(format!("unknown processing kind: {other}")),
        }
    }
}

/// Requests from the hosting layer (CLI, UI) into the running pipeline.
#[derive(Debug, Clone, Copy)]
pub enum PipelineCommand {
    SetMode(BackgroundMode),
    SetProcessing(ProcessingKind),
    Reconnect,
    Stop,
}

/// The frame pipeline: capture, segmentation or offload, compositing,
/// detection. Three cooperative cycles share state here: the render loop,
/// the segmentation cadence, and the offload channel's inbound drain.
pub struct VideoPipeline<C: CaptureSource, O: OutputSink> {
    config: PipelineConfig,
    capture: C,
    output: O,
    engine: Option<SegmentationEngine>,
    channel: Option<OffloadChannel>,
    cache: BackgroundAssetCache,
    scheduler: FrameScheduler,
    detection: DetectionState,
    processing: ProcessingKind,
    mode: BackgroundMode,
    last_mask: Option<SegmentationMask>,
    last_segment_at: Option<Instant>,
    command_rx: Receiver<PipelineCommand>,
    frame_count: u64,
    stop_requested: bool,
    stopped: bool,
}

impl<C: CaptureSource, O: OutputSink> VideoPipeline<C, O> {
    pub fn new(
        config: PipelineConfig,
        capture: C,
        output: O,
        command_rx: Receiver<PipelineCommand>,
    ) -> Self {
        let cache = BackgroundAssetCache::new(config.backgrounds_dir.clone());
        let scheduler = FrameScheduler::new(config.render_interval);
        Self {
            config,
            capture,
            output,
            engine: None,
            channel: None,
            cache,
            scheduler,
            detection: DetectionState::new(),
            processing: ProcessingKind::Local,
            mode: BackgroundMode::None,
            last_mask: None,
            last_segment_at: None,
            command_rx,
            frame_count: 0,
            stop_requested: false,
            stopped: false,
        }
    }

    /// Attach a local segmentation engine.
    pub fn with_engine(mut self, engine: SegmentationEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Attach a remote offload channel. The channel is inert until
    /// processing is switched to remote.
    pub fn with_channel(mut self, channel: OffloadChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Select the initial processing path.
    pub fn with_processing(mut self, processing: ProcessingKind) -> Self {
        self.set_processing(processing);
        self
    }

    pub fn with_detection_callback(mut self, callback: Box<dyn FnMut(bool) + Send>) -> Self {
        self.detection = DetectionState::with_callback(callback);
        self
    }

    pub fn mode(&self) -> BackgroundMode {
        self.mode
    }

    pub fn processing(&self) -> ProcessingKind {
        self.processing
    }

    /// Switch between local and remote processing at runtime. Remote is
    /// refused when no offload channel is attached.
    pub fn set_processing(&mut self, processing: ProcessingKind) {
        if processing == self.processing {
            return;
        }
        if processing == ProcessingKind::Remote && self.channel.is_none() {
            tracing::warn!("no offload channel attached, staying on local processing");
            return;
        }
        tracing::info!("processing: {} -> {}", self.processing, processing);
        self.processing = processing;
    }

    pub fn person_detected(&self) -> bool {
        self.detection.current()
    }

    /// Switch the virtual background. Requesting the active mode again
    /// issues no asset load and no control message.
    pub fn set_mode(&mut self, mode: BackgroundMode) {
        if mode == self.mode {
            return;
        }
        tracing::info!("background mode: {} -> {}", self.mode, mode);
        self.mode = mode;
        self.cache.request(mode);
        if let Some(channel) = &mut self.channel {
            channel.set_mode(mode);
        }
    }

    /// Drive the pipeline until a stop command arrives.
    pub fn run(&mut self) -> Result<()> {
        tracing::info!("pipeline running ({} processing)", self.processing);

        while !self.stop_requested {
            if !self.cycle(Instant::now())? {
                thread::sleep(Duration::from_millis(1));
            }
        }

        self.stop();
        Ok(())
    }

    /// One scheduler-gated cycle. Returns false when the tick was not due
    /// (the caller may sleep).
    fn cycle(&mut self, now: Instant) -> Result<bool> {
        self.drain_commands();
        if self.stop_requested {
            return Ok(true);
        }

        if !self.scheduler.try_begin(now) {
            return Ok(false);
        }

        if let Some(CacheEvent::Failed(mode)) = self.cache.poll() {
            tracing::warn!("background asset for {mode} failed, reverting to none");
            self.set_mode(BackgroundMode::None);
        }

        let image = match self.capture.capture_frame() {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!("frame capture failed, skipping cycle: {err:#}");
                self.scheduler.abort();
                return Ok(false);
            }
        };
        let frame = VideoFrame::new(image);

        if self.processing == ProcessingKind::Remote && self.channel.is_some() {
            self.remote_cycle(&frame, now)?;
        } else {
            self.local_cycle(&frame, now)?;
        }

        self.scheduler.finish(Instant::now());
        self.frame_count += 1;
        if self.frame_count % 30 == 0 {
            let fps = self.scheduler.throughput(Instant::now());
            let mask_age_ms = self
                .last_mask
                .as_ref()
                .map(|m| m.produced_at.elapsed().as_millis())
                .unwrap_or(0);
            tracing::info!(
                "frame {}: {}x{}, {} cycles/s, {:.1}ms cycle, mask age {}ms, mode={}, person={}",
                self.frame_count,
                frame.width(),
                frame.height(),
                fps,
                frame.captured_at.elapsed().as_secs_f64() * 1000.0,
                mask_age_ms,
                self.mode,
                self.detection.current()
            );
        }

        Ok(true)
    }

    /// Local path: poll the engine, feed it at its own cadence, composite
    /// with whatever mask is newest.
    fn local_cycle(&mut self, frame: &VideoFrame, now: Instant) -> Result<()> {
        if let Some(engine) = &mut self.engine {
            if let Some((mask, detection)) = engine.poll() {
                self.last_mask = Some(mask);
                self.detection.update(&detection);
            }

            let due = self
                .last_segment_at
                .map_or(true, |at| now.duration_since(at) >= self.config.segment_interval);
            if due && engine.submit(&frame.image, self.mode) {
                self.last_segment_at = Some(now);
            }
        }

        let surface = compositor::composite(
            &frame.image,
            self.last_mask.as_ref(),
            self.mode,
            &mut self.cache,
            self.config.blur_sigma,
        );
        self.output
            .write_frame(&surface)
            .context("failed to write composited frame")
    }

    /// Remote path: advance the channel, draw returned frames, ship the
    /// current frame, degrade to a dimmed passthrough while reconnecting.
    fn remote_cycle(&mut self, frame: &VideoFrame, now: Instant) -> Result<()> {
        let (events, pending_retry, open) = match self.channel.as_mut() {
            Some(channel) => (
                channel.tick(now),
                channel.is_pending_retry(),
                channel.is_open(),
            ),
            None => return Ok(()),
        };

        let mut drew = false;
        for event in events {
            match event {
                ChannelEvent::Opened => {}
                ChannelEvent::Ack(mode) => {
                    tracing::debug!("worker acknowledged mode {mode}");
                }
                ChannelEvent::Frame { meta, image } => {
                    let surface = if self.mode == BackgroundMode::None
                        && meta.mode == BackgroundMode::None
                    {
                        // Idle passthrough: nothing to composite remotely.
                        compositor::passthrough(&frame.image)
                    } else {
                        match image::load_from_memory(&image) {
                            Ok(decoded) => decoded.to_rgba8(),
                            Err(err) => {
                                tracing::warn!(
                                    "returned frame failed to decode, drawing raw feed: {err}"
                                );
                                compositor::passthrough(&frame.image)
                            }
                        }
                    };
                    self.output
                        .write_frame(&surface)
                        .context("failed to write processed frame")?;
                    drew = true;

                    self.detection.update(&DetectionResult {
                        is_person_detected: meta.is_person_detected,
                        percentage: meta.percentage,
                        mode: meta.mode,
                    });
                }
            }
        }

        if !drew {
            if pending_retry {
                // Keep the surface alive while the channel waits to retry.
                self.output
                    .write_frame(&compositor::dimmed(&frame.image))
                    .context("failed to write reconnect frame")?;
            } else if !open {
                // Handshake still in flight: show the raw feed undimmed.
                self.output
                    .write_frame(&compositor::passthrough(&frame.image))
                    .context("failed to write connecting frame")?;
            }
        }

        if let Some(channel) = &mut self.channel {
            channel.send_frame(&frame.image);
        }

        Ok(())
    }

    fn drain_commands(&mut self) {
        loop {
            let Ok(command) = self.command_rx.try_recv() else {
                break;
            };
            match command {
                PipelineCommand::SetMode(mode) => self.set_mode(mode),
                PipelineCommand::SetProcessing(processing) => self.set_processing(processing),
                PipelineCommand::Reconnect => {
                    if let Some(channel) = &mut self.channel {
                        channel.request_reconnect();
                    }
                }
                PipelineCommand::Stop => self.stop_requested = true,
            }
        }
    }

    /// Tear everything down: segmentation worker, capture tracks, offload
    /// channel, asset loader. Idempotent and safe from any teardown path.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stop_requested = true;

        if let Some(engine) = &mut self.engine {
            engine.shutdown();
        }
        self.capture.stop();
        if let Some(channel) = &mut self.channel {
            channel.dispose();
        }
        self.cache.shutdown();
        tracing::info!("pipeline stopped");
    }
}

impl<C: CaptureSource, O: OutputSink> Drop for VideoPipeline<C, O> {
    fn drop(&mut self) {
        self.stop();
    }
}
