//! Multi-channel front ends over [`ChannelPipeline`].
//!
//! [`VitalMonitor`] processes on the caller's thread; [`IngestService`]
//! queues batches per channel and processes them on a worker thread each.

use crate::config::PipelineConfig;
use crate::error::{ProcessingError, Result};
use crate::estimator::VitalSignEstimate;
use crate::pipeline::{CabinContext, ChannelPipeline, WindowReport};
use crate::risk::{RiskState, RiskTransition};
use crate::{ChannelId, IQSample};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cabin facts supplied by the surrounding system.
pub trait OccupancySource: Send + Sync {
    fn occupancy_signal(&self, channel: &ChannelId) -> bool;

    fn elapsed_unattended(&self, channel: &ChannelId) -> Duration;

    fn cabin_temperature(&self, _channel: &ChannelId) -> Option<f64> {
        None
    }
}

fn cabin_context(source: &dyn OccupancySource, channel: &ChannelId) -> CabinContext {
    CabinContext {
        occupied: source.occupancy_signal(channel),
        unattended: source.elapsed_unattended(channel),
        cabin_temperature: source.cabin_temperature(channel),
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Same answer for every channel, changeable at runtime.
#[derive(Debug, Default)]
pub struct StaticOccupancy {
    state: RwLock<CabinContext>,
}

impl StaticOccupancy {
    pub fn new(occupied: bool, unattended: Duration, cabin_temperature: Option<f64>) -> Self {
        Self {
            state: RwLock::new(CabinContext {
                occupied,
                unattended,
                cabin_temperature,
            }),
        }
    }

    pub fn set_occupied(&self, occupied: bool) {
        write(&self.state).occupied = occupied;
    }

    pub fn set_unattended(&self, unattended: Duration) {
        write(&self.state).unattended = unattended;
    }

    pub fn set_cabin_temperature(&self, temperature: Option<f64>) {
        write(&self.state).cabin_temperature = temperature;
    }
}

impl OccupancySource for StaticOccupancy {
    fn occupancy_signal(&self, _channel: &ChannelId) -> bool {
        read(&self.state).occupied
    }

    fn elapsed_unattended(&self, _channel: &ChannelId) -> Duration {
        read(&self.state).unattended
    }

    fn cabin_temperature(&self, _channel: &ChannelId) -> Option<f64> {
        read(&self.state).cabin_temperature
    }
}

fn check_rate(sampling_rate: f64) -> Result<()> {
    if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
        return Err(ProcessingError::InvalidSampleRate(sampling_rate));
    }
    Ok(())
}

fn channel_config(config: &PipelineConfig, sampling_rate: f64) -> PipelineConfig {
    let mut config = config.clone();
    config.window.sampling_rate = sampling_rate;
    config
}

fn to_iq(samples: &[(f64, f64)]) -> Vec<IQSample> {
    samples.iter().copied().map(IQSample::from).collect()
}

type SharedPipeline = Arc<Mutex<ChannelPipeline>>;

/// Synchronous multi-channel API. Windows of one channel are processed in
/// arrival order; different channels proceed in parallel on the callers' threads.
pub struct VitalMonitor {
    config: PipelineConfig,
    occupancy: Arc<dyn OccupancySource>,
    channels: RwLock<HashMap<ChannelId, SharedPipeline>>,
    stream_start: Option<DateTime<Utc>>,
}

impl VitalMonitor {
    pub fn new(config: PipelineConfig, occupancy: Arc<dyn OccupancySource>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            occupancy,
            channels: RwLock::new(HashMap::new()),
            stream_start: None,
        })
    }

    /// Anchor every new channel's time axis at `start` instead of the wall clock.
    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.stream_start = Some(start);
        self
    }

    /// Buffer samples for `channel` and analyse every window they complete.
    ///
    /// Returns the smoothed reading after the last completed window (the raw
    /// window reading while no smoothed one exists), or `None` if no window
    /// completed.
    pub fn submit_samples(
        &self,
        channel: &ChannelId,
        samples: &[(f64, f64)],
        sampling_rate: f64,
    ) -> Result<Option<VitalSignEstimate>> {
        let mut reports = self.submit_reports(channel, samples, sampling_rate)?;
        Ok(reports
            .pop()
            .map(|report| report.aggregated.unwrap_or(report.estimate)))
    }

    /// Like [`submit_samples`](Self::submit_samples) but returns every window report.
    pub fn submit_reports(
        &self,
        channel: &ChannelId,
        samples: &[(f64, f64)],
        sampling_rate: f64,
    ) -> Result<Vec<WindowReport>> {
        check_rate(sampling_rate)?;
        let pipeline = self.pipeline_for(channel, sampling_rate)?;
        let cabin = cabin_context(self.occupancy.as_ref(), channel);
        let mut pipeline = lock(&pipeline);
        pipeline.push_samples(&to_iq(samples), &cabin)
    }

    /// Flush the channel's trailing short window.
    pub fn finish_channel(&self, channel: &ChannelId) -> Result<Option<WindowReport>> {
        let pipeline = self
            .get(channel)
            .ok_or_else(|| ProcessingError::ChannelClosed(channel.clone()))?;
        let cabin = cabin_context(self.occupancy.as_ref(), channel);
        let mut pipeline = lock(&pipeline);
        Ok(pipeline.finish(&cabin))
    }

    fn get(&self, channel: &ChannelId) -> Option<SharedPipeline> {
        read(&self.channels).get(channel).cloned()
    }

    fn pipeline_for(&self, channel: &ChannelId, sampling_rate: f64) -> Result<SharedPipeline> {
        if let Some(pipeline) = self.get(channel) {
            let expected = lock(&pipeline).sampling_rate();
            if expected != sampling_rate {
                return Err(ProcessingError::SampleRateMismatch {
                    expected,
                    actual: sampling_rate,
                });
            }
            return Ok(pipeline);
        }

        let mut channels = write(&self.channels);
        // another caller may have created it meanwhile
        if let Some(pipeline) = channels.get(channel) {
            return Ok(Arc::clone(pipeline));
        }
        let pipeline = ChannelPipeline::new(
            channel.clone(),
            &channel_config(&self.config, sampling_rate),
            self.stream_start.unwrap_or_else(Utc::now),
        )?;
        info!("Channel {} opened at {} Hz", channel, sampling_rate);
        let pipeline = Arc::new(Mutex::new(pipeline));
        channels.insert(channel.clone(), Arc::clone(&pipeline));
        Ok(pipeline)
    }

    /// `None` for channels that never received samples.
    pub fn current_risk(&self, channel: &ChannelId) -> Option<RiskState> {
        self.get(channel).map(|p| lock(&p).risk_state())
    }

    /// Initial state followed by every state entered, oldest first.
    pub fn risk_history(&self, channel: &ChannelId) -> Vec<RiskState> {
        self.get(channel)
            .map(|p| lock(&p).risk_history())
            .unwrap_or_default()
    }

    pub fn transitions(&self, channel: &ChannelId) -> Vec<RiskTransition> {
        self.get(channel)
            .map(|p| lock(&p).transitions())
            .unwrap_or_default()
    }

    pub fn latest_estimate(&self, channel: &ChannelId) -> Option<VitalSignEstimate> {
        self.get(channel).and_then(|p| lock(&p).latest_estimate())
    }

    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = read(&self.channels).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn remove_channel(&self, channel: &ChannelId) -> bool {
        write(&self.channels).remove(channel).is_some()
    }
}

/// What to do with a batch when a channel's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new batch with `BufferOverflow`.
    RejectNew,
    /// Discard the oldest queued batch to make room.
    DropOldest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Batches waiting per channel
    pub capacity: usize,
    /// Reports waiting to be collected
    pub results_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            results_capacity: 256,
            overflow: OverflowPolicy::RejectNew,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || self.results_capacity == 0 {
            return Err(ProcessingError::config("queue capacities must be at least 1"));
        }
        Ok(())
    }
}

/// Latest published state of one channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelSnapshot {
    pub risk: Option<RiskState>,
    pub history: Vec<RiskState>,
    pub latest: Option<VitalSignEstimate>,
    pub windows_processed: u64,
    pub last_error: Option<ProcessingError>,
}

/// A queued batch and the stream index of its first sample.
struct QueuedBatch {
    offset: u64,
    samples: Vec<IQSample>,
}

struct ChannelWorker {
    sender: Sender<QueuedBatch>,
    /// Kept to evict the oldest batch under `DropOldest`
    receiver: Receiver<QueuedBatch>,
    cancelled: Arc<AtomicBool>,
    snapshot: Arc<RwLock<ChannelSnapshot>>,
    sampling_rate: f64,
    /// Stream index the next accepted batch starts at
    next_offset: u64,
    handle: Option<JoinHandle<()>>,
}

impl ChannelWorker {
    /// Returns false if the worker thread panicked.
    fn stop(mut self, cancel: bool) -> bool {
        if cancel {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        let handle = self.handle.take();
        // disconnect so the worker's recv() ends once the queue is empty
        drop(self);
        handle.map_or(true, |handle| handle.join().is_ok())
    }
}

/// Queued ingestion: `ingest` never blocks; a worker per channel runs the pipeline.
pub struct IngestService {
    config: PipelineConfig,
    occupancy: Arc<dyn OccupancySource>,
    workers: Mutex<HashMap<ChannelId, ChannelWorker>>,
    results_tx: Sender<WindowReport>,
    results_rx: Receiver<WindowReport>,
    stream_start: Option<DateTime<Utc>>,
    dropped_batches: AtomicU64,
    rejected_batches: AtomicU64,
    dropped_results: Arc<AtomicU64>,
    failed_workers: AtomicU64,
}

impl IngestService {
    pub fn new(config: PipelineConfig, occupancy: Arc<dyn OccupancySource>) -> Result<Self> {
        config.validate()?;
        let (results_tx, results_rx) = bounded(config.queue.results_capacity);
        Ok(Self {
            config,
            occupancy,
            workers: Mutex::new(HashMap::new()),
            results_tx,
            results_rx,
            stream_start: None,
            dropped_batches: AtomicU64::new(0),
            rejected_batches: AtomicU64::new(0),
            dropped_results: Arc::new(AtomicU64::new(0)),
            failed_workers: AtomicU64::new(0),
        })
    }

    pub fn starting_at(mut self, start: DateTime<Utc>) -> Self {
        self.stream_start = Some(start);
        self
    }

    /// Queue a batch for `channel`, creating the channel on first use.
    pub fn ingest(
        &self,
        channel: &ChannelId,
        samples: &[(f64, f64)],
        sampling_rate: f64,
    ) -> Result<()> {
        check_rate(sampling_rate)?;
        let mut workers = lock(&self.workers);
        if !workers.contains_key(channel) {
            let worker = self.spawn_worker(channel, sampling_rate)?;
            workers.insert(channel.clone(), worker);
        }
        let Some(worker) = workers.get_mut(channel) else {
            return Err(ProcessingError::ChannelClosed(channel.clone()));
        };
        if worker.sampling_rate != sampling_rate {
            return Err(ProcessingError::SampleRateMismatch {
                expected: worker.sampling_rate,
                actual: sampling_rate,
            });
        }

        let batch = QueuedBatch {
            offset: worker.next_offset,
            samples: to_iq(samples),
        };
        let len = batch.samples.len() as u64;
        match worker.sender.try_send(batch) {
            Ok(()) => {
                worker.next_offset += len;
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(ProcessingError::ChannelClosed(channel.clone()))
            }
            Err(TrySendError::Full(batch)) => match self.config.queue.overflow {
                OverflowPolicy::RejectNew => {
                    self.rejected_batches.fetch_add(1, Ordering::Relaxed);
                    Err(ProcessingError::BufferOverflow {
                        pending: worker.sender.len(),
                        limit: self.config.queue.capacity,
                    })
                }
                OverflowPolicy::DropOldest => {
                    if worker.receiver.try_recv().is_ok() {
                        self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                        warn!("Channel {} queue full, dropped oldest batch", channel);
                    }
                    match worker.sender.try_send(batch) {
                        Ok(()) => {
                            worker.next_offset += len;
                            Ok(())
                        }
                        Err(TrySendError::Full(_)) => {
                            // the stream still moved on; the worker sees the gap
                            worker.next_offset += len;
                            self.dropped_batches.fetch_add(1, Ordering::Relaxed);
                            warn!("Channel {} queue still full, dropped new batch", channel);
                            Ok(())
                        }
                        Err(TrySendError::Disconnected(_)) => {
                            Err(ProcessingError::ChannelClosed(channel.clone()))
                        }
                    }
                }
            },
        }
    }

    fn spawn_worker(&self, channel: &ChannelId, sampling_rate: f64) -> Result<ChannelWorker> {
        let mut pipeline = ChannelPipeline::new(
            channel.clone(),
            &channel_config(&self.config, sampling_rate),
            self.stream_start.unwrap_or_else(Utc::now),
        )?;
        let (sender, receiver) = bounded::<QueuedBatch>(self.config.queue.capacity);
        let cancelled = Arc::new(AtomicBool::new(false));
        let snapshot = Arc::new(RwLock::new(ChannelSnapshot {
            risk: Some(pipeline.risk_state()),
            history: pipeline.risk_history(),
            ..ChannelSnapshot::default()
        }));

        let handle = {
            let receiver = receiver.clone();
            let cancelled = Arc::clone(&cancelled);
            let snapshot = Arc::clone(&snapshot);
            let occupancy = Arc::clone(&self.occupancy);
            let results = self.results_tx.clone();
            let dropped_results = Arc::clone(&self.dropped_results);
            let channel = channel.clone();

            thread::spawn(move || {
                debug!("Worker for channel {} started", channel);
                // one hop never completes more than one window, so the backlog cannot overflow
                let chunk = pipeline.hop_len().max(1);
                'batches: while let Ok(QueuedBatch { offset, samples }) = receiver.recv() {
                    let expected = pipeline.samples_seen();
                    if offset > expected {
                        warn!(
                            "Channel {}: {} samples dropped before stream index {}",
                            channel,
                            offset - expected,
                            offset
                        );
                        pipeline.skip_samples(offset - expected);
                    }
                    for part in samples.chunks(chunk) {
                        if cancelled.load(Ordering::SeqCst) {
                            break 'batches;
                        }
                        let cabin = cabin_context(occupancy.as_ref(), &channel);
                        match pipeline.push_samples(part, &cabin) {
                            Ok(reports) => {
                                let mut snap = write(&snapshot);
                                for report in reports {
                                    snap.windows_processed += 1;
                                    snap.risk = Some(report.risk);
                                    if results.try_send(report).is_err() {
                                        dropped_results.fetch_add(1, Ordering::Relaxed);
                                    }
                                }
                                snap.history = pipeline.risk_history();
                                snap.latest = pipeline.latest_estimate();
                            }
                            Err(e) => {
                                warn!("Channel {}: {}", channel, e);
                                write(&snapshot).last_error = Some(e);
                            }
                        }
                    }
                }
                debug!("Worker for channel {} stopped", channel);
            })
        };

        info!("Channel {} opened at {} Hz (queued)", channel, sampling_rate);
        Ok(ChannelWorker {
            sender,
            receiver,
            cancelled,
            snapshot,
            sampling_rate,
            next_offset: 0,
            handle: Some(handle),
        })
    }

    /// Reports from every channel, in the order windows completed per channel.
    pub fn results(&self) -> &Receiver<WindowReport> {
        &self.results_rx
    }

    pub fn snapshot(&self, channel: &ChannelId) -> Option<ChannelSnapshot> {
        lock(&self.workers)
            .get(channel)
            .map(|w| read(&w.snapshot).clone())
    }

    pub fn current_risk(&self, channel: &ChannelId) -> Option<RiskState> {
        self.snapshot(channel).and_then(|s| s.risk)
    }

    pub fn risk_history(&self, channel: &ChannelId) -> Vec<RiskState> {
        self.snapshot(channel)
            .map(|s| s.history)
            .unwrap_or_default()
    }

    pub fn latest_estimate(&self, channel: &ChannelId) -> Option<VitalSignEstimate> {
        self.snapshot(channel).and_then(|s| s.latest)
    }

    pub fn queue_len(&self, channel: &ChannelId) -> usize {
        lock(&self.workers)
            .get(channel)
            .map_or(0, |w| w.sender.len())
    }

    pub fn dropped_batches(&self) -> u64 {
        self.dropped_batches.load(Ordering::Relaxed)
    }

    pub fn rejected_batches(&self) -> u64 {
        self.rejected_batches.load(Ordering::Relaxed)
    }

    pub fn dropped_results(&self) -> u64 {
        self.dropped_results.load(Ordering::Relaxed)
    }

    /// Worker threads that ended in a panic.
    pub fn failed_workers(&self) -> u64 {
        self.failed_workers.load(Ordering::Relaxed)
    }

    fn join_worker(&self, channel: &ChannelId, worker: ChannelWorker, cancel: bool) {
        if !worker.stop(cancel) {
            self.failed_workers.fetch_add(1, Ordering::Relaxed);
            warn!("Worker for channel {} panicked", channel);
        }
    }

    /// Cancel the channel's worker. Queued and in-flight batches are discarded.
    pub fn remove_channel(&self, channel: &ChannelId) -> bool {
        let worker = lock(&self.workers).remove(channel);
        match worker {
            Some(worker) => {
                self.join_worker(channel, worker, true);
                info!("Channel {} removed", channel);
                true
            }
            None => false,
        }
    }

    /// Close every queue, let workers finish what is queued, and join them.
    pub fn shutdown(&self) {
        let workers: Vec<_> = lock(&self.workers).drain().collect();
        for (channel, worker) in workers {
            self.join_worker(&channel, worker, false);
            debug!("Channel {} shut down", channel);
        }
    }
}

impl Drop for IngestService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowConfig;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            window: WindowConfig {
                sampling_rate: 20.0,
                window_seconds: 30.0,
                ..WindowConfig::default()
            },
            ..PipelineConfig::default()
        }
    }

    fn unit_samples(n: usize) -> Vec<(f64, f64)> {
        (0..n)
            .map(|k| {
                let phi = 0.5 * (k as f64 * 0.1).sin();
                (phi.cos(), phi.sin())
            })
            .collect()
    }

    fn occupancy() -> Arc<StaticOccupancy> {
        Arc::new(StaticOccupancy::new(true, Duration::ZERO, None))
    }

    /// Blocks the worker inside `occupancy_signal` until the gate is released.
    struct GatedOccupancy {
        entered: Sender<()>,
        gate: Receiver<()>,
    }

    impl OccupancySource for GatedOccupancy {
        fn occupancy_signal(&self, _channel: &ChannelId) -> bool {
            let _ = self.entered.send(());
            let _ = self.gate.recv();
            true
        }

        fn elapsed_unattended(&self, _channel: &ChannelId) -> Duration {
            Duration::ZERO
        }
    }

    #[test]
    fn unknown_channel_has_no_risk() {
        let monitor = VitalMonitor::new(config(), occupancy()).unwrap();
        let id = ChannelId::from("rear");
        assert!(monitor.current_risk(&id).is_none());
        assert!(monitor.risk_history(&id).is_empty());
    }

    #[test]
    fn first_submission_fixes_rate() {
        let monitor = VitalMonitor::new(config(), occupancy()).unwrap();
        let id = ChannelId::from("rear");
        assert_eq!(monitor.submit_samples(&id, &unit_samples(100), 20.0).unwrap(), None);
        let err = monitor.submit_samples(&id, &unit_samples(100), 50.0).unwrap_err();
        assert_eq!(
            err,
            ProcessingError::SampleRateMismatch {
                expected: 20.0,
                actual: 50.0
            }
        );
    }

    #[test]
    fn invalid_rate_is_rejected() {
        let monitor = VitalMonitor::new(config(), occupancy()).unwrap();
        let id = ChannelId::from("rear");
        assert_eq!(
            monitor.submit_samples(&id, &[], 0.0).unwrap_err(),
            ProcessingError::InvalidSampleRate(0.0)
        );
        assert!(monitor.channels().is_empty());
    }

    #[test]
    fn completed_window_returns_reading() {
        let monitor = VitalMonitor::new(config(), occupancy())
            .unwrap()
            .starting_at(start());
        let id = ChannelId::from("rear");
        let reading = monitor
            .submit_samples(&id, &unit_samples(600), 20.0)
            .unwrap()
            .unwrap();
        assert_eq!(reading.timestamp, start());
        assert_eq!(monitor.risk_history(&id).len(), monitor.transitions(&id).len() + 1);
    }

    #[test]
    fn channels_run_in_parallel() {
        let monitor = VitalMonitor::new(config(), occupancy()).unwrap();
        thread::scope(|scope| {
            for name in ["a", "b", "c"] {
                let monitor = &monitor;
                scope.spawn(move || {
                    let id = ChannelId::from(name);
                    for batch in unit_samples(1200).chunks(300) {
                        monitor.submit_samples(&id, batch, 20.0).unwrap();
                    }
                });
            }
        });
        assert_eq!(monitor.channels().len(), 3);
        assert!(monitor.current_risk(&"b".into()).is_some());
    }

    #[test]
    fn ingest_publishes_reports() {
        let service = IngestService::new(config(), occupancy())
            .unwrap()
            .starting_at(start());
        let id = ChannelId::from("front");
        for batch in unit_samples(1200).chunks(400) {
            service.ingest(&id, batch, 20.0).unwrap();
        }
        service.shutdown();
        let reports: Vec<_> = service.results().try_iter().collect();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].window_start, start() + chrono::Duration::seconds(30));
    }

    fn gated_service(
        policy: OverflowPolicy,
        capacity: usize,
    ) -> (IngestService, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
        let mut cfg = config();
        cfg.queue.capacity = capacity;
        cfg.queue.overflow = policy;
        let service = IngestService::new(
            cfg,
            Arc::new(GatedOccupancy {
                entered: entered_tx,
                gate: gate_rx,
            }),
        )
        .unwrap()
        .starting_at(start());
        (service, entered_rx, gate_tx)
    }

    #[test]
    fn full_queue_rejects_new_batch() {
        let (service, entered, gate) = gated_service(OverflowPolicy::RejectNew, 2);
        let id = ChannelId::from("front");
        let batch = unit_samples(200);

        service.ingest(&id, &batch, 20.0).unwrap();
        entered.recv().unwrap();
        service.ingest(&id, &batch, 20.0).unwrap();
        service.ingest(&id, &batch, 20.0).unwrap();
        let err = service.ingest(&id, &batch, 20.0).unwrap_err();
        assert_eq!(
            err,
            ProcessingError::BufferOverflow {
                pending: 2,
                limit: 2
            }
        );
        assert_eq!(service.rejected_batches(), 1);

        drop(gate);
        service.shutdown();
        assert_eq!(service.results().try_iter().count(), 1);
    }

    #[test]
    fn full_queue_drops_oldest_batch() {
        let (service, entered, gate) = gated_service(OverflowPolicy::DropOldest, 2);
        let id = ChannelId::from("front");
        let batch = unit_samples(200);

        service.ingest(&id, &batch, 20.0).unwrap();
        entered.recv().unwrap();
        for _ in 0..3 {
            service.ingest(&id, &batch, 20.0).unwrap();
        }
        assert_eq!(service.dropped_batches(), 1);
        assert_eq!(service.queue_len(&id), 2);

        drop(gate);
        service.shutdown();
        assert_eq!(service.results().try_iter().count(), 1);
    }

    #[test]
    fn dropped_batches_leave_a_gap_in_window_time() {
        let (service, entered, gate) = gated_service(OverflowPolicy::DropOldest, 1);
        let id = ChannelId::from("front");
        let samples = unit_samples(2400);
        let batches: Vec<_> = samples.chunks(600).collect();

        // the worker holds the first batch while the rest contend for one slot
        service.ingest(&id, batches[0], 20.0).unwrap();
        entered.recv().unwrap();
        for batch in &batches[1..] {
            service.ingest(&id, batch, 20.0).unwrap();
        }
        assert_eq!(service.dropped_batches(), 2);

        drop(gate);
        service.shutdown();
        let starts: Vec<_> = service.results().try_iter().map(|r| r.window_start).collect();
        assert_eq!(
            starts,
            vec![start(), start() + chrono::Duration::seconds(90)]
        );
    }

    #[test]
    fn dropped_batch_discards_the_partial_window() {
        let (service, entered, gate) = gated_service(OverflowPolicy::DropOldest, 1);
        let id = ChannelId::from("front");
        let samples = unit_samples(1500);

        // 300 held, 300 dropped, 900 queued: no window may mix both sides of the gap
        service.ingest(&id, &samples[..300], 20.0).unwrap();
        entered.recv().unwrap();
        service.ingest(&id, &samples[300..600], 20.0).unwrap();
        service.ingest(&id, &samples[600..], 20.0).unwrap();
        assert_eq!(service.dropped_batches(), 1);

        drop(gate);
        service.shutdown();
        let reports: Vec<_> = service.results().try_iter().collect();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].window_start, start() + chrono::Duration::seconds(30));
    }

    struct FailingOccupancy;

    impl OccupancySource for FailingOccupancy {
        fn occupancy_signal(&self, _channel: &ChannelId) -> bool {
            panic!("occupancy sensor unavailable");
        }

        fn elapsed_unattended(&self, _channel: &ChannelId) -> Duration {
            Duration::ZERO
        }
    }

    #[test]
    fn panicked_worker_is_counted_on_shutdown() {
        let service = IngestService::new(config(), Arc::new(FailingOccupancy)).unwrap();
        let id = ChannelId::from("front");
        service.ingest(&id, &unit_samples(10), 20.0).unwrap();
        service.shutdown();
        assert_eq!(service.failed_workers(), 1);
        assert!(service.current_risk(&id).is_none());
    }

    #[test]
    fn removed_channel_is_gone() {
        let service = IngestService::new(config(), occupancy()).unwrap();
        let id = ChannelId::from("front");
        service.ingest(&id, &unit_samples(10), 20.0).unwrap();
        assert!(service.current_risk(&id).is_some());
        assert!(service.remove_channel(&id));
        assert!(service.current_risk(&id).is_none());
        assert!(!service.remove_channel(&id));
    }
}
