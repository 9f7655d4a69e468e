use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use crate::channel::{ChannelEvent, ChannelStatus, ProgressMessage};
use super::admission::admit;
use super::client::{StorageUsage, UploadApi};
use super::errors::{Result, UploadError};
use super::source::FileHandle;
use super::task::UploadTask;
use super::telemetry::{eta, TaskTelemetry};
use super::types::{
    AdmissionReport, ManagerCommand, QueueSummary, RejectedFile, UploadConfig, UploadEvent, UploadId, UploadStatus,
};
use super::worker::{poll_progress, ReportKind, TransferOutcome, TransferReport, UploadWorker};

struct TaskHandle {
    task: UploadTask,
    telemetry: TaskTelemetry,
    join_handle: Option<JoinHandle<()>>,
    /// A progress poll for this task has not answered yet
    poll_in_flight: bool,
}

impl TaskHandle {
    fn new(task: UploadTask) -> Self {
        Self {
            task,
            telemetry: TaskTelemetry::new(),
            join_handle: None,
            poll_in_flight: false,
        }
    }

    /// Stops the current transfer run, if any.
    fn stop_transfer(&mut self) {
        if let Some(token) = self.task.cancel_token.take() {
            token.cancel();
        }
        self.join_handle = None;
    }
}

/// Broadcasts events, ignoring the "no subscribers" case.
struct EventSink(broadcast::Sender<UploadEvent>);

impl EventSink {
    fn send(&self, event: UploadEvent) {
        let _ = self.0.send(event);
    }

    /// Moves `task` to `to` and announces the change.
    fn transition(&self, task: &mut UploadTask, to: UploadStatus) -> Result<UploadStatus> {
        let from = task.transition(to)?;
        debug!(task = %task.id, %from, %to, "state changed");
        self.send(UploadEvent::StateChanged {
            upload_id: task.id,
            old_state: from,
            new_state: to,
        });
        Ok(from)
    }

    fn progress(&self, task: &UploadTask) {
        self.send(UploadEvent::Progress(task.to_progress()));
    }

    fn failed(&self, task: &mut UploadTask, error: String) {
        if let Err(err) = self.transition(task, UploadStatus::Failed) {
            warn!(task = %task.id, "cannot mark task failed: {err}");
            return;
        }
        warn!(task = %task.id, file = %task.file_name, %error, "upload failed");
        task.error = Some(error.clone());
        self.send(UploadEvent::Failed { upload_id: task.id, error });
    }

    fn completed(&self, task: &mut UploadTask) {
        if let Err(err) = self.transition(task, UploadStatus::Completed) {
            warn!(task = %task.id, "cannot mark task completed: {err}");
            return;
        }
        info!(task = %task.id, file = %task.file_name, photo_id = ?task.photo_id, "upload completed");
        self.send(UploadEvent::Completed {
            upload_id: task.id,
            photo_id: task.photo_id.clone(),
        });
    }
}

pub struct UploadManagerWorker {
    api: Arc<dyn UploadApi>,
    config: UploadConfig,
    tasks: HashMap<UploadId, TaskHandle>,
    /// Insertion order of `tasks`
    order: Vec<UploadId>,
    queued_tasks: VecDeque<UploadId>,
    active_uploads: usize,
    /// Push channel connected; when false `processing` tasks are polled
    channel_alive: bool,
    /// Start of the current burst of work
    session_started: Option<Instant>,
    last_session: Option<Duration>,
    events: EventSink,
    report_tx: mpsc::UnboundedSender<TransferReport>,
}

impl UploadManagerWorker {
    pub(crate) async fn run(
        api: Arc<dyn UploadApi>,
        config: UploadConfig,
        mut command_rx: mpsc::Receiver<ManagerCommand>,
        mut channel_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
        event_tx: broadcast::Sender<UploadEvent>,
    ) {
        let (report_tx, mut report_rx) = mpsc::unbounded_channel();
        let mut ticker = interval(config.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut worker = Self {
            api,
            config,
            tasks: HashMap::new(),
            order: Vec::new(),
            queued_tasks: VecDeque::new(),
            active_uploads: 0,
            channel_alive: channel_rx.is_some(),
            session_started: None,
            last_session: None,
            events: EventSink(event_tx),
            report_tx,
        };

        // 主事件循环
        loop {
            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(ManagerCommand::Shutdown { reply }) => {
                        worker.stop_all();
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => worker.handle_command(command),
                    None => break,
                },
                Some(report) = report_rx.recv() => {
                    worker.handle_report(report);
                }
                event = next_channel_event(&mut channel_rx) => match event {
                    Some(event) => worker.handle_channel_event(event),
                    None => {
                        channel_rx = None;
                        worker.channel_alive = false;
                    }
                },
                _ = ticker.tick() => {
                    worker.on_tick();
                }
            }

            worker.process_queue();
            worker.check_settled();
        }

        worker.stop_all();
    }

    fn handle_command(&mut self, command: ManagerCommand) {
        match command {
            ManagerCommand::AddFiles { files, usage, reply } => {
                let report = self.add_files(files, usage);
                let _ = reply.send(report);
            }
            ManagerCommand::Pause { upload_id, reply } => {
                let _ = reply.send(self.pause(upload_id));
            }
            ManagerCommand::PauseAll { reply } => {
                let ids = self.ids_where(|task| matches!(task.state, UploadStatus::Pending | UploadStatus::Uploading));
                let _ = reply.send(self.apply_all(ids, Self::pause));
            }
            ManagerCommand::Resume { upload_id, reply } => {
                let _ = reply.send(self.resume(upload_id));
            }
            ManagerCommand::ResumeAll { reply } => {
                let ids = self.ids_where(|task| task.state == UploadStatus::Paused);
                let _ = reply.send(self.apply_all(ids, Self::resume));
            }
            ManagerCommand::Cancel { upload_id, reply } => {
                let _ = reply.send(self.cancel(upload_id));
            }
            ManagerCommand::CancelAll { reply } => {
                let ids = self.ids_where(|task| !task.state.is_terminal());
                let _ = reply.send(self.apply_all(ids, Self::cancel));
            }
            ManagerCommand::Retry { upload_id, reply } => {
                let _ = reply.send(self.retry(upload_id));
            }
            ManagerCommand::RetryFailed { reply } => {
                let ids = self.ids_where(|task| task.state == UploadStatus::Failed && !task.rejected);
                let _ = reply.send(self.apply_all(ids, Self::retry));
            }
            ManagerCommand::GetTask { upload_id, reply } => {
                let task = self.tasks
                    .get(&upload_id)
                    .map(|handle| handle.task.clone());
                let _ = reply.send(task);
            }
            ManagerCommand::GetAllTasks { reply } => {
                let tasks = self.order
                    .iter()
                    .filter_map(|id| self.tasks.get(id))
                    .map(|handle| handle.task.clone())
                    .collect();
                let _ = reply.send(tasks);
            }
            ManagerCommand::ClearCompleted { reply } => {
                let _ = reply.send(self.clear(|state| state == UploadStatus::Completed));
            }
            ManagerCommand::ClearFinished { reply } => {
                let _ = reply.send(self.clear(UploadStatus::is_terminal));
            }
            ManagerCommand::Summary { reply } => {
                let _ = reply.send(self.summary());
            }
            ManagerCommand::Shutdown { reply } => {
                // handled by the loop
                let _ = reply.send(());
            }
        }
    }

    fn ids_where(&self, filter: impl Fn(&UploadTask) -> bool) -> Vec<UploadId> {
        self.order
            .iter()
            .filter(|id| self.tasks.get(id).is_some_and(|handle| filter(&handle.task)))
            .copied()
            .collect()
    }

    fn apply_all(&mut self, ids: Vec<UploadId>, action: fn(&mut Self, UploadId) -> Result<()>) -> usize {
        ids.into_iter()
            .filter(|id| action(self, *id).is_ok())
            .count()
    }

    fn add_files(&mut self, files: Vec<FileHandle>, usage: Option<StorageUsage>) -> AdmissionReport {
        let admission = admit(
            files,
            self.tasks.values().map(|handle| &handle.task),
            usage.as_ref(),
            self.config.max_file_size,
        );

        let mut report = AdmissionReport::default();

        for file in admission.accepted {
            let task = UploadTask::new(file);
            let upload_id = task.id;
            debug!(task = %upload_id, file = %task.file_name, size = task.total_bytes, "task queued");

            self.insert(task);
            self.queued_tasks.push_back(upload_id);
            self.events.send(UploadEvent::TaskAdded { upload_id });
            report.accepted.push(upload_id);
        }

        for (file, reason) in admission.rejected {
            let reason = reason.to_string();
            let task = UploadTask::rejected(file, reason.clone());
            let upload_id = task.id;
            let file_name = task.file_name.clone();
            warn!(task = %upload_id, file = %file_name, %reason, "file rejected");

            self.insert(task);
            self.events.send(UploadEvent::TaskAdded { upload_id });
            self.events.send(UploadEvent::Failed { upload_id, error: reason.clone() });
            report.rejected.push(RejectedFile { upload_id, file_name, reason });
        }

        if !report.accepted.is_empty() {
            self.mark_session_active();
        }

        info!(accepted = report.accepted.len(), rejected = report.rejected.len(), "files admitted");
        report
    }

    fn insert(&mut self, task: UploadTask) {
        self.order.push(task.id);
        self.tasks.insert(task.id, TaskHandle::new(task));
    }

    fn mark_session_active(&mut self) {
        if self.session_started.is_none() {
            self.session_started = Some(Instant::now());
        }
    }

    fn pause(&mut self, upload_id: UploadId) -> Result<()> {
        let handle = self.tasks.get_mut(&upload_id)
            .ok_or(UploadError::NotFound(upload_id))?;

        let old_state = self.events.transition(&mut handle.task, UploadStatus::Paused)?;
        match old_state {
            UploadStatus::Pending => {
                self.queued_tasks.retain(|id| *id != upload_id);
            }
            UploadStatus::Uploading => {
                handle.stop_transfer();
                self.active_uploads -= 1;
            }
            _ => {}
        }

        Ok(())
    }

    fn resume(&mut self, upload_id: UploadId) -> Result<()> {
        let handle = self.tasks.get_mut(&upload_id)
            .ok_or(UploadError::NotFound(upload_id))?;

        if handle.task.state != UploadStatus::Paused {
            return Err(UploadError::InvalidTransition { action: "resume", state: handle.task.state });
        }

        // 从第 0 个分片重新开始
        self.events.transition(&mut handle.task, UploadStatus::Pending)?;
        handle.task.reset_for_retry();
        handle.telemetry.reset();
        self.events.progress(&handle.task);

        self.queued_tasks.push_back(upload_id);
        self.mark_session_active();
        Ok(())
    }

    fn cancel(&mut self, upload_id: UploadId) -> Result<()> {
        let handle = self.tasks.get_mut(&upload_id)
            .ok_or(UploadError::NotFound(upload_id))?;

        let old_state = self.events.transition(&mut handle.task, UploadStatus::Cancelled)?;
        handle.stop_transfer();
        handle.poll_in_flight = false;

        match old_state {
            UploadStatus::Pending => self.queued_tasks.retain(|id| *id != upload_id),
            UploadStatus::Uploading => self.active_uploads -= 1,
            _ => {}
        }

        info!(task = %upload_id, "upload cancelled");
        Ok(())
    }

    fn retry(&mut self, upload_id: UploadId) -> Result<()> {
        let handle = self.tasks.get_mut(&upload_id)
            .ok_or(UploadError::NotFound(upload_id))?;

        if handle.task.rejected {
            return Err(UploadError::Validation(format!(
                "{} was rejected at admission and cannot be retried",
                handle.task.file_name
            )));
        }
        if handle.task.state != UploadStatus::Failed {
            return Err(UploadError::InvalidTransition { action: "retry", state: handle.task.state });
        }

        self.events.transition(&mut handle.task, UploadStatus::Pending)?;
        handle.task.reset_for_retry();
        handle.telemetry.reset();
        self.events.progress(&handle.task);

        self.queued_tasks.push_back(upload_id);
        self.mark_session_active();
        Ok(())
    }

    fn clear(&mut self, filter: impl Fn(UploadStatus) -> bool) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, handle| !filter(handle.task.state));
        let tasks = &self.tasks;
        self.order.retain(|id| tasks.contains_key(id));
        before - self.tasks.len()
    }

    fn process_queue(&mut self) {
        while self.active_uploads < self.config.global_concurrency {
            let Some(upload_id) = self.queued_tasks.pop_front() else {
                break;
            };

            let is_pending = self.tasks
                .get(&upload_id)
                .is_some_and(|handle| handle.task.state == UploadStatus::Pending);
            if is_pending {
                self.start_upload(upload_id);
            }
        }
    }

    fn start_upload(&mut self, upload_id: UploadId) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else {
            return;
        };

        if let Err(err) = self.events.transition(&mut handle.task, UploadStatus::Uploading) {
            warn!(task = %upload_id, "cannot start upload: {err}");
            return;
        }

        let cancellation_token = CancellationToken::new();
        handle.task.generation += 1;
        handle.task.cancel_token = Some(cancellation_token.clone());
        handle.task.started_at = Some(chrono::Utc::now());
        handle.poll_in_flight = false;
        handle.telemetry.reset();
        handle.telemetry.sample(&mut handle.task, Instant::now());

        let worker = UploadWorker {
            api: self.api.clone(),
            cancellation_token,
            retry: self.config.retry.clone(),
            chunk_size: self.config.chunk_size,
            chunk_concurrency: self.config.per_task_chunk_concurrency,
            upload_id,
            generation: handle.task.generation,
            reports: self.report_tx.clone(),
        };

        info!(task = %upload_id, file = %handle.task.file_name, size = handle.task.total_bytes, "upload started");
        handle.join_handle = Some(tokio::spawn(worker.run(handle.task.file.clone())));
        self.active_uploads += 1;
    }

    fn handle_report(&mut self, report: TransferReport) {
        let upload_id = report.upload_id;
        let Some(handle) = self.tasks.get_mut(&upload_id) else {
            return;
        };

        if let ReportKind::Polled(_) = report.kind {
            handle.poll_in_flight = false;
        }

        if handle.task.generation != report.generation {
            debug!(task = %upload_id, generation = report.generation, "ignoring report of an earlier run");
            return;
        }

        match report.kind {
            ReportKind::Bound { photo_id } => {
                if handle.task.state == UploadStatus::Uploading && !handle.task.bind_photo_id(photo_id.clone()) {
                    warn!(task = %upload_id, %photo_id, existing = ?handle.task.photo_id, "photoId already bound");
                }
            }
            ReportKind::Progress { bytes, observed_at } => {
                if handle.task.state == UploadStatus::Uploading
                    && handle.telemetry.apply_local(&mut handle.task, bytes, observed_at)
                {
                    self.events.progress(&handle.task);
                }
            }
            ReportKind::Finished(result) => {
                // 暂停/取消/推送已经结束了这次运行
                if handle.task.state != UploadStatus::Uploading {
                    return;
                }

                handle.stop_transfer();
                self.active_uploads -= 1;

                match result {
                    Ok(TransferOutcome::Completed) => {
                        if self.events.transition(&mut handle.task, UploadStatus::Processing).is_ok() {
                            self.events.completed(&mut handle.task);
                        }
                    }
                    Ok(TransferOutcome::Processing) => {
                        let total = handle.task.total_bytes;
                        handle.telemetry.apply_local(&mut handle.task, total, Instant::now());
                        if self.events.transition(&mut handle.task, UploadStatus::Processing).is_ok() {
                            self.events.progress(&handle.task);
                        }
                    }
                    Err(err) => {
                        self.events.failed(&mut handle.task, err.to_string());
                    }
                }
            }
            ReportKind::Polled(Ok(message)) => {
                if handle.task.state == UploadStatus::Processing {
                    self.apply_message(upload_id, &message, Instant::now());
                }
            }
            ReportKind::Polled(Err(err)) => {
                debug!(task = %upload_id, "progress poll failed: {err}");
            }
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.channel_alive = true;
            }
            ChannelEvent::Disconnected | ChannelEvent::Reconnecting { .. } => {
                self.channel_alive = false;
            }
            ChannelEvent::GaveUp => {
                info!("push channel unavailable, polling progress instead");
                self.channel_alive = false;
            }
            ChannelEvent::Progress { message, received_at } => {
                let Some(photo_id) = message.photo_id.as_deref() else {
                    return;
                };

                let upload_id = self.tasks
                    .values()
                    .find(|handle| handle.task.photo_id.as_deref() == Some(photo_id) && handle.task.state.is_live())
                    .map(|handle| handle.task.id);

                match upload_id {
                    Some(upload_id) => self.apply_message(upload_id, &message, received_at),
                    None => debug!(photo_id, status = ?message.status, "progress for unknown photo"),
                }
            }
        }
    }

    /// Applies a push or poll frame to a task in `uploading` or `processing`.
    fn apply_message(&mut self, upload_id: UploadId, message: &ProgressMessage, received_at: Instant) {
        let Some(handle) = self.tasks.get_mut(&upload_id) else {
            return;
        };

        let state = handle.task.state;
        if !matches!(state, UploadStatus::Uploading | UploadStatus::Processing) {
            return;
        }

        match message.status {
            ChannelStatus::Completed | ChannelStatus::Failed => {
                if state == UploadStatus::Uploading {
                    handle.stop_transfer();
                    self.active_uploads -= 1;
                }

                if message.status == ChannelStatus::Completed {
                    self.events.completed(&mut handle.task);
                } else {
                    let error = message.message.clone().unwrap_or_else(|| "Upload failed".to_string());
                    self.events.failed(&mut handle.task, error);
                }
            }
            ChannelStatus::Uploading | ChannelStatus::Unknown => {
                if handle.telemetry.apply_channel(&mut handle.task, message, received_at) {
                    self.events.progress(&handle.task);
                }
            }
            ChannelStatus::Connected => {}
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();

        for handle in self.tasks.values_mut() {
            if handle.task.state == UploadStatus::Uploading {
                handle.telemetry.sample(&mut handle.task, now);
                self.events.progress(&handle.task);
            }
        }

        if self.channel_alive {
            return;
        }

        for handle in self.tasks.values_mut() {
            if handle.task.state != UploadStatus::Processing || handle.poll_in_flight {
                continue;
            }
            let Some(photo_id) = handle.task.photo_id.clone() else {
                continue;
            };

            handle.poll_in_flight = true;
            tokio::spawn(poll_progress(
                self.api.clone(),
                photo_id,
                handle.task.id,
                handle.task.generation,
                self.report_tx.clone(),
            ));
        }
    }

    fn check_settled(&mut self) {
        let Some(started) = self.session_started else {
            return;
        };

        let busy = self.tasks.values().any(|handle| {
            matches!(
                handle.task.state,
                UploadStatus::Pending | UploadStatus::Uploading | UploadStatus::Processing
            )
        });
        if busy {
            return;
        }

        let total_duration = started.elapsed();
        self.session_started = None;
        self.last_session = Some(total_duration);

        let total_bytes = self.tasks
            .values()
            .filter(|handle| handle.task.state == UploadStatus::Completed)
            .map(|handle| handle.task.total_bytes)
            .sum();

        info!(tasks = self.tasks.len(), total_bytes, elapsed_ms = total_duration.as_millis() as u64, "queue settled");
        self.events.send(UploadEvent::AllCompleted {
            total_tasks: self.tasks.len(),
            total_bytes,
            total_duration,
        });
    }

    fn summary(&self) -> QueueSummary {
        let mut summary = QueueSummary {
            total_tasks: self.tasks.len(),
            ..Default::default()
        };

        let mut remaining = 0;
        for handle in self.tasks.values() {
            let task = &handle.task;
            match task.state {
                UploadStatus::Pending => summary.pending += 1,
                UploadStatus::Uploading => summary.uploading += 1,
                UploadStatus::Processing => summary.processing += 1,
                UploadStatus::Completed => summary.completed += 1,
                UploadStatus::Failed => summary.failed += 1,
                UploadStatus::Paused => summary.paused += 1,
                UploadStatus::Cancelled => summary.cancelled += 1,
            }

            if task.rejected || task.state == UploadStatus::Cancelled {
                continue;
            }
            summary.total_bytes += task.total_bytes;
            summary.total_uploaded += task.uploaded_bytes;
            if task.state == UploadStatus::Uploading {
                summary.overall_speed += task.speed;
            }
            if task.state.is_live() {
                remaining += task.remaining_bytes();
            }
        }

        if summary.total_bytes > 0 {
            summary.overall_percentage = summary.total_uploaded as f64 / summary.total_bytes as f64 * 100.0;
        }
        summary.overall_eta = eta(remaining, summary.overall_speed);
        summary.elapsed = self.session_started
            .map(|started| started.elapsed())
            .or(self.last_session);

        summary
    }

    fn stop_all(&mut self) {
        for handle in self.tasks.values_mut() {
            handle.stop_transfer();
        }
    }
}

async fn next_channel_event(channel_rx: &mut Option<mpsc::UnboundedReceiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match channel_rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
