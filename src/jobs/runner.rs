use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GridlinkError, Result};
use crate::jobs::persist::Persist;
use crate::jobs::record::{JobRecord, JobStatus, LogEvent};

/// Capacity of each per-kind execution queue. Submit rejects with
/// `QueueFull` instead of blocking once a kind has this many jobs waiting.
pub const QUEUE_CAPACITY: usize = 64;

/// Buffered events per log subscriber. A subscriber that falls further
/// behind loses the newest events rather than stalling the worker.
const SUBSCRIBER_BUFFER: usize = 128;

/// Future returned by a job handler. `Ok(Some(value))` becomes the job's
/// result payload; a handler that returns `Ok` without a payload still
/// succeeds with progress 1.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<Value>>> + Send>>;

type JobHandler = Box<dyn FnOnce(JobContext) -> HandlerFuture + Send>;

struct QueuedJob {
    id: Uuid,
    handler: JobHandler,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LogEvent>,
}

/// In-process job orchestrator. One FIFO queue and one worker task per
/// kind; records mirrored to the store on every transition; best-effort
/// log fan-out to live subscribers.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
    queues: RwLock<HashMap<String, mpsc::Sender<QueuedJob>>>,
    cancels: RwLock<HashMap<Uuid, CancellationToken>>,
    // Sync lock so subscriptions can detach from a plain Drop impl and the
    // worker can publish without awaiting. Held only for registry access.
    subs: StdRwLock<HashMap<Uuid, Vec<Subscriber>>>,
    next_sub_id: AtomicU64,
    store: Option<Arc<dyn Persist>>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_store(store: Arc<dyn Persist>) -> Self {
        Self::build(Some(store))
    }

    fn build(store: Option<Arc<dyn Persist>>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                jobs: RwLock::new(HashMap::new()),
                queues: RwLock::new(HashMap::new()),
                cancels: RwLock::new(HashMap::new()),
                subs: StdRwLock::new(HashMap::new()),
                next_sub_id: AtomicU64::new(1),
                store,
            }),
        }
    }

    /// Enqueue a job of the given kind. The handler runs on the kind's
    /// worker once every earlier job of that kind has finished.
    ///
    /// Fails fast with [`GridlinkError::QueueFull`] when the kind already
    /// has [`QUEUE_CAPACITY`] jobs waiting.
    pub async fn submit<F, Fut>(&self, kind: &str, spec: Value, handler: F) -> Result<Uuid>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
    {
        if kind.trim().is_empty() {
            return Err(GridlinkError::Validation("job kind required".into()));
        }
        let queue = self.inner.queue_for(kind).await;
        // Reserve the slot before the record exists so a full queue rejects
        // without leaving a phantom Queued job behind.
        let permit = queue
            .try_reserve()
            .map_err(|_| GridlinkError::QueueFull(kind.to_string()))?;

        let rec = JobRecord::new(kind, spec);
        let id = rec.id;
        self.inner.jobs.write().await.insert(id, rec.clone());
        self.inner
            .cancels
            .write()
            .await
            .insert(id, CancellationToken::new());
        self.inner.persist(&rec).await;
        tracing::info!(job_id = %id, kind = %kind, "job queued");

        permit.send(QueuedJob {
            id,
            handler: Box::new(move |ctx| Box::pin(handler(ctx)) as HandlerFuture),
        });
        Ok(id)
    }

    /// Copy of the job record, from memory first and the store second.
    pub async fn get(&self, id: Uuid) -> Option<JobRecord> {
        if let Some(rec) = self.inner.jobs.read().await.get(&id) {
            return Some(rec.clone());
        }
        let store = self.inner.store.as_ref()?;
        match store.get_job(id).await {
            Ok(rec) => rec,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "store lookup failed");
                None
            }
        }
    }

    /// Snapshot of all known jobs: in-memory records merged with persisted
    /// history (in-memory wins on id collision), sorted by creation time.
    pub async fn list(&self) -> Vec<JobRecord> {
        let mut out: Vec<JobRecord> = self.inner.jobs.read().await.values().cloned().collect();
        if let Some(store) = &self.inner.store {
            match store.list_jobs().await {
                Ok(persisted) => {
                    let resident: std::collections::HashSet<Uuid> =
                        out.iter().map(|r| r.id).collect();
                    out.extend(persisted.into_iter().filter(|r| !resident.contains(&r.id)));
                }
                Err(e) => tracing::warn!(error = %e, "store list failed"),
            }
        }
        out.sort_by_key(|r| r.created);
        out
    }

    /// Request cooperative cancellation. Queued jobs are skipped by their
    /// worker; running handlers observe the flag at their next checkpoint.
    /// Jobs already in a terminal state are unaffected.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        if let Some(token) = self.inner.cancels.read().await.get(&id) {
            token.cancel();
        } else if !self.inner.jobs.read().await.contains_key(&id) {
            return Err(GridlinkError::JobNotFound(id));
        }
        let updated = {
            let mut jobs = self.inner.jobs.write().await;
            match jobs.get_mut(&id) {
                Some(rec) if !rec.status.is_terminal() => {
                    rec.status = JobStatus::Canceled;
                    rec.updated = Utc::now();
                    Some(rec.clone())
                }
                _ => None,
            }
        };
        if let Some(rec) = updated {
            tracing::info!(job_id = %id, "job canceled");
            self.inner.persist(&rec).await;
        }
        Ok(())
    }

    pub async fn is_canceled(&self, id: Uuid) -> bool {
        self.inner
            .cancels
            .read()
            .await
            .get(&id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }

    /// Subscribe to log events for one job. Only events published after
    /// attachment are delivered; replay belongs to the store. Dropping the
    /// subscription detaches it.
    pub fn subscribe_logs(&self, job: Uuid) -> LogSubscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subs
            .write()
            .expect("subscriber registry poisoned")
            .entry(job)
            .or_default()
            .push(Subscriber { id, tx });
        LogSubscription {
            job,
            id,
            rx,
            inner: self.inner.clone(),
        }
    }

    /// Re-mark persisted jobs that were interrupted by a crash or restart.
    /// Returns how many records were repaired.
    pub async fn recover(&self) -> usize {
        let Some(store) = self.inner.store.clone() else {
            return 0;
        };
        let persisted = match store.list_jobs().await {
            Ok(recs) => recs,
            Err(e) => {
                tracing::warn!(error = %e, "recovery list failed");
                return 0;
            }
        };
        let mut repaired = 0;
        for mut rec in persisted {
            if rec.status.is_terminal() {
                continue;
            }
            rec.status = JobStatus::Failed;
            rec.error = Some("interrupted by restart".to_string());
            rec.updated = Utc::now();
            tracing::warn!(job_id = %rec.id, kind = %rec.kind, "marking interrupted job failed");
            self.inner.jobs.write().await.insert(rec.id, rec.clone());
            self.inner.persist(&rec).await;
            repaired += 1;
        }
        repaired
    }
}

impl RunnerInner {
    /// Sender for the kind's queue, lazily spawning its worker on first use.
    async fn queue_for(self: &Arc<Self>, kind: &str) -> mpsc::Sender<QueuedJob> {
        if let Some(tx) = self.queues.read().await.get(kind) {
            return tx.clone();
        }
        let mut queues = self.queues.write().await;
        if let Some(tx) = queues.get(kind) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        queues.insert(kind.to_string(), tx.clone());
        let inner = Arc::clone(self);
        let kind = kind.to_string();
        tokio::spawn(async move {
            inner.worker_loop(kind, rx).await;
        });
        tx
    }

    /// Drains one kind's queue for the process lifetime. A handler fault
    /// never escapes an iteration.
    async fn worker_loop(self: Arc<Self>, kind: String, mut rx: mpsc::Receiver<QueuedJob>) {
        tracing::debug!(kind = %kind, "job worker started");
        while let Some(job) = rx.recv().await {
            self.run_one(job).await;
        }
        tracing::debug!(kind = %kind, "job worker stopped");
    }

    async fn run_one(self: &Arc<Self>, job: QueuedJob) {
        let QueuedJob { id, handler } = job;
        let spec = {
            let jobs = self.jobs.read().await;
            match jobs.get(&id) {
                None => return,
                Some(rec) if rec.status == JobStatus::Canceled => {
                    tracing::debug!(job_id = %id, "skipping job canceled while queued");
                    return;
                }
                Some(rec) => rec.spec.clone(),
            }
        };

        if let Some(rec) = self
            .mutate(id, |rec| {
                rec.status = JobStatus::Running;
            })
            .await
        {
            self.persist(&rec).await;
        }
        tracing::info!(job_id = %id, "job running");

        let cancel = self
            .cancels
            .read()
            .await
            .get(&id)
            .cloned()
            .unwrap_or_default();
        let ctx = JobContext {
            id,
            spec,
            cancel,
            inner: Arc::clone(self),
        };

        // The handler runs in its own task so a panic is contained by the
        // JoinHandle instead of unwinding through the worker loop.
        let outcome = tokio::spawn(handler(ctx)).await;
        match outcome {
            Ok(Ok(result)) => self.finish_ok(id, result).await,
            Ok(Err(err)) => self.finish_failed(id, format!("{err:#}")).await,
            Err(join_err) => {
                let msg = if join_err.is_panic() {
                    let payload = join_err.into_panic();
                    payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string())
                } else {
                    "handler task aborted".to_string()
                };
                self.finish_failed(id, msg).await;
            }
        }
    }

    async fn finish_ok(self: &Arc<Self>, id: Uuid, result: Option<Value>) {
        let updated = self
            .mutate_if(id, |rec| {
                // A late cancel wins over the handler's return: only a job
                // still Running transitions to Succeeded.
                if rec.status != JobStatus::Running {
                    return false;
                }
                rec.status = JobStatus::Succeeded;
                rec.progress = 1.0;
                rec.result = result.clone();
                true
            })
            .await;
        if let Some(rec) = updated {
            tracing::info!(job_id = %id, "job succeeded");
            self.persist(&rec).await;
        }
    }

    async fn finish_failed(self: &Arc<Self>, id: Uuid, error: String) {
        let updated = self
            .mutate_if(id, |rec| {
                if rec.status.is_terminal() {
                    return false;
                }
                rec.status = JobStatus::Failed;
                rec.error = Some(error.clone());
                true
            })
            .await;
        if let Some(rec) = updated {
            tracing::warn!(job_id = %id, error = %error, "job failed");
            self.persist(&rec).await;
            let mut event = LogEvent::new(id, "failed");
            event.err = Some(error);
            self.publish(&event);
            self.append(&event).await;
        }
    }

    async fn mutate<F>(&self, id: Uuid, f: F) -> Option<JobRecord>
    where
        F: FnOnce(&mut JobRecord),
    {
        self.mutate_if(id, |rec| {
            f(rec);
            true
        })
        .await
    }

    /// Apply `f` under the table lock; `f` returning false leaves the
    /// record untouched. Returns a copy of the updated record.
    async fn mutate_if<F>(&self, id: Uuid, f: F) -> Option<JobRecord>
    where
        F: FnOnce(&mut JobRecord) -> bool,
    {
        let mut jobs = self.jobs.write().await;
        let rec = jobs.get_mut(&id)?;
        if !f(rec) {
            return None;
        }
        rec.updated = Utc::now();
        Some(rec.clone())
    }

    async fn persist(&self, rec: &JobRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_job(rec).await {
                tracing::warn!(job_id = %rec.id, error = %e, "job save failed");
            }
        }
    }

    async fn append(&self, event: &LogEvent) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append_log(event.job, event).await {
                tracing::warn!(job_id = %event.job, error = %e, "log append failed");
            }
        }
    }

    /// Best-effort fan-out: a subscriber whose buffer is full loses this
    /// event instead of blocking the publisher.
    fn publish(&self, event: &LogEvent) {
        let subs = self.subs.read().expect("subscriber registry poisoned");
        if let Some(list) = subs.get(&event.job) {
            for sub in list {
                if sub.tx.try_send(event.clone()).is_err() {
                    tracing::trace!(job_id = %event.job, sub = sub.id, "dropping log event for slow subscriber");
                }
            }
        }
    }

    fn unsubscribe(&self, job: Uuid, sub_id: u64) {
        let mut subs = self.subs.write().expect("subscriber registry poisoned");
        if let Some(list) = subs.get_mut(&job) {
            list.retain(|s| s.id != sub_id);
            if list.is_empty() {
                subs.remove(&job);
            }
        }
    }
}

/// Live log stream for one job. Detaches on drop.
pub struct LogSubscription {
    job: Uuid,
    id: u64,
    rx: mpsc::Receiver<LogEvent>,
    inner: Arc<RunnerInner>,
}

impl LogSubscription {
    /// Next event, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<LogEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for LogSubscription {
    fn drop(&mut self) {
        self.inner.unsubscribe(self.job, self.id);
    }
}

/// Handler-side view of a running job: typed spec access, cooperative
/// cancellation, and checkpointed progress/log emission.
pub struct JobContext {
    id: Uuid,
    spec: Value,
    cancel: CancellationToken,
    inner: Arc<RunnerInner>,
}

impl JobContext {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deserialize the job spec into a concrete type.
    pub fn spec<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.spec.clone())
    }

    pub fn raw_spec(&self) -> &Value {
        &self.spec
    }

    /// True once `cancel` has been requested for this job. Handlers poll
    /// this at safe points; blocking calls are not interrupted.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested. Useful inside `select!`.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Record a checkpoint: update and persist progress, then fan out a
    /// log event carrying the step label.
    pub async fn step(&self, progress: f64, label: &str, msg: &str) {
        self.step_with(progress, label, msg, None).await
    }

    pub async fn step_with(
        &self,
        progress: f64,
        label: &str,
        msg: &str,
        kv: Option<serde_json::Map<String, Value>>,
    ) {
        if let Some(rec) = self
            .inner
            .mutate(self.id, |rec| {
                rec.progress = progress.clamp(0.0, 1.0);
            })
            .await
        {
            self.inner.persist(&rec).await;
        }
        let mut event = LogEvent::new(self.id, msg);
        event.step = Some(label.to_string());
        event.kv = kv;
        self.inner.publish(&event);
        self.inner.append(&event).await;
    }

    /// Emit a log line without touching progress.
    pub async fn log(&self, msg: &str) {
        let event = LogEvent::new(self.id, msg);
        self.inner.publish(&event);
        self.inner.append(&event).await;
    }
}
