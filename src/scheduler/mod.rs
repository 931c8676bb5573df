//! Scheduler: persistent schedule store + min-heap tick loop (`spec.md`
//! §4.6).
//!
//! At each due tick the scheduler materializes a [`Job`] from a
//! [`Schedule`]'s defaults and the target task's policy, and enqueues it
//! via the active queue backend — the scheduler never runs jobs itself.

pub mod store;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::codec::Value;
use crate::error::{JobErrorDetail, NuvomError, Result};
use crate::job::{AfterHook, HookResult, Job, OnErrorHook};
use crate::queue::QueueBackend;
use crate::task::TaskRegistry;

pub use store::ScheduleStore;

/// Default tick when the heap is empty, so `add`/`enable` calls made while
/// idle are noticed within a bounded time even without the wake condition.
const IDLE_TICK: std::time::Duration = std::time::Duration::from_secs(5);

/// `spec.md` §3's three schedule kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

/// How a schedule whose `next_run_ts` was found to be in the past at
/// startup is handled (`spec.md` §4.6 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    RunImmediately,
    Skip,
    Reschedule,
}

/// A recurring or one-off rule that materializes Jobs at computed times
/// (`spec.md` §3's Schedule row).
#[derive(Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub task_name: String,
    pub schedule_type: ScheduleType,
    pub cron_expr: Option<String>,
    pub interval_secs: Option<u64>,
    pub run_at: Option<DateTime<Utc>>,
    pub default_args: Vec<Value>,
    pub default_kwargs: std::collections::BTreeMap<String, Value>,
    pub enabled: bool,
    pub next_run_ts: Option<DateTime<Utc>>,
    pub timezone: String,
    pub misfire_policy: MisfirePolicy,
    pub concurrency_limit: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(id: impl Into<String>, task_name: impl Into<String>, schedule_type: ScheduleType) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_name: task_name.into(),
            schedule_type,
            cron_expr: None,
            interval_secs: None,
            run_at: None,
            default_args: Vec::new(),
            default_kwargs: std::collections::BTreeMap::new(),
            enabled: true,
            next_run_ts: None,
            timezone: "UTC".to_string(),
            misfire_policy: MisfirePolicy::RunImmediately,
            concurrency_limit: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_cron(mut self, expr: impl Into<String>) -> Self {
        self.cron_expr = Some(expr.into());
        self
    }

    pub fn with_interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = Some(secs);
        self
    }

    pub fn with_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    pub fn with_timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = tz.into();
        self
    }

    pub fn with_misfire_policy(mut self, policy: MisfirePolicy) -> Self {
        self.misfire_policy = policy;
        self
    }

    pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    /// Next occurrence strictly after `now`, computed from `base`
    /// (`spec.md` §4.6's recompute formulas). `None` means the schedule is
    /// exhausted (a fired `once`).
    fn compute_next_run_from(&self, base: DateTime<Utc>, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        match self.schedule_type {
            ScheduleType::Interval => {
                let interval_secs = self
                    .interval_secs
                    .filter(|s| *s > 0)
                    .ok_or_else(|| NuvomError::schedule_misconfigured("interval schedule requires a positive interval_secs"))?;
                let interval = ChronoDuration::seconds(interval_secs as i64);
                let elapsed_ms = (now - base).num_milliseconds().max(0) as f64;
                let periods = (elapsed_ms / (interval_secs as f64 * 1000.0)).ceil().max(1.0) as i64;
                let mut next = base + interval * periods as i32;
                while next <= now {
                    next = next + interval;
                }
                Ok(Some(next))
            }
            ScheduleType::Cron => {
                let expr = self
                    .cron_expr
                    .as_ref()
                    .ok_or_else(|| NuvomError::schedule_misconfigured("cron schedule requires cron_expr"))?;
                let parsed = cron::Schedule::from_str(expr)?;
                let tz = chrono_tz::Tz::from_str(&self.timezone)
                    .map_err(|_| NuvomError::schedule_misconfigured(format!("invalid timezone: {}", self.timezone)))?;
                let now_tz = now.with_timezone(&tz);
                let next = parsed
                    .after(&now_tz)
                    .next()
                    .ok_or_else(|| NuvomError::schedule_misconfigured("cron expression has no future occurrence"))?;
                Ok(Some(next.with_timezone(&Utc)))
            }
            ScheduleType::Once => match self.run_at {
                Some(run_at) if run_at > now => Ok(Some(run_at)),
                _ => Ok(None),
            },
        }
    }

    /// Startup computation for a schedule with no `next_run_ts` yet.
    fn initial_next_run(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let base = self.run_at.unwrap_or(self.created_at);
        match self.schedule_type {
            ScheduleType::Once => Ok(self.run_at.filter(|at| *at > now).or(Some(now))),
            _ => self.compute_next_run_from(base, now),
        }
    }

    /// Apply `misfire_policy` to a schedule whose `next_run_ts` is in the
    /// past at startup (`spec.md` §4.6 step 2).
    fn apply_misfire(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(next_run_ts) = self.next_run_ts else { return Ok(()) };
        if next_run_ts >= now {
            return Ok(());
        }
        match self.misfire_policy {
            MisfirePolicy::RunImmediately => {}
            MisfirePolicy::Skip => {
                self.next_run_ts = self.compute_next_run_from(next_run_ts, now)?;
                if self.next_run_ts.is_none() {
                    self.enabled = false;
                }
            }
            MisfirePolicy::Reschedule => {
                self.next_run_ts = Some(now);
            }
        }
        Ok(())
    }
}

struct HeapEntry {
    next_run_ts: DateTime<Utc>,
    schedule_id: String,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.next_run_ts == other.next_run_ts
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Reversed so `BinaryHeap` (a max-heap) surfaces the earliest
/// `next_run_ts` first.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.next_run_ts.cmp(&self.next_run_ts)
    }
}

struct SchedulerState {
    heap: BinaryHeap<HeapEntry>,
    schedules: HashMap<String, Schedule>,
}

/// Owns the schedule store and the in-memory min-heap, materializing Jobs
/// onto the active queue backend as schedules come due.
pub struct Scheduler {
    store: Arc<ScheduleStore>,
    queue: Arc<dyn QueueBackend>,
    tasks: TaskRegistry,
    state: Mutex<SchedulerState>,
    wake: Notify,
    /// Best-effort, in-process count of currently-running executions per
    /// schedule id, used to honor `concurrency_limit` (`spec.md` §9 Open
    /// Question: not enqueued-but-unrun jobs, concurrently *running* ones).
    running: Arc<StdMutex<HashMap<String, u32>>>,
}

impl Scheduler {
    /// Load every persisted schedule, compute missing `next_run_ts`
    /// values, apply misfire policy to overdue ones, and build the heap
    /// (`spec.md` §4.6 startup steps 1-3).
    pub async fn start(store: Arc<ScheduleStore>, queue: Arc<dyn QueueBackend>, tasks: TaskRegistry) -> Result<Self> {
        let now = Utc::now();
        let mut schedules = store.list().await?;
        let mut heap = BinaryHeap::new();

        for schedule in schedules.iter_mut() {
            if !schedule.enabled {
                continue;
            }
            if schedule.next_run_ts.is_none() {
                schedule.next_run_ts = schedule.initial_next_run(now)?;
            }
            schedule.apply_misfire(now)?;
            if schedule.next_run_ts.is_none() {
                schedule.enabled = false;
            }
            store.upsert(schedule).await?;
        }

        for schedule in &schedules {
            if schedule.enabled {
                if let Some(ts) = schedule.next_run_ts {
                    heap.push(HeapEntry { next_run_ts: ts, schedule_id: schedule.id.clone() });
                }
            }
        }

        let schedules_by_id = schedules.into_iter().map(|s| (s.id.clone(), s)).collect();

        Ok(Self {
            store,
            queue,
            tasks,
            state: Mutex::new(SchedulerState { heap, schedules: schedules_by_id }),
            wake: Notify::new(),
            running: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    /// Main tick loop: wait for the next due time (or the idle tick), then
    /// dispatch everything that's due (`spec.md` §4.6's main loop).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                info!("scheduler shutting down");
                return;
            }
            let wait = self.next_wait().await;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            self.dispatch_due().await;
        }
    }

    async fn next_wait(&self) -> std::time::Duration {
        let state = self.state.lock().await;
        match state.heap.peek() {
            Some(top) => {
                let delta = top.next_run_ts - Utc::now();
                delta.to_std().unwrap_or(std::time::Duration::ZERO)
            }
            None => IDLE_TICK,
        }
    }

    async fn dispatch_due(&self) {
        let now = Utc::now();
        let due: Vec<Schedule> = {
            let mut state = self.state.lock().await;
            let mut due = Vec::new();
            while let Some(top) = state.heap.peek() {
                if top.next_run_ts > now {
                    break;
                }
                let entry = state.heap.pop().expect("just peeked");
                // `add`/`update`/`enable` can leave a stale heap entry
                // behind when they push a fresher one for the same id;
                // discard it here rather than dispatching twice.
                if let Some(schedule) = state.schedules.get(&entry.schedule_id) {
                    if schedule.next_run_ts == Some(entry.next_run_ts) {
                        due.push(schedule.clone());
                    }
                }
            }
            due
        };

        for schedule in due {
            self.dispatch_one(schedule, now).await;
        }
    }

    async fn dispatch_one(&self, mut schedule: Schedule, now: DateTime<Utc>) {
        if schedule.enabled {
            if self.tasks.get(&schedule.task_name).await.is_none() {
                warn!(schedule_id = %schedule.id, task_name = %schedule.task_name, "scheduled task not registered, skipping occurrence");
            } else {
                let within_limit = match schedule.concurrency_limit {
                    Some(limit) => self.running_count(&schedule.id) < limit,
                    None => true,
                };
                if within_limit {
                    self.materialize_and_enqueue(&schedule).await;
                } else {
                    debug!(schedule_id = %schedule.id, "concurrency_limit reached, skipping occurrence");
                }
            }
        }

        let base = schedule.next_run_ts.unwrap_or(now);
        match schedule.compute_next_run_from(base, now) {
            Ok(Some(ts)) => schedule.next_run_ts = Some(ts),
            Ok(None) => {
                schedule.next_run_ts = None;
                schedule.enabled = false;
            }
            Err(e) => {
                e.log();
                schedule.next_run_ts = None;
                schedule.enabled = false;
            }
        }
        schedule.updated_at = now;

        if let Err(e) = self.store.upsert(&schedule).await {
            e.log();
        }

        let mut state = self.state.lock().await;
        if schedule.enabled {
            if let Some(ts) = schedule.next_run_ts {
                state.heap.push(HeapEntry { next_run_ts: ts, schedule_id: schedule.id.clone() });
            }
        }
        state.schedules.insert(schedule.id.clone(), schedule);
    }

    fn running_count(&self, schedule_id: &str) -> u32 {
        *self.running.lock().unwrap().get(schedule_id).unwrap_or(&0)
    }

    /// Build a Job from the task's policy defaults and the schedule's
    /// default args/kwargs, and enqueue it. On a concurrency-limited
    /// schedule, wraps the task's own `after_job`/`on_error` hooks so the
    /// running count is decremented when the job reaches a terminal
    /// disposition the runner surfaces a hook for.
    async fn materialize_and_enqueue(&self, schedule: &Schedule) {
        let Some(task) = self.tasks.get(&schedule.task_name).await else { return };

        let mut job = Job::new(task.name.clone(), schedule.default_args.clone(), schedule.default_kwargs.clone())
            .with_retries(task.default_retries)
            .with_timeout_policy(task.default_timeout_policy);
        if let Some(secs) = task.default_timeout_secs {
            job = job.with_timeout_secs(secs);
        }
        if let Some(secs) = task.default_retry_delay_secs {
            job = job.with_retry_delay_secs(secs);
        }
        job.before_job = task.before_job.clone();

        if schedule.concurrency_limit.is_some() {
            *self.running.lock().unwrap().entry(schedule.id.clone()).or_insert(0) += 1;
            job.after_job = Some(self.decrementing_after_hook(schedule.id.clone(), task.after_job.clone()));
            job.on_error = Some(self.decrementing_error_hook(schedule.id.clone(), task.on_error.clone()));
        } else {
            job.after_job = task.after_job.clone();
            job.on_error = task.on_error.clone();
        }

        if let Err(e) = self.queue.enqueue(job).await {
            e.log();
        }
    }

    fn decrementing_after_hook(&self, schedule_id: String, inner: Option<AfterHook>) -> AfterHook {
        let running = self.running.clone();
        Arc::new(move |value: &Value| -> HookResult {
            decrement(&running, &schedule_id);
            match &inner {
                Some(hook) => hook(value),
                None => Ok(()),
            }
        })
    }

    fn decrementing_error_hook(&self, schedule_id: String, inner: Option<OnErrorHook>) -> OnErrorHook {
        let running = self.running.clone();
        Arc::new(move |detail: &JobErrorDetail| -> HookResult {
            decrement(&running, &schedule_id);
            match &inner {
                Some(hook) => hook(detail),
                None => Ok(()),
            }
        })
    }

    // ─── Public operations (`spec.md` §4.6) ────────────────────────────

    pub async fn add(&self, mut schedule: Schedule) -> Result<()> {
        let now = Utc::now();
        if schedule.next_run_ts.is_none() {
            schedule.next_run_ts = schedule.initial_next_run(now)?;
        }
        self.store.upsert(&schedule).await?;
        let mut state = self.state.lock().await;
        if schedule.enabled {
            if let Some(ts) = schedule.next_run_ts {
                state.heap.push(HeapEntry { next_run_ts: ts, schedule_id: schedule.id.clone() });
            }
        }
        state.schedules.insert(schedule.id.clone(), schedule);
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn update(&self, schedule: Schedule) -> Result<()> {
        self.store.upsert(&schedule).await?;
        let mut state = self.state.lock().await;
        state.schedules.insert(schedule.id.clone(), schedule.clone());
        if schedule.enabled {
            if let Some(ts) = schedule.next_run_ts {
                state.heap.push(HeapEntry { next_run_ts: ts, schedule_id: schedule.id });
            }
        }
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.store.remove(id).await?;
        let mut state = self.state.lock().await;
        state.schedules.remove(id);
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<Schedule> {
        self.state.lock().await.schedules.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Schedule> {
        self.state.lock().await.schedules.values().cloned().collect()
    }

    pub async fn enable(&self, id: &str) -> Result<()> {
        let schedule = {
            let mut state = self.state.lock().await;
            let Some(schedule) = state.schedules.get_mut(id) else {
                return Err(NuvomError::not_found("schedule", Some(id)));
            };
            schedule.enabled = true;
            if schedule.next_run_ts.is_none() {
                schedule.next_run_ts = schedule.initial_next_run(Utc::now())?;
            }
            schedule.clone()
        };
        self.store.upsert(&schedule).await?;
        let mut state = self.state.lock().await;
        if let Some(ts) = schedule.next_run_ts {
            state.heap.push(HeapEntry { next_run_ts: ts, schedule_id: schedule.id.clone() });
        }
        state.schedules.insert(schedule.id.clone(), schedule);
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn disable(&self, id: &str) -> Result<()> {
        let schedule = {
            let mut state = self.state.lock().await;
            let Some(schedule) = state.schedules.get_mut(id) else {
                return Err(NuvomError::not_found("schedule", Some(id)));
            };
            schedule.enabled = false;
            schedule.clone()
        };
        self.store.upsert(&schedule).await?;
        Ok(())
    }

    /// Dispatch a schedule's task immediately, independent of its normal
    /// cadence, without mutating `next_run_ts`.
    pub async fn run_once_now(&self, id: &str) -> Result<()> {
        let schedule = self.get(id).await.ok_or_else(|| NuvomError::not_found("schedule", Some(id)))?;
        self.materialize_and_enqueue(&schedule).await;
        Ok(())
    }
}

fn decrement(running: &Arc<StdMutex<HashMap<String, u32>>>, schedule_id: &str) {
    if let Some(n) = running.lock().unwrap().get_mut(schedule_id) {
        *n = n.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::queue::memory::MemoryQueue;
    use crate::task::{RegisterMode, Task};

    async fn test_scheduler() -> (Scheduler, TaskRegistry, Arc<dyn QueueBackend>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ScheduleStore::new(dir.path().join("schedules.db")).await.unwrap());
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        let tasks = TaskRegistry::new();
        tasks
            .register(Task::new("tick", Arc::new(|_args, _kwargs, _ctx| Ok(Value::Null))), RegisterMode::Strict)
            .await
            .unwrap();
        let scheduler = Scheduler::start(store, queue.clone(), tasks.clone()).await.unwrap();
        (scheduler, tasks, queue)
    }

    #[tokio::test]
    async fn cron_schedule_materializes_one_job_per_minute() {
        let (scheduler, _tasks, queue) = test_scheduler().await;
        let schedule = Schedule::new("every-minute", "tick", ScheduleType::Cron)
            .with_cron("* * * * *")
            .with_timezone("UTC");
        scheduler.add(schedule).await.unwrap();

        // force the first occurrence to be due right now
        {
            let mut state = scheduler.state.lock().await;
            if let Some(s) = state.schedules.get_mut("every-minute") {
                s.next_run_ts = Some(Utc::now());
            }
            state.heap.clear();
            state.heap.push(HeapEntry { next_run_ts: Utc::now(), schedule_id: "every-minute".to_string() });
        }

        scheduler.dispatch_due().await;
        assert_eq!(queue.qsize().await.unwrap(), 1);

        let after_first = scheduler.get("every-minute").await.unwrap().next_run_ts.unwrap();
        assert!(after_first > Utc::now());

        // a second tick before the next occurrence is due enqueues nothing
        scheduler.dispatch_due().await;
        assert_eq!(queue.qsize().await.unwrap(), 1);

        // force the second occurrence due and confirm it advances again,
        // mirroring one materialization per minute with the updated
        // `next_run_ts` persisted between firings
        {
            let mut state = scheduler.state.lock().await;
            if let Some(s) = state.schedules.get_mut("every-minute") {
                s.next_run_ts = Some(Utc::now());
            }
            state.heap.clear();
            state.heap.push(HeapEntry { next_run_ts: Utc::now(), schedule_id: "every-minute".to_string() });
        }
        scheduler.dispatch_due().await;
        assert_eq!(queue.qsize().await.unwrap(), 2);

        let after_second = scheduler.get("every-minute").await.unwrap().next_run_ts.unwrap();
        assert!(after_second > after_first);
    }

    #[tokio::test]
    async fn once_schedule_disables_after_firing() {
        let (scheduler, _tasks, queue) = test_scheduler().await;
        let schedule = Schedule::new("one-shot", "tick", ScheduleType::Once).with_run_at(Utc::now() - ChronoDuration::seconds(1));
        scheduler.add(schedule).await.unwrap();
        scheduler.dispatch_due().await;

        assert_eq!(queue.qsize().await.unwrap(), 1);
        let updated = scheduler.get("one-shot").await.unwrap();
        assert!(!updated.enabled);
    }

    #[tokio::test]
    async fn concurrency_limit_skips_occurrence_while_at_capacity() {
        let (scheduler, _tasks, queue) = test_scheduler().await;
        *scheduler.running.lock().unwrap().entry("limited".to_string()).or_insert(0) = 1;
        let schedule = Schedule::new("limited", "tick", ScheduleType::Interval)
            .with_interval_secs(60)
            .with_concurrency_limit(1);
        scheduler.add(schedule).await.unwrap();

        {
            let mut state = scheduler.state.lock().await;
            state.heap.clear();
            state.heap.push(HeapEntry { next_run_ts: Utc::now(), schedule_id: "limited".to_string() });
        }
        scheduler.dispatch_due().await;
        assert_eq!(queue.qsize().await.unwrap(), 0);
    }

    #[test]
    fn interval_recompute_always_moves_forward() {
        let schedule = Schedule::new("s", "tick", ScheduleType::Interval).with_interval_secs(1);
        let base = Utc::now();
        let now = base + ChronoDuration::milliseconds(1500);
        let next = schedule.compute_next_run_from(base, now).unwrap().unwrap();
        assert!(next > now);
    }
}
