//! Alarm scheduler
//!
//! Alarms are recorded on the owning `ExtensionRuntime` and armed as tokio
//! timers. When a timer fires, the alarm is pushed to the context that
//! created it. A fired one-shot alarm stays in the record list until it is
//! cleared. Periodic alarms re-arm themselves and advance `scheduledTime`.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use extbus_session::{Alarm, ContextId, SessionId, SessionRegistry};

use crate::config::BusConfig;
use crate::contexts::ContextTable;
use crate::error::BusError;
use crate::protocol::{AlarmCreateInfo, AlarmOperationKind, AlarmRequest, ContextEvent};
use crate::Result;

const MS_PER_MINUTE: f64 = 60_000.0;

type TimerKey = (SessionId, String, String);

/// An armed timer. `generation` tells a finished task whether the entry
/// under its key is still its own.
struct Timer {
    generation: u64,
    handle: AbortHandle,
}

fn now_ms() -> f64 {
    Utc::now().timestamp_millis() as f64
}

pub struct AlarmScheduler {
    registry: SessionRegistry,
    contexts: ContextTable,
    timers: Arc<Mutex<HashMap<TimerKey, Timer>>>,
    generations: Arc<AtomicU64>,
    min_delay_minutes: f64,
    cancel_cleared: bool,
}

impl AlarmScheduler {
    pub fn new(registry: SessionRegistry, contexts: ContextTable, config: &BusConfig) -> Self {
        Self {
            registry,
            contexts,
            timers: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            min_delay_minutes: config.min_alarm_delay_minutes,
            cancel_cleared: config.cancel_cleared_alarms,
        }
    }

    /// Dispatch one `api-alarms-operation` request
    pub fn handle(&self, session_id: SessionId, owner: ContextId, request: AlarmRequest) -> Result<Value> {
        let name = request.name.unwrap_or_default();
        let ext = request.extension_id;

        match request.kind {
            AlarmOperationKind::Create => {
                let info = request.info.unwrap_or_default();
                self.create(session_id, owner, &ext, &name, &info)?;
                Ok(Value::Null)
            }
            AlarmOperationKind::Get => Ok(serde_json::to_value(self.get(session_id, &ext, &name)?)?),
            AlarmOperationKind::GetAll => Ok(serde_json::to_value(self.get_all(session_id, &ext)?)?),
            AlarmOperationKind::Clear => Ok(Value::Bool(self.clear(session_id, &ext, &name)?)),
            AlarmOperationKind::ClearAll => Ok(Value::Bool(self.clear_all(session_id, &ext)?)),
        }
    }

    /// Create and arm an alarm. Returns `None` when an alarm with that name
    /// already exists; the existing one is left untouched.
    pub fn create(
        &self,
        session_id: SessionId,
        owner: ContextId,
        extension_id: &str,
        name: &str,
        info: &AlarmCreateInfo,
    ) -> Result<Option<Alarm>> {
        let now = now_ms();
        let min_delay = self.min_delay_minutes;

        let created = self
            .registry
            .with_extension_mut(session_id, extension_id, |ext| -> Result<Option<Alarm>> {
                if ext.find_alarm(name).is_some() {
                    return Ok(None);
                }

                let alarm = Alarm {
                    name: name.to_string(),
                    scheduled_time: scheduled_time(now, info, min_delay)?,
                    period_in_minutes: info.period_in_minutes,
                };
                ext.add_alarm(alarm.clone());
                Ok(Some(alarm))
            })??;

        let Some(alarm) = created else {
            tracing::debug!(session_id, extension_id, alarm = name, "Alarm already exists");
            return Ok(None);
        };

        tracing::debug!(
            session_id,
            extension_id,
            alarm = name,
            scheduled_time = alarm.scheduled_time,
            period_in_minutes = ?alarm.period_in_minutes,
            "Alarm created"
        );

        let delay = Duration::from_millis((alarm.scheduled_time - now).max(0.0) as u64);
        self.arm(session_id, owner, extension_id, alarm.clone(), delay);

        Ok(Some(alarm))
    }

    fn arm(&self, session_id: SessionId, owner: ContextId, extension_id: &str, alarm: Alarm, delay: Duration) {
        let key: TimerKey = (session_id, extension_id.to_string(), alarm.name.clone());
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let scheduler = self.clone();
        let ext = extension_id.to_string();
        let task_key = key.clone();

        // Hold the lock across spawn so the task cannot finish and
        // unregister before it is registered.
        let mut timers = self.timers.lock();
        let task = tokio::spawn(async move {
            scheduler
                .run_timer(session_id, owner, ext, alarm, Instant::now() + delay)
                .await;
            scheduler.unregister(&task_key, generation);
        });

        let timer = Timer {
            generation,
            handle: task.abort_handle(),
        };
        if let Some(previous) = timers.insert(key, timer) {
            // A cleared alarm keeps its pending timer unless cancellation is on
            if self.cancel_cleared {
                previous.handle.abort();
            }
        }
    }

    fn unregister(&self, key: &TimerKey, generation: u64) {
        let mut timers = self.timers.lock();
        if timers.get(key).is_some_and(|timer| timer.generation == generation) {
            timers.remove(key);
        }
    }

    async fn run_timer(
        &self,
        session_id: SessionId,
        owner: ContextId,
        extension_id: String,
        mut alarm: Alarm,
        mut deadline: Instant,
    ) {
        loop {
            tokio::time::sleep_until(deadline).await;

            let current = self
                .registry
                .with_session(session_id, |session| {
                    session
                        .extension(&extension_id)
                        .and_then(|ext| ext.find_alarm(&alarm.name).cloned())
                })
                .ok()
                .flatten();

            match current {
                Some(record) => alarm = record,
                // Cleared while cancellation is disabled: one-shot still fires
                None if alarm.period_in_minutes.is_some() => break,
                None => {}
            }

            if let Err(e) = self.contexts.send(owner, ContextEvent::Alarm(alarm.clone())) {
                tracing::debug!(session_id, alarm = %alarm.name, error = %e, "Alarm owner gone");
                break;
            }

            tracing::debug!(session_id, extension_id = %extension_id, alarm = %alarm.name, "Alarm fired");

            let Some(period) = alarm.period_in_minutes else {
                break;
            };

            deadline += Duration::from_millis((period * MS_PER_MINUTE) as u64);
            let next = alarm.scheduled_time + period * MS_PER_MINUTE;
            let _ = self.registry.with_extension_mut(session_id, &extension_id, |ext| {
                if let Some(record) = ext.find_alarm_mut(&alarm.name) {
                    record.scheduled_time = next;
                }
            });
            alarm.scheduled_time = next;
        }
    }

    pub fn get(&self, session_id: SessionId, extension_id: &str, name: &str) -> Result<Option<Alarm>> {
        Ok(self
            .registry
            .extension(session_id, extension_id)?
            .find_alarm(name)
            .cloned())
    }

    pub fn get_all(&self, session_id: SessionId, extension_id: &str) -> Result<Vec<Alarm>> {
        Ok(self.registry.extension(session_id, extension_id)?.alarms)
    }

    pub fn clear(&self, session_id: SessionId, extension_id: &str, name: &str) -> Result<bool> {
        let removed = self
            .registry
            .with_extension_mut(session_id, extension_id, |ext| ext.remove_alarm(name))?;

        if removed.is_some() && self.cancel_cleared {
            let key: TimerKey = (session_id, extension_id.to_string(), name.to_string());
            if let Some(timer) = self.timers.lock().remove(&key) {
                timer.handle.abort();
            }
        }

        Ok(removed.is_some())
    }

    pub fn clear_all(&self, session_id: SessionId, extension_id: &str) -> Result<bool> {
        let removed = self
            .registry
            .with_extension_mut(session_id, extension_id, |ext| ext.clear_alarms())?;

        if self.cancel_cleared {
            self.cancel_where(|(sid, ext, _)| *sid == session_id && ext == extension_id);
        }

        Ok(!removed.is_empty())
    }

    /// Stop every timer of an unloaded extension
    pub fn drop_extension(&self, session_id: SessionId, extension_id: &str) {
        self.cancel_where(|(sid, ext, _)| *sid == session_id && ext == extension_id);
    }

    pub fn drop_session(&self, session_id: SessionId) {
        self.cancel_where(|(sid, _, _)| *sid == session_id);
    }

    pub fn armed(&self) -> usize {
        self.timers.lock().len()
    }

    fn cancel_where<F>(&self, predicate: F)
    where
        F: Fn(&TimerKey) -> bool,
    {
        self.timers.lock().retain(|key, timer| {
            if predicate(key) {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
    }
}

impl Clone for AlarmScheduler {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            contexts: self.contexts.clone(),
            timers: Arc::clone(&self.timers),
            generations: Arc::clone(&self.generations),
            min_delay_minutes: self.min_delay_minutes,
            cancel_cleared: self.cancel_cleared,
        }
    }
}

/// Resolve the first fire time in epoch milliseconds
fn scheduled_time(now: f64, info: &AlarmCreateInfo, min_delay: f64) -> Result<f64> {
    if let Some(period) = info.period_in_minutes {
        if !period.is_finite() || period < min_delay {
            return Err(BusError::InvalidArgument(format!(
                "periodInMinutes {} is below the minimum of {}",
                period, min_delay
            )));
        }
    }

    // delayInMinutes overrides when
    if let Some(delay) = info.delay_in_minutes {
        if !delay.is_finite() || delay < min_delay {
            return Err(BusError::InvalidArgument(format!(
                "delayInMinutes {} is below the minimum of {}",
                delay, min_delay
            )));
        }
        return Ok(now + delay * MS_PER_MINUTE);
    }

    if let Some(when) = info.when {
        return Ok(when);
    }

    Ok(now + info.period_in_minutes.unwrap_or(0.0) * MS_PER_MINUTE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::ContextInfo;
    use extbus_privacy::Blacklist;
    use extbus_session::{ExtensionRuntime, ManifestSummary};
    use std::path::PathBuf;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup(cancel_cleared: bool) -> (AlarmScheduler, ContextId, UnboundedReceiver<ContextEvent>) {
        let registry = SessionRegistry::new();
        registry.start_session(1, Blacklist::new()).unwrap();
        registry
            .load_extension(
                1,
                ExtensionRuntime::new(
                    "ext-a".to_string(),
                    PathBuf::from("/extensions/ext-a"),
                    ManifestSummary {
                        name: "A".to_string(),
                        version: "1.0".to_string(),
                        ..Default::default()
                    },
                ),
            )
            .unwrap();
        let contexts = ContextTable::new();
        let (owner, rx) = contexts.attach(1, ContextInfo::background("ext-a"));

        let mut config = BusConfig::new(PathBuf::from("/tmp"));
        config.cancel_cleared_alarms = cancel_cleared;
        (AlarmScheduler::new(registry, contexts, &config), owner, rx)
    }

    fn delay(minutes: f64) -> AlarmCreateInfo {
        AlarmCreateInfo {
            delay_in_minutes: Some(minutes),
            ..Default::default()
        }
    }

    async fn next_alarm(rx: &mut UnboundedReceiver<ContextEvent>) -> Alarm {
        match tokio::time::timeout(Duration::from_secs(600), rx.recv()).await {
            Ok(Some(ContextEvent::Alarm(alarm))) => alarm,
            other => panic!("expected an alarm, got {:?}", other),
        }
    }

    #[test]
    fn test_scheduled_time_rules() {
        let at = AlarmCreateInfo {
            when: Some(5_000.0),
            ..Default::default()
        };
        assert_eq!(scheduled_time(1_000.0, &at, 1.0).unwrap(), 5_000.0);

        let both = AlarmCreateInfo {
            when: Some(5_000.0),
            delay_in_minutes: Some(3.0),
            ..Default::default()
        };
        assert_eq!(scheduled_time(1_000.0, &both, 1.0).unwrap(), 181_000.0);

        let short_with_when = AlarmCreateInfo {
            when: Some(2_000.0),
            delay_in_minutes: Some(0.1),
            ..Default::default()
        };
        assert!(matches!(
            scheduled_time(1_000.0, &short_with_when, 1.0),
            Err(BusError::InvalidArgument(_))
        ));
        assert_eq!(scheduled_time(1_000.0, &delay(2.0), 1.0).unwrap(), 121_000.0);
        assert!(matches!(
            scheduled_time(1_000.0, &delay(0.5), 1.0),
            Err(BusError::InvalidArgument(_))
        ));

        let periodic = AlarmCreateInfo {
            period_in_minutes: Some(5.0),
            ..Default::default()
        };
        assert_eq!(scheduled_time(0.0, &periodic, 1.0).unwrap(), 300_000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_create_is_noop() {
        let (scheduler, owner, _rx) = setup(true);

        let first = scheduler.create(1, owner, "ext-a", "tick", &delay(1.0)).unwrap();
        assert!(first.is_some());
        let before = scheduler.get_all(1, "ext-a").unwrap();

        let second = scheduler.create(1, owner, "ext-a", "tick", &delay(5.0)).unwrap();
        assert!(second.is_none());
        assert_eq!(scheduler.get_all(1, "ext-a").unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_delay_rejected() {
        let (scheduler, owner, _rx) = setup(true);

        let err = scheduler
            .create(1, owner, "ext-a", "tick", &delay(0.5))
            .unwrap_err();
        assert!(matches!(err, BusError::InvalidArgument(_)));
        assert!(scheduler.get_all(1, "ext-a").unwrap().is_empty());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_fires_and_stays_recorded() {
        let (scheduler, owner, mut rx) = setup(true);
        scheduler.create(1, owner, "ext-a", "once", &delay(1.0)).unwrap();

        let fired = next_alarm(&mut rx).await;
        assert_eq!(fired.name, "once");
        assert!(scheduler.get(1, "ext-a", "once").unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_alarm_rearms() {
        let (scheduler, owner, mut rx) = setup(true);
        let info = AlarmCreateInfo {
            delay_in_minutes: Some(1.0),
            period_in_minutes: Some(2.0),
            ..Default::default()
        };
        let created = scheduler.create(1, owner, "ext-a", "every", &info).unwrap().unwrap();

        let first = next_alarm(&mut rx).await;
        let second = next_alarm(&mut rx).await;

        assert_eq!(first.scheduled_time, created.scheduled_time);
        assert_eq!(second.scheduled_time, created.scheduled_time + 2.0 * MS_PER_MINUTE);
        assert_eq!(
            scheduler.get(1, "ext-a", "every").unwrap().unwrap().scheduled_time,
            created.scheduled_time + 4.0 * MS_PER_MINUTE
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_timer() {
        let (scheduler, owner, mut rx) = setup(true);
        scheduler.create(1, owner, "ext-a", "once", &delay(1.0)).unwrap();

        assert!(scheduler.clear(1, "ext-a", "once").unwrap());
        assert!(!scheduler.clear(1, "ext-a", "once").unwrap());
        assert_eq!(scheduler.armed(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_without_cancellation_still_fires() {
        let (scheduler, owner, mut rx) = setup(false);
        scheduler.create(1, owner, "ext-a", "once", &delay(1.0)).unwrap();
        assert!(scheduler.clear(1, "ext-a", "once").unwrap());

        assert_eq!(next_alarm(&mut rx).await.name, "once");
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_delay_rejected_even_with_when() {
        let (scheduler, owner, _rx) = setup(true);
        let info = AlarmCreateInfo {
            when: Some(now_ms() + 1_000.0),
            delay_in_minutes: Some(0.1),
            ..Default::default()
        };

        assert!(scheduler.create(1, owner, "ext-a", "soon", &info).is_err());
        assert!(scheduler.get_all(1, "ext-a").unwrap().is_empty());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_timer_is_unregistered() {
        let (scheduler, owner, mut rx) = setup(true);
        scheduler.create(1, owner, "ext-a", "once", &delay(1.0)).unwrap();
        assert_eq!(scheduler.armed(), 1);

        next_alarm(&mut rx).await;
        tokio::task::yield_now().await;
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_timer_unregistered_when_owner_gone() {
        let (scheduler, owner, rx) = setup(true);
        let info = AlarmCreateInfo {
            delay_in_minutes: Some(1.0),
            period_in_minutes: Some(1.0),
            ..Default::default()
        };
        scheduler.create(1, owner, "ext-a", "every", &info).unwrap();
        drop(rx);

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreate_keeps_stale_timer_without_cancellation() {
        let (scheduler, owner, mut rx) = setup(false);
        scheduler.create(1, owner, "ext-a", "once", &delay(1.0)).unwrap();
        assert!(scheduler.clear(1, "ext-a", "once").unwrap());
        scheduler.create(1, owner, "ext-a", "once", &delay(3.0)).unwrap();

        let start = Instant::now();
        assert_eq!(next_alarm(&mut rx).await.name, "once");
        assert!(start.elapsed() < Duration::from_secs(120));

        assert_eq!(next_alarm(&mut rx).await.name, "once");
        assert!(start.elapsed() >= Duration::from_secs(180));

        tokio::task::yield_now().await;
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all() {
        let (scheduler, owner, _rx) = setup(true);
        scheduler.create(1, owner, "ext-a", "a", &delay(1.0)).unwrap();
        scheduler.create(1, owner, "ext-a", "b", &delay(2.0)).unwrap();

        assert!(scheduler.clear_all(1, "ext-a").unwrap());
        assert!(!scheduler.clear_all(1, "ext-a").unwrap());
        assert_eq!(scheduler.armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_extension() {
        let (scheduler, owner, _rx) = setup(true);
        assert!(scheduler.create(1, owner, "nope", "a", &delay(1.0)).is_err());
        assert!(scheduler.get_all(1, "nope").is_err());
    }
}
