//! Per-resource synchronization: observe or poll, never both
//!
//! [`SyncScheduler`] owns the active update mechanism of one resource. Switching
//! mechanism releases the previous one (observe relation cancelled, poll timer
//! cancelled) before the new one is armed. Updates that were already in flight when a
//! mechanism was released are discarded by a generation check.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::coap_types::CoapResponse;
use crate::error::{AdapterError, Result};
use crate::resource::{ResourceDescriptor, SyncMode, UpdateSource};
use crate::transport::{CoapTransport, NotificationHandler, ObserveRelation};

/// Replaces the transport GET used by polling
pub type GetFunction =
    Arc<dyn Fn(&ResourceDescriptor) -> Result<Option<CoapResponse>> + Send + Sync>;

/// Cancellable fixed-rate task running on its own thread
///
/// The first tick runs immediately. Ticks are scheduled from the start time, a tick
/// that overruns makes the task skip the deadlines it missed instead of bursting, and
/// ticks never overlap. Cancelling only prevents future ticks.
pub struct ScheduledTask {
    name: String,
    cancel: Option<Sender<()>>,
}

impl ScheduledTask {
    pub fn fixed_rate(
        name: impl Into<String>,
        period: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Result<Self> {
        if period.is_zero() {
            return Err(AdapterError::Configuration(
                "task period must be greater than zero".into(),
            ));
        }

        let name = name.into();
        let (cancel, cancelled) = mpsc::channel::<()>();
        thread::Builder::new().name(name.clone()).spawn(move || {
            let mut next = Instant::now();
            loop {
                tick();

                next += period;
                let now = Instant::now();
                while next <= now {
                    next += period;
                }
                match cancelled.recv_timeout(next - now) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })?;

        Ok(Self {
            name,
            cancel: Some(cancel),
        })
    }

    /// Stop future ticks; idempotent and non-blocking
    pub fn cancel(&mut self) {
        if self.cancel.take().is_some() {
            debug!(task = %self.name, "scheduled task cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_none()
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Default)]
enum Mechanism {
    #[default]
    Idle,
    Observing(ObserveRelation),
    Polling(ScheduledTask),
}

/// Sync state machine of one resource
pub struct SyncScheduler {
    resource: Arc<ResourceDescriptor>,
    transport: Arc<dyn CoapTransport>,
    get_function: Option<GetFunction>,
    generation: Arc<AtomicU64>,
    mechanism: Mutex<Mechanism>,
}

impl SyncScheduler {
    pub fn new(resource: Arc<ResourceDescriptor>, transport: Arc<dyn CoapTransport>) -> Self {
        Self {
            resource,
            transport,
            get_function: None,
            generation: Arc::new(AtomicU64::new(0)),
            mechanism: Mutex::new(Mechanism::Idle),
        }
    }

    /// Poll through `get` instead of the transport
    pub fn with_get_function(mut self, get: GetFunction) -> Self {
        self.get_function = Some(get);
        self
    }

    pub fn resource(&self) -> &Arc<ResourceDescriptor> {
        &self.resource
    }

    /// Currently armed mechanism
    pub fn mode(&self) -> SyncMode {
        match *self.mechanism.lock() {
            Mechanism::Idle => SyncMode::Idle,
            Mechanism::Observing(_) => SyncMode::Observe,
            Mechanism::Polling(_) => SyncMode::Poll,
        }
    }

    /// Release the active mechanism and invalidate its in-flight updates
    fn release(&self, mechanism: &mut Mechanism) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        match std::mem::take(mechanism) {
            Mechanism::Observing(mut relation) => {
                relation.proactive_cancel();
                debug!(resource = %self.resource.uri(), "observe relation cancelled");
            }
            Mechanism::Polling(mut task) => task.cancel(),
            Mechanism::Idle => {}
        }
        self.resource.set_sync_mode(SyncMode::Idle);
    }

    /// Register an observation, replacing any active mechanism
    ///
    /// The registration round trip runs without holding the mechanism, so `mode` and
    /// `stop` answer meanwhile. A `stop` or restart issued during registration wins:
    /// the new relation is cancelled straight away. A registration failure leaves the
    /// resource idle; calling again retries.
    pub fn start_observing(&self) -> Result<()> {
        let generation = {
            let mut mechanism = self.mechanism.lock();
            self.release(&mut mechanism);
            self.generation.load(Ordering::SeqCst)
        };

        let current = Arc::clone(&self.generation);
        let resource = Arc::clone(&self.resource);
        let handler: NotificationHandler = Box::new(move |response| {
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            resource.record_response(response, UpdateSource::Observe);
        });

        let request = self.resource.get_request().observing();
        let mut relation = match self.transport.observe(&request, handler) {
            Ok(relation) => relation,
            Err(e) => {
                warn!(
                    resource = %self.resource.uri(),
                    "CoAP observe registration failed: {}", e
                );
                return Err(e);
            }
        };

        let mut mechanism = self.mechanism.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            relation.proactive_cancel();
            debug!(resource = %self.resource.uri(), "observation superseded during registration");
            return Ok(());
        }
        *mechanism = Mechanism::Observing(relation);
        self.resource.set_sync_mode(SyncMode::Observe);
        info!(resource = %self.resource.uri(), "CoAP observation started");
        Ok(())
    }

    /// Poll the resource every `period`, replacing any active mechanism
    pub fn start_auto_update(&self, period: Duration) -> Result<()> {
        let mut mechanism = self.mechanism.lock();
        self.release(&mut mechanism);

        let generation = self.generation.load(Ordering::SeqCst);
        let current = Arc::clone(&self.generation);
        let resource = Arc::clone(&self.resource);
        let transport = Arc::clone(&self.transport);
        let get_function = self.get_function.clone();

        let task = ScheduledTask::fixed_rate(
            format!("coap-poll{}", self.resource.uri()),
            period,
            move || {
                let is_current = || current.load(Ordering::SeqCst) == generation;
                if !is_current() {
                    return;
                }
                let response = match &get_function {
                    Some(get) => get(&resource),
                    None => transport.send(&resource.get_request()),
                };
                if !is_current() {
                    return;
                }
                match response {
                    Ok(response) => {
                        resource.record_response(response, UpdateSource::Poll);
                    }
                    Err(e) => {
                        warn!(resource = %resource.uri(), "CoAP poll failed: {}", e);
                        resource.record_error(e.to_string());
                    }
                }
            },
        )?;

        *mechanism = Mechanism::Polling(task);
        self.resource.set_sync_mode(SyncMode::Poll);
        info!(
            resource = %self.resource.uri(),
            period_ms = period.as_millis() as u64,
            "CoAP polling started"
        );
        Ok(())
    }

    /// Cancel whichever mechanism is active; a no-op when idle
    pub fn stop(&self) {
        let mut mechanism = self.mechanism.lock();
        if !matches!(*mechanism, Mechanism::Idle) {
            info!(resource = %self.resource.uri(), "CoAP synchronization stopped");
        }
        self.release(&mut mechanism);
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("resource", &self.resource.uri())
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::coap_types::{ContentFormat, ResponseCode};
    use crate::resource::{MethodSupport, ResourceKind};
    use crate::transport::mock::{MockTransport, Reply};

    const PERIOD: Duration = Duration::from_millis(20);

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn setup() -> (Arc<MockTransport>, SyncScheduler) {
        let transport = MockTransport::new();
        transport.set_fallback(Reply::Respond(CoapResponse::content(
            b"21.0".to_vec(),
            ContentFormat::TextPlain,
        )));
        let resource = Arc::new(ResourceDescriptor::new(
            "/sensor/temp",
            Some("temp".into()),
            ResourceKind::Sensor,
            ResourceKind::Sensor.capabilities(true, MethodSupport::default()),
            ContentFormat::TextPlain,
        ));
        let scheduler = SyncScheduler::new(resource, transport.clone());
        (transport, scheduler)
    }

    fn plain_gets(transport: &MockTransport) -> usize {
        transport
            .requests
            .lock()
            .iter()
            .filter(|r| r.observe.is_none())
            .count()
    }

    #[test]
    fn test_fixed_rate_task_ticks_until_cancelled() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut task = ScheduledTask::fixed_rate("test-task", PERIOD, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        // first tick is immediate
        assert!(wait_until(Duration::from_millis(500), || ticks.load(Ordering::SeqCst) >= 1));
        assert!(wait_until(Duration::from_secs(2), || ticks.load(Ordering::SeqCst) >= 3));

        task.cancel();
        task.cancel();
        assert!(task.is_cancelled());
        thread::sleep(PERIOD * 3);
        let after_cancel = ticks.load(Ordering::SeqCst);
        thread::sleep(PERIOD * 5);
        assert_eq!(ticks.load(Ordering::SeqCst), after_cancel);
    }

    #[test]
    fn test_slow_ticks_do_not_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let ticks = Arc::new(AtomicUsize::new(0));
        let (r, o, t) = (running.clone(), overlapped.clone(), ticks.clone());

        let task = ScheduledTask::fixed_rate("slow-task", Duration::from_millis(5), move || {
            if r.fetch_add(1, Ordering::SeqCst) > 0 {
                o.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(25));
            t.fetch_add(1, Ordering::SeqCst);
            r.fetch_sub(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(200));
        drop(task);
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
        // missed deadlines are skipped, not replayed
        assert!(ticks.load(Ordering::SeqCst) <= 10);
    }

    #[test]
    fn test_zero_period_rejected() {
        assert!(matches!(
            ScheduledTask::fixed_rate("zero", Duration::ZERO, || {}),
            Err(AdapterError::Configuration(_))
        ));
    }

    #[test]
    fn test_poll_caches_payload() {
        let (transport, scheduler) = setup();
        scheduler.start_auto_update(PERIOD).unwrap();
        assert_eq!(scheduler.mode(), SyncMode::Poll);
        assert_eq!(scheduler.resource().sync_mode(), SyncMode::Poll);

        assert!(wait_until(Duration::from_secs(1), || {
            scheduler.resource().snapshot().last_payload == b"21.0"
        }));
        assert!(transport.request_count() >= 1);
        scheduler.stop();
    }

    #[test]
    fn test_poll_null_response_records_error() {
        let (transport, scheduler) = setup();
        transport.set_fallback(Reply::Silence);
        scheduler.start_auto_update(PERIOD).unwrap();

        assert!(wait_until(Duration::from_secs(1), || {
            scheduler.resource().snapshot().last_error.as_deref()
                == Some("CoAP request got null response")
        }));
        scheduler.stop();
    }

    #[test]
    fn test_observe_replaces_poll() {
        let (transport, scheduler) = setup();
        scheduler.start_auto_update(PERIOD).unwrap();
        assert!(wait_until(Duration::from_secs(1), || plain_gets(&transport) >= 1));

        scheduler.start_observing().unwrap();
        assert_eq!(scheduler.mode(), SyncMode::Observe);
        assert_eq!(transport.active_observations(), 1);

        // at most one in-flight tick may still land after the switch
        thread::sleep(PERIOD * 2);
        let settled = plain_gets(&transport);
        thread::sleep(PERIOD * 5);
        assert_eq!(plain_gets(&transport), settled);

        transport.notify(
            "/sensor/temp",
            Some(CoapResponse::content(b"23.5".to_vec(), ContentFormat::TextPlain)),
        );
        assert_eq!(scheduler.resource().snapshot().last_payload, b"23.5");

        transport.notify(
            "/sensor/temp",
            Some(CoapResponse::error(ResponseCode::ServiceUnavailable, "")),
        );
        assert_eq!(
            scheduler.resource().snapshot().last_error.as_deref(),
            Some("Observed CoAP response with code=5.03")
        );
    }

    #[test]
    fn test_poll_replaces_observe() {
        let (transport, scheduler) = setup();
        scheduler.start_observing().unwrap();
        assert_eq!(transport.active_observations(), 1);

        let observe_request = transport.requests.lock()[0].clone();
        assert_eq!(observe_request.observe, Some(0));
        assert_eq!(observe_request.path, "/sensor/temp");

        scheduler.start_auto_update(PERIOD).unwrap();
        assert_eq!(transport.active_observations(), 0);
        assert_eq!(scheduler.mode(), SyncMode::Poll);

        // a late notification from the old relation must not reach the cache
        transport.notify("/sensor/temp", None);
        assert_eq!(scheduler.resource().snapshot().last_error, None);
        scheduler.stop();
    }

    #[test]
    fn test_observe_registration_failure_leaves_idle() {
        let (transport, scheduler) = setup();
        scheduler.start_auto_update(PERIOD).unwrap();
        transport.fail_observe.store(true, Ordering::SeqCst);

        assert!(matches!(
            scheduler.start_observing(),
            Err(AdapterError::Transport(_))
        ));
        assert_eq!(scheduler.mode(), SyncMode::Idle);
        assert_eq!(scheduler.resource().sync_mode(), SyncMode::Idle);

        // retry once the server is back
        transport.fail_observe.store(false, Ordering::SeqCst);
        scheduler.start_observing().unwrap();
        assert_eq!(scheduler.mode(), SyncMode::Observe);
    }

    /// Transport whose observe registration waits until released
    struct SlowRegistration {
        inner: Arc<MockTransport>,
        entered: Mutex<Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl CoapTransport for SlowRegistration {
        fn send(&self, request: &crate::coap_types::CoapRequest) -> Result<Option<CoapResponse>> {
            self.inner.send(request)
        }

        fn observe(
            &self,
            request: &crate::coap_types::CoapRequest,
            handler: NotificationHandler,
        ) -> Result<ObserveRelation> {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
            self.inner.observe(request, handler)
        }
    }

    #[test]
    fn test_stop_during_registration() {
        let (inner, scheduler) = setup();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let transport = Arc::new(SlowRegistration {
            inner: Arc::clone(&inner),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let scheduler = Arc::new(SyncScheduler::new(Arc::clone(scheduler.resource()), transport));

        let registering = {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || scheduler.start_observing())
        };
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // the registration is still pending; neither call may wait for it
        let (done_tx, done_rx) = mpsc::channel();
        {
            let scheduler = Arc::clone(&scheduler);
            thread::spawn(move || {
                let mode = scheduler.mode();
                scheduler.stop();
                let _ = done_tx.send(mode);
            });
        }
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(2)).unwrap(), SyncMode::Idle);

        release_tx.send(()).unwrap();
        registering.join().unwrap().unwrap();

        // the stop issued during registration wins
        assert_eq!(scheduler.mode(), SyncMode::Idle);
        assert_eq!(scheduler.resource().sync_mode(), SyncMode::Idle);
        assert_eq!(inner.active_observations(), 0);
        inner.notify(
            "/sensor/temp",
            Some(CoapResponse::content(b"30".to_vec(), ContentFormat::TextPlain)),
        );
        assert!(scheduler.resource().snapshot().last_payload.is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (transport, scheduler) = setup();
        scheduler.stop();
        assert_eq!(scheduler.mode(), SyncMode::Idle);

        scheduler.start_observing().unwrap();
        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.mode(), SyncMode::Idle);
        assert_eq!(transport.active_observations(), 0);
    }

    #[test]
    fn test_custom_get_function() {
        let (transport, scheduler) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let scheduler = scheduler.with_get_function(Arc::new(move |resource: &ResourceDescriptor| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(resource.uri(), "/sensor/temp");
            Ok(Some(CoapResponse::content(b"7".to_vec(), ContentFormat::TextPlain)))
        }));

        scheduler.start_auto_update(PERIOD).unwrap();
        assert!(wait_until(Duration::from_secs(1), || {
            scheduler.resource().snapshot().last_payload == b"7"
        }));
        scheduler.stop();
        assert!(calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(transport.request_count(), 0);
    }
}
