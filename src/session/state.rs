//! Per-session state: phase, cooperative stop flag, append-only event log,
//! and ownership of the open browser profile.
//!
//! The phase tells polling clients how far the run has progressed; the stop
//! flag tells the owning task to wind down. They are tracked separately
//! because a stop request must be visible to the task immediately while the
//! phase only changes at transition points.

use crate::core::types::{CrawlEvent, SessionPhase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub struct Session {
    pub id: String,
    stop: AtomicBool,
    inner: Mutex<Inner>,
}

struct Inner {
    phase: SessionPhase,
    events: Vec<CrawlEvent>,
    /// Profile id of the open browser session; exclusively owned by the
    /// running task, cleared through every exit path.
    active_profile: Option<String>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            stop: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                phase: SessionPhase::Idle,
                events: Vec::new(),
                active_profile: None,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.lock().phase
    }

    /// Admission control: succeed only from a non-running phase. On success
    /// the event log is replaced, the stop flag cleared, and phase→Running —
    /// all under one lock, so two concurrent starts cannot both win.
    pub fn try_begin_run(&self) -> bool {
        let mut inner = self.lock();
        if matches!(
            inner.phase,
            SessionPhase::Running | SessionPhase::StopRequested
        ) {
            return false;
        }
        inner.phase = SessionPhase::Running;
        inner.events = Vec::new();
        inner.active_profile = None;
        self.stop.store(false, Ordering::SeqCst);
        true
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let mut inner = self.lock();
        if inner.phase == SessionPhase::Running {
            inner.phase = SessionPhase::StopRequested;
        }
    }

    /// Polled by the owning task before every unit of work.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn push_event(&self, event: CrawlEvent) {
        self.lock().events.push(event);
    }

    /// Snapshot of the event log in append order.
    pub fn events(&self) -> Vec<CrawlEvent> {
        self.lock().events.clone()
    }

    pub fn set_active_profile(&self, profile_id: impl Into<String>) {
        self.lock().active_profile = Some(profile_id.into());
    }

    pub fn active_profile(&self) -> Option<String> {
        self.lock().active_profile.clone()
    }

    /// Completion sequence, shared by success, stop, and error paths: append
    /// the terminal event, phase→Stopped, clear the stop flag, and release
    /// handle ownership. Returns the profile id that still needs closing.
    pub fn finalize(&self, terminal_event: CrawlEvent) -> Option<String> {
        let mut inner = self.lock();
        inner.events.push(terminal_event);
        inner.phase = SessionPhase::Stopped;
        self.stop.store(false, Ordering::SeqCst);
        inner.active_profile.take()
    }

    /// Set by the watcher when the owning task panicked before its
    /// completion sequence could run.
    pub fn mark_failed(&self, message: impl Into<String>) -> Option<String> {
        let mut inner = self.lock();
        inner.events.push(CrawlEvent::new(None, message.into()));
        inner.phase = SessionPhase::Failed;
        self.stop.store(false, Ordering::SeqCst);
        inner.active_profile.take()
    }
}
