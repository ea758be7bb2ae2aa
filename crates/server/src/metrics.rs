use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    connections_active: AtomicU64,
    frames_ingress: AtomicU64,
    frames_egress: AtomicU64,
    frames_rejected: AtomicU64,
    sends_failed: AtomicU64,
    calls_started: AtomicU64,
    calls_ended: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_connections(&self) {
        self.connections_active.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decr_connections(&self) {
        self.connections_active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn mark_ingress(&self) {
        self.frames_ingress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_egress(&self) {
        self.frames_egress.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_send_failed(&self) {
        self.sends_failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_started(&self) {
        self.calls_started.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mark_call_ended(&self) {
        self.calls_ended.fetch_add(1, Ordering::SeqCst);
    }

    pub fn encode_prometheus(&self) -> String {
        format!(
            "# TYPE convo_connections_active gauge\nconvo_connections_active {}\n# TYPE convo_frames_ingress counter\nconvo_frames_ingress {}\n# TYPE convo_frames_egress counter\nconvo_frames_egress {}\n# TYPE convo_frames_rejected counter\nconvo_frames_rejected {}\n# TYPE convo_sends_failed counter\nconvo_sends_failed {}\n# TYPE convo_calls_started counter\nconvo_calls_started {}\n# TYPE convo_calls_ended counter\nconvo_calls_ended {}\n",
            self.connections_active.load(Ordering::SeqCst),
            self.frames_ingress.load(Ordering::SeqCst),
            self.frames_egress.load(Ordering::SeqCst),
            self.frames_rejected.load(Ordering::SeqCst),
            self.sends_failed.load(Ordering::SeqCst),
            self.calls_started.load(Ordering::SeqCst),
            self.calls_ended.load(Ordering::SeqCst)
        )
    }
}
