//! Pad event interceptor.
//!
//! A [`PadEventInterceptor`] is registered on one boundary pad of
//! a sub-graph. Every event crossing the pad is validated, handed to an
//! [`EventPolicy`], and the policy's decision is enforced:
//!
//! - EOS and flush events are never dropped. A `Drop` on them becomes
//!   `Forward`, and a `Replace` must keep the event kind.
//! - Malformed events (zero segment rate, stop before start, empty caps)
//!   are dropped and counted unless mandatory.
//! - Once teardown begins, events pass through without reaching the policy.
//!
//! Policies run inline on the engine's streaming thread and must not block
//! or do host I/O. Built-ins: [`ForwardAll`], [`CapsRewrite`],
//! [`KeyUnitWatcher`], [`CapsNegotiation`], and [`PolicyChain`] to compose
//! them.

use crate::caps::{Caps, CapsValue, RtpCodecParameters};
use crate::engine::{PadDirection, PadProbe, ProbeReturn};
use crate::error::{Error, Result};
use crate::event::{ForceKeyUnit, PadEvent, PadEventKind};
use crate::liveness::Liveness;
use crate::observability::record_event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

// ============================================================================
// Policy trait
// ============================================================================

/// Host policy deciding what happens to an event at a pad.
pub trait EventPolicy: Send + Sync {
    /// Decide for one event.
    fn decide(&self, pad: PadDirection, event: &PadEvent) -> ProbeReturn;
}

impl<F> EventPolicy for F
where
    F: Fn(PadDirection, &PadEvent) -> ProbeReturn + Send + Sync,
{
    fn decide(&self, pad: PadDirection, event: &PadEvent) -> ProbeReturn {
        self(pad, event)
    }
}

// ============================================================================
// Interceptor
// ============================================================================

/// Interceptor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterceptorStats {
    /// Events that reached the interceptor.
    pub seen: u64,
    /// Events let through unchanged.
    pub forwarded: u64,
    /// Events stopped at the pad.
    pub dropped: u64,
    /// Events swapped for another.
    pub replaced: u64,
    /// Policy decisions overridden to keep a mandatory event.
    pub overridden: u64,
    /// Events that failed validation.
    pub malformed: u64,
    /// Events passed through untouched because teardown had begun.
    pub bypassed: u64,
}

#[derive(Default)]
struct Counters {
    seen: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    replaced: AtomicU64,
    overridden: AtomicU64,
    malformed: AtomicU64,
    bypassed: AtomicU64,
}

/// Probe enforcing a host [`EventPolicy`] on one pad.
pub struct PadEventInterceptor {
    session: String,
    label: String,
    policy: Box<dyn EventPolicy>,
    liveness: Liveness,
    counters: Counters,
}

impl PadEventInterceptor {
    /// Create an interceptor. `label` names the pad in logs and metrics.
    pub fn new(
        session: impl Into<String>,
        label: impl Into<String>,
        policy: impl EventPolicy + 'static,
        liveness: Liveness,
    ) -> Self {
        Self {
            session: session.into(),
            label: label.into(),
            policy: Box::new(policy),
            liveness,
            counters: Counters::default(),
        }
    }

    /// Pad label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> InterceptorStats {
        InterceptorStats {
            seen: self.counters.seen.load(Ordering::Relaxed),
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            overridden: self.counters.overridden.load(Ordering::Relaxed),
            malformed: self.counters.malformed.load(Ordering::Relaxed),
            bypassed: self.counters.bypassed.load(Ordering::Relaxed),
        }
    }

    fn enforce(&self, event: &PadEvent, decision: ProbeReturn) -> ProbeReturn {
        if !event.is_mandatory() {
            return decision;
        }
        match decision {
            ProbeReturn::Drop => {
                self.counters.overridden.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session = %self.session,
                    pad = %self.label,
                    event = %event.name(),
                    "policy tried to drop a mandatory event; forwarding"
                );
                ProbeReturn::Forward
            }
            ProbeReturn::Replace(replacement) if replacement.kind() != event.kind() => {
                self.counters.overridden.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session = %self.session,
                    pad = %self.label,
                    event = %event.name(),
                    replacement = %replacement.name(),
                    "mandatory event replaced by another kind; forwarding original"
                );
                ProbeReturn::Forward
            }
            other => other,
        }
    }

    fn record(&self, event: &PadEvent, decision: &str) {
        record_event(&self.session, &self.label, event.name(), decision);
    }
}

impl PadProbe for PadEventInterceptor {
    fn on_event(&self, pad: PadDirection, event: &PadEvent) -> ProbeReturn {
        self.counters.seen.fetch_add(1, Ordering::Relaxed);

        let Some(_guard) = self.liveness.enter() else {
            self.counters.bypassed.fetch_add(1, Ordering::Relaxed);
            return ProbeReturn::Forward;
        };

        if let Err(e) = event.validate() {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                session = %self.session,
                pad = %self.label,
                event = %event.name(),
                error = %e,
                "malformed event"
            );
            if !event.is_mandatory() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.record(event, "malformed");
                return ProbeReturn::Drop;
            }
        }

        let mut decision = self.enforce(event, self.policy.decide(pad, event));
        if let ProbeReturn::Replace(replacement) = &decision {
            if let Err(e) = replacement.validate() {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    session = %self.session,
                    pad = %self.label,
                    error = %e,
                    "policy produced a malformed replacement; forwarding original"
                );
                decision = ProbeReturn::Forward;
            }
        }

        let label = match &decision {
            ProbeReturn::Forward => {
                self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
                "forward"
            }
            ProbeReturn::Drop => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                "drop"
            }
            ProbeReturn::Replace(_) => {
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                "replace"
            }
        };
        tracing::trace!(
            session = %self.session,
            pad = %self.label,
            direction = %pad,
            event = %event,
            decision = label,
            "pad event"
        );
        self.record(event, label);
        decision
    }
}

// ============================================================================
// Built-in policies
// ============================================================================

/// Forwards everything and counts events by kind.
///
/// Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct ForwardAll {
    counts: Arc<Mutex<HashMap<PadEventKind, u64>>>,
}

impl ForwardAll {
    /// Create a counting pass-through policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Events of `kind` seen so far.
    pub fn count(&self, kind: PadEventKind) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }
}

impl EventPolicy for ForwardAll {
    fn decide(&self, _pad: PadDirection, event: &PadEvent) -> ProbeReturn {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event.kind())
            .or_insert(0) += 1;
        ProbeReturn::Forward
    }
}

/// Rewrites RTP caps to describe a given codec.
///
/// Sets `payload`, `clock-rate`, `encoding-name` and optionally `ssrc`;
/// other fields pass through. Non-RTP caps are left alone.
pub struct CapsRewrite {
    codec: RtpCodecParameters,
    ssrc: Option<u32>,
}

impl CapsRewrite {
    /// Rewrite to `codec`.
    pub fn new(codec: RtpCodecParameters) -> Self {
        Self { codec, ssrc: None }
    }

    /// Also stamp this SSRC.
    pub fn with_ssrc(mut self, ssrc: u32) -> Self {
        self.ssrc = Some(ssrc);
        self
    }

    fn rewrite(&self, caps: &Caps) -> Option<Caps> {
        let (_, encoding) = self.codec.split_mime_type().ok()?;
        let mut out = caps.clone();
        out.set("payload", CapsValue::Int(self.codec.payload_type as i64));
        out.set("clock-rate", CapsValue::Int(self.codec.clock_rate as i64));
        out.set(
            "encoding-name",
            CapsValue::String(encoding.to_ascii_uppercase()),
        );
        if let Some(ssrc) = self.ssrc {
            out.set("ssrc", CapsValue::UInt(ssrc as u64));
        }
        (out != *caps).then_some(out)
    }
}

impl EventPolicy for CapsRewrite {
    fn decide(&self, _pad: PadDirection, event: &PadEvent) -> ProbeReturn {
        match event {
            PadEvent::Caps(caps) if caps.is_rtp() => match self.rewrite(caps) {
                Some(out) => ProbeReturn::Replace(PadEvent::Caps(out)),
                None => ProbeReturn::Forward,
            },
            _ => ProbeReturn::Forward,
        }
    }
}

/// Relays upstream key-unit requests to the host.
///
/// Install on the ingress source pad: when something downstream asks for a
/// keyframe, the host forwards the request to the remote sender (for RTP, a
/// picture loss indication). The event itself is forwarded.
pub struct KeyUnitWatcher {
    hook: Box<dyn Fn(&ForceKeyUnit) + Send + Sync>,
}

impl KeyUnitWatcher {
    /// Call `hook` for each request. The hook must not block.
    pub fn new(hook: impl Fn(&ForceKeyUnit) + Send + Sync + 'static) -> Self {
        Self {
            hook: Box::new(hook),
        }
    }

    /// Queue each request on a channel the host drains.
    pub fn channel() -> (Self, kanal::Receiver<ForceKeyUnit>) {
        let (tx, rx) = kanal::unbounded();
        let watcher = Self::new(move |request| {
            let _ = tx.try_send(*request);
        });
        (watcher, rx)
    }
}

impl EventPolicy for KeyUnitWatcher {
    fn decide(&self, _pad: PadDirection, event: &PadEvent) -> ProbeReturn {
        if let PadEvent::ForceKeyUnit(request) = event {
            if request.upstream {
                (self.hook)(request);
            }
        }
        ProbeReturn::Forward
    }
}

/// Latest caps seen by a [`CapsNegotiation`] policy.
#[derive(Default)]
pub struct NegotiatedCaps {
    caps: Mutex<Option<Caps>>,
    changed: Condvar,
    notify: tokio::sync::Notify,
}

impl NegotiatedCaps {
    /// Caps negotiated so far.
    pub fn get(&self) -> Option<Caps> {
        self.caps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, caps: Caps) {
        *self.caps.lock().unwrap_or_else(PoisonError::into_inner) = Some(caps);
        self.changed.notify_all();
        self.notify.notify_waiters();
    }

    /// Block until caps are known, up to `timeout`.
    pub fn wait(&self, timeout: Duration) -> Option<Caps> {
        let deadline = Instant::now() + timeout;
        let mut caps = self.caps.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(caps) = caps.as_ref() {
                return Some(caps.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            caps = self
                .changed
                .wait_timeout(caps, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Async form of [`wait`](Self::wait).
    pub async fn wait_async(&self, timeout: Duration) -> Option<Caps> {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if let Some(caps) = self.get() {
                    return caps;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.ok()
    }

    /// Wait for caps and convert them to RTP codec parameters.
    pub fn codec_parameters(&self, timeout: Duration) -> Result<RtpCodecParameters> {
        self.wait(timeout)
            .ok_or_else(|| Error::TransientIo(format!("caps not negotiated within {timeout:?}")))?
            .to_codec_parameters()
    }
}

/// Records caps crossing the pad. Install on the egress sink pad.
pub struct CapsNegotiation {
    state: Arc<NegotiatedCaps>,
}

impl CapsNegotiation {
    /// Create the policy and the handle the host waits on.
    pub fn new() -> (Self, Arc<NegotiatedCaps>) {
        let state = Arc::new(NegotiatedCaps::default());
        (
            Self {
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl EventPolicy for CapsNegotiation {
    fn decide(&self, _pad: PadDirection, event: &PadEvent) -> ProbeReturn {
        if let PadEvent::Caps(caps) = event {
            self.state.set(caps.clone());
        }
        ProbeReturn::Forward
    }
}

/// Runs policies in order.
///
/// Each policy sees the event as left by the previous one. The first `Drop`
/// wins.
#[derive(Default)]
pub struct PolicyChain {
    policies: Vec<Box<dyn EventPolicy>>,
}

impl PolicyChain {
    /// Create an empty chain (forwards everything).
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a policy.
    pub fn with(mut self, policy: impl EventPolicy + 'static) -> Self {
        self.policies.push(Box::new(policy));
        self
    }
}

impl EventPolicy for PolicyChain {
    fn decide(&self, pad: PadDirection, event: &PadEvent) -> ProbeReturn {
        let mut replaced: Option<PadEvent> = None;
        for policy in &self.policies {
            let current = replaced.as_ref().unwrap_or(event);
            match policy.decide(pad, current) {
                ProbeReturn::Forward => {}
                ProbeReturn::Drop => return ProbeReturn::Drop,
                ProbeReturn::Replace(next) => replaced = Some(next),
            }
        }
        match replaced {
            Some(event) => ProbeReturn::Replace(event),
            None => ProbeReturn::Forward,
        }
    }
}
