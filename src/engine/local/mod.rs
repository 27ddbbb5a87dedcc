//! In-process graph engine.
//!
//! [`LocalEngine`] implements [`GraphEngine`] over a daggy graph of
//! built-in elements. It is built from a textual description:
//!
//! ```text
//! packetsrc name=media caps="application/x-rtp, media=(string)video, clock-rate=(int)90000"
//!     ! rtcpreporter feedback=fb ! appsink name=out ;
//! packetsrc name=rtcp-in ! feedbacksink name=fb
//! ```
//!
//! One streaming thread drives every chain while the graph is PLAYING. On
//! each pass it:
//!
//! 1. sends stream-start, caps and segment from chain heads not yet started
//! 2. routes events queued by [`GraphEngine::send_event`]
//! 3. pulls one packet per chain through the installed pull callback
//!    (outside the graph lock) and runs it to the chain's sink
//! 4. ends chains without a pull callback once every fed chain has ended
//! 5. hands packets emitted for push slots to their [`RetryOutlet`]
//! 6. posts EOS once every chain's sink has seen end of stream
//!
//! Nothing is pushed once EOS has been posted.
//!
//! State changes step through adjacent states. Reaching PLAYING is
//! asynchronous: `set_state` starts the streaming thread and returns
//! [`StateChange::Async`]; the thread posts the final `StateChanged`.

mod element;
mod elements;
mod factory;
mod graph;

pub use element::{Element, ElementRole, ProcessContext, PropertyTable};
pub use elements::{
    AppSink, CapsFilter, FeedbackSinkElement, Identity, PacketSrc, RtcpReporterElement,
};
pub use factory::{ElementConstructor, ElementFactory};

use self::graph::{Chain, Graph, ProbeList};
use crate::config::EngineConfig;
use crate::engine::parser::parse_description;
use crate::engine::{
    BusMessage, ElementId, GraphEngine, GraphState, PIPELINE_SOURCE, PadProbe, PadRef, ProbeId,
    PropertyType, PropertyValue, PullHandler, PullResult, PushHandler, StateChange,
};
use crate::error::{Error, Result};
use crate::event::{PadEvent, Segment};
use crate::observability::{record_feedback_dropped, span_streaming};
use crate::packet::Packet;
use crate::sink::RetryOutlet;
use bytes::Bytes;
use smallvec::SmallVec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Virtual read-only property every element answers.
const NAME_PROPERTY: &str = "name";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Shared {
    name: String,
    config: EngineConfig,
    graph: Mutex<Graph>,
    probes: Mutex<HashMap<PadRef, Vec<(ProbeId, Arc<dyn PadProbe>)>>>,
    pull_slots: Mutex<HashMap<ElementId, Arc<dyn PullHandler>>>,
    push_slots: Mutex<HashMap<ElementId, RetryOutlet>>,
    pending_events: Mutex<VecDeque<(PadRef, PadEvent)>>,
    bus_tx: kanal::Sender<BusMessage>,
    bus_rx: kanal::Receiver<BusMessage>,
    state: Mutex<GraphState>,
    transition: Mutex<()>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_probe: AtomicU64,
    eos_posted: AtomicBool,
}

impl Shared {
    fn post(&self, message: BusMessage) {
        tracing::trace!(graph = %self.name, %message, "bus");
        let _ = self.bus_tx.send(message);
    }

    fn post_error(&self, element: String, error: &Error, debug: String) {
        tracing::error!(graph = %self.name, element = %element, error = %error, "element error");
        self.post(BusMessage::Error {
            source: element,
            message: error.to_string(),
            debug: Some(debug),
        });
    }

    fn current_state(&self) -> GraphState {
        *lock(&self.state)
    }

    fn probes_for(&self, pad: PadRef) -> ProbeList {
        lock(&self.probes)
            .get(&pad)
            .map(|list| list.iter().map(|(_, probe)| Arc::clone(probe)).collect())
            .unwrap_or_default()
    }

    fn stop_worker(&self) {
        self.running.store(false, Ordering::SeqCst);
        let Some(handle) = lock(&self.worker).take() else {
            return;
        };
        // Called from a probe or element on the streaming thread itself.
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            tracing::error!(graph = %self.name, "streaming thread panicked");
        }
    }
}

/// In-process [`GraphEngine`].
pub struct LocalEngine {
    shared: Arc<Shared>,
}

impl LocalEngine {
    /// Build an engine from a description with default settings.
    pub fn from_description(description: &str) -> Result<Self> {
        Self::with_config(description, EngineConfig::default())
    }

    /// Build an engine from a description.
    pub fn with_config(description: &str, config: EngineConfig) -> Result<Self> {
        Self::with_factory(description, config, &ElementFactory::new())
    }

    /// Build an engine using a custom element factory.
    pub fn with_factory(
        description: &str,
        config: EngineConfig,
        factory: &ElementFactory,
    ) -> Result<Self> {
        if config.max_packet_size == 0 {
            return Err(Error::Config("max packet size is zero".into()));
        }
        let parsed = parse_description(description)?;
        let graph = Graph::build(&parsed, factory)?;
        static NEXT_GRAPH: AtomicU64 = AtomicU64::new(0);
        let name = format!("graph{}", NEXT_GRAPH.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(
            graph = %name,
            elements = graph.element_count(),
            chains = graph.chains.len(),
            "graph built"
        );

        let (bus_tx, bus_rx) = kanal::unbounded();
        Ok(Self {
            shared: Arc::new(Shared {
                name,
                config,
                graph: Mutex::new(graph),
                probes: Mutex::new(HashMap::new()),
                pull_slots: Mutex::new(HashMap::new()),
                push_slots: Mutex::new(HashMap::new()),
                pending_events: Mutex::new(VecDeque::new()),
                bus_tx,
                bus_rx,
                state: Mutex::new(GraphState::Null),
                transition: Mutex::new(()),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
                next_probe: AtomicU64::new(1),
                eos_posted: AtomicBool::new(false),
            }),
        })
    }

    /// Engine instance name, used as the stream-id prefix.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Receiver of packets reaching the named sink.
    pub fn output(&self, element: &str) -> Result<kanal::Receiver<Packet>> {
        let graph = lock(&self.shared.graph);
        let id = graph
            .element_id(element)
            .ok_or_else(|| Error::UnknownElement(element.to_string()))?;
        graph
            .node(id)?
            .element
            .output()
            .ok_or_else(|| Error::Element(format!("{element} exposes no output")))
    }

    /// Whether the streaming thread is running.
    pub fn is_streaming(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn spawn_worker(&self) -> Result<()> {
        let mut slot = lock(&self.shared.worker);
        if let Some(old) = slot.take() {
            if old.join().is_err() {
                tracing::error!(graph = %self.shared.name, "streaming thread panicked");
            }
        }
        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-streaming", self.shared.name))
            .spawn(move || Worker::new(shared).run())
            .inspect_err(|_| self.shared.running.store(false, Ordering::SeqCst))?;
        *slot = Some(handle);
        Ok(())
    }
}

impl Drop for LocalEngine {
    fn drop(&mut self) {
        self.shared.stop_worker();
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("name", &self.shared.name)
            .field("state", &self.shared.current_state())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

impl GraphEngine for LocalEngine {
    fn element_by_name(&self, name: &str) -> Result<ElementId> {
        lock(&self.shared.graph)
            .element_id(name)
            .ok_or_else(|| Error::UnknownElement(name.to_string()))
    }

    fn element_name(&self, element: ElementId) -> Result<String> {
        Ok(lock(&self.shared.graph).node(element)?.name.clone())
    }

    fn set_state(&self, target: GraphState) -> Result<StateChange> {
        let shared = &self.shared;
        let _transition = lock(&shared.transition);
        if target < GraphState::Playing {
            shared.stop_worker();
        }

        loop {
            let current = shared.current_state();
            let Some(next) = current.step_toward(target) else {
                return Ok(StateChange::Success);
            };

            if next == GraphState::Playing {
                if !shared.running.load(Ordering::SeqCst) {
                    self.spawn_worker()?;
                }
                return Ok(StateChange::Async);
            }

            let changed = lock(&shared.graph).change_state(current, next);
            if let Err((element, e)) = changed {
                shared.post_error(element, &e, format!("state change {current} -> {next}"));
                return Ok(StateChange::Failure);
            }
            if current == GraphState::Paused && next == GraphState::Ready {
                shared.eos_posted.store(false, Ordering::SeqCst);
                lock(&shared.pending_events).clear();
            }

            *lock(&shared.state) = next;
            tracing::debug!(graph = %shared.name, old = %current, new = %next, "state changed");
            shared.post(BusMessage::StateChanged {
                source: PIPELINE_SOURCE.to_string(),
                old: current,
                new: next,
                pending: (next != target).then_some(target),
            });
        }
    }

    fn current_state(&self) -> GraphState {
        self.shared.current_state()
    }

    fn pop_bus_message(&self, timeout: Duration) -> Option<BusMessage> {
        if timeout.is_zero() {
            return self.shared.bus_rx.try_recv().ok().flatten();
        }
        self.shared.bus_rx.recv_timeout(timeout).ok()
    }

    fn set_pull_handler(
        &self,
        element: ElementId,
        handler: Option<Arc<dyn PullHandler>>,
    ) -> Result<()> {
        {
            let graph = lock(&self.shared.graph);
            let node = graph.node(element)?;
            if node.element.role() != ElementRole::Source {
                return Err(Error::Element(format!(
                    "{} has no pull callback slot",
                    node.name
                )));
            }
        }
        let mut slots = lock(&self.shared.pull_slots);
        match handler {
            Some(handler) => {
                slots.insert(element, handler);
            }
            None => {
                slots.remove(&element);
            }
        }
        Ok(())
    }

    fn set_push_handler(
        &self,
        element: ElementId,
        handler: Option<Arc<dyn PushHandler>>,
    ) -> Result<()> {
        let (name, retries) = {
            let graph = lock(&self.shared.graph);
            let node = graph.node(element)?;
            if !node.element.has_push_slot() {
                return Err(Error::Element(format!(
                    "{} has no push callback slot",
                    node.name
                )));
            }
            let retries = node
                .element
                .properties()
                .int64("max-retries")
                .map_or(0, |v| u32::try_from(v.max(0)).unwrap_or(u32::MAX));
            (node.name.clone(), retries)
        };
        let mut slots = lock(&self.shared.push_slots);
        match handler {
            Some(handler) => {
                slots.insert(element, RetryOutlet::new(name, handler, retries));
            }
            None => {
                slots.remove(&element);
            }
        }
        Ok(())
    }

    fn add_pad_probe(&self, pad: PadRef, probe: Arc<dyn PadProbe>) -> Result<ProbeId> {
        lock(&self.shared.graph).check_pad(pad)?;
        let id = ProbeId(self.shared.next_probe.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.probes)
            .entry(pad)
            .or_default()
            .push((id, probe));
        Ok(id)
    }

    fn remove_pad_probe(&self, probe: ProbeId) -> Result<()> {
        let mut probes = lock(&self.shared.probes);
        for list in probes.values_mut() {
            list.retain(|(id, _)| *id != probe);
        }
        probes.retain(|_, list| !list.is_empty());
        Ok(())
    }

    fn property_type(&self, element: ElementId, name: &str) -> Result<PropertyType> {
        let graph = lock(&self.shared.graph);
        let node = graph.node(element)?;
        if name == NAME_PROPERTY {
            return Ok(PropertyType::String);
        }
        node.element
            .properties()
            .property_type(name)
            .ok_or_else(|| Error::UnknownProperty {
                element: node.name.clone(),
                property: name.to_string(),
            })
    }

    fn get_property(&self, element: ElementId, name: &str) -> Result<PropertyValue> {
        let graph = lock(&self.shared.graph);
        let node = graph.node(element)?;
        if name == NAME_PROPERTY {
            return Ok(PropertyValue::String(node.name.clone()));
        }
        node.element
            .properties()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownProperty {
                element: node.name.clone(),
                property: name.to_string(),
            })
    }

    fn set_property(&self, element: ElementId, name: &str, value: PropertyValue) -> Result<()> {
        let mut graph = lock(&self.shared.graph);
        let node = graph.node_mut(element)?;
        if name == NAME_PROPERTY {
            return Err(Error::ReadOnlyProperty {
                element: node.name.clone(),
                property: name.to_string(),
            });
        }
        let props = node.element.properties_mut();
        let registered = props
            .property_type(name)
            .ok_or_else(|| Error::UnknownProperty {
                element: node.name.clone(),
                property: name.to_string(),
            })?;
        if registered != value.property_type() {
            return Err(Error::TypeMismatch {
                property: name.to_string(),
                expected: value.property_type(),
                found: registered,
            });
        }
        if props.is_writable(name) != Some(true) {
            return Err(Error::ReadOnlyProperty {
                element: node.name.clone(),
                property: name.to_string(),
            });
        }
        props.update(name, value);
        Ok(())
    }

    fn send_event(&self, pad: PadRef, event: PadEvent) -> Result<bool> {
        lock(&self.shared.graph).check_pad(pad)?;
        if !self.shared.running.load(Ordering::SeqCst) {
            return Ok(false);
        }
        lock(&self.shared.pending_events).push_back((pad, event));
        Ok(true)
    }
}

// ============================================================================
// Streaming thread
// ============================================================================

struct Worker {
    shared: Arc<Shared>,
    buffer: Vec<u8>,
}

/// Chain ready to pull: index, head node, head id.
type ActiveHead = (usize, daggy::NodeIndex, ElementId);

impl Worker {
    fn new(shared: Arc<Shared>) -> Self {
        let buffer = vec![0u8; shared.config.max_packet_size];
        Self { shared, buffer }
    }

    fn run(mut self) {
        let span = span_streaming(&self.shared.name);
        let _entered = span.enter();

        if !self.start() {
            return;
        }
        while self.shared.running.load(Ordering::SeqCst) {
            match self.pass() {
                Ok(true) => {}
                Ok(false) => thread::sleep(self.shared.config.idle_backoff),
                Err((element, e)) => {
                    self.shared
                        .post_error(element, &e, "streaming stopped".to_string());
                    self.shared.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
        tracing::debug!(graph = %self.shared.name, "streaming thread exiting");
    }

    /// PAUSED -> PLAYING, done here so it is ordered after `set_state` returned.
    fn start(&self) -> bool {
        let shared = &*self.shared;
        let mut state = lock(&shared.state);
        if !shared.running.load(Ordering::SeqCst) {
            return false;
        }
        let changed = lock(&shared.graph).change_state(GraphState::Paused, GraphState::Playing);
        if let Err((element, e)) = changed {
            shared.running.store(false, Ordering::SeqCst);
            shared.post_error(element, &e, "state change PAUSED -> PLAYING".to_string());
            return false;
        }
        *state = GraphState::Playing;
        drop(state);
        tracing::debug!(graph = %shared.name, "streaming");
        shared.post(BusMessage::StateChanged {
            source: PIPELINE_SOURCE.to_string(),
            old: GraphState::Paused,
            new: GraphState::Playing,
            pending: None,
        });
        true
    }

    /// One pass over every chain. Returns whether anything moved.
    fn pass(&mut self) -> std::result::Result<bool, (String, Error)> {
        let shared = Arc::clone(&self.shared);
        let probes = |pad: PadRef| shared.probes_for(pad);
        let mut ctx = ProcessContext::new(Instant::now());
        let mut moved = false;

        let pending: Vec<(PadRef, PadEvent)> = lock(&shared.pending_events).drain(..).collect();
        let active: SmallVec<[ActiveHead; 4]> = {
            let mut graph = lock(&shared.graph);
            for chain in 0..graph.chains.len() {
                if !graph.chains[chain].started {
                    moved = true;
                    start_chain(&mut graph, chain, &shared.name, &probes, &mut ctx);
                }
            }

            for (pad, event) in pending {
                moved = true;
                let is_eos = matches!(event, PadEvent::Eos);
                let out = graph.route(pad, event, &probes, &mut ctx);
                if is_eos && out.is_some() {
                    if let Some(chain) = graph.chain_of(pad.element) {
                        graph.chains[chain].eos_sent = true;
                        graph.chains[chain].eos_reached = true;
                    }
                }
            }

            graph
                .chains
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.eos_sent)
                .map(|(i, c)| (i, c.head, ElementId(c.head.index())))
                .collect()
        };

        let mut failure = None;
        for (chain, head, id) in active {
            let handler = lock(&shared.pull_slots).get(&id).cloned();
            let Some(handler) = handler else {
                continue;
            };
            match handler.pull(&mut self.buffer) {
                PullResult::Data(0) | PullResult::Transient => {}
                PullResult::Data(n) => {
                    moved = true;
                    let n = n.min(self.buffer.len());
                    let packet = Packet::copy_from_slice(&self.buffer[..n]);
                    if let Err(e) = lock(&shared.graph).process(head, packet, &mut ctx) {
                        failure = Some(e);
                        break;
                    }
                }
                PullResult::EndOfStream => {
                    moved = true;
                    let mut graph = lock(&shared.graph);
                    graph.chains[chain].eos_sent = true;
                    tracing::debug!(graph = %shared.name, chain, "source reached end of stream");
                    if graph
                        .route(PadRef::src(id), PadEvent::Eos, &probes, &mut ctx)
                        .is_some()
                    {
                        graph.chains[chain].eos_reached = true;
                    }
                }
            }
        }

        if failure.is_none() && self.finish_unfed_chains(&probes, &mut ctx) {
            moved = true;
        }

        self.deliver(&mut ctx);
        if let Some(failure) = failure {
            return Err(failure);
        }

        let all_reached = {
            let graph = lock(&shared.graph);
            !graph.chains.is_empty() && graph.chains.iter().all(|c| c.eos_reached)
        };
        if all_reached && !shared.eos_posted.swap(true, Ordering::SeqCst) {
            tracing::debug!(graph = %shared.name, "all sinks reached end of stream");
            shared.post(BusMessage::Eos {
                source: PIPELINE_SOURCE.to_string(),
            });
        }

        Ok(moved)
    }

    /// End chains that have no pull callback once every chain that has one
    /// ended. Returns whether any chain was ended.
    fn finish_unfed_chains(
        &self,
        probes: &dyn Fn(PadRef) -> ProbeList,
        ctx: &mut ProcessContext,
    ) -> bool {
        let shared = &*self.shared;
        let fed: SmallVec<[ElementId; 4]> = lock(&shared.pull_slots).keys().copied().collect();
        if fed.is_empty() {
            return false;
        }

        let mut graph = lock(&shared.graph);
        let is_fed = |chain: &Chain| fed.contains(&ElementId(chain.head.index()));
        if graph.chains.iter().any(|c| is_fed(c) && !c.eos_sent) {
            return false;
        }

        let unfed: SmallVec<[usize; 4]> = graph
            .chains
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.eos_sent && !is_fed(c))
            .map(|(i, _)| i)
            .collect();
        for &chain in &unfed {
            let head = ElementId(graph.chains[chain].head.index());
            graph.chains[chain].eos_sent = true;
            tracing::debug!(
                graph = %shared.name,
                chain,
                "no pull callback; ending with the fed chains"
            );
            if graph.route(PadRef::src(head), PadEvent::Eos, probes, ctx).is_some() {
                graph.chains[chain].eos_reached = true;
            }
        }
        !unfed.is_empty()
    }

    /// Apply side effects collected during the pass.
    fn deliver(&self, ctx: &mut ProcessContext) {
        let shared = &*self.shared;
        let pushes = ctx.take_pushes();
        if shared.eos_posted.load(Ordering::SeqCst) {
            if !pushes.is_empty() {
                tracing::trace!(
                    graph = %shared.name,
                    count = pushes.len(),
                    "after EOS; discarding pushes"
                );
            }
            for message in ctx.take_messages() {
                shared.post(message);
            }
            return;
        }
        let targets: SmallVec<[(Option<ElementId>, String, Bytes); 2]> = {
            let graph = lock(&shared.graph);
            pushes
                .into_iter()
                .map(|(name, data)| (graph.element_id(&name), name, data))
                .collect()
        };

        let mut dropped: SmallVec<[(String, usize); 1]> = SmallVec::new();
        {
            let mut slots = lock(&shared.push_slots);
            for (id, name, data) in targets {
                match id.and_then(|id| slots.get_mut(&id)) {
                    Some(outlet) => {
                        let report = outlet.offer(data);
                        if report.dropped > 0 {
                            dropped.push((name, report.dropped));
                        }
                    }
                    None => {
                        tracing::trace!(
                            element = %name,
                            len = data.len(),
                            "no push callback; discarding"
                        );
                    }
                }
            }
            for outlet in slots.values_mut() {
                if outlet.pending_bytes() == 0 {
                    continue;
                }
                let report = outlet.flush();
                if report.dropped > 0 {
                    dropped.push((outlet.element().to_string(), report.dropped));
                }
            }
        }

        for (element, bytes) in dropped {
            record_feedback_dropped(&element, bytes);
            shared.post(BusMessage::Warning {
                source: element,
                message: format!("dropped {bytes} feedback bytes after retries"),
                degraded: true,
            });
        }
        for message in ctx.take_messages() {
            shared.post(message);
        }
    }
}

/// Send stream-start, caps and segment from a chain head.
fn start_chain(
    graph: &mut Graph,
    chain: usize,
    graph_name: &str,
    probes: &dyn Fn(PadRef) -> ProbeList,
    ctx: &mut ProcessContext,
) {
    graph.chains[chain].started = true;
    let head = ElementId(graph.chains[chain].head.index());
    let Ok(node) = graph.node(head) else {
        return;
    };
    let stream_id = format!("{graph_name}/{}", node.name);
    let caps = node.element.caps();
    let pad = PadRef::src(head);

    graph.route(pad, PadEvent::StreamStart { stream_id }, probes, ctx);
    if let Some(caps) = caps {
        graph.route(pad, PadEvent::Caps(caps), probes, ctx);
    }
    graph.route(pad, PadEvent::Segment(Segment::default()), probes, ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{PadDirection, ProbeReturn, PushResult};

    const DESC: &str = "packetsrc name=src caps=\"application/x-rtp, media=(string)video, payload=(int)96, clock-rate=(int)90000, encoding-name=(string)VP8\" ! identity name=id ! appsink name=out";

    struct Feed {
        packets: Mutex<VecDeque<Vec<u8>>>,
    }

    impl Feed {
        fn new(packets: Vec<Vec<u8>>) -> Arc<Self> {
            Arc::new(Self {
                packets: Mutex::new(packets.into()),
            })
        }
    }

    impl PullHandler for Feed {
        fn pull(&self, into: &mut [u8]) -> PullResult {
            match self.packets.lock().unwrap().pop_front() {
                Some(p) => {
                    into[..p.len()].copy_from_slice(&p);
                    PullResult::Data(p.len())
                }
                None => PullResult::EndOfStream,
            }
        }
    }

    fn rtp(seq: u16) -> Vec<u8> {
        let mut p = vec![0x80, 96];
        p.extend_from_slice(&seq.to_be_bytes());
        p.extend_from_slice(&(seq as u32 * 3000).to_be_bytes());
        p.extend_from_slice(&0x1234u32.to_be_bytes());
        p.extend_from_slice(&[0xAA; 4]);
        p
    }

    fn wait_for(engine: &LocalEngine, pred: impl Fn(&BusMessage) -> bool) -> Option<BusMessage> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(msg) = engine.pop_bus_message(Duration::from_millis(50)) {
                if pred(&msg) {
                    return Some(msg);
                }
            }
        }
        None
    }

    #[test]
    fn test_state_steps_and_bus() {
        let engine = LocalEngine::from_description(DESC).unwrap();
        assert_eq!(engine.set_state(GraphState::Paused).unwrap(), StateChange::Success);
        assert_eq!(engine.current_state(), GraphState::Paused);

        let first = engine.pop_bus_message(Duration::ZERO).unwrap();
        assert_eq!(
            first,
            BusMessage::StateChanged {
                source: "pipeline".into(),
                old: GraphState::Null,
                new: GraphState::Ready,
                pending: Some(GraphState::Paused),
            }
        );
        assert!(matches!(
            engine.pop_bus_message(Duration::ZERO),
            Some(BusMessage::StateChanged { pending: None, .. })
        ));
        assert_eq!(engine.set_state(GraphState::Null).unwrap(), StateChange::Success);
    }

    #[test]
    fn test_packets_flow_then_eos() {
        let engine = LocalEngine::from_description(DESC).unwrap();
        let src = engine.element_by_name("src").unwrap();
        engine
            .set_pull_handler(src, Some(Feed::new(vec![rtp(1), rtp(2), rtp(3)])))
            .unwrap();
        let out = engine.output("out").unwrap();

        assert_eq!(engine.set_state(GraphState::Playing).unwrap(), StateChange::Async);
        assert!(wait_for(&engine, |m| matches!(m, BusMessage::Eos { .. })).is_some());
        assert_eq!(engine.current_state(), GraphState::Playing);

        assert_eq!(out.len(), 3);
        let first = out.try_recv().unwrap().unwrap();
        assert_eq!(first.rtp().unwrap().seq, 1);

        let id = engine.element_by_name("id").unwrap();
        assert!(matches!(
            engine.get_property(id, "processed").unwrap(),
            PropertyValue::Int64(3)
        ));
        assert_eq!(engine.set_state(GraphState::Null).unwrap(), StateChange::Success);
        assert!(!engine.is_streaming());
    }

    #[test]
    fn test_unfed_chain_ends_with_fed_chains() {
        let engine = LocalEngine::from_description(
            "packetsrc name=media ! appsink name=out ; \
             packetsrc name=rtcp-in ! feedbacksink name=fb",
        )
        .unwrap();
        let media = engine.element_by_name("media").unwrap();
        engine
            .set_pull_handler(media, Some(Feed::new(vec![rtp(1)])))
            .unwrap();

        engine.set_state(GraphState::Playing).unwrap();
        assert!(wait_for(&engine, |m| matches!(m, BusMessage::Eos { .. })).is_some());
        assert_eq!(engine.set_state(GraphState::Null).unwrap(), StateChange::Success);
    }

    #[test]
    fn test_element_error_posts_bus_error() {
        let engine = LocalEngine::from_description(
            "packetsrc name=src ! identity name=bad error-after=1 ! appsink",
        )
        .unwrap();
        let src = engine.element_by_name("src").unwrap();
        engine
            .set_pull_handler(src, Some(Feed::new(vec![rtp(1), rtp(2)])))
            .unwrap();
        engine.set_state(GraphState::Playing).unwrap();

        let error = wait_for(&engine, |m| matches!(m, BusMessage::Error { .. })).unwrap();
        assert_eq!(error.source(), "bad");
        assert_eq!(engine.set_state(GraphState::Null).unwrap(), StateChange::Success);
    }

    #[test]
    fn test_property_rules() {
        let engine = LocalEngine::from_description(DESC).unwrap();
        let src = engine.element_by_name("src").unwrap();

        assert_eq!(engine.property_type(src, "caps").unwrap(), PropertyType::String);
        assert!(matches!(
            engine.get_property(src, "name").unwrap(),
            PropertyValue::String(ref n) if n == "src"
        ));
        assert!(matches!(
            engine.set_property(src, "caps", PropertyValue::Int64(1)),
            Err(Error::TypeMismatch {
                expected: PropertyType::Int64,
                found: PropertyType::String,
                ..
            })
        ));
        assert!(matches!(
            engine.set_property(src, "packets", PropertyValue::Int64(1)),
            Err(Error::ReadOnlyProperty { .. })
        ));
        assert!(matches!(
            engine.set_property(src, "name", PropertyValue::String("x".into())),
            Err(Error::ReadOnlyProperty { .. })
        ));
        assert!(matches!(
            engine.property_type(src, "nope"),
            Err(Error::UnknownProperty { .. })
        ));
        engine
            .set_property(src, "is-live", PropertyValue::Bool(false))
            .unwrap();
        assert!(matches!(
            engine.get_property(src, "is-live").unwrap(),
            PropertyValue::Bool(false)
        ));
    }

    #[test]
    fn test_slots_and_probes() {
        let engine = LocalEngine::from_description(
            "packetsrc name=media ! appsink ; packetsrc name=rtcp ! feedbacksink name=fb",
        )
        .unwrap();
        let media = engine.element_by_name("media").unwrap();
        let fb = engine.element_by_name("fb").unwrap();

        struct Accept;
        impl PushHandler for Accept {
            fn push(&self, from: &[u8]) -> PushResult {
                PushResult::Accepted(from.len())
            }
        }
        assert!(engine.set_push_handler(media, Some(Arc::new(Accept))).is_err());
        engine.set_push_handler(fb, Some(Arc::new(Accept))).unwrap();
        assert!(engine.set_pull_handler(fb, Some(Feed::new(vec![]))).is_err());

        struct Nop;
        impl PadProbe for Nop {
            fn on_event(&self, _pad: PadDirection, _event: &PadEvent) -> ProbeReturn {
                ProbeReturn::Forward
            }
        }
        assert!(engine.add_pad_probe(PadRef::sink(media), Arc::new(Nop)).is_err());
        let a = engine.add_pad_probe(PadRef::src(media), Arc::new(Nop)).unwrap();
        let b = engine.add_pad_probe(PadRef::src(media), Arc::new(Nop)).unwrap();
        assert_ne!(a, b);
        engine.remove_pad_probe(a).unwrap();
        engine.remove_pad_probe(a).unwrap();
        assert_eq!(engine.shared.probes_for(PadRef::src(media)).len(), 1);

        assert!(!engine.send_event(PadRef::src(media), PadEvent::Eos).unwrap());
    }
}
