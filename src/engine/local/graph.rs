//! Element graph of the local engine using daggy.

use super::element::{Element, ProcessContext};
use super::factory::ElementFactory;
use crate::engine::parser::ParsedGraph;
use crate::engine::{ElementId, GraphState, PadDirection, PadProbe, PadRef, ProbeReturn};
use crate::error::{Error, Result};
use crate::event::PadEvent;
use crate::packet::Packet;
use daggy::{Dag, NodeIndex, Walker};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::sync::Arc;

/// Probes attached to one pad, in attachment order.
pub(crate) type ProbeList = SmallVec<[Arc<dyn PadProbe>; 2]>;

/// A node in the graph.
pub(crate) struct Node {
    pub(crate) name: String,
    pub(crate) element: Box<dyn Element>,
}

/// Streaming state of one source-to-sink chain.
#[derive(Debug)]
pub(crate) struct Chain {
    pub(crate) head: NodeIndex,
    /// Stream-start, caps and segment went out.
    pub(crate) started: bool,
    /// The source returned end of stream; no more pulls.
    pub(crate) eos_sent: bool,
    /// EOS arrived at the chain's sink.
    pub(crate) eos_reached: bool,
}

pub(crate) struct Graph {
    dag: Dag<Node, ()>,
    names: HashMap<String, NodeIndex>,
    pub(crate) chains: Vec<Chain>,
}

fn element_id(idx: NodeIndex) -> ElementId {
    ElementId(idx.index())
}

fn node_index(id: ElementId) -> NodeIndex {
    NodeIndex::new(id.0)
}

impl Graph {
    /// Instantiate a parsed description.
    ///
    /// Every chain must start with a source, end with a sink, and have only
    /// transforms in between.
    pub(crate) fn build(parsed: &ParsedGraph, factory: &ElementFactory) -> Result<Self> {
        let mut graph = Self {
            dag: Dag::new(),
            names: HashMap::new(),
            chains: Vec::with_capacity(parsed.chains.len()),
        };
        let mut counters: HashMap<&str, usize> = HashMap::new();

        for chain in &parsed.chains {
            if chain.len() < 2 {
                return Err(Error::InvalidDescription(format!(
                    "chain starting at '{}' has no sink",
                    chain.first().map(|e| e.factory.as_str()).unwrap_or_default()
                )));
            }

            let mut prev: Option<NodeIndex> = None;
            for (position, parsed_element) in chain.iter().enumerate() {
                let element = factory.create(parsed_element)?;
                let role = element.role();
                let first = position == 0;
                let last = position + 1 == chain.len();
                if first != !role.has_sink_pad() || last != !role.has_src_pad() {
                    return Err(Error::InvalidDescription(format!(
                        "{} cannot be linked at position {position}",
                        parsed_element.factory
                    )));
                }

                let name = match parsed_element.name() {
                    Some(name) => name.to_string(),
                    None => {
                        let n = counters.entry(parsed_element.factory.as_str()).or_insert(0);
                        let name = format!("{}{}", parsed_element.factory, n);
                        *n += 1;
                        name
                    }
                };
                if graph.names.contains_key(&name) {
                    return Err(Error::InvalidDescription(format!(
                        "duplicate element name '{name}'"
                    )));
                }

                let idx = graph.dag.add_node(Node {
                    name: name.clone(),
                    element,
                });
                graph.names.insert(name, idx);

                match prev {
                    Some(p) => {
                        graph.dag.add_edge(p, idx, ()).map_err(|_| {
                            Error::InvalidDescription("linking would create a cycle".into())
                        })?;
                    }
                    None => graph.chains.push(Chain {
                        head: idx,
                        started: false,
                        eos_sent: false,
                        eos_reached: false,
                    }),
                }
                prev = Some(idx);
            }
        }

        Ok(graph)
    }

    pub(crate) fn element_id(&self, name: &str) -> Option<ElementId> {
        self.names.get(name).copied().map(element_id)
    }

    pub(crate) fn node(&self, id: ElementId) -> Result<&Node> {
        self.dag
            .node_weight(node_index(id))
            .ok_or_else(|| Error::UnknownElement(format!("#{}", id.0)))
    }

    pub(crate) fn node_mut(&mut self, id: ElementId) -> Result<&mut Node> {
        self.dag
            .node_weight_mut(node_index(id))
            .ok_or_else(|| Error::UnknownElement(format!("#{}", id.0)))
    }

    /// Check that the pad exists on its element.
    pub(crate) fn check_pad(&self, pad: PadRef) -> Result<()> {
        let node = self.node(pad.element)?;
        let role = node.element.role();
        let exists = match pad.direction {
            PadDirection::Source => role.has_src_pad(),
            PadDirection::Sink => role.has_sink_pad(),
        };
        if exists {
            Ok(())
        } else {
            Err(Error::Element(format!(
                "{} has no {} pad",
                node.name, pad.direction
            )))
        }
    }

    pub(crate) fn element_count(&self) -> usize {
        self.dag.node_count()
    }

    fn next(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.dag.children(idx).walk_next(&self.dag).map(|(_, n)| n)
    }

    fn prev(&self, idx: NodeIndex) -> Option<NodeIndex> {
        self.dag.parents(idx).walk_next(&self.dag).map(|(_, n)| n)
    }

    /// Chain an element belongs to.
    pub(crate) fn chain_of(&self, id: ElementId) -> Option<usize> {
        let mut idx = node_index(id);
        while let Some(parent) = self.prev(idx) {
            idx = parent;
        }
        self.chains.iter().position(|c| c.head == idx)
    }

    /// Apply one adjacent state step to every element, sinks first.
    ///
    /// On failure returns the failing element's name.
    pub(crate) fn change_state(
        &mut self,
        from: GraphState,
        to: GraphState,
    ) -> std::result::Result<(), (String, Error)> {
        let count = self.dag.node_count();
        for i in (0..count).rev() {
            if let Some(node) = self.dag.node_weight_mut(NodeIndex::new(i)) {
                node.element
                    .change_state(from, to)
                    .map_err(|e| (node.name.clone(), e))?;
            }
        }
        if from == GraphState::Paused && to == GraphState::Ready {
            for chain in &mut self.chains {
                chain.started = false;
                chain.eos_sent = false;
                chain.eos_reached = false;
            }
        }
        Ok(())
    }

    /// Run a packet from a chain head towards its sink.
    pub(crate) fn process(
        &mut self,
        head: NodeIndex,
        mut packet: Packet,
        ctx: &mut ProcessContext,
    ) -> std::result::Result<(), (String, Error)> {
        let mut idx = head;
        loop {
            let Some(node) = self.dag.node_weight_mut(idx) else {
                return Ok(());
            };
            ctx.enter(&node.name);
            match node.element.process(packet, ctx) {
                Ok(Some(out)) => match self.next(idx) {
                    Some(next) => {
                        idx = next;
                        packet = out;
                    }
                    None => return Ok(()),
                },
                Ok(None) => return Ok(()),
                Err(e) => {
                    let name = self
                        .dag
                        .node_weight(idx)
                        .map(|n| n.name.clone())
                        .unwrap_or_default();
                    return Err((name, e));
                }
            }
        }
    }

    fn handle(
        &mut self,
        idx: NodeIndex,
        event: PadEvent,
        ctx: &mut ProcessContext,
    ) -> Option<PadEvent> {
        let node = self.dag.node_weight_mut(idx)?;
        ctx.enter(&node.name);
        node.element.handle_event(event, ctx)
    }

    /// Send an event into the graph at `pad`.
    ///
    /// Downstream events cross the source pad of one element, then the sink
    /// pad of the next, then that element handles them; upstream events do
    /// the mirror image. Flush events travel away from the pad they enter
    /// on. Returns the event if it made it to the end of the chain.
    pub(crate) fn route(
        &mut self,
        pad: PadRef,
        event: PadEvent,
        probes: &dyn Fn(PadRef) -> ProbeList,
        ctx: &mut ProcessContext,
    ) -> Option<PadEvent> {
        let downstream = match (event.is_downstream(), event.is_upstream()) {
            (true, false) => true,
            (false, true) => false,
            _ => pad.direction == PadDirection::Source,
        };
        let mut idx = node_index(pad.element);
        let mut event = event;

        if downstream {
            let mut at_src = pad.direction == PadDirection::Source;
            loop {
                if !at_src {
                    event = run_probes(probes, PadRef::sink(element_id(idx)), event)?;
                    event = self.handle(idx, event, ctx)?;
                }
                let Some(next) = self.next(idx) else {
                    return Some(event);
                };
                event = run_probes(probes, PadRef::src(element_id(idx)), event)?;
                idx = next;
                at_src = false;
            }
        } else {
            let mut at_sink = pad.direction == PadDirection::Sink;
            loop {
                if !at_sink {
                    event = run_probes(probes, PadRef::src(element_id(idx)), event)?;
                    event = self.handle(idx, event, ctx)?;
                }
                let Some(prev) = self.prev(idx) else {
                    return Some(event);
                };
                event = run_probes(probes, PadRef::sink(element_id(idx)), event)?;
                idx = prev;
                at_sink = false;
            }
        }
    }
}

fn run_probes(
    probes: &dyn Fn(PadRef) -> ProbeList,
    pad: PadRef,
    event: PadEvent,
) -> Option<PadEvent> {
    let mut event = event;
    for probe in probes(pad) {
        match probe.on_event(pad.direction, &event) {
            ProbeReturn::Forward => {}
            ProbeReturn::Drop => return None,
            ProbeReturn::Replace(replacement) => event = replacement,
        }
    }
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::parser::parse_description;
    use std::sync::Mutex;
    use std::time::Instant;

    fn build(desc: &str) -> Result<Graph> {
        Graph::build(&parse_description(desc)?, &ElementFactory::new())
    }

    struct Recorder {
        seen: Arc<Mutex<Vec<(PadDirection, String)>>>,
    }

    impl PadProbe for Recorder {
        fn on_event(&self, pad: PadDirection, event: &PadEvent) -> ProbeReturn {
            self.seen.lock().unwrap().push((pad, event.name().to_string()));
            ProbeReturn::Forward
        }
    }

    #[test]
    fn test_build_names_and_chains() {
        let graph = build(
            "packetsrc ! identity ! identity ! appsink name=out ; packetsrc ! feedbacksink",
        )
        .unwrap();
        assert_eq!(graph.chains.len(), 2);
        assert_eq!(graph.element_count(), 6);
        assert!(graph.element_id("identity1").is_some());
        assert!(graph.element_id("out").is_some());
        assert!(graph.element_id("packetsrc1").is_some());
        let fb = graph.element_id("feedbacksink0").unwrap();
        assert_eq!(graph.chain_of(fb), Some(1));
    }

    #[test]
    fn test_build_rejects_bad_chains() {
        assert!(build("identity ! appsink").is_err());
        assert!(build("packetsrc ! appsink ! identity").is_err());
        assert!(build("packetsrc").is_err());
        assert!(build("packetsrc name=a ! appsink name=a").is_err());
    }

    #[test]
    fn test_route_visits_pads_in_order() {
        let mut graph = build("packetsrc ! identity ! appsink").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder: Arc<dyn PadProbe> = Arc::new(Recorder { seen: seen.clone() });
        let probes = move |_pad: PadRef| -> ProbeList {
            let mut list = ProbeList::new();
            list.push(recorder.clone());
            list
        };
        let head = graph.element_id("packetsrc0").unwrap();
        let mut ctx = ProcessContext::new(Instant::now());

        let out = graph.route(PadRef::src(head), PadEvent::Eos, &probes, &mut ctx);
        assert_eq!(out, Some(PadEvent::Eos));
        let pads: Vec<_> = seen.lock().unwrap().iter().map(|(d, _)| *d).collect();
        use PadDirection::*;
        assert_eq!(pads, [Source, Sink, Source, Sink]);

        seen.lock().unwrap().clear();
        let sink = graph.element_id("appsink0").unwrap();
        let up = PadEvent::ForceKeyUnit(crate::event::ForceKeyUnit::upstream());
        assert!(graph.route(PadRef::sink(sink), up, &probes, &mut ctx).is_some());
        let pads: Vec<_> = seen.lock().unwrap().iter().map(|(d, _)| *d).collect();
        assert_eq!(pads, [Sink, Source, Sink, Source]);
    }

    #[test]
    fn test_process_reaches_sink() {
        let mut graph = build("packetsrc ! identity name=id ! appsink name=out").unwrap();
        let out = graph.element_id("out").unwrap();
        let rx = graph.node(out).unwrap().element.output().unwrap();
        let head = graph.chains[0].head;
        let mut ctx = ProcessContext::new(Instant::now());
        graph
            .process(head, Packet::copy_from_slice(&[1, 2, 3]), &mut ctx)
            .unwrap();
        assert_eq!(rx.len(), 1);
        let id = graph.element_id("id").unwrap();
        assert_eq!(
            graph.node(id).unwrap().element.properties().int64("processed"),
            Some(1)
        );
    }
}
