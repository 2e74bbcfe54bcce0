use std::sync::Arc;

use pilot_protocol::Action;
use pilot_protocol::Event;
use pilot_protocol::EventSource;
use pilot_protocol::NullArgs;
use pilot_protocol::Observation;
use tracing::debug;

use crate::event_stream::EventStream;

/// Filtered, windowed view over an [`EventStream`]; what an agent prompt
/// actually reads.
///
/// Not a container: every call reads the live stream inside the
/// `[start_id, end_id]` window (`end_id = -1` follows the tip), masking out
/// bookkeeping events, a delegate's internal traffic, and anything covered
/// by a condenser summary. Nothing is ever deleted from the log underneath.
#[derive(Debug, Clone)]
pub struct ShortTermHistory {
    pub start_id: i64,
    pub end_id: i64,
    stream: Option<Arc<EventStream>>,
    /// `(delegate action id, delegate observation id)` pairs; events strictly
    /// inside a range are hidden.
    delegate_ranges: Vec<(i64, i64)>,
    /// The injected summarize event, yielded in place of everything at or
    /// below `last_summarized_event_id`.
    summary: Option<Box<Event>>,
    last_summarized_event_id: i64,
}

impl Default for ShortTermHistory {
    fn default() -> Self {
        Self {
            start_id: -1,
            end_id: -1,
            stream: None,
            delegate_ranges: Vec::new(),
            summary: None,
            last_summarized_event_id: -1,
        }
    }
}

impl ShortTermHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind (or rebind, after a restore) the view to a stream.
    pub fn set_event_stream(&mut self, stream: Arc<EventStream>) {
        self.stream = Some(stream);
    }

    /// All visible events in the window, oldest first unless `reverse`.
    pub fn get_events(&self, reverse: bool) -> impl Iterator<Item = Event> + '_ {
        let start = self.start_id.max(0);
        let main = self
            .stream
            .as_ref()
            .map(|stream| stream.get_events(start, self.end_id, reverse))
            .into_iter()
            .flatten()
            .filter(move |event| self.visible(event));
        let head = (!reverse).then(|| self.summary_in_window()).flatten();
        let tail = reverse.then(|| self.summary_in_window()).flatten();
        head.into_iter().chain(main).chain(tail)
    }

    fn visible(&self, event: &Event) -> bool {
        if event.id <= self.last_summarized_event_id {
            return false;
        }
        if let Some(summary) = &self.summary
            && summary.id == event.id
        {
            // yielded in place of the chunk it replaces, not at its own slot
            return false;
        }
        match &event.payload {
            pilot_protocol::EventPayload::Action(action) => match action {
                Action::Null(_) | Action::ChangeAgentState(_) => return false,
                _ => {}
            },
            pilot_protocol::EventPayload::Observation(observation) => match observation {
                Observation::Null(_) | Observation::AgentStateChanged(_) => return false,
                _ => {}
            },
        }
        !self
            .delegate_ranges
            .iter()
            .any(|(start, end)| event.id > *start && event.id < *end)
    }

    fn summary_in_window(&self) -> Option<Event> {
        let summary = self.summary.as_deref()?;
        if self.last_summarized_event_id >= self.start_id.max(0) {
            Some(summary.clone())
        } else {
            None
        }
    }

    pub fn get_last_action(&self) -> Option<Action> {
        self.get_events(true)
            .find_map(|event| event.as_action().cloned())
    }

    pub fn get_last_observation(&self) -> Option<Observation> {
        self.get_events(true)
            .find_map(|event| event.as_observation().cloned())
    }

    pub fn get_last_user_message(&self) -> Option<String> {
        self.get_events(true).find_map(|event| {
            match (&event.payload, event.source) {
                (
                    pilot_protocol::EventPayload::Action(Action::Message(args)),
                    EventSource::User,
                ) => Some(args.content.clone()),
                _ => None,
            }
        })
    }

    pub fn get_last_agent_message(&self) -> Option<String> {
        self.get_events(true).find_map(|event| {
            match (&event.payload, event.source) {
                (
                    pilot_protocol::EventPayload::Action(Action::Message(args)),
                    EventSource::Agent,
                ) => Some(args.content.clone()),
                _ => None,
            }
        })
    }

    /// The last `n` visible events, oldest first.
    pub fn get_last_events(&self, n: usize) -> Vec<Event> {
        let mut tail: Vec<Event> = self.get_events(true).take(n).collect();
        tail.reverse();
        tail
    }

    /// Legacy projection for evaluation harnesses: one `(action,
    /// observation)` pair per action in the window. Runnable actions pair
    /// with the observation citing them as cause, or `Null` while still
    /// pending; non-runnable actions always pair with `Null`.
    pub fn compatibility_for_eval_history_pairs(&self) -> Vec<(Action, Observation)> {
        let events: Vec<Event> = self.get_events(false).collect();
        let mut pairs = Vec::new();
        for event in &events {
            let Some(action) = event.as_action() else {
                continue;
            };
            let observation = if action.runnable() {
                events.iter().find_map(|candidate| {
                    match candidate.as_observation() {
                        Some(observation) if candidate.cause_id() == Some(event.id) => {
                            Some(observation.clone())
                        }
                        _ => None,
                    }
                })
            } else {
                None
            };
            pairs.push((
                action.clone(),
                observation.unwrap_or(Observation::Null(NullArgs {})),
            ));
        }
        pairs
    }

    /// Out-of-band notifications that reshape the view: a completed delegate
    /// collapses its internal traffic, a condenser summary masks an old
    /// prefix.
    pub fn on_event(&mut self, event: &Event) {
        match &event.payload {
            pilot_protocol::EventPayload::Observation(Observation::Delegate(_)) => {
                if let Some(start) = self.find_delegate_action_before(event.id) {
                    debug!("history: hiding delegate events in ({start}, {})", event.id);
                    self.delegate_ranges.push((start, event.id));
                }
            }
            pilot_protocol::EventPayload::Action(Action::Summarize(args)) => {
                self.last_summarized_event_id = args.last_summarized_event_id;
                self.summary = Some(Box::new(event.clone()));
            }
            _ => {}
        }
    }

    /// Nearest preceding `delegate` action that is not already the start of
    /// a recorded range.
    fn find_delegate_action_before(&self, id: i64) -> Option<i64> {
        let stream = self.stream.as_ref()?;
        stream
            .get_events(self.start_id.max(0), id - 1, true)
            .find_map(|event| match event.as_action() {
                Some(Action::Delegate(_))
                    if !self.delegate_ranges.iter().any(|(s, _)| *s == event.id) =>
                {
                    Some(event.id)
                }
                _ => None,
            })
    }
}
