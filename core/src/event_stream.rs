// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use pilot_protocol::Event;
use pilot_protocol::EventPayload;
use pilot_protocol::EventSource;
use tracing::debug;
use tracing::warn;

use crate::error::CoreErr;
use crate::error::Result;
use crate::file_store::FileStore;

/// A named consumer of appended events. Callbacks run synchronously on the
/// appending context, in registration order; a failure is logged and the
/// remaining subscribers still run. Callbacks may re-enter
/// [`EventStream::add`]; the nested event is queued and delivered after the
/// current dispatch completes.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &Event) -> anyhow::Result<()>;
}

/// Predicate and variant allowlist applied by filtered iteration.
#[derive(Default)]
pub struct EventFilter {
    /// Only yield events from these sources.
    pub sources: Option<Vec<EventSource>>,

    /// Only yield events whose payload tag is listed.
    pub tags: Option<Vec<&'static str>>,

    /// Arbitrary predicate, applied last.
    pub predicate: Option<Box<dyn Fn(&Event) -> bool + Send + Sync>>,
}

impl EventFilter {
    fn accepts(&self, event: &Event) -> bool {
        if let Some(sources) = &self.sources
            && !sources.contains(&event.source)
        {
            return false;
        }
        if let Some(tags) = &self.tags {
            let tag = match &event.payload {
                EventPayload::Action(action) => action.tag(),
                EventPayload::Observation(observation) => observation.tag(),
            };
            if !tags.contains(&tag) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate
            && !predicate(event)
        {
            return false;
        }
        true
    }
}

struct StreamInner {
    next_id: i64,
    subscribers: Vec<(String, Arc<dyn Subscriber>)>,
    /// Events appended while a dispatch is in flight, waiting their turn.
    queue: VecDeque<Event>,
    dispatching: bool,
}

/// Append-only log of everything that happens in a session.
///
/// Ids are contiguous from 0 and owned by the stream; every appended event is
/// persisted as `sessions/<sid>/events/<id>.json` before fan-out. One stream
/// is shared by the controller, the sandbox adapter and any UI subscriber;
/// append and dispatch are serialized so all of them observe events in id
/// order.
pub struct EventStream {
    sid: String,
    file_store: Arc<dyn FileStore>,
    inner: Mutex<StreamInner>,
}

impl EventStream {
    /// Open the stream for `sid`. If the file store already holds events for
    /// this session the next id continues after the highest existing one;
    /// prior events are not re-delivered.
    pub fn new(sid: impl Into<String>, file_store: Arc<dyn FileStore>) -> Result<Self> {
        let sid = sid.into();
        let mut next_id = 0;
        for path in file_store.list(&events_prefix(&sid))? {
            if let Some(id) = parse_event_id(&path) {
                next_id = next_id.max(id + 1);
            }
        }
        if next_id > 0 {
            debug!("reopened event stream {sid} at id {next_id}");
        }
        Ok(Self {
            sid,
            file_store,
            inner: Mutex::new(StreamInner {
                next_id,
                subscribers: Vec::new(),
                queue: VecDeque::new(),
                dispatching: false,
            }),
        })
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Append `event`, stamping its id, timestamp and source. Returns the
    /// assigned id after every current subscriber has been notified (unless
    /// the append was re-entrant, in which case delivery is owed to the
    /// outer dispatch).
    pub fn add(&self, mut event: Event, source: EventSource) -> Result<i64> {
        let id = {
            let mut inner = self.inner.lock().unwrap();
            let id = inner.next_id;
            event.id = id;
            event.timestamp = Utc::now();
            event.source = source;
            let json = event.to_json()?;
            // Persist before the id is committed so a failed write leaves the
            // in-memory sequence untouched.
            self.file_store
                .write(&event_path(&self.sid, id), json.as_bytes())?;
            inner.next_id += 1;
            inner.queue.push_back(event);
            if inner.dispatching {
                return Ok(id);
            }
            inner.dispatching = true;
            id
        };
        self.drain();
        Ok(id)
    }

    fn drain(&self) {
        loop {
            let (event, subscribers) = {
                let mut inner = self.inner.lock().unwrap();
                match inner.queue.pop_front() {
                    Some(event) => (event, inner.subscribers.clone()),
                    None => {
                        inner.dispatching = false;
                        return;
                    }
                }
            };
            for (name, subscriber) in &subscribers {
                if let Err(e) = subscriber.on_event(&event) {
                    warn!(
                        "subscriber '{name}' failed on event {id}: {e:#}",
                        id = event.id
                    );
                }
            }
        }
    }

    /// Register a subscriber. With `append = false` the name must be unique;
    /// with `append = true` multiple subscriptions may share it (nested
    /// delegate controllers reuse their parent's stream this way).
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        subscriber: Arc<dyn Subscriber>,
        append: bool,
    ) -> Result<()> {
        let name = name.into();
        let mut inner = self.inner.lock().unwrap();
        if !append && inner.subscribers.iter().any(|(n, _)| *n == name) {
            return Err(CoreErr::Internal(format!(
                "subscriber already exists: {name}"
            )));
        }
        inner.subscribers.push((name, subscriber));
        Ok(())
    }

    /// Remove the most recently added subscription under `name`, so a
    /// delegate's registration pops off without disturbing its parent's.
    /// Idempotent.
    pub fn unsubscribe(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(pos) = inner.subscribers.iter().rposition(|(n, _)| n == name) {
            inner.subscribers.remove(pos);
        }
    }

    /// Highest id assigned so far, or -1 on an empty stream.
    pub fn get_latest_event_id(&self) -> i64 {
        self.inner.lock().unwrap().next_id - 1
    }

    pub fn get_event(&self, id: i64) -> Result<Event> {
        let bytes = self.file_store.read(&event_path(&self.sid, id))?;
        let raw = String::from_utf8(bytes)
            .map_err(|e| CoreErr::MalformedEvent(e.to_string()))?;
        Ok(Event::from_json(&raw)?)
    }

    /// Iterate the persisted log over `[start_id, end_id]`. `end_id = -1`
    /// snapshots the current tip; events appended during iteration are not
    /// yielded. `reverse` traverses high to low.
    pub fn get_events(&self, start_id: i64, end_id: i64, reverse: bool) -> EventIter<'_> {
        self.get_events_filtered(start_id, end_id, reverse, None)
    }

    pub fn get_events_filtered(
        &self,
        start_id: i64,
        end_id: i64,
        reverse: bool,
        filter: Option<EventFilter>,
    ) -> EventIter<'_> {
        let low = start_id.max(0);
        let high = if end_id >= 0 {
            end_id.min(self.get_latest_event_id())
        } else {
            self.get_latest_event_id()
        };
        EventIter {
            stream: self,
            next: if reverse { high } else { low },
            low,
            high,
            reverse,
            filter,
        }
    }

    /// Unsubscribe everyone and drop queued deliveries. Idempotent; the
    /// persisted log is untouched.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.clear();
        inner.queue.clear();
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("sid", &self.sid)
            .field("next_id", &self.inner.lock().unwrap().next_id)
            .finish()
    }
}

/// Snapshot iterator over a stream's persisted events.
pub struct EventIter<'a> {
    stream: &'a EventStream,
    next: i64,
    low: i64,
    high: i64,
    reverse: bool,
    filter: Option<EventFilter>,
}

impl Iterator for EventIter<'_> {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            if self.next < self.low || self.next > self.high {
                return None;
            }
            let id = self.next;
            self.next += if self.reverse { -1 } else { 1 };
            match self.stream.get_event(id) {
                Ok(event) => {
                    if self
                        .filter
                        .as_ref()
                        .is_none_or(|filter| filter.accepts(&event))
                    {
                        return Some(event);
                    }
                }
                Err(e) => {
                    warn!("skipping unreadable event {id}: {e}");
                }
            }
        }
    }
}

pub(crate) fn events_prefix(sid: &str) -> String {
    format!("sessions/{sid}/events/")
}

fn event_path(sid: &str, id: i64) -> String {
    format!("sessions/{sid}/events/{id}.json")
}

fn parse_event_id(path: &str) -> Option<i64> {
    path.rsplit('/')
        .next()?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use pilot_protocol::Action;
    use pilot_protocol::MessageArgs;
    use pilot_protocol::Observation;
    use pilot_protocol::CmdOutputArgs;
    use pilot_protocol::CmdRunArgs;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::file_store::InMemoryFileStore;

    fn message(content: &str) -> Event {
        Event::action(Action::Message(MessageArgs {
            content: content.to_string(),
            wait_for_response: false,
        }))
    }

    struct Recorder {
        seen: StdMutex<Vec<i64>>,
    }

    impl Subscriber for Recorder {
        fn on_event(&self, event: &Event) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.id);
            Ok(())
        }
    }

    #[test]
    fn ids_are_contiguous_from_zero() {
        let stream = EventStream::new("s", Arc::new(InMemoryFileStore::new())).unwrap();
        assert_eq!(stream.get_latest_event_id(), -1);
        assert_eq!(stream.add(message("a"), EventSource::User).unwrap(), 0);
        assert_eq!(stream.add(message("b"), EventSource::Agent).unwrap(), 1);
        assert_eq!(stream.get_latest_event_id(), 1);
    }

    #[test]
    fn subscribers_see_events_in_order() {
        let stream = EventStream::new("s", Arc::new(InMemoryFileStore::new())).unwrap();
        let recorder = Arc::new(Recorder {
            seen: StdMutex::new(Vec::new()),
        });
        stream.subscribe("rec", recorder.clone(), false).unwrap();
        stream.add(message("a"), EventSource::User).unwrap();
        stream.add(message("b"), EventSource::User).unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn duplicate_name_requires_append() {
        let stream = EventStream::new("s", Arc::new(InMemoryFileStore::new())).unwrap();
        let rec = Arc::new(Recorder {
            seen: StdMutex::new(Vec::new()),
        });
        stream.subscribe("rec", rec.clone(), false).unwrap();
        assert!(stream.subscribe("rec", rec.clone(), false).is_err());
        stream.subscribe("rec", rec.clone(), true).unwrap();
        assert_eq!(stream.subscriber_count(), 2);
        // unsubscribe pops the most recent registration first
        stream.unsubscribe("rec");
        assert_eq!(stream.subscriber_count(), 1);
        stream.unsubscribe("rec");
        stream.unsubscribe("rec");
        assert_eq!(stream.subscriber_count(), 0);
    }

    /// A subscriber that answers the first `run` action with an observation,
    /// exercising re-entrant `add`.
    struct Echo {
        stream: StdMutex<Option<Arc<EventStream>>>,
    }

    impl Subscriber for Echo {
        fn on_event(&self, event: &Event) -> anyhow::Result<()> {
            if let Some(Action::CmdRun(_)) = event.as_action() {
                let stream = self.stream.lock().unwrap().clone();
                if let Some(stream) = stream {
                    stream.add(
                        Event::observation(Observation::CmdOutput(CmdOutputArgs {
                            content: "ok".to_string(),
                            command: String::new(),
                            command_id: -1,
                            exit_code: 0,
                        }))
                        .with_cause(event.id),
                        EventSource::Environment,
                    )?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn reentrant_add_is_queued_and_ordered() {
        let stream = Arc::new(
            EventStream::new("s", Arc::new(InMemoryFileStore::new())).unwrap(),
        );
        let echo = Arc::new(Echo {
            stream: StdMutex::new(Some(stream.clone())),
        });
        let recorder = Arc::new(Recorder {
            seen: StdMutex::new(Vec::new()),
        });
        stream.subscribe("echo", echo, false).unwrap();
        stream.subscribe("rec", recorder.clone(), false).unwrap();

        let action = Event::action(Action::CmdRun(CmdRunArgs {
            command: "ls".to_string(),
            thought: String::new(),
        }));
        let id = stream.add(action, EventSource::Agent).unwrap();
        assert_eq!(id, 0);
        // the echoed observation was delivered after the action, to everyone
        assert_eq!(*recorder.seen.lock().unwrap(), vec![0, 1]);
        let obs = stream.get_event(1).unwrap();
        assert_eq!(obs.cause, Some(0));
    }

    #[test]
    fn iteration_filters_and_reverses() {
        let stream = EventStream::new("s", Arc::new(InMemoryFileStore::new())).unwrap();
        stream.add(message("a"), EventSource::User).unwrap();
        stream
            .add(
                Event::action(Action::CmdRun(CmdRunArgs {
                    command: "ls".to_string(),
                    thought: String::new(),
                })),
                EventSource::Agent,
            )
            .unwrap();
        stream.add(message("b"), EventSource::Agent).unwrap();

        let ids: Vec<i64> = stream.get_events(0, -1, false).map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let ids: Vec<i64> = stream.get_events(0, -1, true).map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 1, 0]);

        let filter = EventFilter {
            sources: Some(vec![EventSource::Agent]),
            tags: Some(vec!["message"]),
            predicate: None,
        };
        let ids: Vec<i64> = stream
            .get_events_filtered(0, -1, false, Some(filter))
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn reopening_continues_the_id_sequence() {
        let store: Arc<dyn FileStore> = Arc::new(InMemoryFileStore::new());
        {
            let stream = EventStream::new("s", store.clone()).unwrap();
            stream.add(message("a"), EventSource::User).unwrap();
            stream.add(message("b"), EventSource::User).unwrap();
        }
        let stream = EventStream::new("s", store).unwrap();
        assert_eq!(stream.get_latest_event_id(), 1);
        assert_eq!(stream.add(message("c"), EventSource::User).unwrap(), 2);
    }

    #[test]
    fn close_is_idempotent() {
        let stream = EventStream::new("s", Arc::new(InMemoryFileStore::new())).unwrap();
        let rec = Arc::new(Recorder {
            seen: StdMutex::new(Vec::new()),
        });
        stream.subscribe("rec", rec, false).unwrap();
        stream.close();
        stream.close();
        assert_eq!(stream.subscriber_count(), 0);
        // the log survives close
        stream.add(message("a"), EventSource::User).unwrap();
        assert_eq!(stream.get_latest_event_id(), 0);
    }

    struct Exploder;

    impl Subscriber for Exploder {
        fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("callback failure")
        }
    }

    #[test]
    fn failing_subscriber_does_not_stop_the_rest() {
        let stream = EventStream::new("s", Arc::new(InMemoryFileStore::new())).unwrap();
        let recorder = Arc::new(Recorder {
            seen: StdMutex::new(Vec::new()),
        });
        stream.subscribe("bad", Arc::new(Exploder), false).unwrap();
        stream.subscribe("rec", recorder.clone(), false).unwrap();
        stream.add(message("a"), EventSource::User).unwrap();
        assert_eq!(*recorder.seen.lock().unwrap(), vec![0]);
        // the event is in the log despite the failure
        assert!(stream.get_event(0).is_ok());
    }
}
