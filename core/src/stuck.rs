use pilot_protocol::Action;
use pilot_protocol::Event;
use pilot_protocol::EventPayload;
use pilot_protocol::EventSource;
use pilot_protocol::NullArgs;
use pilot_protocol::Observation;
use tracing::warn;

use crate::state::State;

/// How many identical repetitions of an action (and its observation) count
/// as a loop.
const REPEAT_THRESHOLD: usize = 4;

/// How many occurrences of a two-pair alternating pattern count as a loop.
const PATTERN_THRESHOLD: usize = 3;

/// Pure predicate over the recent history that flags pathological loops.
///
/// User messages are ignored while inspecting the window: a reply from the
/// user does not break a repetition by itself. Equality compares tags and
/// semantic payload only; ids and timestamps never participate.
#[derive(Debug, Default)]
pub struct StuckDetector;

impl StuckDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn is_stuck(&self, state: &State) -> bool {
        let events: Vec<Event> = state
            .history
            .get_events(false)
            .filter(|event| {
                !matches!(
                    (&event.payload, event.source),
                    (EventPayload::Action(Action::Message(_)), EventSource::User)
                )
            })
            .collect();
        if events.len() < REPEAT_THRESHOLD {
            return false;
        }

        let mut last_actions: Vec<&Action> = Vec::new();
        let mut last_observations: Vec<&Observation> = Vec::new();
        for event in events.iter().rev() {
            match &event.payload {
                EventPayload::Action(action) => {
                    if last_actions.len() < REPEAT_THRESHOLD {
                        last_actions.push(action);
                    }
                }
                EventPayload::Observation(observation) => {
                    if last_observations.len() < REPEAT_THRESHOLD {
                        last_observations.push(observation);
                    }
                }
            }
            if last_actions.len() == REPEAT_THRESHOLD
                && last_observations.len() == REPEAT_THRESHOLD
            {
                break;
            }
        }

        if self.repeating_action_observation(&last_actions, &last_observations) {
            warn!("action, observation loop detected");
            return true;
        }
        if self.repeating_action_error(&last_actions, &last_observations) {
            warn!("action, error loop detected");
            return true;
        }
        if self.alternating_pattern(&events) {
            warn!("alternating action, observation pattern detected");
            return true;
        }
        false
    }

    /// The same action kept producing the same observation.
    fn repeating_action_observation(
        &self,
        actions: &[&Action],
        observations: &[&Observation],
    ) -> bool {
        actions.len() == REPEAT_THRESHOLD
            && observations.len() == REPEAT_THRESHOLD
            && all_equal(actions)
            && all_equal(observations)
    }

    /// The same action kept failing, regardless of how the error reads.
    fn repeating_action_error(
        &self,
        actions: &[&Action],
        observations: &[&Observation],
    ) -> bool {
        actions.len() == REPEAT_THRESHOLD
            && observations.len() == REPEAT_THRESHOLD
            && all_equal(actions)
            && observations
                .iter()
                .all(|observation| matches!(observation, Observation::Error(_)))
    }

    /// Two distinct actions alternating: `[A₁,O₁,A₂,O₂]` seen
    /// `PATTERN_THRESHOLD` times over the recent pairs.
    fn alternating_pattern(&self, events: &[Event]) -> bool {
        let pairs = pair_up(events);
        let len = pairs.len();
        if len < PATTERN_THRESHOLD * 2 {
            return false;
        }
        let a_side: Vec<&(Action, Observation)> =
            (0..PATTERN_THRESHOLD).map(|i| &pairs[len - 1 - 2 * i]).collect();
        let b_side: Vec<&(Action, Observation)> =
            (0..PATTERN_THRESHOLD).map(|i| &pairs[len - 2 - 2 * i]).collect();
        all_equal(&a_side) && all_equal(&b_side) && a_side[0].0 != b_side[0].0
    }
}

/// One `(action, observation)` pair per action, in window order. Runnable
/// actions pair by cause; everything else pairs with `Null`.
fn pair_up(events: &[Event]) -> Vec<(Action, Observation)> {
    let mut pairs = Vec::new();
    for event in events {
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

fn all_equal<T: PartialEq>(items: &[&T]) -> bool {
    items.windows(2).all(|pair| pair[0] == pair[1])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pilot_protocol::CmdOutputArgs;
    use pilot_protocol::CmdRunArgs;
    use pilot_protocol::ErrorArgs;
    use pilot_protocol::MessageArgs;

    use super::*;
    use crate::event_stream::EventStream;
    use crate::file_store::InMemoryFileStore;

    fn setup() -> (Arc<EventStream>, State) {
        let stream =
            Arc::new(EventStream::new("s", Arc::new(InMemoryFileStore::new())).unwrap());
        let mut state = State::new(100);
        state.history.start_id = 0;
        state.history.set_event_stream(stream.clone());
        (stream, state)
    }

    fn cmd(command: &str) -> Event {
        Event::action(Action::CmdRun(CmdRunArgs {
            command: command.to_string(),
            thought: String::new(),
        }))
    }

    fn output(content: &str, cause: i64) -> Event {
        Event::observation(Observation::CmdOutput(CmdOutputArgs {
            content: content.to_string(),
            command: String::new(),
            command_id: -1,
            exit_code: 0,
        }))
        .with_cause(cause)
    }

    fn error(content: &str, cause: i64) -> Event {
        Event::observation(Observation::Error(ErrorArgs {
            content: content.to_string(),
        }))
        .with_cause(cause)
    }

    #[test]
    fn four_identical_pairs_are_stuck() {
        let (stream, state) = setup();
        let detector = StuckDetector::new();
        for _ in 0..4 {
            let id = stream.add(cmd("echo"), EventSource::Agent).unwrap();
            stream
                .add(output("hello", id), EventSource::Environment)
                .unwrap();
        }
        assert!(detector.is_stuck(&state));
    }

    #[test]
    fn three_identical_pairs_are_not_stuck() {
        let (stream, state) = setup();
        let detector = StuckDetector::new();
        for _ in 0..3 {
            let id = stream.add(cmd("echo"), EventSource::Agent).unwrap();
            stream
                .add(output("hello", id), EventSource::Environment)
                .unwrap();
        }
        assert!(!detector.is_stuck(&state));
    }

    #[test]
    fn varying_output_is_not_stuck() {
        let (stream, state) = setup();
        let detector = StuckDetector::new();
        for i in 0..4 {
            let id = stream.add(cmd("date"), EventSource::Agent).unwrap();
            stream
                .add(output(&format!("t{i}"), id), EventSource::Environment)
                .unwrap();
        }
        assert!(!detector.is_stuck(&state));
    }

    #[test]
    fn repeated_errors_with_distinct_messages_are_stuck() {
        let (stream, state) = setup();
        let detector = StuckDetector::new();
        for i in 0..4 {
            let id = stream.add(cmd("make"), EventSource::Agent).unwrap();
            stream
                .add(error(&format!("failure {i}"), id), EventSource::Environment)
                .unwrap();
        }
        assert!(detector.is_stuck(&state));
    }

    #[test]
    fn user_messages_do_not_break_a_loop() {
        let (stream, state) = setup();
        let detector = StuckDetector::new();
        for i in 0..4 {
            let id = stream.add(cmd("echo"), EventSource::Agent).unwrap();
            stream
                .add(output("hello", id), EventSource::Environment)
                .unwrap();
            if i == 2 {
                stream
                    .add(
                        Event::action(Action::Message(MessageArgs {
                            content: "keep going".to_string(),
                            wait_for_response: false,
                        })),
                        EventSource::User,
                    )
                    .unwrap();
            }
        }
        assert!(detector.is_stuck(&state));
    }

    #[test]
    fn alternating_two_step_pattern_is_stuck() {
        let (stream, state) = setup();
        let detector = StuckDetector::new();
        for _ in 0..3 {
            let a = stream.add(cmd("ls"), EventSource::Agent).unwrap();
            stream.add(output("files", a), EventSource::Environment).unwrap();
            let b = stream.add(cmd("pwd"), EventSource::Agent).unwrap();
            stream.add(output("/root", b), EventSource::Environment).unwrap();
        }
        assert!(detector.is_stuck(&state));
    }

    #[test]
    fn distinct_progress_is_not_stuck() {
        let (stream, state) = setup();
        let detector = StuckDetector::new();
        for i in 0..6 {
            let id = stream
                .add(cmd(&format!("step-{i}")), EventSource::Agent)
                .unwrap();
            stream
                .add(output(&format!("out-{i}"), id), EventSource::Environment)
                .unwrap();
        }
        assert!(!detector.is_stuck(&state));
    }
}
