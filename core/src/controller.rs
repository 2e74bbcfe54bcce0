// Poisoned mutex should fail the program
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::BoxFuture;
use pilot_protocol::Action;
use pilot_protocol::AgentState;
use pilot_protocol::AgentStateChangedArgs;
use pilot_protocol::DelegateArgs;
use pilot_protocol::DelegateResultArgs;
use pilot_protocol::ErrorArgs;
use pilot_protocol::Event;
use pilot_protocol::EventPayload;
use pilot_protocol::EventSource;
use pilot_protocol::Observation;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::agent::Agent;
use crate::agent::AgentRegistry;
use crate::config::CoreConfig;
use crate::error::CoreErr;
use crate::error::Result;
use crate::event_stream::EventStream;
use crate::event_stream::Subscriber;
use crate::state::State;
use crate::state::TrafficControlState;
use crate::stuck::StuckDetector;

/// Name under which every controller subscribes to its stream. Delegates
/// append-subscribe under the same name so unsubscription pops in LIFO
/// order.
const SUBSCRIBER_NAME: &str = "agent_controller";

/// Cadence of the step loop.
const STEP_TICK: Duration = Duration::from_millis(100);

const TRAFFIC_CONTROL_REMINDER: &str =
    "Please resume the task if you'd like to continue, or start a new one.";

/// An appended runnable action the controller is waiting on. The id arrives
/// when the stream echoes the action back through `on_event`; the matching
/// observation clears the slot.
struct PendingAction {
    id: Option<i64>,
    action: Action,
}

struct Inner {
    state: State,
    pending_action: Option<PendingAction>,
    delegate: Option<Arc<AgentController>>,
}

/// Owner of the step loop for one (sub)task.
///
/// Subscribes to the session's event stream, mutates its [`State`], invokes
/// the agent's `step`, enforces iteration and cost budgets, and manages the
/// lifecycle of delegate controllers. A top-level controller runs its own
/// loop task; a delegate is stepped by its parent.
pub struct AgentController {
    id: String,
    agent: Arc<dyn Agent>,
    event_stream: Arc<EventStream>,
    registry: Arc<AgentRegistry>,
    max_budget_per_task: Option<f64>,
    is_delegate: bool,
    stuck_detector: StuckDetector,
    cancel: CancellationToken,
    closed: AtomicBool,
    inner: Mutex<Inner>,
}

impl AgentController {
    /// Construct a top-level controller and spawn its step loop.
    pub fn new(
        agent: Arc<dyn Agent>,
        event_stream: Arc<EventStream>,
        registry: Arc<AgentRegistry>,
        config: &CoreConfig,
        initial_state: Option<State>,
    ) -> Result<Arc<Self>> {
        Self::construct(
            agent,
            event_stream,
            registry,
            config.sid.clone(),
            config.max_iterations,
            config.max_budget_per_task,
            initial_state,
            false,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn construct(
        agent: Arc<dyn Agent>,
        event_stream: Arc<EventStream>,
        registry: Arc<AgentRegistry>,
        sid: String,
        max_iterations: i64,
        max_budget_per_task: Option<f64>,
        initial_state: Option<State>,
        is_delegate: bool,
    ) -> Result<Arc<Self>> {
        // state from a previous session, state from a parent agent, or a
        // fresh state
        let mut state = initial_state.unwrap_or_else(|| State::new(max_iterations));
        if state.start_id == -1 {
            // starting fresh, at the top of the stream
            state.start_id = event_stream.get_latest_event_id() + 1;
        } else {
            debug!("[agent controller {sid}] restoring from event {}", state.start_id);
        }
        state.attach_history(event_stream.clone());

        let controller = Arc::new(Self {
            id: sid,
            agent,
            event_stream: event_stream.clone(),
            registry,
            max_budget_per_task,
            is_delegate,
            stuck_detector: StuckDetector::new(),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state,
                pending_action: None,
                delegate: None,
            }),
        });
        event_stream.subscribe(
            SUBSCRIBER_NAME,
            controller.clone() as Arc<dyn Subscriber>,
            is_delegate,
        )?;
        if !is_delegate {
            controller.spawn_step_loop();
        }
        Ok(controller)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_state(&self) -> AgentState {
        self.lock_inner().state.agent_state
    }

    /// Clone of the current state. The embedded history view stays bound to
    /// the live stream.
    pub fn state_snapshot(&self) -> State {
        self.lock_inner().state.clone()
    }

    pub fn has_delegate(&self) -> bool {
        self.lock_inner().delegate.is_some()
    }

    fn spawn_step_loop(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            info!("[agent controller {}] starting step loop", controller.id);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(STEP_TICK) => {}
                }
                controller.tick().await;
            }
            debug!("[agent controller {}] step loop exited", controller.id);
        });
    }

    /// One pass of the loop. A failure that is not part of the recognized
    /// recoverable set ends the task in `ERROR`.
    async fn tick(&self) {
        if let Err(e) = self.step().await {
            error!(
                "[agent controller {}] error while running the agent: {e}",
                self.id
            );
            self.report_error(
                "There was an unexpected error while running the agent",
                Some(&e),
            );
            self.set_agent_state_to(AgentState::Error);
        }
    }

    /// Cancel the step loop, park the agent in `STOPPED` and drop this
    /// controller's stream subscription. Idempotent. An active delegate is
    /// closed first.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let delegate = self.lock_inner().delegate.take();
        if let Some(delegate) = delegate {
            delegate.close();
        }
        self.cancel.cancel();
        self.set_agent_state_to(AgentState::Stopped);
        self.event_stream.unsubscribe(SUBSCRIBER_NAME);
    }

    fn step(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let delegate = {
                let inner = self.lock_inner();
                if inner.state.agent_state != AgentState::Running {
                    return Ok(());
                }
                if let Some(pending) = &inner.pending_action {
                    debug!(
                        "[agent controller {}] waiting for pending action: {}",
                        self.id,
                        pending.action.tag()
                    );
                    return Ok(());
                }
                inner.delegate.clone()
            };
            if let Some(delegate) = delegate {
                return self.step_delegate(delegate).await;
            }

            if let Some(message) = self.check_budgets() {
                self.report_error(&message, None);
                self.set_agent_state_to(AgentState::Paused);
                return Ok(());
            }

            let snapshot = {
                let mut inner = self.lock_inner();
                inner.state.iteration += 1;
                inner.state.local_iteration += 1;
                info!(
                    "{} LEVEL {} STEP {}",
                    self.agent.name(),
                    inner.state.delegate_level,
                    inner.state.iteration
                );
                inner.state.clone()
            };

            let action = match self.agent.step(&snapshot).await {
                Ok(action) => action,
                Err(e) if e.is_recoverable() => {
                    // surface the failure so the agent can self-correct next
                    // step
                    self.report_error(&e.to_string(), None);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            // the task's spend is whatever the agent's LLM accumulated; alias
            // it before fan-out so a delegate started by this very action
            // shares the same handle
            {
                let mut inner = self.lock_inner();
                inner.state.metrics = self.agent.metrics();
            }

            if action.runnable() {
                self.lock_inner().pending_action = Some(PendingAction {
                    id: None,
                    action: action.clone(),
                });
            }

            if !matches!(action, Action::Null(_)) {
                self.event_stream
                    .add(Event::action(action.clone()), EventSource::Agent)?;
            }
            if !action.runnable() {
                debug!(
                    "[agent controller {}] {} paired with null observation",
                    self.id,
                    action.tag()
                );
            }
            info!("action: {}", action.message());

            if self.is_stuck() {
                self.report_error("Agent got stuck in a loop", None);
                self.set_agent_state_to(AgentState::Error);
            }
            Ok(())
        })
    }

    /// Apply the iteration and cost gates. Returns the pause message when
    /// the task must throttle; flips `PAUSED → NORMAL` (allowing one more
    /// step) when the user already asked to resume.
    fn check_budgets(&self) -> Option<String> {
        let mut inner = self.lock_inner();
        let state = &mut inner.state;
        if state.iteration >= state.max_iterations {
            if state.traffic_control_state == TrafficControlState::Paused {
                info!("hitting traffic control, temporarily resume upon user request");
                state.traffic_control_state = TrafficControlState::Normal;
            } else {
                state.traffic_control_state = TrafficControlState::Throttling;
                return Some(format!(
                    "Agent reached maximum number of iterations, task paused. {TRAFFIC_CONTROL_REMINDER}"
                ));
            }
        } else if let Some(max_budget) = self.max_budget_per_task {
            let current_cost = state.metrics.accumulated_cost();
            if current_cost > max_budget {
                if state.traffic_control_state == TrafficControlState::Paused {
                    info!("hitting traffic control, temporarily resume upon user request");
                    state.traffic_control_state = TrafficControlState::Normal;
                } else {
                    state.traffic_control_state = TrafficControlState::Throttling;
                    return Some(format!(
                        "Task budget exceeded. Current cost: {current_cost:.2}, max budget: {max_budget:.2}, task paused. {TRAFFIC_CONTROL_REMINDER}"
                    ));
                }
            }
        }
        None
    }

    async fn step_delegate(&self, delegate: Arc<AgentController>) -> Result<()> {
        debug!("[agent controller {}] delegate active, stepping it", self.id);
        delegate.tick().await;
        match delegate.agent_state() {
            AgentState::Error => {
                delegate.close();
                self.lock_inner().delegate = None;
                self.report_error("Delegate agent encountered an error", None);
            }
            AgentState::Finished | AgentState::Rejected => {
                info!(
                    "[agent controller {}] delegate agent has finished execution",
                    self.id
                );
                let outputs = delegate.state_snapshot().outputs;
                // close the delegate before appending new events so its
                // subscription is gone by the time the result fans out
                delegate.close();
                self.lock_inner().delegate = None;

                let formatted = outputs
                    .iter()
                    .map(|(key, value)| {
                        let rendered = value
                            .as_str()
                            .map(str::to_string)
                            .unwrap_or_else(|| value.to_string());
                        format!("{key}: {rendered}")
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                let content =
                    format!("{} finishes task with {formatted}", delegate.agent.name());
                self.event_stream.add(
                    Event::observation(Observation::Delegate(DelegateResultArgs {
                        outputs,
                        content,
                    })),
                    EventSource::Agent,
                )?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Stuck if this controller's recent history repeats, or if the current
    /// delegate (recursively) is stuck.
    fn is_stuck(&self) -> bool {
        let (delegate, stuck) = {
            let inner = self.lock_inner();
            (
                inner.delegate.clone(),
                self.stuck_detector.is_stuck(&inner.state),
            )
        };
        if let Some(delegate) = delegate
            && delegate.is_stuck()
        {
            return true;
        }
        stuck
    }

    /// Record a user-visible error and surface it on the stream so the agent
    /// sees it next step. Used both for recoverable errors (the loop
    /// continues) and right before a terminal `ERROR` transition.
    fn report_error(&self, message: &str, exception: Option<&CoreErr>) {
        {
            let mut inner = self.lock_inner();
            inner.state.last_error = Some(match exception {
                Some(e) => format!("{message}: {e}"),
                None => message.to_string(),
            });
        }
        let observation = Observation::Error(ErrorArgs {
            content: message.to_string(),
        });
        if let Err(e) = self
            .event_stream
            .add(Event::observation(observation), EventSource::Agent)
        {
            error!("failed to report error on the stream: {e}");
        }
    }

    fn set_agent_state_to(&self, new_state: AgentState) {
        let resume = {
            let mut inner = self.lock_inner();
            let state = &mut inner.state;
            if new_state == state.agent_state {
                return;
            }
            debug!(
                "[agent controller {}] setting agent({}) state from {} to {new_state}",
                self.id,
                self.agent.name(),
                state.agent_state
            );
            if state.agent_state == AgentState::Paused
                && new_state == AgentState::Running
                && state.traffic_control_state == TrafficControlState::Throttling
            {
                // user intends to interrupt traffic control and let the task
                // resume temporarily
                state.traffic_control_state = TrafficControlState::Paused;
            }
            state.agent_state = new_state;
            if new_state == AgentState::Init {
                state.resume_state.take()
            } else {
                None
            }
        };

        if new_state.is_terminal() {
            self.agent.reset();
        }

        let observation = Observation::AgentStateChanged(AgentStateChangedArgs {
            agent_state: new_state,
            content: String::new(),
        });
        if let Err(e) = self
            .event_stream
            .add(Event::observation(observation), EventSource::Agent)
        {
            error!("failed to record agent state change: {e}");
        }

        if let Some(resume) = resume {
            self.set_agent_state_to(resume);
        }
    }

    fn start_delegate(&self, args: &DelegateArgs) -> Result<()> {
        let (metrics, max_iterations, delegate_level) = {
            let inner = self.lock_inner();
            (
                inner.state.metrics.clone(),
                inner.state.max_iterations,
                inner.state.delegate_level,
            )
        };
        let agent = self.registry.create(&args.agent, metrics.clone())?;
        // metrics are shared between parent and child so the delegate's
        // spend counts toward the parent's budget
        let state = State {
            inputs: args.inputs.clone(),
            max_iterations,
            delegate_level: delegate_level + 1,
            metrics,
            ..State::default()
        };
        info!("[agent controller {}] start delegate", self.id);
        let delegate = Self::construct(
            agent,
            self.event_stream.clone(),
            self.registry.clone(),
            format!("{}-delegate", self.id),
            max_iterations,
            self.max_budget_per_task,
            Some(state),
            true,
        )?;
        self.lock_inner().delegate = Some(delegate.clone());
        delegate.set_agent_state_to(AgentState::Running);
        Ok(())
    }

    fn handle_event(&self, event: &Event) -> Result<()> {
        match &event.payload {
            EventPayload::Action(action) => self.handle_action(event, action),
            EventPayload::Observation(observation) => {
                self.handle_observation(event, observation)
            }
        }
        Ok(())
    }

    fn handle_action(&self, event: &Event, action: &Action) {
        self.capture_pending_id(event, action);

        // While a delegate is active the deepest controller in the chain is
        // the acting one; control actions emitted by the delegate's agent
        // must not be interpreted by its ancestors.
        let has_delegate = self.has_delegate();
        match action {
            Action::ChangeAgentState(args) => self.set_agent_state_to(args.agent_state),
            Action::Message(args) => {
                if event.source == EventSource::User {
                    debug!(
                        "[agent controller {}] user message: {}",
                        self.id, args.content
                    );
                    if self.agent_state() != AgentState::Running {
                        self.set_agent_state_to(AgentState::Running);
                    }
                } else if event.source == EventSource::Agent && args.wait_for_response {
                    self.set_agent_state_to(AgentState::AwaitingUserInput);
                }
            }
            Action::Delegate(args) if !has_delegate => {
                if let Err(e) = self.start_delegate(args) {
                    self.report_error(&format!("Failed to start delegate: {e}"), None);
                }
            }
            Action::AddTask(args) if !has_delegate => {
                let result = {
                    let mut inner = self.lock_inner();
                    inner
                        .state
                        .root_task
                        .add_subtask(&args.parent, &args.goal, &args.subtasks)
                };
                if let Err(e) = result {
                    self.report_error(&e.to_string(), None);
                }
            }
            Action::ModifyTask(args) if !has_delegate => {
                let result = {
                    let mut inner = self.lock_inner();
                    inner
                        .state
                        .root_task
                        .set_subtask_state(&args.task_id, &args.state)
                };
                if let Err(e) = result {
                    self.report_error(&e.to_string(), None);
                }
            }
            Action::Finish(args) if !has_delegate => {
                self.lock_inner().state.outputs = args.outputs.clone();
                self.set_agent_state_to(AgentState::Finished);
            }
            Action::Reject(args) if !has_delegate => {
                self.lock_inner().state.outputs = args.outputs.clone();
                self.set_agent_state_to(AgentState::Rejected);
            }
            Action::Summarize(_) => {
                self.lock_inner().state.history.on_event(event);
            }
            _ => {}
        }
    }

    /// The stream echoes our own appended action back before any observation
    /// can pair with it; grab the id it was assigned.
    fn capture_pending_id(&self, event: &Event, action: &Action) {
        if event.source != EventSource::Agent {
            return;
        }
        let mut inner = self.lock_inner();
        if let Some(pending) = &mut inner.pending_action
            && pending.id.is_none()
            && pending.action == *action
        {
            pending.id = Some(event.id);
        }
    }

    fn handle_observation(&self, event: &Event, observation: &Observation) {
        {
            let mut inner = self.lock_inner();
            if let Some(pending) = &inner.pending_action
                && pending.id.is_some()
                && pending.id == event.cause_id()
            {
                debug!(
                    "[agent controller {}] {} answered by {}",
                    self.id,
                    pending.action.tag(),
                    observation.tag()
                );
                inner.pending_action = None;
                return;
            }
        }
        match observation {
            Observation::CmdOutput(_) => {
                // unsolicited (e.g. background) output; recorded against no
                // action
                debug!(
                    "[agent controller {}] unsolicited observation: {}",
                    self.id,
                    observation.tag()
                );
            }
            Observation::Delegate(_) => {
                self.lock_inner().state.history.on_event(event);
            }
            Observation::Error(_) => {
                debug!(
                    "[agent controller {}] error observation: {}",
                    self.id,
                    observation.content()
                );
            }
            _ => {}
        }
    }
}

impl Subscriber for AgentController {
    fn on_event(&self, event: &Event) -> anyhow::Result<()> {
        self.handle_event(event)?;
        Ok(())
    }
}

impl std::fmt::Debug for AgentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock_inner();
        f.debug_struct("AgentController")
            .field("id", &self.id)
            .field("agent", &self.agent.name())
            .field("agent_state", &inner.state.agent_state)
            .field("is_delegate", &self.is_delegate)
            .field("has_delegate", &inner.delegate.is_some())
            .field(
                "pending_action",
                &inner.pending_action.as_ref().map(|p| p.action.tag()),
            )
            .finish()
    }
}
