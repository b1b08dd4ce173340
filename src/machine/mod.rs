//! Sequential protocol engine.
//!
//! A [`Sequence`] is a script of [`Step`]s. A local step computes over the
//! run's context and may post one action; a remote step takes exactly one
//! action off the queue and applies it. [`run`] executes the steps strictly in
//! order against one exclusively borrowed context, with the current `dequeue`
//! as the only suspension point.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ProtocolError, ProtocolResult, Violation};
use crate::ledger::messages::{Action, ActionKind, ActionPayload};
use crate::ledger::queue::ActionQueue;
use crate::ledger::types::ClientId;
use crate::tokio_tools::{await_bounded, Bounded};

const LOG_TARGET: &str = "mental_poker::machine";

type LocalFn<C> = dyn Fn(&mut C) -> ProtocolResult<Option<ActionPayload>> + Send + Sync;
type RemoteFn<C> = dyn Fn(&Action, &mut C) -> ProtocolResult<()> + Send + Sync;

enum Transition<C> {
    Local(Arc<LocalFn<C>>),
    Remote(Arc<RemoteFn<C>>),
}

impl<C> Clone for Transition<C> {
    fn clone(&self) -> Self {
        match self {
            Transition::Local(f) => Transition::Local(Arc::clone(f)),
            Transition::Remote(f) => Transition::Remote(Arc::clone(f)),
        }
    }
}

/// One runnable transition over a context of type `C`.
pub struct Step<C> {
    name: &'static str,
    transition: Transition<C>,
}

impl<C> Clone for Step<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            transition: self.transition.clone(),
        }
    }
}

impl<C> fmt::Debug for Step<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.transition {
            Transition::Local(_) => "local",
            Transition::Remote(_) => "remote",
        };
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("kind", &kind)
            .finish()
    }
}

impl<C> Step<C> {
    /// Originates work. A returned payload is posted as an action from the
    /// queue's client.
    pub fn local<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&mut C) -> ProtocolResult<Option<ActionPayload>> + Send + Sync + 'static,
    {
        Self {
            name,
            transition: Transition::Local(Arc::new(f)),
        }
    }

    /// Awaits exactly one action and applies it.
    pub fn remote<F>(name: &'static str, f: F) -> Self
    where
        F: Fn(&Action, &mut C) -> ProtocolResult<()> + Send + Sync + 'static,
    {
        Self {
            name,
            transition: Transition::Remote(Arc::new(f)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.transition, Transition::Remote(_))
    }

    pub async fn execute(&self, queue: &ActionQueue, ctx: &mut C) -> ProtocolResult<()> {
        match &self.transition {
            Transition::Local(f) => {
                if let Some(payload) = (**f)(ctx)? {
                    let action = Action::new(queue.client_id().clone(), payload);
                    queue.enqueue(action).await?;
                }
                Ok(())
            }
            Transition::Remote(f) => {
                let action = queue.dequeue().await?;
                debug!(
                    target = LOG_TARGET,
                    client_id = %queue.client_id(),
                    step = self.name,
                    kind = %action.kind(),
                    sender = %action.sender_id,
                    "applying remote action"
                );
                (**f)(&action, ctx)
            }
        }
    }
}

/// An ordered script of steps. Holds no run state.
pub struct Sequence<C> {
    steps: Vec<Step<C>>,
}

impl<C> Default for Sequence<C> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<C> Clone for Sequence<C> {
    fn clone(&self) -> Self {
        Self {
            steps: self.steps.clone(),
        }
    }
}

impl<C> fmt::Debug for Sequence<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|step| step.name))
            .finish()
    }
}

impl<C> Sequence<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, step: Step<C>) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends `times` copies of `step`.
    pub fn repeat(mut self, step: Step<C>, times: usize) -> Self {
        self.steps.extend(std::iter::repeat(step).take(times));
        self
    }

    pub fn extend(mut self, other: Sequence<C>) -> Self {
        self.steps.extend(other.steps);
        self
    }

    /// Flattens `parts` into one sequence, preserving order.
    pub fn concat<I>(parts: I) -> Self
    where
        I: IntoIterator<Item = Sequence<C>>,
    {
        parts
            .into_iter()
            .fold(Sequence::new(), |acc, part| acc.extend(part))
    }

    pub fn steps(&self) -> &[Step<C>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(Step::name).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl<C> FromIterator<Step<C>> for Sequence<C> {
    fn from_iter<I: IntoIterator<Item = Step<C>>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

/// Bounds applied to every step of a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Longest a single step may take. `None` waits indefinitely.
    pub step_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl RunOptions {
    pub fn with_timeout(step_timeout: Duration) -> Self {
        Self {
            step_timeout: Some(step_timeout),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_on(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Executes `sequence` in order against `ctx`.
///
/// The first failing step ends the run and no later step touches the
/// context. A step that outlives `options.step_timeout` fails with
/// [`ProtocolError::PeerUnresponsive`].
pub async fn run<C>(
    sequence: &Sequence<C>,
    queue: &ActionQueue,
    ctx: &mut C,
    options: &RunOptions,
) -> ProtocolResult<()>
where
    C: Send,
{
    let client_id = queue.client_id().clone();
    debug!(
        target = LOG_TARGET,
        client_id = %client_id,
        steps = sequence.len(),
        "starting run"
    );

    for (index, step) in sequence.steps().iter().enumerate() {
        let outcome = await_bounded(
            step.execute(queue, ctx),
            options.step_timeout,
            &options.cancel,
        )
        .await;

        match outcome {
            Bounded::Ready(Ok(())) => {
                debug!(
                    target = LOG_TARGET,
                    client_id = %client_id,
                    step = step.name(),
                    index,
                    "step completed"
                );
            }
            Bounded::Ready(Err(err)) => {
                warn!(
                    target = LOG_TARGET,
                    client_id = %client_id,
                    step = step.name(),
                    index,
                    error = %err,
                    "run aborted"
                );
                return Err(err);
            }
            Bounded::TimedOut => {
                let waited = options.step_timeout.unwrap_or_default();
                warn!(
                    target = LOG_TARGET,
                    client_id = %client_id,
                    step = step.name(),
                    index,
                    waited_ms = waited.as_millis() as u64,
                    "peer unresponsive"
                );
                return Err(ProtocolError::PeerUnresponsive {
                    step: step.name(),
                    waited,
                });
            }
            Bounded::Cancelled => {
                debug!(
                    target = LOG_TARGET,
                    client_id = %client_id,
                    step = step.name(),
                    index,
                    "run cancelled"
                );
                return Err(ProtocolError::Cancelled);
            }
        }
    }

    Ok(())
}

/// The violation for an action whose kind is not `expected`.
pub fn unexpected(action: &Action, expected: ActionKind) -> Violation {
    Violation::UnexpectedAction {
        expected: expected.as_str(),
        found: action.kind().as_str(),
        sender: action.sender_id.clone(),
    }
}

pub fn expect_kind(action: &Action, expected: ActionKind) -> Result<(), Violation> {
    if action.kind() != expected {
        return Err(unexpected(action, expected));
    }
    Ok(())
}

pub fn expect_sender(action: &Action, expected: &ClientId) -> Result<(), Violation> {
    if action.sender_id != *expected {
        return Err(Violation::UnexpectedSender {
            expected: expected.clone(),
            found: action.sender_id.clone(),
        });
    }
    Ok(())
}
