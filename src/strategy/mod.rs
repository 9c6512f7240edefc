//! Declarative connection strategies.
//!
//! A strategy tree is built from a JSON scheme (see [`builder`]) and executed by
//! [`Strategy::connect`], which returns a [`Runner`]. Leaves drive a single transport;
//! composite nodes sequence, race or delay their children. Every attempt that opens a
//! transport is reported as [`Attempt::Connected`] and handed off, still open, to the
//! caller.

pub mod builder;
mod delayed;
mod parallel;
mod sequential;
mod transport;

use std::fmt;
use std::sync::Arc;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use self::builder::build;
pub use self::delayed::DelayedStrategy;
pub(crate) use self::parallel::Policy;
pub use self::parallel::ParallelStrategy;
pub use self::sequential::SequentialStrategy;
pub use self::transport::TransportStrategy;
use crate::error::Error;
use crate::transport::{Transport, TransportEvents};

/// A node of the strategy tree. Children are owned by their parent.
#[non_exhaustive]
#[derive(Debug)]
pub enum Strategy {
    /// Drives one transport
    Transport(TransportStrategy),
    /// Tries children one at a time
    Sequential(SequentialStrategy),
    /// Uses the first supported child only
    FirstSupported(ParallelStrategy),
    /// Races all children, supported only if all of them are
    AllSupported(ParallelStrategy),
    /// Races all children and keeps the first that connects
    FirstConnected(ParallelStrategy),
    /// Races all children, aborting only those ranked after a winner
    BestConnectedEver(ParallelStrategy),
    /// Starts its child after a delay
    Delayed(DelayedStrategy),
}

impl Strategy {
    #[must_use]
    pub fn is_supported(&self) -> bool {
        match self {
            Self::Transport(strategy) => strategy.is_supported(),
            Self::Sequential(strategy) => strategy.is_supported(),
            Self::FirstSupported(strategy)
            | Self::FirstConnected(strategy)
            | Self::BestConnectedEver(strategy) => strategy.any_supported(),
            Self::AllSupported(strategy) => strategy.all_supported(),
            Self::Delayed(strategy) => strategy.is_supported(),
        }
    }

    /// Start executing the tree in a background task.
    #[must_use]
    pub fn connect(self: Arc<Self>) -> Runner {
        let token = CancellationToken::new();
        let (outcomes_tx, outcomes) = mpsc::unbounded_channel();
        let task_token = token.clone();

        tokio::spawn(async move {
            let reporter = Reporter::new(0, outcomes_tx);
            self.run(&reporter, &task_token).await;
        });

        Runner { token, outcomes }
    }

    /// Execute this node until it has nothing left to try or `token` is cancelled.
    pub(crate) fn run<'a>(
        &'a self,
        reporter: &'a Reporter,
        token: &'a CancellationToken,
    ) -> BoxFuture<'a, ()> {
        match self {
            Self::Transport(strategy) => strategy.run(reporter, token).boxed(),
            Self::Sequential(strategy) => strategy.run(reporter, token).boxed(),
            Self::FirstSupported(strategy)
            | Self::AllSupported(strategy)
            | Self::FirstConnected(strategy) => strategy
                .run(Policy::FirstConnected, reporter, token)
                .boxed(),
            Self::BestConnectedEver(strategy) => strategy
                .run(Policy::BestConnectedEver, reporter, token)
                .boxed(),
            Self::Delayed(strategy) => strategy.run(reporter, token).boxed(),
        }
    }
}

/// An opened transport together with its event stream.
#[non_exhaustive]
pub struct OpenTransport {
    pub transport: Arc<dyn Transport>,
    pub events: TransportEvents,
}

impl fmt::Debug for OpenTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenTransport")
            .field("transport", &self.transport.name())
            .field("state", &self.transport.state())
            .finish_non_exhaustive()
    }
}

/// Outcome of a connection attempt.
#[non_exhaustive]
#[derive(Debug)]
pub enum Attempt {
    Connected(OpenTransport),
    Failed(Error),
}

/// Sends outcomes to the parent node, tagged with the child's position.
pub(crate) struct Reporter {
    index: usize,
    outcomes: mpsc::UnboundedSender<(usize, Attempt)>,
}

impl Reporter {
    pub(crate) fn new(index: usize, outcomes: mpsc::UnboundedSender<(usize, Attempt)>) -> Self {
        Self { index, outcomes }
    }

    pub(crate) fn report(&self, attempt: Attempt) {
        _ = self.outcomes.send((self.index, attempt));
    }
}

/// Live execution of a strategy tree.
///
/// Aborting is idempotent and harmless once the execution has finished. Dropping the
/// runner aborts it.
#[derive(Debug)]
pub struct Runner {
    token: CancellationToken,
    outcomes: mpsc::UnboundedReceiver<(usize, Attempt)>,
}

impl Runner {
    pub fn abort(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Next outcome, or `None` once the tree has finished without anything left to
    /// report.
    pub async fn next(&mut self) -> Option<Attempt> {
        self.outcomes.recv().await.map(|(_, attempt)| attempt)
    }

    /// Outcome already delivered, without waiting.
    pub(crate) fn try_next(&mut self) -> Option<Attempt> {
        self.outcomes.try_recv().ok().map(|(_, attempt)| attempt)
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Sleep until `deadline`, or forever when there is none.
pub(crate) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
