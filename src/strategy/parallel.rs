use futures::StreamExt as _;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Attempt, Reporter, Strategy};
use crate::transport::TransportError;

/// What a parallel node aborts when child `i` connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Policy {
    /// Every other child
    FirstConnected,
    /// Only children after `i`; earlier ones may still deliver better connections
    BestConnectedEver,
}

/// Children raced against each other. The variant of [`Strategy`] holding it decides
/// the policy.
#[derive(Debug)]
pub struct ParallelStrategy {
    children: Vec<Strategy>,
}

impl ParallelStrategy {
    #[must_use]
    pub fn new(children: Vec<Strategy>) -> Self {
        Self { children }
    }

    /// Keep only the first supported child.
    #[must_use]
    pub fn first_supported(children: Vec<Strategy>) -> Self {
        Self {
            children: children
                .into_iter()
                .find(Strategy::is_supported)
                .into_iter()
                .collect(),
        }
    }

    #[must_use]
    pub fn children(&self) -> &[Strategy] {
        &self.children
    }

    pub(crate) fn any_supported(&self) -> bool {
        self.children.iter().any(Strategy::is_supported)
    }

    pub(crate) fn all_supported(&self) -> bool {
        !self.children.is_empty() && self.children.iter().all(Strategy::is_supported)
    }

    pub(crate) async fn run(&self, policy: Policy, reporter: &Reporter, token: &CancellationToken) {
        let children: Vec<&Strategy> = self
            .children
            .iter()
            .filter(|child| child.is_supported())
            .collect();
        if children.is_empty() {
            reporter.report(Attempt::Failed(TransportError::Unsupported.into()));
            return;
        }

        let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
        let reporters: Vec<Reporter> = (0..children.len())
            .map(|index| Reporter::new(index, outcomes_tx.clone()))
            .collect();
        drop(outcomes_tx);
        let tokens: Vec<CancellationToken> =
            children.iter().map(|_| token.child_token()).collect();

        let mut running: FuturesUnordered<BoxFuture<'_, ()>> = children
            .iter()
            .zip(&reporters)
            .zip(&tokens)
            .map(|((child, reporter), token)| child.run(reporter, token))
            .collect();
        let mut failed = vec![false; children.len()];
        let mut aborted = vec![false; children.len()];

        loop {
            let wake = tokio::select! {
                biased;
                () = token.cancelled() => None,
                Some((index, attempt)) = outcomes.recv() => Some(Some((index, attempt))),
                Some(()) = running.next(), if !running.is_empty() => Some(None),
            };

            match wake {
                None => {
                    while running.next().await.is_some() {}
                    return;
                }
                Some(Some((index, Attempt::Connected(open)))) => {
                    let losers = match policy {
                        Policy::FirstConnected => 0..children.len(),
                        Policy::BestConnectedEver => index + 1..children.len(),
                    };
                    for loser in losers {
                        if loser != index && !failed[loser] && !aborted[loser] {
                            aborted[loser] = true;
                            tokens[loser].cancel();
                        }
                    }
                    reporter.report(Attempt::Connected(open));
                }
                Some(Some((index, Attempt::Failed(error)))) => {
                    failed[index] = true;
                    #[cfg(feature = "tracing")]
                    tracing::debug!(index, %error, "Parallel strategy child failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &error;

                    if failed.iter().all(|failed| *failed) {
                        reporter.report(Attempt::Failed(TransportError::Exhausted.into()));
                    }
                }
                Some(None) => {}
            }

            if running.is_empty() && outcomes.is_empty() {
                return;
            }
        }
    }
}
