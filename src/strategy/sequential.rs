use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Attempt, Reporter, Strategy, wait_until};
use crate::error::Error;
use crate::transport::TransportError;

/// Tries supported children one at a time, advancing on failure.
///
/// Each attempt may be bounded by a timeout that doubles after every failure, capped
/// by `timeout_limit`. With `looping` the children are retried round-robin forever.
#[derive(Debug)]
pub struct SequentialStrategy {
    children: Vec<Strategy>,
    looping: bool,
    timeout: Option<Duration>,
    timeout_limit: Option<Duration>,
}

impl SequentialStrategy {
    #[must_use]
    pub fn new(
        children: Vec<Strategy>,
        looping: bool,
        timeout: Option<Duration>,
        timeout_limit: Option<Duration>,
    ) -> Self {
        Self {
            children,
            looping,
            timeout,
            timeout_limit,
        }
    }

    #[must_use]
    pub fn children(&self) -> &[Strategy] {
        &self.children
    }

    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.children.iter().any(Strategy::is_supported)
    }

    pub(crate) async fn run(&self, reporter: &Reporter, token: &CancellationToken) {
        let children: Vec<&Strategy> = self
            .children
            .iter()
            .filter(|child| child.is_supported())
            .collect();
        if children.is_empty() {
            reporter.report(Attempt::Failed(TransportError::Unsupported.into()));
            return;
        }

        let mut current = 0;
        let mut timeout = self.timeout;

        while let Some(child) = children.get(current) {
            match try_child(child, timeout, reporter, token).await {
                Step::Finished | Step::Aborted => return,
                Step::Failed(error) => {
                    current = next_index(current, children.len(), self.looping);
                    if current >= children.len() {
                        reporter.report(Attempt::Failed(error));
                        return;
                    }
                    timeout = next_timeout(timeout, self.timeout_limit);
                }
            }
        }
    }
}

/// Position of the child tried after `current` failed.
pub(crate) fn next_index(current: usize, len: usize, looping: bool) -> usize {
    let next = current + 1;
    if looping { next % len } else { next }
}

/// Per-attempt timeout after a failure: doubled, then capped.
pub(crate) fn next_timeout(timeout: Option<Duration>, limit: Option<Duration>) -> Option<Duration> {
    let doubled = timeout?.saturating_mul(2);
    Some(limit.map_or(doubled, |limit| doubled.min(limit)))
}

enum Step {
    /// The child connected and has finished
    Finished,
    Aborted,
    Failed(Error),
}

enum Wake {
    Cancelled,
    Attempt(Attempt),
    ChildDone,
    TimedOut,
}

async fn try_child(
    child: &Strategy,
    timeout: Option<Duration>,
    reporter: &Reporter,
    token: &CancellationToken,
) -> Step {
    let child_token = token.child_token();
    let (outcomes_tx, mut outcomes) = mpsc::unbounded_channel();
    let child_reporter = Reporter::new(0, outcomes_tx);

    let mut run = child.run(&child_reporter, &child_token);
    let mut running = true;
    let mut deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut connected = false;
    let mut last_error = None;

    loop {
        let wake = tokio::select! {
            biased;
            () = token.cancelled() => Wake::Cancelled,
            Some((_, attempt)) = outcomes.recv() => Wake::Attempt(attempt),
            () = &mut run, if running => Wake::ChildDone,
            () = wait_until(deadline) => Wake::TimedOut,
        };

        match wake {
            Wake::Cancelled => {
                if running {
                    (&mut run).await;
                }
                return Step::Aborted;
            }
            Wake::Attempt(Attempt::Connected(open)) => {
                deadline = None;
                connected = true;
                reporter.report(Attempt::Connected(open));
            }
            Wake::Attempt(Attempt::Failed(error)) => {
                // With a timer armed, failures only take effect once it fires.
                if deadline.is_some() {
                    last_error = Some(error);
                    continue;
                }
                child_token.cancel();
                if running {
                    (&mut run).await;
                }
                return Step::Failed(error);
            }
            Wake::ChildDone => {
                running = false;
                if !outcomes.is_empty() {
                    continue;
                }
                if connected {
                    return Step::Finished;
                }
                if deadline.is_none() {
                    return Step::Failed(
                        last_error.unwrap_or_else(|| TransportError::Exhausted.into()),
                    );
                }
            }
            Wake::TimedOut => {
                #[cfg(feature = "tracing")]
                tracing::debug!(?timeout, "Strategy attempt timed out");

                child_token.cancel();
                if running {
                    (&mut run).await;
                }
                return Step::Failed(
                    TransportError::Timeout(timeout.unwrap_or_default()).into(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::strategy::build;
    use crate::transport::TransportRegistry;
    use crate::transport::testing::MockFactory;

    #[test]
    fn timeouts_double_up_to_the_limit() {
        let mut timeout = Some(Duration::from_secs(15));
        let limit = Some(Duration::from_secs(60));
        let mut seen = Vec::new();

        for _ in 0..4 {
            timeout = next_timeout(timeout, limit);
            seen.push(timeout.unwrap().as_secs());
        }

        assert_eq!(seen, vec![30, 60, 60, 60]);
        assert_eq!(next_timeout(None, limit), None);
    }

    #[test]
    fn looping_wraps_modulo_child_count() {
        let order: Vec<usize> = std::iter::successors(Some(0), |current| {
            Some(next_index(*current, 3, true))
        })
        .take(7)
        .collect();

        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(next_index(2, 3, false), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn advances_to_next_child_on_failure() {
        let (first, mut first_rx) = MockFactory::new("first", true);
        let (second, mut second_rx) = MockFactory::new("second", true);
        let registry = TransportRegistry::empty()
            .with("first", first)
            .with("second", second);
        let strategy = Arc::new(
            build(
                &json!({
                    "type": "sequential",
                    "children": [
                        { "type": "transport", "transport": "first" },
                        { "type": "transport", "transport": "second" },
                    ],
                }),
                &registry,
            )
            .unwrap(),
        );

        let mut runner = strategy.connect();
        first_rx.recv().await.unwrap().fail();
        second_rx.recv().await.unwrap().open();

        let Some(Attempt::Connected(open)) = runner.next().await else {
            panic!("expected the second child to connect");
        };
        assert_eq!(open.transport.name(), "second");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_waits_for_armed_timeout_and_timeout_grows() {
        let (flaky, mut flaky_rx) = MockFactory::new("flaky", true);
        let registry = TransportRegistry::empty().with("flaky", flaky);
        let strategy = Arc::new(
            build(
                &json!({
                    "type": "sequential",
                    "loop": true,
                    "timeout": 1000,
                    "timeoutLimit": 3000,
                    "children": [{ "type": "transport", "transport": "flaky" }],
                }),
                &registry,
            )
            .unwrap(),
        );

        let start = Instant::now();
        let _runner = strategy.connect();

        let mut started = Vec::new();
        for _ in 0..4 {
            let transport = flaky_rx.recv().await.unwrap();
            started.push(start.elapsed().as_millis());
            transport.fail();
        }

        // Attempts start after 0, 1000, 1000 + 2000 and 3000 + 3000 milliseconds.
        assert_eq!(started, vec![0, 1000, 3000, 6000]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_without_loop_reports_failure() {
        let (only, mut only_rx) = MockFactory::new("only", true);
        let registry = TransportRegistry::empty().with("only", only);
        let strategy = Arc::new(
            build(
                &json!({
                    "type": "sequential",
                    "children": [{ "type": "transport", "transport": "only" }],
                }),
                &registry,
            )
            .unwrap(),
        );

        let mut runner = strategy.connect();
        only_rx.recv().await.unwrap().fail();

        assert!(matches!(runner.next().await, Some(Attempt::Failed(_))));
    }
}
