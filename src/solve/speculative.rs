use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

use super::{
    log::SolutionLog,
    solvable::{PartitionResponse, Solvable, SolveResult},
};
use crate::config::SolverConfig;
use crate::metrics::Metrics;
use crate::net::reader::ReadError;
use crate::partition::PartitionCoord;

/// How a partition solve ended.
#[derive(Debug)]
pub enum SolveOutcome<A, R> {
    /// The first replica to succeed.
    Solved {
        response: PartitionResponse<A, R>,
        winner: PartitionCoord,
        attempts: usize,
        elapsed: Duration,
    },
    /// The deadline passed without a success. Not an error: the caller
    /// substitutes its default for this partition.
    TimedOut { attempts: usize, elapsed: Duration },
    /// Every replica was tried and none succeeded.
    Unsolvable {
        failures: Vec<(PartitionCoord, ReadError)>,
    },
    /// The surrounding request went away.
    Cancelled,
}

impl<A, R> SolveOutcome<A, R> {
    pub fn is_solved(&self) -> bool {
        matches!(self, SolveOutcome::Solved { .. })
    }
}

type Attempt<A, R> = (PartitionCoord, SolveResult<A, R>);

/// Races the replicas of a single partition and keeps the first success.
///
/// `initial_concurrency` attempts start right away. Each time
/// `escalate_after` passes without a success another one joins, never
/// exceeding `max_concurrency` in flight. A failed attempt frees its slot for
/// the next replica immediately. When a winner is found, or the deadline
/// passes, every attempt still running is cancelled.
pub struct SpeculativeSolver {
    config: SolverConfig,
    metrics: Arc<dyn Metrics>,
}

impl SpeculativeSolver {
    pub fn new(config: SolverConfig, metrics: Arc<dyn Metrics>) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub async fn solve<A, R>(
        &self,
        solvables: Vec<Solvable<A, R>>,
        log: &mut SolutionLog,
        cancel: &CancellationToken,
    ) -> SolveOutcome<A, R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        self.solve_within(solvables, self.config.deadline(), log, cancel)
            .await
    }

    /// Like `solve`, with the deadline capped by the caller, e.g. to what is
    /// left of a request budget.
    pub async fn solve_within<A, R>(
        &self,
        solvables: Vec<Solvable<A, R>>,
        deadline: Duration,
        log: &mut SolutionLog,
        cancel: &CancellationToken,
    ) -> SolveOutcome<A, R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let Some(first) = solvables.first() else {
            self.metrics.partition_unsolvable();
            log.info("no replica to ask");
            return SolveOutcome::Unsolvable {
                failures: Vec::new(),
            };
        };
        let partition = first.coord().partition;
        let span = debug_span!(
            "solve",
            tenant = %first.coord().tenant,
            %partition,
            replicas = solvables.len()
        );
        let outcome = self
            .race(solvables, deadline, log, cancel)
            .instrument(span)
            .await;

        match &outcome {
            SolveOutcome::Solved {
                winner,
                attempts,
                elapsed,
                ..
            } => {
                self.metrics.partition_solved(*elapsed);
                log.info(format_args!(
                    "{partition}: solved by {} after {attempts} attempt(s) in {}ms",
                    winner.host,
                    elapsed.as_millis()
                ));
            }
            SolveOutcome::TimedOut { attempts, elapsed } => {
                self.metrics.partition_timed_out();
                log.info(format_args!(
                    "{partition}: no answer within {}ms after {attempts} attempt(s)",
                    elapsed.as_millis()
                ));
            }
            SolveOutcome::Unsolvable { failures } => {
                self.metrics.partition_unsolvable();
                log.info(format_args!(
                    "{partition}: all {} replica(s) failed",
                    failures.len()
                ));
            }
            SolveOutcome::Cancelled => {
                log.debug(format_args!("{partition}: cancelled"));
            }
        }
        outcome
    }

    async fn race<A, R>(
        &self,
        solvables: Vec<Solvable<A, R>>,
        deadline: Duration,
        log: &mut SolutionLog,
        cancel: &CancellationToken,
    ) -> SolveOutcome<A, R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let started = Instant::now();
        let max = self.config.max_concurrency.max(1);
        let initial = self.config.initial_concurrency.clamp(1, max);
        let escalate_after = self.config.escalate_after().max(Duration::from_millis(1));

        // cancelling this stops every attempt of this race and nothing else
        let race = cancel.child_token();
        let mut pending = solvables.into_iter();
        let mut in_flight: JoinSet<Attempt<A, R>> = JoinSet::new();
        let mut attempts = 0;
        let mut failures = Vec::new();

        for solvable in pending.by_ref().take(initial) {
            log.debug(format_args!("launching {}", solvable.coord().host));
            launch(&mut in_flight, solvable, &race);
            attempts += 1;
        }

        let mut escalation =
            time::interval_at(started + escalate_after, escalate_after);
        escalation.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let expiry = time::sleep_until(started + deadline);
        tokio::pin!(expiry);

        let outcome = loop {
            if in_flight.is_empty() {
                match pending.next() {
                    Some(solvable) => {
                        log.debug(format_args!(
                            "nothing in flight, launching {}",
                            solvable.coord().host
                        ));
                        launch(&mut in_flight, solvable, &race);
                        attempts += 1;
                        continue;
                    }
                    None => break SolveOutcome::Unsolvable { failures },
                }
            }

            let can_escalate = in_flight.len() < max && !pending.as_slice().is_empty();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break SolveOutcome::Cancelled,
                _ = &mut expiry => {
                    break SolveOutcome::TimedOut {
                        attempts,
                        elapsed: started.elapsed(),
                    }
                }
                joined = in_flight.join_next() => match joined {
                    Some(Ok((winner, Ok(response)))) => {
                        break SolveOutcome::Solved {
                            response,
                            winner,
                            attempts,
                            elapsed: started.elapsed(),
                        }
                    }
                    Some(Ok((coord, Err(e)))) => {
                        debug!(%coord, error = %e, "replica attempt failed");
                        log.debug(format_args!("{} failed: {e}", coord.host));
                        failures.push((coord, e));
                        if in_flight.len() < max {
                            if let Some(solvable) = pending.next() {
                                log.debug(format_args!(
                                    "replacing with {}",
                                    solvable.coord().host
                                ));
                                launch(&mut in_flight, solvable, &race);
                                attempts += 1;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "replica task ended abnormally");
                    }
                    None => {}
                },
                _ = escalation.tick(), if can_escalate => {
                    if let Some(solvable) = pending.next() {
                        log.debug(format_args!(
                            "no success after {}ms, escalating to {}",
                            started.elapsed().as_millis(),
                            solvable.coord().host
                        ));
                        launch(&mut in_flight, solvable, &race);
                        attempts += 1;
                    }
                }
            }
        };

        race.cancel();
        in_flight.abort_all();
        outcome
    }
}

fn launch<A, R>(
    in_flight: &mut JoinSet<Attempt<A, R>>,
    solvable: Solvable<A, R>,
    race: &CancellationToken,
) where
    A: Send + 'static,
    R: Send + 'static,
{
    let token = race.child_token();
    let (coord, task) = solvable.start(token.clone());
    in_flight.spawn(async move {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ReadError::Cancelled),
            result = AssertUnwindSafe(task).catch_unwind() => {
                result.unwrap_or_else(|_| {
                    Err(ReadError::QueryServiceFailure("attempt panicked".into()))
                })
            }
        };
        (coord, result)
    });
}
