use std::fmt;
use std::future::Future;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::net::reader::ReadError;
use crate::partition::PartitionCoord;

/// One partition's contribution: its answer and, optionally, a report that
/// parameterizes the solve of the next (older) partition.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionResponse<A, R> {
    pub answer: A,
    pub report: Option<R>,
}

impl<A, R> PartitionResponse<A, R> {
    pub fn new(answer: A, report: Option<R>) -> Self {
        Self { answer, report }
    }

    pub fn answer(answer: A) -> Self {
        Self {
            answer,
            report: None,
        }
    }
}

pub type SolveResult<A, R> = Result<PartitionResponse<A, R>, ReadError>;

type Task<A, R> =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, SolveResult<A, R>> + Send>;

/// A deferred attempt at answering a query against one partition replica.
/// Nothing runs until the solver starts it; the token it is started with is
/// cancelled as soon as the attempt is no longer wanted.
pub struct Solvable<A, R> {
    coord: PartitionCoord,
    task: Task<A, R>,
}

impl<A, R> Solvable<A, R> {
    pub fn new<F, Fut>(coord: PartitionCoord, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = SolveResult<A, R>> + Send + 'static,
    {
        Self {
            coord,
            task: Box::new(move |cancel| task(cancel).boxed()),
        }
    }

    pub fn coord(&self) -> &PartitionCoord {
        &self.coord
    }

    pub(crate) fn start(
        self,
        cancel: CancellationToken,
    ) -> (PartitionCoord, BoxFuture<'static, SolveResult<A, R>>) {
        (self.coord, (self.task)(cancel))
    }
}

impl<A, R> fmt::Debug for Solvable<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Solvable").field("coord", &self.coord).finish()
    }
}
