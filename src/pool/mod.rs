//! A master/worker pool that runs independent tasks on groups of ranks.
//!
//! Rank 0 of the pool's communicator is the coordinator. The other ranks are
//! divided into worker groups of `cpus_per_worker` ranks each (see
//! [`split_ranks`]), and every group gets a communicator of its own. The
//! lowest rank of a group is its local coordinator: it asks the coordinator
//! for work, shares each task with the rest of its group, and reports the
//! group's result back. Every member of a group runs every task its group is
//! given, collectively.
//!
//! A task that fails on any rank aborts the whole job.
//!
//! [`split_ranks`]: crate::partition::split_ranks
use crate::comm::Communicator;
use crate::config::PoolConfig;
use crate::context::Context;
use crate::error::PoolError;
use crate::partition::{leftover, split_ranks};
use futures::FutureExt;
use log::{info, log, warn, Level};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

mod protocol;

pub use protocol::{PoolMsg, Tag};

const COORDINATOR: usize = 0;

/// A pool of worker groups that tasks are dispatched to.
///
/// Every rank of the communicator constructs the pool, and every rank then
/// calls [`compute`](TaskPool::compute). The coordinator gets the results
/// back, in the order the tasks were given; the other ranks get `None`.
#[derive(Debug)]
pub struct TaskPool {
    /// Carries the pool protocol, apart from any other traffic
    comm: Communicator,
    /// The group this rank belongs to: its worker group, or the group of the
    /// coordinator and the idle ranks
    group: Context,
    color: u32,
    workers: usize,
    is_worker: bool,
    verbosity: Level,
}

impl TaskPool {
    /// Creates the pool on every rank of `ctx`'s communicator. This is a
    /// collective.
    ///
    /// ## Errors
    /// `PoolError::Configuration` if there are fewer than 2 ranks, or if the
    /// ranks cannot be divided into groups of `config.cpus_per_worker`.
    pub async fn new(ctx: &Context, config: PoolConfig) -> Result<Self, PoolError> {
        let comm = ctx.comm();
        if comm.size() < 2 {
            return Err(PoolError::Configuration(format!(
                "a task pool needs at least 2 ranks, found {}",
                comm.size()
            )));
        }
        let groups = split_ranks(comm.size(), config.cpus_per_worker, config.use_all_cpus)?;
        let rank = comm.rank();
        let color = groups
            .iter()
            .find(|(_, members)| members.contains(&rank))
            .map(|(i, _)| *i as u32 + 1)
            .unwrap_or(0);

        if rank == COORDINATOR {
            let idle = leftover(comm.size(), &groups);
            if idle > 0 {
                warn!(
                    "{} rank(s) do not fill a worker group of {} and will be idle",
                    idle, config.cpus_per_worker
                );
            }
        }

        let pool_comm = comm.split(0, rank).await?;
        let group_comm = comm.split(color, rank).await?;
        if color > 0 && group_comm.rank() == 0 {
            info!(
                "worker group {} formed of world ranks {:?}",
                color,
                group_comm.members()
            );
        }

        Ok(TaskPool {
            comm: pool_comm,
            group: ctx.for_comm(group_comm),
            color,
            workers: groups.len(),
            is_worker: color > 0,
            verbosity: if config.debug {
                Level::Info
            } else {
                Level::Debug
            },
        })
    }

    /// Whether this rank is the coordinator
    pub fn is_master(&self) -> bool {
        self.comm.rank() == COORDINATOR
    }

    /// Whether this rank is a member of a worker group
    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    /// The color of this rank's group: 0 for the coordinator and idle ranks,
    /// `1..=workers()` for the worker groups
    pub fn color(&self) -> u32 {
        self.color
    }

    /// The number of worker groups
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// The context of this rank's group, which tasks are run with
    pub fn context(&self) -> &Context {
        &self.group
    }

    /// Runs `tasks` on the worker groups. Every rank must call `compute`;
    /// only the tasks given on the coordinator are used.
    ///
    /// `f` is called on every member of a worker group with the group's
    /// context, the index of the task and the task. The result of the group's
    /// local coordinator is the result of the task.
    pub async fn compute<T, R, E, F, Fut>(
        &self,
        tasks: Vec<T>,
        f: F,
    ) -> Result<Option<Vec<R>>, PoolError>
    where
        T: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
        E: Display,
        F: Fn(Context, usize, T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if self.is_master() {
            Ok(Some(self.dispatch(tasks).await?))
        } else {
            self.await_work(f).await?;
            Ok(None)
        }
    }

    /// The coordinator's side of [`compute`](TaskPool::compute): hands out
    /// tasks until every worker group has exited and returns the results
    /// sorted by task index.
    pub async fn dispatch<T, R>(&self, tasks: Vec<T>) -> Result<Vec<R>, PoolError>
    where
        T: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
    {
        let total = tasks.len();
        info!(
            "task pool starting with {} worker group(s) and {} task(s)",
            self.workers, total
        );
        let mut tasks = tasks.into_iter().enumerate();
        let mut results: Vec<(usize, R)> = Vec::with_capacity(total);
        let mut closed = 0;

        while closed < self.workers {
            let (msg, status) = self.comm.recv::<PoolMsg<T, R>>(None, None).await?;
            let worker = status.source;
            match msg {
                PoolMsg::Ready => {
                    let reply = match tasks.next() {
                        Some((index, task)) => {
                            log!(
                                self.verbosity,
                                "sending task {} of {} to worker {}",
                                index + 1,
                                total,
                                worker
                            );
                            PoolMsg::<T, R>::Start { index, task }
                        }
                        None => PoolMsg::Exit,
                    };
                    self.comm.send(worker, reply.tag().id(), &reply).await?;
                }
                PoolMsg::Done { index, result } => {
                    log!(
                        self.verbosity,
                        "received result of task {} from worker {}",
                        index + 1,
                        worker
                    );
                    results.push((index, result));
                }
                PoolMsg::Exit => {
                    closed += 1;
                    log!(
                        self.verbosity,
                        "worker {} exited, {} of {} worker(s) done",
                        worker,
                        closed,
                        self.workers
                    );
                }
                PoolMsg::Start { .. } => return Err(PoolError::UnexpectedMessage),
            }
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().map(|(_, result)| result).collect())
    }

    /// The worker side of [`compute`](TaskPool::compute): runs the tasks
    /// given to this rank's group until the coordinator says there are no
    /// more. Returns at once on the coordinator and idle ranks.
    pub async fn await_work<T, R, E, F, Fut>(&self, f: F) -> Result<(), PoolError>
    where
        T: Serialize + DeserializeOwned,
        R: Serialize + DeserializeOwned,
        E: Display,
        F: Fn(Context, usize, T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if !self.is_worker {
            return Ok(());
        }
        let group = self.group.comm();
        let is_leader = group.rank() == 0;

        loop {
            let order = if is_leader {
                let ready = PoolMsg::<T, R>::Ready;
                self.comm
                    .send(COORDINATOR, ready.tag().id(), &ready)
                    .await?;
                let (order, _) = self
                    .comm
                    .recv::<PoolMsg<T, R>>(Some(COORDINATOR), None)
                    .await?;
                Some(order)
            } else {
                None
            };

            match group.broadcast(order, 0).await? {
                PoolMsg::Start { index, task } => {
                    let run = AssertUnwindSafe(f(self.group.clone(), index, task));
                    let reason = match run.catch_unwind().await {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(panic) => Err(format!("panicked: {}", panic_message(&*panic))),
                    };
                    let result = match reason {
                        Ok(result) => result,
                        Err(reason) => {
                            let failure = PoolError::TaskFailure { index, reason };
                            group.abort(&failure.to_string())
                        }
                    };
                    // no member starts the next task before all are done
                    group.barrier().await?;
                    if is_leader {
                        let done = PoolMsg::<T, R>::Done { index, result };
                        self.comm
                            .send(COORDINATOR, done.tag().id(), &done)
                            .await?;
                    }
                }
                PoolMsg::Exit => {
                    group.barrier().await?;
                    if is_leader {
                        let exit = PoolMsg::<T, R>::Exit;
                        self.comm.send(COORDINATOR, exit.tag().id(), &exit).await?;
                    }
                    return Ok(());
                }
                PoolMsg::Ready | PoolMsg::Done { .. } => {
                    return Err(PoolError::UnexpectedMessage)
                }
            }
        }
    }

    /// Shuts the pool down
    pub fn close(self) {
        if self.is_master() {
            info!("terminating task pool");
        }
    }
}

/// The message a panic was raised with, if it was a string
fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown cause"
    }
}
