//
// Copyright 2025 Rendezvous RTC Contributors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! A minimal actor: a dedicated thread draining a queue of tasks that
//! mutate a private `State`, plus delayed tasks for timers.
//!
//! Every stateful component of this crate (handshake, offer pool,
//! durable connection/service, the blocking HTTP client) owns one
//! actor. All mutation of the component's state happens on that single
//! task runner, which is what makes the polling loops, timeouts and
//! cancellation flags race-free without fine-grained locking.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        atomic::{self, AtomicBool},
        mpsc::{channel, RecvError, RecvTimeoutError, Sender},
        Arc, Condvar, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crate::common::Result;

pub struct Actor<State> {
    name: String,
    sender: Sender<Task<State>>,
    stopper: Stopper,
}

impl<State: 'static> Actor<State> {
    /// Spawns the actor thread and constructs the state on it.
    ///
    /// If `gen_state` fails, the error is returned here and no actor is
    /// registered with the stopper.
    pub fn start(
        name: &'static str,
        stopper: Stopper,
        gen_state: impl FnOnce(Actor<State>) -> Result<State> + Send + 'static,
    ) -> Result<Self> {
        let (sender, receiver) = channel::<Task<State>>();
        let (ready_sender, ready_receiver) = channel::<Result<()>>();

        // One flag on the inside of the loop to observe stopping, one
        // on the outside to trigger it.
        let stopped = Arc::new(AtomicBool::new(false));
        let stopped_to_register = stopped.clone();

        let actor = Self {
            name: name.to_string(),
            sender,
            stopper: stopper.clone(),
        };
        let actor_to_pass_in = actor.clone();
        let actor_to_return = actor.clone();

        let join_handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut state = match gen_state(actor_to_pass_in) {
                Ok(state) => {
                    let _ = ready_sender.send(Ok(()));
                    state
                }
                Err(err) => {
                    let _ = ready_sender.send(Err(err));
                    return;
                }
            };
            let mut delayed_tasks = BinaryHeap::<Task<State>>::new();
            loop {
                // Manual select between the earliest delayed task and
                // the incoming queue.
                let received_task = match delayed_tasks.peek() {
                    None => match receiver.recv() {
                        Ok(received_task) => received_task,
                        Err(RecvError) => break,
                    },
                    Some(delayed_task) => match receiver.recv_timeout(delayed_task.timeout()) {
                        Ok(received_task) => received_task,
                        Err(RecvTimeoutError::Disconnected) => break,
                        // It's waited long enough; run it as an immediate task below.
                        Err(RecvTimeoutError::Timeout) => {
                            match delayed_tasks.pop() {
                                Some(task) => task.as_immediate(),
                                None => continue,
                            }
                        }
                    },
                };
                if stopped.load(atomic::Ordering::Relaxed) {
                    break;
                }
                if received_task.is_delayed() {
                    delayed_tasks.push(received_task);
                } else {
                    (received_task.run)(&mut state);
                }
            }
        })?;

        match ready_receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = join_handle.join();
                return Err(err);
            }
            Err(_) => {
                let _ = join_handle.join();
                anyhow::bail!("actor {} died during startup", actor_to_return.name);
            }
        }

        stopper.register(
            Box::new(actor_to_return.clone()),
            stopped_to_register,
            join_handle,
        );
        Ok(actor_to_return)
    }

    pub fn send(&self, run: impl FnOnce(&mut State) + Send + 'static) {
        let _ = self.sender.send(Task::immediate(Box::new(run)));
    }

    pub fn send_delayed(&self, delay: Duration, run: impl FnOnce(&mut State) + Send + 'static) {
        let _ = self.sender.send(Task::delayed(Box::new(run), delay));
    }

    /// Blocks until every task queued before this call has run.
    /// Delayed tasks whose deadline has not arrived are not waited for.
    /// Used by tests to make actor-driven assertions deterministic.
    pub fn synchronize(&self) {
        let barrier = Arc::new((Mutex::new(false), Condvar::new()));
        let barrier_in_task = barrier.clone();
        self.send(move |_state| {
            let (flag, condvar) = &*barrier_in_task;
            if let Ok(mut done) = flag.lock() {
                *done = true;
            }
            condvar.notify_all();
        });
        let (flag, condvar) = &*barrier;
        let mut done = match flag.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        // Bounded wait so a stopped actor can't hang a test forever.
        let deadline = Instant::now() + Duration::from_secs(5);
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            match condvar.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => done = guard,
                Err(_) => return,
            }
        }
    }

    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// This doesn't #[derive] because State isn't Clone.
impl<State> Clone for Actor<State> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            sender: self.sender.clone(),
            stopper: self.stopper.clone(),
        }
    }
}

impl<State> Stop for Actor<State> {
    fn stop(&self, stopped: &AtomicBool) {
        stopped.store(true, atomic::Ordering::Relaxed);
        // An empty message kicks the loop if it's blocked on recv.
        let _ = self.sender.send(Task::immediate(Box::new(|_state| {})));
    }
}

type BoxedTaskFn<State> = Box<dyn FnOnce(&mut State) + Send>;

struct Task<State> {
    run: BoxedTaskFn<State>,
    deadline: Option<Instant>, // None == immediately
}

impl<State> Task<State> {
    fn immediate(run: BoxedTaskFn<State>) -> Self {
        Self {
            run,
            deadline: None,
        }
    }

    fn delayed(run: BoxedTaskFn<State>, delay: Duration) -> Self {
        Self {
            run,
            deadline: Some(Instant::now() + delay),
        }
    }

    fn as_immediate(self) -> Self {
        Self {
            run: self.run,
            deadline: None,
        }
    }

    fn is_delayed(&self) -> bool {
        self.deadline.is_some()
    }

    fn timeout(&self) -> Duration {
        match self.deadline {
            None => Duration::from_secs(0),
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        }
    }
}

impl<T> Ord for Task<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the earliest deadline comes out of the BinaryHeap first.
        self.deadline.cmp(&other.deadline).reverse()
    }
}

impl<T> PartialOrd for Task<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Task<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl<T> Eq for Task<T> {}

trait Stop: Send {
    fn stop(&self, stopped: &AtomicBool);
}

/// A Stopper stops all the actors associated with it. Pass one Stopper
/// to many actors (and those to child actors and so forth), then close
/// them all at once.
#[derive(Clone, Default)]
pub struct Stopper {
    actors: Arc<Mutex<Vec<(Box<dyn Stop>, Arc<AtomicBool>, thread::JoinHandle<()>)>>>,
}

impl Stopper {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(
        &self,
        actor: Box<dyn Stop>,
        stopped: Arc<AtomicBool>,
        join_handle: thread::JoinHandle<()>,
    ) {
        if let Ok(mut actors) = self.actors.lock() {
            actors.push((actor, stopped, join_handle));
        }
    }

    /// Stop all the actors associated with this Stopper without waiting
    /// for their threads to end.
    pub fn stop_all_without_joining(&self) -> Vec<thread::JoinHandle<()>> {
        let mut actors = match self.actors.lock() {
            Ok(actors) => actors,
            Err(_) => return Vec::new(),
        };
        actors
            .drain(..)
            .map(|(actor, stopped, join_handle)| {
                actor.stop(&stopped);
                join_handle
            })
            .collect()
    }

    /// Stop all the actors associated with this Stopper and join their
    /// threads.
    pub fn stop_all_and_join(&self) {
        for join_handle in self.stop_all_without_joining() {
            let _ = join_handle.join();
        }
    }
}
