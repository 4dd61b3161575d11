//! In-memory daemon used by the pool, compile and build tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::build::step_factory::StepFlavor;
use crate::protocol::{ExecuteRequest, Request, ResultEvent};
use crate::worker::{CompilerDaemon, DaemonError, DaemonLauncher, WorkerId};

#[derive(Debug, Clone, Default)]
pub struct FakeBehaviour {
    pub delay: Duration,
    pub exit_code: i32,
    pub message: Option<String>,
    /// Only this step reports `exit_code` and `message`; every other step succeeds.
    pub failing_step: Option<StepFlavor>,
    pub crash: bool,
    pub fail_handshake: bool,
}

#[derive(Debug, Clone)]
pub struct Dispatch {
    pub worker: WorkerId,
    pub request: ExecuteRequest,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Default)]
pub struct FakeState {
    dispatches: Mutex<Vec<Dispatch>>,
    exits: Mutex<Vec<Arc<AtomicBool>>>,
    launched: AtomicUsize,
    killed: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl FakeState {
    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().unwrap().clone()
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.killed.load(Ordering::SeqCst)
    }

    /// Highest number of round-trips that were running at the same time.
    pub fn max_concurrency(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Simulates every launched process dying on its own.
    pub fn exit_all(&self) {
        for exited in self.exits.lock().unwrap().iter() {
            exited.store(true, Ordering::SeqCst);
        }
    }
}

pub struct FakeLauncher {
    behaviour: FakeBehaviour,
    state: Arc<FakeState>,
}

impl FakeLauncher {
    pub fn new(behaviour: FakeBehaviour) -> Self {
        FakeLauncher {
            behaviour,
            state: Arc::new(FakeState::default()),
        }
    }

    pub fn state(&self) -> Arc<FakeState> {
        self.state.clone()
    }

    pub fn daemon(&self, id: WorkerId) -> FakeDaemon {
        let exited = Arc::new(AtomicBool::new(false));
        self.state.exits.lock().unwrap().push(exited.clone());
        self.state.launched.fetch_add(1, Ordering::SeqCst);
        FakeDaemon {
            id,
            behaviour: self.behaviour.clone(),
            state: self.state.clone(),
            exited,
            killed: false,
        }
    }
}

impl DaemonLauncher for FakeLauncher {
    type Daemon = FakeDaemon;

    async fn launch(&self, id: WorkerId) -> Result<FakeDaemon, DaemonError> {
        Ok(self.daemon(id))
    }
}

pub struct FakeDaemon {
    id: WorkerId,
    behaviour: FakeBehaviour,
    state: Arc<FakeState>,
    exited: Arc<AtomicBool>,
    killed: bool,
}

impl CompilerDaemon for FakeDaemon {
    async fn handshake(&mut self) -> Result<(), DaemonError> {
        if self.behaviour.fail_handshake {
            return Err(DaemonError::Unexpected {
                expected: "a ready message",
                got: "garbage".to_string(),
            });
        }
        Ok(())
    }

    async fn round_trip(&mut self, request: &Request) -> Result<ResultEvent, DaemonError> {
        let Request::Execute(request) = request else {
            return Err(DaemonError::Unexpected {
                expected: "an execute request",
                got: "handshake".to_string(),
            });
        };
        if self.behaviour.crash {
            self.exited.store(true, Ordering::SeqCst);
            return Err(DaemonError::Exited { status: Some(1) });
        }

        let started = Instant::now();
        let running = self.state.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_running.fetch_max(running, Ordering::SeqCst);
        tokio::time::sleep(self.behaviour.delay).await;
        self.state.running.fetch_sub(1, Ordering::SeqCst);

        self.state.dispatches.lock().unwrap().push(Dispatch {
            worker: self.id,
            request: request.clone(),
            started,
            finished: Instant::now(),
        });

        let fails = self
            .behaviour
            .failing_step
            .is_none_or(|step| step == request.step);
        Ok(if fails {
            ResultEvent {
                exit_code: self.behaviour.exit_code,
                message: self.behaviour.message.clone(),
                cause: None,
            }
        } else {
            ResultEvent {
                exit_code: 0,
                message: None,
                cause: None,
            }
        })
    }

    fn has_exited(&mut self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    fn kill(&mut self) {
        if !self.killed {
            self.killed = true;
            self.state.killed.fetch_add(1, Ordering::SeqCst);
        }
        self.exited.store(true, Ordering::SeqCst);
    }
}
