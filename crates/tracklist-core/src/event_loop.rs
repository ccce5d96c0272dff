//! The single loop thread.
//!
//! Multiplexes the backend's wake signal, the pump timer, the request inbox and
//! the interrupt. Everything that touches the dispatcher happens here.

use std::future::Future;
use std::io;
use std::thread;

use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, SessionEvent, WakeSignal};
use crate::config::BridgeConfig;
use crate::dispatcher::Dispatcher;
use crate::request::{Request, RequestError};
use crate::response::{Reply, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for the session to come up; requests stay in the inbox.
    Idle,
    Running,
    /// Logging out; new requests are refused.
    Draining,
    Terminated,
}

impl LoopState {
    fn metric_value(self) -> f64 {
        match self {
            LoopState::Idle => 0.0,
            LoopState::Running => 1.0,
            LoopState::Draining => 2.0,
            LoopState::Terminated => 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
}

impl ExitStatus {
    pub fn code(self) -> u8 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
        }
    }
}

#[derive(Debug)]
pub struct Envelope {
    pub request: Request,
    pub reply: Reply,
}

/// Cloneable entry point for other threads.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    requests: mpsc::UnboundedSender<Envelope>,
    state: watch::Receiver<LoopState>,
}

impl LoopHandle {
    /// Queues a request. The receiver errors if the loop drops it unanswered.
    pub fn submit(&self, request: Request) -> oneshot::Receiver<Response> {
        let (reply, rx) = Reply::channel();
        if self.requests.send(Envelope { request, reply }).is_err() {
            debug!("loop inbox closed");
        }
        rx
    }

    /// Submits and waits; an unanswered request becomes a shutdown error.
    pub async fn call(&self, request: Request) -> Response {
        self.submit(request)
            .await
            .unwrap_or_else(|_| Response::from_error(&RequestError::ShuttingDown))
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<LoopState> {
        self.state.clone()
    }

    /// Resolves once the loop has left `Idle`, returning the state it moved to.
    pub async fn wait_running(&self) -> LoopState {
        self.wait_until(|state| state != LoopState::Idle).await
    }

    pub async fn wait_terminated(&self) {
        self.wait_until(|state| state == LoopState::Terminated).await;
    }

    async fn wait_until(&self, accept: impl Fn(LoopState) -> bool) -> LoopState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|state| accept(*state)).await {
            Ok(state) => *state,
            // Loop gone without saying goodbye.
            Err(_) => LoopState::Terminated,
        };
        state
    }
}

pub struct EventLoop<B: Backend + 'static> {
    dispatcher: Dispatcher<B>,
    wake: WakeSignal,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    state: watch::Sender<LoopState>,
    exit: ExitStatus,
}

fn channels() -> (
    LoopHandle,
    mpsc::UnboundedReceiver<Envelope>,
    watch::Sender<LoopState>,
) {
    let (requests, inbox) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(LoopState::Idle);
    let handle = LoopHandle {
        requests,
        state: state_rx,
    };
    (handle, inbox, state_tx)
}

impl<B: Backend + 'static> EventLoop<B> {
    /// `wake` must be the signal the backend raises.
    pub fn new(backend: B, wake: WakeSignal, config: BridgeConfig) -> (Self, LoopHandle) {
        let (handle, inbox, state) = channels();
        let event_loop = Self {
            dispatcher: Dispatcher::new(backend, config),
            wake,
            inbox,
            state,
            exit: ExitStatus::Success,
        };
        (event_loop, handle)
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Logs in, serves until the session ends, and tears down.
    pub async fn run<F>(mut self, interrupt: F) -> ExitStatus
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        let mut interrupted = false;
        let mut inbox_open = true;
        let mut next_pump = Instant::now();

        info!("logging in");
        self.dispatcher.backend_mut().login();

        while self.state() != LoopState::Terminated {
            let wake_at = self
                .dispatcher
                .next_deadline()
                .map_or(next_pump, |deadline| deadline.min(next_pump));
            let accepting = matches!(self.state(), LoopState::Running | LoopState::Draining);

            tokio::select! {
                _ = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    info!("interrupt received");
                    self.begin_drain();
                    next_pump = Instant::now();
                }
                _ = self.wake.raised() => {
                    next_pump = Instant::now();
                }
                _ = sleep_until(wake_at) => {}
                envelope = self.inbox.recv(), if accepting && inbox_open => match envelope {
                    Some(envelope) => self.accept(envelope),
                    None => inbox_open = false,
                },
            }

            let now = Instant::now();
            if now >= next_pump {
                let outcome = self.dispatcher.pump();
                next_pump = Instant::now() + outcome.next_timeout;
                for event in outcome.session_events {
                    self.on_session_event(event);
                }
            } else {
                self.dispatcher.expire(now);
            }
        }

        self.dispatcher.teardown();
        self.inbox.close();
        while let Ok(envelope) = self.inbox.try_recv() {
            envelope
                .reply
                .send(Response::from_error(&RequestError::ShuttingDown));
        }
        info!(status = ?self.exit, "loop terminated");
        self.exit
    }

    fn accept(&mut self, envelope: Envelope) {
        let Envelope { request, reply } = envelope;
        if self.state() == LoopState::Draining {
            counter!("tracklist_requests_refused_total", 1);
            reply.send(Response::from_error(&RequestError::ShuttingDown));
            return;
        }
        self.dispatcher.handle(request, reply);
    }

    fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::LoggedIn(Ok(())) => {
                if self.state() == LoopState::Idle {
                    info!("session established");
                    self.set_state(LoopState::Running);
                }
            }
            SessionEvent::LoggedIn(Err(err)) => {
                error!(error = %err, "login failed");
                self.exit = ExitStatus::Failure;
                self.set_state(LoopState::Terminated);
            }
            SessionEvent::TerminalError(err) => {
                error!(error = %err, "session failed");
                self.exit = ExitStatus::Failure;
                self.begin_drain();
            }
            SessionEvent::LoggedOut => {
                info!("logged out");
                self.set_state(LoopState::Terminated);
            }
        }
    }

    fn begin_drain(&mut self) {
        if matches!(self.state(), LoopState::Draining | LoopState::Terminated) {
            return;
        }
        self.set_state(LoopState::Draining);
        self.dispatcher.backend_mut().logout();
    }

    fn set_state(&mut self, state: LoopState) {
        debug!(from = ?self.state(), to = ?state, "loop state");
        gauge!("tracklist_loop_state", state.metric_value());
        self.state.send_replace(state);
    }
}

/// Runs the loop on its own thread with a current-thread runtime. The backend
/// is built on that thread from the wake signal the loop listens to.
pub fn spawn_loop_thread<B, F, I>(
    factory: F,
    config: BridgeConfig,
    interrupt: I,
) -> io::Result<(LoopHandle, thread::JoinHandle<ExitStatus>)>
where
    B: Backend + 'static,
    F: FnOnce(WakeSignal) -> B + Send + 'static,
    I: Future<Output = ()> + Send + 'static,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (handle, inbox, state) = channels();

    let join = thread::Builder::new()
        .name("tracklist-loop".into())
        .spawn(move || {
            let wake = WakeSignal::new();
            let backend = factory(wake.clone());
            let event_loop = EventLoop {
                dispatcher: Dispatcher::new(backend, config),
                wake,
                inbox,
                state,
                exit: ExitStatus::Success,
            };
            let status = runtime.block_on(event_loop.run(interrupt));
            if status == ExitStatus::Failure {
                warn!("loop exited with failure");
            }
            status
        })?;
    Ok((handle, join))
}
