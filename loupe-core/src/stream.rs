// Continue stream and run control
//
// A continue runs on its own worker thread and hands states to the consumer through a
// channel holding at most one state. Halt requests reach the worker through RunControl.

use crate::backend::Interrupt;
use crate::error::{DebugError, DebugResult};
use crate::target::SharedSymbols;
use crate::types::DebuggerState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Capacity of the state channel between worker and consumer.
pub const STREAM_CAPACITY: usize = 1;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Shared between the debugger, the continue worker and halt callers.
#[derive(Default)]
pub struct RunControl {
    running: Mutex<bool>,
    idle: Condvar,
    halt_requested: AtomicBool,
    interrupters: Mutex<Vec<Arc<dyn Interrupt>>>,
    last_state: Mutex<Option<DebuggerState>>,
    symbols: Mutex<Vec<SharedSymbols>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.running)
    }

    /// Mark a continue as started; fails if one is already in flight.
    pub(crate) fn begin(&self, interrupters: Vec<Arc<dyn Interrupt>>) -> DebugResult<()> {
        let mut running = lock(&self.running);
        if *running {
            return Err(DebugError::TargetRunning);
        }
        *running = true;
        self.halt_requested.store(false, Ordering::SeqCst);
        *lock(&self.interrupters) = interrupters;
        Ok(())
    }

    pub(crate) fn finish(&self) {
        let mut running = lock(&self.running);
        *running = false;
        lock(&self.interrupters).clear();
        self.idle.notify_all();
    }

    /// Register a target adopted while the continue is in flight.
    pub(crate) fn add_interrupter(&self, interrupter: Arc<dyn Interrupt>) {
        if self.halt_requested() {
            interrupter.interrupt();
        }
        lock(&self.interrupters).push(interrupter);
    }

    /// Ask the worker to stop and interrupt every running process.
    pub fn request_halt(&self) {
        self.halt_requested.store(true, Ordering::SeqCst);
        for interrupter in lock(&self.interrupters).iter() {
            interrupter.interrupt();
        }
        debug!("Halt requested");
    }

    pub(crate) fn halt_requested(&self) -> bool {
        self.halt_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_halt(&self) {
        self.halt_requested.store(false, Ordering::SeqCst);
    }

    pub(crate) fn wait_idle(&self) {
        let mut running = lock(&self.running);
        while *running {
            running = self
                .idle
                .wait(running)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub(crate) fn publish_state(&self, state: &DebuggerState) {
        *lock(&self.last_state) = Some(state.clone());
    }

    pub(crate) fn last_state(&self) -> Option<DebuggerState> {
        lock(&self.last_state).clone()
    }

    pub(crate) fn publish_symbols(&self, symbols: Vec<SharedSymbols>) {
        *lock(&self.symbols) = symbols;
    }

    /// Debug info handles usable without the engine lock.
    pub(crate) fn symbols(&self) -> Vec<SharedSymbols> {
        lock(&self.symbols).clone()
    }
}

/// How often a worker waiting on a full stream rechecks for a halt.
const PUSH_POLL: Duration = Duration::from_millis(2);

/// Producer half, owned by the continue worker.
pub(crate) struct StateSender {
    tx: mpsc::Sender<DebuggerState>,
    run: Arc<RunControl>,
}

impl StateSender {
    /// Deliver an intermediate state; false once the consumer went away.
    ///
    /// Waits while the stream is full, unless a halt is requested: the state is then
    /// dropped so the worker can reach its stop.
    pub(crate) fn push(&self, state: DebuggerState) -> bool {
        let mut pending = state;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => return false,
                Err(TrySendError::Full(state)) => {
                    if self.run.halt_requested() {
                        debug!("Halt requested, dropping undelivered state");
                        return true;
                    }
                    pending = state;
                    std::thread::sleep(PUSH_POLL);
                }
            }
        }
    }

    /// Deliver the final state. Called once the worker no longer holds the engine.
    pub(crate) fn push_final(&self, state: DebuggerState) -> bool {
        self.tx.blocking_send(state).is_ok()
    }
}

/// Ordered states of one continue. The last state is a real stop or the exit.
pub struct ContinueStream {
    rx: mpsc::Receiver<DebuggerState>,
    run: Arc<RunControl>,
}

impl ContinueStream {
    pub(crate) fn channel(run: Arc<RunControl>) -> (StateSender, ContinueStream) {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let sender = StateSender {
            tx,
            run: run.clone(),
        };
        (sender, ContinueStream { rx, run })
    }

    /// A stream that yields a single, already known state.
    pub(crate) fn ready(run: Arc<RunControl>, state: DebuggerState) -> ContinueStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let _ = tx.try_send(state);
        ContinueStream { rx, run }
    }

    pub async fn recv(&mut self) -> Option<DebuggerState> {
        self.rx.recv().await
    }

    /// Blocking variant for callers outside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<DebuggerState> {
        self.rx.blocking_recv()
    }

    /// Request early closure; the worker still delivers its final state.
    pub fn close(&self) {
        self.run.request_halt();
    }
}

impl Iterator for ContinueStream {
    type Item = DebuggerState;

    fn next(&mut self) -> Option<DebuggerState> {
        self.blocking_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingInterrupt(AtomicUsize);

    impl Interrupt for CountingInterrupt {
        fn interrupt(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_begin_rejects_second_continue() {
        let run = RunControl::new();
        run.begin(Vec::new()).unwrap();
        assert!(matches!(run.begin(Vec::new()), Err(DebugError::TargetRunning)));
        run.finish();
        assert!(!run.is_running());
        run.begin(Vec::new()).unwrap();
    }

    #[test]
    fn test_halt_reaches_interrupters() {
        let run = RunControl::new();
        let counter = Arc::new(CountingInterrupt(AtomicUsize::new(0)));
        run.begin(vec![counter.clone()]).unwrap();
        run.request_halt();
        assert!(run.halt_requested());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        run.finish();
        run.request_halt();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_preserves_order() {
        let run = Arc::new(RunControl::new());
        let (tx, stream) = ContinueStream::channel(run);
        let worker = std::thread::spawn(move || {
            for pid in 1..=3 {
                let state = DebuggerState {
                    pid,
                    ..Default::default()
                };
                assert!(tx.push(state));
            }
        });
        let pids: Vec<u32> = stream.map(|s| s.pid).collect();
        worker.join().unwrap();
        assert_eq!(pids, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_stream_yields_to_halt() {
        let run = Arc::new(RunControl::new());
        run.begin(Vec::new()).unwrap();
        let (tx, mut stream) = ContinueStream::channel(run.clone());
        assert!(tx.push(DebuggerState {
            pid: 1,
            ..Default::default()
        }));

        let worker = std::thread::spawn(move || {
            let delivered = tx.push(DebuggerState {
                pid: 2,
                ..Default::default()
            });
            (delivered, tx)
        });
        std::thread::sleep(Duration::from_millis(20));
        run.request_halt();
        let (delivered, tx) = worker.join().unwrap();
        assert!(delivered);

        assert_eq!(stream.blocking_recv().unwrap().pid, 1);
        assert!(tx.push_final(DebuggerState {
            pid: 3,
            ..Default::default()
        }));
        drop(tx);
        assert_eq!(stream.blocking_recv().unwrap().pid, 3);
        assert!(stream.blocking_recv().is_none());
    }

    #[test]
    fn test_wait_idle_returns_after_finish() {
        let run = Arc::new(RunControl::new());
        run.begin(Vec::new()).unwrap();
        let waiter = {
            let run = run.clone();
            std::thread::spawn(move || run.wait_idle())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        run.finish();
        waiter.join().unwrap();
    }
}
