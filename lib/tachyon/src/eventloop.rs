use crate::fabric::{Completion, CompletionQueue};
use ion::logging;
use ion::options::CompMethod;
use ion::shared::{ErrorType, TransportError, TransportResult};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Upper bound on completions consumed from one queue per loop iteration.
pub const COMPLETION_BATCH: usize = 16;

const SREAD_TIMEOUT: Duration = Duration::from_millis(1);
const WAIT_TIMEOUT: Duration = Duration::from_millis(10);

/// Completion-wait strategy for a loop thread. `Spin` yields between
/// iterations, `Sread` leans on the provider's blocking read, and `WaitFd`
/// parks on the completion queues' file descriptors through `mio`,
/// degrading to a spin when a provider exposes none.
pub struct Completer {
    method: CompMethod,
    poll: Option<Poll>,
    events: Events,
    registered: usize,
    log: logging::Logger,
}

impl Completer {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        method: CompMethod,
        log: L,
    ) -> TransportResult<Completer> {
        let poll = match method {
            CompMethod::WaitFd => Some(
                Poll::new().map_err(|err| TransportError::Fatal(ErrorType::Io(err.kind())))?,
            ),
            _ => None,
        };

        Ok(Completer {
            method,
            poll,
            events: Events::with_capacity(64),
            registered: 0,
            log: logging::child(log),
        })
    }

    /// Registers a completion queue's wait descriptor, when it has one.
    pub fn register(&mut self, cq: &dyn CompletionQueue) -> TransportResult<()> {
        let poll = match &self.poll {
            Some(poll) => poll,
            None => return Ok(()),
        };

        let fd = match cq.wait_fd() {
            Some(fd) => fd,
            None => {
                logging::debug!(self.log, "completion queue exposes no fd, will spin";
                                "context" => "register");
                return Ok(());
            }
        };

        poll.registry()
            .register(&mut SourceFd(&fd), Token(self.registered), Interest::READABLE)
            .map_err(|err| TransportError::Fatal(ErrorType::Io(err.kind())))?;
        self.registered += 1;
        Ok(())
    }

    /// Reads a bounded batch from the queue using the configured strategy.
    pub fn read(
        &mut self,
        cq: &mut dyn CompletionQueue,
        entries: &mut [Completion],
    ) -> TransportResult<usize> {
        match self.method {
            CompMethod::Sread => cq.sread(entries, SREAD_TIMEOUT),
            _ => cq.read(entries),
        }
    }

    /// Parks until there may be progress. Called only when a full loop
    /// iteration made none.
    pub fn idle(&mut self) {
        match self.method {
            CompMethod::Spin => thread::yield_now(),
            // sread already blocked inside `read`
            CompMethod::Sread => {}
            CompMethod::WaitFd => match &mut self.poll {
                Some(poll) if self.registered > 0 => {
                    if let Err(err) = poll.poll(&mut self.events, Some(WAIT_TIMEOUT)) {
                        logging::warn!(self.log, "poll failed, falling back to yield";
                                       "context" => "idle",
                                       "error" => %err);
                        thread::yield_now();
                    }
                }
                _ => thread::yield_now(),
            },
        }
    }
}

/// Handle to a dedicated worker thread driving one event loop. The body
/// returns `true` when its iteration made progress; the loop idles through
/// the supplied completer otherwise.
pub struct LoopThread {
    run: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl LoopThread {
    pub fn spawn<F>(name: &str, mut completer: Completer, mut body: F) -> LoopThread
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let run = Arc::new(AtomicBool::new(true));
        let thread_run = run.clone();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while thread_run.load(Ordering::Acquire) {
                    if !body() {
                        completer.idle();
                    }
                }
            })
            .expect("failed to spawn loop thread");

        LoopThread {
            run,
            handle: Some(handle),
        }
    }

    /// Signals the loop to exit and joins it.
    pub fn stop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            drop(handle.join());
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_loop_thread_runs_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let body_ticks = ticks.clone();

        let completer = Completer::new(CompMethod::Spin, None).unwrap();
        let mut thread = LoopThread::spawn("test-loop", completer, move || {
            body_ticks.fetch_add(1, Ordering::Relaxed);
            false
        });

        while ticks.load(Ordering::Relaxed) < 10 {
            std::thread::yield_now();
        }

        thread.stop();
        assert!(!thread.is_running());

        let after = ticks.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ticks.load(Ordering::Relaxed), after);
    }

    #[test]
    fn test_spin_completer_without_fds() {
        let mut completer = Completer::new(CompMethod::Spin, None).unwrap();
        // never blocks
        completer.idle();
    }
}
