use log::{debug, warn};
use std::{
    io,
    thread::{self, JoinHandle},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use crate::{error::Result, logger::ProjectLogger, services::LineStream};

pub const RELAY_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Copies a live output stream into a project log on a background thread.
///
/// The relay asks `attach` for a stream, drains it, and attaches again after
/// a short delay if reading failed. It stops when a stream closes cleanly,
/// when `attach` has nothing more to offer, or when `cancel` fires. Failures
/// are logged and never reach the pipeline.
///
/// Streams handed out by `attach` must give up once `cancel` fires, or
/// `stop` cannot interrupt a read that is waiting for output.
pub struct Relay {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Relay {
    pub fn spawn<F>(
        name: impl Into<String>,
        cancel: CancellationToken,
        logger: ProjectLogger,
        attach: F,
    ) -> io::Result<Relay>
    where
        F: FnMut() -> Result<Option<LineStream>> + Send + 'static,
    {
        let name = name.into();

        let handle = {
            let name = name.clone();
            let cancel = cancel.clone();
            thread::Builder::new()
                .name(format!("relay-{}", name))
                .spawn(move || relay(&name, &cancel, logger, attach))?
        };

        Ok(Relay {
            name,
            cancel,
            handle: Some(handle),
        })
    }

    /// Cancels the relay and waits for its thread.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.cancel.cancel();

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("relay {} panicked", self.name);
            }
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.join();
    }
}

fn relay<F>(name: &str, cancel: &CancellationToken, logger: ProjectLogger, mut attach: F)
where
    F: FnMut() -> Result<Option<LineStream>>,
{
    while !cancel.is_cancelled() {
        match attach() {
            Ok(None) => break,
            Ok(Some(lines)) => match drain(lines, &logger) {
                Ok(()) => break,
                Err(err) if err.is_cancelled() => break,
                Err(err) => warn!("relay {}: reading output failed: {}", name, err),
            },
            Err(err) if err.is_cancelled() => break,
            Err(err) => warn!("relay {}: attaching failed: {}", name, err),
        }

        thread::sleep(RELAY_RETRY_DELAY);
    }

    debug!("relay {} finished", name);
}

fn drain(lines: LineStream, logger: &ProjectLogger) -> Result<()> {
    for line in lines {
        logger.line(&line?)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::Error, logger::testing::Captured};
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    };

    fn stream(lines: Vec<Result<String>>) -> LineStream {
        Box::new(lines.into_iter())
    }

    #[test]
    fn drains_a_stream_once() {
        let captured = Captured::default();
        let mut source = Some(stream(vec![Ok("one".into()), Ok("two".into())]));

        let relay = Relay::spawn(
            "once",
            CancellationToken::new(),
            captured.logger(),
            move || Ok(source.take()),
        )
        .unwrap();
        relay.stop();

        assert_eq!(captured.contents(), "one\ntwo\n");
    }

    #[test]
    fn reattaches_after_a_read_error() {
        let captured = Captured::default();
        let attempts = Arc::new(AtomicUsize::new(0));

        let relay = {
            let attempts = attempts.clone();
            Relay::spawn(
                "retry",
                CancellationToken::new(),
                captured.logger(),
                move || {
                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                    if attempt == 0 {
                        Ok(Some(stream(vec![
                            Ok("partial".into()),
                            Err(Error::ProtocolViolation("connection reset".into())),
                        ])))
                    } else {
                        Ok(Some(stream(vec![Ok("resumed".into())])))
                    }
                },
            )
            .unwrap()
        };

        while attempts.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(10));
        }
        thread::sleep(Duration::from_millis(50));
        relay.stop();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(captured.contents(), "partial\nresumed\n");
    }

    #[test]
    fn stops_when_parent_is_cancelled() {
        let parent = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let relay = {
            let attempts = attempts.clone();
            Relay::spawn("cancel", parent.child_token(), Captured::default().logger(), move || {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::ProtocolViolation("daemon not ready".into()))
            })
            .unwrap()
        };

        thread::sleep(RELAY_RETRY_DELAY * 2);
        parent.cancel();
        relay.stop();

        let seen = attempts.load(Ordering::SeqCst);
        thread::sleep(RELAY_RETRY_DELAY * 2);
        assert!(seen >= 1);
        assert_eq!(attempts.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn stop_interrupts_a_blocked_read() {
        let captured = Captured::default();
        let cancel = CancellationToken::new();

        let mut source = {
            let cancel = cancel.clone();
            let mut sent = false;
            let lines: LineStream = Box::new(std::iter::from_fn(move || {
                if !sent {
                    sent = true;
                    return Some(Ok("daemon starting".to_owned()));
                }
                while !cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(10));
                }
                None
            }));
            Some(lines)
        };

        let relay = Relay::spawn("blocked", cancel, captured.logger(), move || Ok(source.take()))
            .unwrap();
        while captured.contents().is_empty() {
            thread::sleep(Duration::from_millis(10));
        }

        let (done, stopped) = mpsc::channel();
        thread::spawn(move || {
            relay.stop();
            done.send(()).unwrap();
        });

        stopped.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(captured.contents(), "daemon starting\n");
    }
}
