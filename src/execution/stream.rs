//! Pipe readers feeding the output batcher

use std::io::{ErrorKind, Read};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::errors::Result;
use crate::events::StreamKind;
use crate::execution::output::{short_id, OutputBatcher};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Reader threads for one execution's stdout and stderr
pub struct OutputReaders {
    done_rx: Receiver<StreamKind>,
    pending: usize,
}

impl OutputReaders {
    /// Spawn one reader per available stream
    pub fn spawn<O, E>(
        run_id: &str,
        stdout: Option<O>,
        stderr: Option<E>,
        batcher: &OutputBatcher,
    ) -> Result<Self>
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let (done_tx, done_rx) = channel();
        let mut pending = 0;

        if let Some(stdout) = stdout {
            spawn_reader(run_id, StreamKind::Stdout, stdout, batcher.clone(), done_tx.clone())?;
            pending += 1;
        }
        if let Some(stderr) = stderr {
            spawn_reader(run_id, StreamKind::Stderr, stderr, batcher.clone(), done_tx)?;
            pending += 1;
        }

        Ok(Self { done_rx, pending })
    }

    /// Wait until every reader hit end of file, at most `timeout`.
    ///
    /// A grandchild that inherited the pipes can hold them open after the child
    /// exits; in that case the readers are left running and whatever they read
    /// later is dropped by the closed batcher.
    pub fn wait_drained(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done_rx.recv_timeout(remaining) {
                Ok(stream) => {
                    debug!("{} reader drained", stream.as_str());
                    self.pending -= 1;
                }
                Err(_) => break,
            }
        }
        self.pending == 0
    }
}

/// Spawn a reader thread copying `source` into the batcher until end of file
fn spawn_reader<R>(
    run_id: &str,
    stream: StreamKind,
    mut source: R,
    batcher: OutputBatcher,
    done_tx: Sender<StreamKind>,
) -> Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let name = format!("{}-{}", stream.as_str(), short_id(run_id));
    let handle = thread::Builder::new().name(name).spawn(move || {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    batcher.append(stream, &buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{} read failed: {}", stream.as_str(), e);
                    break;
                }
            }
        }
        let _ = done_tx.send(stream);
    })?;

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{channel as event_channel, Emitter};
    use std::io::Cursor;

    #[test]
    fn readers_copy_everything_into_batcher() {
        let (sink, _events) = event_channel();
        let batcher = OutputBatcher::new(Emitter::new("reader-test", sink), 1024);

        let big = vec![b'x'; READ_BUFFER_SIZE * 3 + 17];
        let mut readers = OutputReaders::spawn(
            "reader-test",
            Some(Cursor::new(big.clone())),
            Some(Cursor::new(b"err".to_vec())),
            &batcher,
        )
        .unwrap();

        assert!(readers.wait_drained(Duration::from_secs(5)));
        let out = batcher.finish();
        assert_eq!(out.stdout, big);
        assert_eq!(out.stderr, b"err");
    }

    #[test]
    fn missing_streams_drain_immediately() {
        let (sink, _events) = event_channel();
        let batcher = OutputBatcher::new(Emitter::new("none", sink), 1024);
        let mut readers =
            OutputReaders::spawn::<Cursor<Vec<u8>>, Cursor<Vec<u8>>>("none", None, None, &batcher)
                .unwrap();
        assert!(readers.wait_drained(Duration::from_millis(10)));
    }

    struct Blocking(Receiver<()>);

    impl Read for Blocking {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(0)
        }
    }

    #[test]
    fn wait_drained_times_out_on_held_pipe() {
        let (sink, _events) = event_channel();
        let batcher = OutputBatcher::new(Emitter::new("held", sink), 1024);
        let (release_tx, release_rx) = channel();

        let mut readers = OutputReaders::spawn::<Blocking, Cursor<Vec<u8>>>(
            "held",
            Some(Blocking(release_rx)),
            None,
            &batcher,
        )
        .unwrap();

        assert!(!readers.wait_drained(Duration::from_millis(50)));
        release_tx.send(()).unwrap();
        assert!(readers.wait_drained(Duration::from_secs(2)));
    }
}
