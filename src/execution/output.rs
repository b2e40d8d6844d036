//! Output batcher: rate-bounded delivery of stdout/stderr
//!
//! Every byte read from the child lands in two places: the cumulative buffer of
//! its stream (delivered once, with the terminal event) and the interleaved flush
//! buffer (delivered as `output` chunks on a timer). For each stream the
//! concatenation of all flushed chunks equals the cumulative buffer.

use std::mem;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::trace;

use crate::errors::Result;
use crate::events::{Emitter, Event, StreamKind};
use crate::schedule::{lock, Clock, PeriodicTask};

/// Largest payload carried by one `output` event
pub const DEFAULT_CHUNK_CAP: usize = 64 * 1024;

/// Cumulative per-stream output handed over with the terminal event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Default)]
struct BatcherState {
    final_stdout: Vec<u8>,
    final_stderr: Vec<u8>,
    /// Arrival-ordered segments; adjacent writes of one stream are merged
    pending: Vec<(StreamKind, Vec<u8>)>,
    /// Incomplete trailing UTF-8 sequence per stream, held until its next write
    partial_stdout: Vec<u8>,
    partial_stderr: Vec<u8>,
    closed: bool,
}

impl BatcherState {
    fn partial_mut(&mut self, stream: StreamKind) -> &mut Vec<u8> {
        match stream {
            StreamKind::Stdout => &mut self.partial_stdout,
            StreamKind::Stderr => &mut self.partial_stderr,
        }
    }

    fn push_pending(&mut self, stream: StreamKind, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        match self.pending.last_mut() {
            Some((last, buf)) if *last == stream => buf.extend_from_slice(&data),
            _ => self.pending.push((stream, data)),
        }
    }
}

/// Shared between reader threads, the flush timer and the lifecycle manager
#[derive(Clone)]
pub struct OutputBatcher {
    state: Arc<Mutex<BatcherState>>,
    emitter: Emitter,
    chunk_cap: usize,
}

impl OutputBatcher {
    pub fn new(emitter: Emitter, chunk_cap: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(BatcherState::default())),
            emitter,
            chunk_cap: chunk_cap.max(1),
        }
    }

    /// Record bytes from `stream`. Returns `false` (and drops the bytes) once closed.
    pub fn append(&self, stream: StreamKind, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }

        let mut state = lock(&self.state);
        if state.closed {
            trace!("Dropping {} bytes of {} after close", data.len(), stream.as_str());
            return false;
        }

        match stream {
            StreamKind::Stdout => state.final_stdout.extend_from_slice(data),
            StreamKind::Stderr => state.final_stderr.extend_from_slice(data),
        }

        let mut bytes = mem::take(state.partial_mut(stream));
        bytes.extend_from_slice(data);
        let complete = complete_prefix_len(&bytes);
        *state.partial_mut(stream) = bytes.split_off(complete);
        state.push_pending(stream, bytes);
        true
    }

    /// Emit and drain the flush buffer. Returns the number of events emitted.
    pub fn flush(&self) -> usize {
        let mut state = lock(&self.state);
        self.flush_locked(&mut state)
    }

    // Emission happens under the lock so concurrent flushes cannot reorder chunks.
    fn flush_locked(&self, state: &mut BatcherState) -> usize {
        let mut emitted = 0;
        for (stream, data) in mem::take(&mut state.pending) {
            let mut rest = data.as_slice();
            while !rest.is_empty() {
                let (chunk, tail) = rest.split_at(chunk_end(rest, self.chunk_cap));
                self.emitter.emit(Event::Output {
                    stream,
                    data: chunk.to_vec(),
                });
                emitted += 1;
                rest = tail;
            }
        }
        emitted
    }

    /// Close the batcher, flush what is left and hand back the cumulative buffers.
    /// Later calls return empty buffers.
    pub fn finish(&self) -> FinalOutput {
        let mut state = lock(&self.state);
        if state.closed {
            return FinalOutput::default();
        }
        state.closed = true;
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let partial = mem::take(state.partial_mut(stream));
            state.push_pending(stream, partial);
        }
        self.flush_locked(&mut state);

        FinalOutput {
            stdout: mem::take(&mut state.final_stdout),
            stderr: mem::take(&mut state.final_stderr),
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Flush every `period` until cancelled or closed
    pub fn spawn_flush_task(&self, period: Duration, clock: Arc<dyn Clock>) -> Result<PeriodicTask> {
        let batcher = self.clone();
        let name = format!("flush-{}", short_id(self.emitter.run_id()));
        PeriodicTask::spawn(name, period, clock, move || {
            if batcher.is_closed() {
                return ControlFlow::Break(());
            }
            batcher.flush();
            ControlFlow::Continue(())
        })
    }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}

/// Length of `data` without a trailing UTF-8 sequence that is still missing bytes
fn complete_prefix_len(data: &[u8]) -> usize {
    let len = data.len();
    for back in 1..=len.min(4) {
        let byte = data[len - back];
        if is_continuation(byte) {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { len - back } else { len };
    }
    len
}

/// End of the next chunk: at most `cap` bytes, backed off to a character start
fn chunk_end(data: &[u8], cap: usize) -> usize {
    if data.len() <= cap {
        return data.len();
    }
    let mut end = cap;
    while end > 0 && cap - end < 3 && is_continuation(data[end]) {
        end -= 1;
    }
    if end == 0 {
        cap
    } else {
        end
    }
}

/// First eight characters of a run id, for thread names
pub(crate) fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}
