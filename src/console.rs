//! User-facing output sink.
//!
//! Every component that prints to the user receives a [`Console`] at
//! construction. The console is cheap to clone and serialises writes from
//! concurrently running jobs through a single lock, so lines never interleave.
//! While a progress spinner is attached, writes go through
//! [`ProgressBar::suspend`] so they never tear the spinner line.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use indicatif::ProgressBar;

const PREFIX: &str = "runem: ";

#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
    progress: Arc<Mutex<Option<ProgressBar>>>,
    decorate: bool,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("decorate", &self.decorate)
            .field("progress_attached", &self.progress_attached())
            .finish_non_exhaustive()
    }
}

impl Console {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(out)),
            progress: Arc::new(Mutex::new(None)),
            decorate: true,
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// A console writing into memory, plus a handle to read what was written.
    pub fn buffered() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (Self::new(Box::new(buffer.clone())), buffer)
    }

    /// Write `msg` as a `runem: `-prefixed line.
    pub fn log(&self, msg: impl AsRef<str>) {
        if self.decorate {
            self.write_raw(&format!("{}{}\n", PREFIX, msg.as_ref()));
        } else {
            self.write_raw(&format!("{}\n", msg.as_ref()));
        }
    }

    /// Route writes around `bar` until [`Console::detach_progress`].
    pub fn attach_progress(&self, bar: ProgressBar) {
        *self.progress_slot() = Some(bar);
    }

    pub fn detach_progress(&self) {
        *self.progress_slot() = None;
    }

    pub fn progress_attached(&self) -> bool {
        self.progress_slot().is_some()
    }

    fn progress_slot(&self) -> std::sync::MutexGuard<'_, Option<ProgressBar>> {
        match self.progress.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Write `msg` verbatim, without prefix or trailing newline.
    pub fn write_raw(&self, msg: &str) {
        let bar = self.progress_slot().clone();
        match bar {
            Some(bar) => bar.suspend(|| self.write_out(msg)),
            None => self.write_out(msg),
        }
    }

    fn write_out(&self, msg: &str) {
        let mut out = match self.out.lock() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        };
        // A closed or full terminal is not worth failing a run over.
        if let Err(e) = out.write_all(msg.as_bytes()).and_then(|_| out.flush()) {
            tracing::debug!(error = %e, "Console write failed");
        }
    }
}

/// In-memory writer shared between a [`Console`] and a reader.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = match self.0.lock() {
            Ok(bytes) => bytes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut bytes) => bytes.extend_from_slice(buf),
            Err(poisoned) => poisoned.into_inner().extend_from_slice(buf),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
