use std::time::Duration;

use crate::engine::term::{split_statements, Transcript};
use crate::error::BackendError;
use crate::model::cache_record::CacheRecord;
use crate::model::chunk::CodeChunk;
use crate::model::output::Output;

/// A stateful interpreter or kernel that runs chunk code.
///
/// Every chunk of a run is evaluated against the same backend, so state set
/// up by one chunk is visible to the next. The hook methods are extension
/// points and do nothing unless a backend overrides them.
pub trait Backend {
    fn open(&mut self) -> Result<(), BackendError>;

    fn evaluate(&mut self, code: &str, timeout: Option<Duration>) -> Result<Vec<Output>, BackendError>;

    /// Fetch the source text of a named symbol.
    fn introspect(&mut self, symbol: &str) -> Result<String, BackendError>;

    fn close(&mut self) -> Result<(), BackendError>;

    /// Evaluate statement by statement, like an interactive transcript.
    fn evaluate_term(&mut self, code: &str, timeout: Option<Duration>) -> Result<Transcript, BackendError> {
        let mut transcript = Transcript::default();
        for statement in split_statements(code) {
            let outputs = self.evaluate(&statement, timeout)?;
            transcript.sources.push(statement);
            transcript.outputs.push(outputs);
        }
        Ok(transcript)
    }

    /// Best-effort interrupt of a call that has timed out.
    fn interrupt(&mut self) -> Result<(), BackendError> {
        Err(BackendError::Protocol("interrupt is not supported by this backend".into()))
    }

    fn pre_run_hook(&mut self, _chunk: &CodeChunk) -> Result<(), BackendError> {
        Ok(())
    }

    fn post_run_hook(&mut self, _chunk: &CodeChunk) -> Result<(), BackendError> {
        Ok(())
    }

    /// Snapshot backend state after a chunk was executed and cached.
    fn save_chunk_state(&mut self, _chunk: &CodeChunk, _record: &CacheRecord) {}

    /// Restore backend state for a chunk answered from the cache.
    fn load_chunk_state(&mut self, _chunk: &CodeChunk, _record: &CacheRecord) {}
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn open(&mut self) -> Result<(), BackendError> {
        (**self).open()
    }

    fn evaluate(&mut self, code: &str, timeout: Option<Duration>) -> Result<Vec<Output>, BackendError> {
        (**self).evaluate(code, timeout)
    }

    fn introspect(&mut self, symbol: &str) -> Result<String, BackendError> {
        (**self).introspect(symbol)
    }

    fn close(&mut self) -> Result<(), BackendError> {
        (**self).close()
    }

    fn evaluate_term(&mut self, code: &str, timeout: Option<Duration>) -> Result<Transcript, BackendError> {
        (**self).evaluate_term(code, timeout)
    }

    fn interrupt(&mut self) -> Result<(), BackendError> {
        (**self).interrupt()
    }

    fn pre_run_hook(&mut self, chunk: &CodeChunk) -> Result<(), BackendError> {
        (**self).pre_run_hook(chunk)
    }

    fn post_run_hook(&mut self, chunk: &CodeChunk) -> Result<(), BackendError> {
        (**self).post_run_hook(chunk)
    }

    fn save_chunk_state(&mut self, chunk: &CodeChunk, record: &CacheRecord) {
        (**self).save_chunk_state(chunk, record)
    }

    fn load_chunk_state(&mut self, chunk: &CodeChunk, record: &CacheRecord) {
        (**self).load_chunk_state(chunk, record)
    }
}

/// The live connection to a backend for the duration of one run.
///
/// Opening a session opens the backend; dropping it closes the backend if
/// [`Session::close`] was never reached, so early returns and panics do not
/// leak a kernel.
pub struct Session<'a, B: Backend + ?Sized> {
    backend: &'a mut B,
    open: bool,
}

impl<'a, B: Backend + ?Sized> Session<'a, B> {
    pub fn open(backend: &'a mut B) -> Result<Self, BackendError> {
        backend.open()?;
        log::debug!("Backend session opened");
        Ok(Self { backend, open: true })
    }

    pub fn backend(&mut self) -> &mut B {
        self.backend
    }

    pub fn close(mut self) -> Result<(), BackendError> {
        self.open = false;
        log::debug!("Backend session closed");
        self.backend.close()
    }
}

impl<B: Backend + ?Sized> Drop for Session<'_, B> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.backend.close() {
                log::warn!("Failed to close backend session: {}", e);
            }
        }
    }
}
