use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::settings::{DocumentPaths, WeaveSettings};
use crate::engine::backend::{Backend, Session};
use crate::engine::cache_store::{CacheStore, FileCacheStore};
use crate::engine::comparison::{ComparisonStrategy, RawContent};
use crate::engine::figures::{FigureSink, NullFigureSink};
use crate::engine::inline_eval::evaluate_inline;
use crate::engine::term::fold_transcript;
use crate::error::{BackendError, EngineError};
use crate::model::cache_record::{CacheRecord, TermSegment};
use crate::model::chunk::{Chunk, CodeChunk, DocChunk};
use crate::model::output::Output;

/// Runs a parsed document's chunks, in order, against one backend.
///
/// Code chunks are executed (or answered from the cache), prose chunks get
/// their inline expressions substituted, and anything else passes through.
pub struct Engine<B: Backend> {
    backend: B,
    settings: WeaveSettings,
    document: DocumentPaths,
    cache: Box<dyn CacheStore>,
    strategy: Box<dyn ComparisonStrategy>,
    figures: Box<dyn FigureSink>,
    pending: String,
    executed: Vec<Chunk>,
}

impl<B: Backend> Engine<B> {
    pub fn new(backend: B, settings: WeaveSettings, document: DocumentPaths) -> Self {
        let cache = FileCacheStore::for_document(&document.cache_dir(&settings), &document.basename);

        Self {
            backend,
            settings,
            document,
            cache: Box::new(cache),
            strategy: Box::new(RawContent),
            figures: Box::new(NullFigureSink),
            pending: String::new(),
            executed: Vec::new(),
        }
    }

    pub fn with_cache_store(mut self, store: impl CacheStore + 'static) -> Self {
        self.cache = Box::new(store);
        self
    }

    pub fn with_comparison(mut self, strategy: impl ComparisonStrategy + 'static) -> Self {
        self.strategy = Box::new(strategy);
        self
    }

    pub fn with_figure_sink(mut self, sink: impl FigureSink + 'static) -> Self {
        self.figures = Box::new(sink);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn cache_store(&self) -> &dyn CacheStore {
        self.cache.as_ref()
    }

    /// Executed chunks of the last successful run.
    pub fn results(&self) -> Vec<Chunk> {
        self.executed.clone()
    }

    /// Process every chunk in document order.
    ///
    /// The cache store (when any chunk caches) and the backend are opened
    /// before the first chunk and closed after the last one, also when the
    /// run fails.
    pub fn run(&mut self, chunks: &[Chunk]) -> Result<Vec<Chunk>, EngineError> {
        let use_cache = self.caching_needed(chunks);
        if use_cache {
            self.cache.open()?;
            log::debug!("Caching results in {}", self.cache.location());
        }

        let result = self.run_chunks(chunks, use_cache);

        let closed = if use_cache { self.cache.close() } else { Ok(()) };
        let executed = result?;
        closed?;

        self.executed = executed.clone();
        Ok(executed)
    }

    fn caching_needed(&self, chunks: &[Chunk]) -> bool {
        self.settings.caching
            && chunks.iter().filter_map(Chunk::as_code).any(|code| {
                code.options
                    .merged_over(&self.settings.default_options)
                    .caches(self.settings.caching)
            })
    }

    fn run_chunks(&mut self, chunks: &[Chunk], use_cache: bool) -> Result<Vec<Chunk>, EngineError> {
        if let Err(e) = self.figures.prepare() {
            log::warn!("Figure output unavailable: {:#}", e);
        }
        self.pending.clear();

        let mut session = Session::open(&mut self.backend).map_err(EngineError::Session)?;
        let mut pass = Pass {
            session: &mut session,
            cache: if use_cache { Some(&mut *self.cache) } else { None },
            strategy: &*self.strategy,
            figures: &mut *self.figures,
            settings: &self.settings,
            document: &self.document,
            pending: &mut self.pending,
        };

        // Term chunks come back as several records; flatten them in place.
        let mut executed = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match pass.eval_chunk(chunk)? {
                Evaluated::One(chunk) => executed.push(chunk),
                Evaluated::Many(many) => executed.extend(many),
            }
        }

        session.close().map_err(EngineError::Session)?;
        Ok(executed)
    }
}

/* =========================
   One processing run
   ========================= */

enum Evaluated {
    One(Chunk),
    Many(Vec<Chunk>),
}

/// Result of running (or recalling) one code chunk.
struct Execution {
    outputs: Vec<Output>,
    /// Present in term mode.
    segments: Option<Vec<TermSegment>>,
    timed_out: bool,
}

impl Execution {
    fn whole(outputs: Vec<Output>) -> Self {
        Self { outputs, segments: None, timed_out: false }
    }

    fn term(segments: Vec<TermSegment>) -> Self {
        let outputs = segments.iter().flat_map(|s| s.outputs.iter().cloned()).collect();
        Self { outputs, segments: Some(segments), timed_out: false }
    }

    fn recalled(chunk: &CodeChunk, record: CacheRecord) -> Self {
        if !chunk.options.term() {
            return Self::whole(record.outputs);
        }
        if record.transcript.is_empty() {
            return Self::term(vec![TermSegment {
                source: chunk.content.clone(),
                outputs: record.outputs,
            }]);
        }
        Self::term(record.transcript)
    }

    fn record(&self, comparison_key: String) -> CacheRecord {
        match &self.segments {
            Some(segments) => CacheRecord::from_transcript(comparison_key, segments.clone()),
            None => CacheRecord::new(comparison_key, self.outputs.clone()),
        }
    }
}

/// A term chunk always yields at least one record, even when it holds no
/// statements.
fn segments_or_whole(segments: Vec<TermSegment>, content: &str) -> Vec<TermSegment> {
    if segments.is_empty() {
        vec![TermSegment {
            source: content.to_string(),
            outputs: Vec::new(),
        }]
    } else {
        segments
    }
}

struct Pass<'r, 's, B: Backend> {
    session: &'r mut Session<'s, B>,
    cache: Option<&'r mut (dyn CacheStore + 'static)>,
    strategy: &'r dyn ComparisonStrategy,
    figures: &'r mut (dyn FigureSink + 'static),
    settings: &'r WeaveSettings,
    document: &'r DocumentPaths,
    pending: &'r mut String,
}

impl<B: Backend> Pass<'_, '_, B> {
    fn timeout(&self) -> Option<Duration> {
        self.settings.timeout()
    }

    fn eval_chunk(&mut self, chunk: &Chunk) -> Result<Evaluated, EngineError> {
        match chunk {
            Chunk::Doc(doc) => self.eval_doc(doc).map(|d| Evaluated::One(Chunk::Doc(d))),
            Chunk::Code(code) => self.eval_code(code.clone()),
            Chunk::Other(_) => Ok(Evaluated::One(chunk.clone())),
        }
    }

    fn eval_doc(&mut self, doc: &DocChunk) -> Result<DocChunk, EngineError> {
        let timeout = self.timeout();
        let content = match evaluate_inline(self.session.backend(), &doc.content, timeout) {
            Ok(content) => content,
            Err(e) => return Err(self.fail(doc.number, e)),
        };

        Ok(DocChunk {
            content,
            ..doc.clone()
        })
    }

    fn eval_code(&mut self, mut chunk: CodeChunk) -> Result<Evaluated, EngineError> {
        chunk.options = chunk.options.merged_over(&self.settings.default_options);
        self.resolve_source(&mut chunk)?;

        log::info!(
            "Processing chunk {} named {} from line {}",
            chunk.number,
            chunk.label(),
            chunk.start_line.map(|l| l.to_string()).unwrap_or_else(|| "?".into())
        );

        if !chunk.options.complete() {
            self.pending.push_str(&chunk.content);
            if !self.pending.ends_with('\n') {
                self.pending.push('\n');
            }
            chunk.outputs = Vec::new();
            return Ok(Evaluated::One(Chunk::Code(chunk)));
        }

        // Execution sees the joined fragments, display keeps this chunk's own text.
        let own_content = if self.pending.is_empty() {
            None
        } else {
            let joined = std::mem::take(self.pending) + &chunk.content;
            Some(std::mem::replace(&mut chunk.content, joined))
        };

        if !chunk.options.evaluate() {
            chunk.outputs = Vec::new();
            if let Some(own) = own_content {
                chunk.content = own;
            }
            return Ok(Evaluated::One(Chunk::Code(chunk)));
        }

        self.session
            .backend()
            .pre_run_hook(&chunk)
            .map_err(|e| EngineError::from_backend(chunk.number, e))?;

        let (execution, from_cache) = self.execute(&chunk)?;

        self.session
            .backend()
            .post_run_hook(&chunk)
            .map_err(|e| EngineError::from_backend(chunk.number, e))?;

        if let Some(own) = own_content {
            chunk.content = own;
        }
        chunk.from_cache = Some(from_cache);

        match execution.segments {
            None => {
                chunk.outputs = execution.outputs;
                if chunk.options.fig() {
                    chunk.figure = self.materialize(&chunk);
                }
                Ok(Evaluated::One(Chunk::Code(chunk)))
            }
            Some(segments) => {
                let mut records = Vec::with_capacity(segments.len());
                for segment in segments {
                    let mut record = chunk.clone();
                    record.content = segment.source;
                    record.outputs = segment.outputs;
                    if record.options.fig() {
                        record.figure = self.materialize(&record);
                    }
                    records.push(Chunk::Code(record));
                }
                Ok(Evaluated::Many(records))
            }
        }
    }

    /// Prepend the text of a `source` reference: a file if one exists at
    /// that path (as given, or next to the document), otherwise a symbol
    /// looked up through the backend.
    fn resolve_source(&mut self, chunk: &mut CodeChunk) -> Result<(), EngineError> {
        let Some(reference) = chunk.options.source.clone() else {
            return Ok(());
        };

        let candidates = [PathBuf::from(&reference), self.document.dir.join(&reference)];
        if let Some(path) = candidates.iter().find(|p| p.is_file()) {
            let text = fs::read_to_string(path).map_err(|source| EngineError::SourceFile {
                path: path.clone(),
                source,
            })?;
            chunk.content = format!("{}\n{}", text.trim_end(), chunk.content);
            return Ok(());
        }

        let text = match self.session.backend().introspect(&reference) {
            Ok(text) => text,
            Err(e) => return Err(self.fail(chunk.number, e)),
        };

        let mut content = text.trim_end().to_string();
        if !chunk.content.trim().is_empty() {
            content.push('\n');
            content.push_str(&chunk.content);
        }
        chunk.content = content;
        Ok(())
    }

    /// Execute `chunk` directly or through the cache.
    ///
    /// On a miss the fresh record is written at the chunk's position and
    /// every record after it is deleted: later chunks may have read state
    /// this one changes, and dependencies are not tracked.
    fn execute(&mut self, chunk: &CodeChunk) -> Result<(Execution, bool), EngineError> {
        let caches = chunk.options.caches(self.settings.caching);
        if !caches || self.cache.is_none() {
            return Ok((self.evaluate(chunk)?, false));
        }

        let key = self.strategy.comparison_key(chunk);
        let cached = self.cache.as_ref().and_then(|c| c.get(chunk.number));

        if let Some(record) = cached.filter(|r| r.comparison_key == key) {
            log::info!("Cache hit on chunk {}", chunk.number);
            self.session.backend().load_chunk_state(chunk, &record);
            return Ok((Execution::recalled(chunk, record), true));
        }

        log::info!("Cache miss on chunk {}", chunk.number);
        let execution = self.evaluate(chunk)?;
        if execution.timed_out {
            return Ok((execution, false));
        }

        let record = execution.record(key);
        if let Some(cache) = self.cache.as_deref_mut() {
            let removed = cache.replace_from(chunk.number, record.clone())?;
            if !removed.is_empty() {
                log::debug!("Invalidated cached chunks {:?} after chunk {}", removed, chunk.number);
            }
        }
        self.session.backend().save_chunk_state(chunk, &record);

        Ok((execution, false))
    }

    fn evaluate(&mut self, chunk: &CodeChunk) -> Result<Execution, EngineError> {
        let timeout = self.timeout();
        let backend = self.session.backend();

        let result = if chunk.options.term() {
            backend
                .evaluate_term(&chunk.content, timeout)
                .map(|t| Execution::term(segments_or_whole(fold_transcript(t), &chunk.content)))
        } else {
            backend.evaluate(&chunk.content, timeout).map(Execution::whole)
        };

        match result {
            Ok(execution) => {
                let kinds: Vec<&str> = execution.outputs.iter().map(Output::short_name).collect();
                log::debug!("Chunk {} produced [{}]", chunk.number, kinds.join(", "));
                Ok(execution)
            }
            Err(BackendError::Timeout { after }) => {
                let error = self.recover_timeout(chunk.number, after)?;
                let mut execution = if chunk.options.term() {
                    Execution::term(vec![TermSegment {
                        source: chunk.content.clone(),
                        outputs: vec![error],
                    }])
                } else {
                    Execution::whole(vec![error])
                };
                execution.timed_out = true;
                Ok(execution)
            }
            Err(e) => Err(EngineError::from_backend(chunk.number, e)),
        }
    }

    /// An interrupted chunk becomes an error record; without a successful
    /// interrupt the timeout ends the run.
    fn recover_timeout(&mut self, number: u32, after: Duration) -> Result<Output, EngineError> {
        if self.settings.interrupt_on_timeout {
            match self.session.backend().interrupt() {
                Ok(()) => {
                    log::warn!("Chunk {} timed out after {:?}, kernel interrupted", number, after);
                    return Ok(Output::error(
                        "Timeout",
                        format!("execution exceeded {:?} and was interrupted", after),
                    ));
                }
                Err(e) => log::warn!("Interrupt after timeout failed: {}", e),
            }
        }
        Err(EngineError::Timeout { chunk: number, after })
    }

    fn fail(&mut self, number: u32, err: BackendError) -> EngineError {
        if let BackendError::Timeout { .. } = err {
            if let Err(e) = self.session.backend().interrupt() {
                log::warn!("Interrupt after timeout failed: {}", e);
            }
        }
        EngineError::from_backend(number, err)
    }

    fn materialize(&mut self, chunk: &CodeChunk) -> Option<Vec<String>> {
        match self.figures.materialize(chunk) {
            Ok(paths) if paths.is_empty() => None,
            Ok(paths) => Some(paths),
            Err(e) => {
                log::warn!("Could not save figures of chunk {}: {:#}", chunk.number, e);
                None
            }
        }
    }
}
