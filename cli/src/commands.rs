//! Command implementations. Each command loads `settings.json` from the
//! working directory, does its work, and persists the index if it changed.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context as _, Result, bail};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, stdin};
use tokio::sync::{Mutex, watch};
use tokio::task::spawn_blocking;

use crag_config::{CragConfig, SETTINGS_FILE, Settings};
use crag_context::{ChatSession, CompactionOutcome, ModelRegistry, TurnSummary};
use crag_providers::{Capability, ProviderClient, ProviderError, StreamHandlers};
use crag_sync::{
    IndexWatcher, KnowledgeStoreSync, SyncPhase, SyncReport, TransferEngine, resolve_patterns,
};
use crag_types::{ApiKey, ChatConfig, ChatMessage, ConversationWindow, Provider};

use crate::ChatOptions;

const BASE_PROMPT: &str = "You are a specialized assistant. \
Use ONLY the provided file knowledge when relevant. ";
const STRICT_PROMPT: &str = "If the answer is not explicitly contained in the files, \
respond with: 'The provided documents do not contain that information.'";
const LENIENT_PROMPT: &str = "If the files do not contain the answer, you may reason \
normally but clearly state that you are extrapolating.";

pub(crate) struct Context {
    config: CragConfig,
    client: ProviderClient,
    settings_path: PathBuf,
    settings: Settings,
}

impl Context {
    pub fn new(config: CragConfig) -> Result<Self> {
        let client = build_client(&config)?;
        let settings_path = PathBuf::from(SETTINGS_FILE);
        let settings = Settings::load(&settings_path)
            .with_context(|| format!("loading {}", settings_path.display()))?
            .unwrap_or_default();
        Ok(Self {
            config,
            client,
            settings_path,
            settings,
        })
    }

    fn knowledge_sync(&self) -> Result<KnowledgeStoreSync> {
        if !self.client.supports(Capability::KnowledgeStore) {
            bail!(
                "{} does not support knowledge stores",
                self.client.provider()
            );
        }
        let engine = TransferEngine::from_settings(&self.config.transfer());
        Ok(
            KnowledgeStoreSync::new(self.client.clone(), engine, self.config.knowledge())
                .with_progress(print_progress),
        )
    }

    fn save(&self) -> Result<()> {
        self.settings
            .save(&self.settings_path)
            .with_context(|| format!("saving {}", self.settings_path.display()))
    }

    fn store_id(&self) -> Result<String> {
        self.settings
            .knowledge_store_id
            .clone()
            .context("no knowledge store yet; run `crag index <pattern>...` first")
    }

    /// Upload `patterns` into a fresh store, replacing any existing one.
    pub async fn index(mut self, patterns: Vec<String>) -> Result<()> {
        let sync = self.knowledge_sync()?;
        let files = resolve(patterns.clone()).await?;

        let result = match self.settings.knowledge_store_id.clone() {
            Some(old_store_id) => {
                sync.rebuild_from(&old_store_id, files, &mut self.settings.indexed_files)
                    .await
            }
            None => sync.create_from(files, &mut self.settings.indexed_files).await,
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => {
                if self.settings.knowledge_store_id.take().is_some() {
                    // The old store may already be gone.
                    self.settings.clear_index();
                    self.save()?;
                }
                return Err(e.into());
            }
        };

        self.settings.knowledge_store_id = Some(report.store_id.clone());
        self.settings.file_patterns = patterns;
        self.save()?;
        print_report("Indexed", &report);
        Ok(())
    }

    pub async fn update(mut self) -> Result<()> {
        let store_id = self.store_id()?;
        let sync = self.knowledge_sync()?;
        let files = resolve(self.settings.file_patterns.clone()).await?;

        let report = sync
            .refresh_from(&store_id, &files, &mut self.settings.indexed_files)
            .await;
        if report.index_changed {
            self.save()?;
        }
        print_report("Updated", &report);
        Ok(())
    }

    pub async fn rebuild(self, patterns: Vec<String>) -> Result<()> {
        self.store_id()?;
        let patterns = if patterns.is_empty() {
            self.settings.file_patterns.clone()
        } else {
            patterns
        };
        if patterns.is_empty() {
            bail!("no file patterns recorded; pass them to `crag rebuild`");
        }
        self.index(patterns).await
    }

    pub async fn watch(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.store_id()?;
        let sync = self.knowledge_sync()?;
        let interval = self.config.knowledge().watch_interval;
        eprintln!("Watching {} (Ctrl+C to stop)", self.settings.file_patterns.join(" "));

        let watcher = IndexWatcher::new(
            Arc::new(sync),
            Arc::new(Mutex::new(self.settings)),
            self.settings_path,
            interval,
        );
        watcher.spawn(shutdown).await.context("watcher task failed")
    }

    pub async fn models(self) -> Result<()> {
        let models = self.client.list_models().await?;
        if models.is_empty() {
            println!("No models available for {}", self.client.provider());
        }
        for model in models {
            println!("{:<40} {:>9} tokens", model.id, model.max_context_tokens);
        }
        Ok(())
    }

    pub async fn chat(
        self,
        options: &ChatOptions,
        cancel: Arc<AtomicBool>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut session = self.chat_session(options).await?;

        if options.non_interactive {
            let mut input = String::new();
            stdin()
                .read_to_string(&mut input)
                .await
                .context("reading query from stdin")?;
            let input = input.trim();
            if input.is_empty() {
                return Ok(());
            }
            run_turn(&mut session, input, &cancel).await?;
            println!();
            return Ok(());
        }

        println!();
        println!("=== crag ready ({}) ===", session.config().model);
        println!("Type 'quit' to exit.");
        println!();

        let mut lines = BufReader::new(stdin()).lines();
        loop {
            print!("You: ");
            io::stdout().flush()?;

            let line = tokio::select! {
                line = lines.next_line() => line.context("reading input")?,
                _ = shutdown.changed() => None,
            };
            let Some(line) = line else {
                println!();
                break;
            };
            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            if input == "quit" || input == "exit" {
                println!("Goodbye.");
                break;
            }

            println!();
            println!("Assistant:");
            if let Err(e) = run_turn(&mut session, input, &cancel).await {
                eprintln!("\nError: {e}");
            }
            println!();
            println!();
            // An interrupt during the turn only cancels the turn.
            shutdown.mark_unchanged();
        }
        Ok(())
    }

    async fn chat_session(&self, options: &ChatOptions) -> Result<ChatSession> {
        let provider = self.client.provider();
        let model = self
            .settings
            .model
            .clone()
            .or_else(|| self.config.model().map(str::to_string))
            .unwrap_or_else(|| provider.default_model().to_string());
        let effort = match options.thinking.or(self.settings.reasoning_effort) {
            Some(effort) => Some(effort),
            None => self.config.reasoning_effort()?,
        };
        let store = self
            .settings
            .knowledge_store_id
            .clone()
            .filter(|_| self.client.supports(Capability::KnowledgeStore));

        let config = ChatConfig::new(model)
            .with_reasoning_effort(effort)
            .with_knowledge_store(store)
            .with_max_tool_rounds(self.config.chat().max_tool_rounds);

        let registry = match self.client.list_models().await {
            Ok(models) => ModelRegistry::from_listing(&models),
            Err(e) => {
                tracing::warn!(error = %e, "Model listing failed; using built-in limits");
                ModelRegistry::new()
            }
        };

        let prompt = if options.strict {
            format!("{BASE_PROMPT}{STRICT_PROMPT}")
        } else {
            format!("{BASE_PROMPT}{LENIENT_PROMPT}")
        };
        let window = ConversationWindow::from_messages(vec![ChatMessage::system(prompt)]);

        Ok(ChatSession::with_registry(self.client.clone(), config, &registry).with_window(window))
    }
}

/// Provider from the config file, else the first one with a key.
fn build_client(config: &CragConfig) -> Result<ProviderClient> {
    let provider = match config.provider()? {
        Some(provider) => provider,
        None => Provider::all()
            .iter()
            .copied()
            .find(|provider| config.api_key(*provider).is_some())
            .context("no API key found; set OPENAI_API_KEY or GEMINI_API_KEY")?,
    };
    let key = config
        .api_key(provider)
        .with_context(|| format!("no API key found for {provider}"))?;
    Ok(ProviderClient::new(ApiKey::new(provider, key))
        .with_idle_timeout(config.chat().stream_idle_timeout))
}

async fn resolve(patterns: Vec<String>) -> Result<Vec<PathBuf>> {
    let files = spawn_blocking(move || resolve_patterns(&patterns))
        .await
        .context("file resolver task failed")??;
    Ok(files)
}

async fn run_turn(
    session: &mut ChatSession,
    input: &str,
    cancel: &Arc<AtomicBool>,
) -> Result<TurnSummary, ProviderError> {
    cancel.store(false, Ordering::SeqCst);
    let flag = Arc::clone(cancel);
    let is_cancelled = move || flag.load(Ordering::SeqCst);
    let mut on_text = |delta: &str| write_delta(&mut io::stdout().lock(), delta, cancel);

    let turn = session
        .send_turn(input, StreamHandlers::new(&mut on_text, &is_cancelled))
        .await?;

    if turn.result.cancelled {
        eprintln!("\n[cancelled]");
    }
    match &turn.compaction {
        CompactionOutcome::Compacted { items } => {
            tracing::info!(items, "Conversation compacted");
        }
        CompactionOutcome::Failed(message) => {
            eprintln!("\nWarning: context compaction failed: {message}");
        }
        _ => {}
    }
    Ok(turn)
}

/// Stream `delta` to `out`. A failed write (closed pipe) cancels the turn.
fn write_delta(out: &mut impl Write, delta: &str, cancel: &AtomicBool) {
    if cancel.load(Ordering::SeqCst) {
        return;
    }
    if let Err(e) = out.write_all(delta.as_bytes()).and_then(|()| out.flush()) {
        tracing::warn!(error = %e, "Failed to write reply; cancelling turn");
        cancel.store(true, Ordering::SeqCst);
    }
}

fn print_progress(phase: SyncPhase, done: usize, total: usize) {
    eprint!("\r{phase}: {done}/{total}");
    if done == total {
        eprintln!();
    }
}

fn print_report(verb: &str, report: &SyncReport) {
    println!(
        "{verb} store {}: {} added, {} modified, {} removed",
        report.store_id,
        report.added.len(),
        report.modified.len(),
        report.removed.len()
    );
    for (path, error) in &report.failures {
        println!("  failed: {} ({error})", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn deltas_reach_the_writer() {
        let cancel = AtomicBool::new(false);
        let mut out = Vec::new();
        write_delta(&mut out, "Hel", &cancel);
        write_delta(&mut out, "lo", &cancel);
        assert_eq!(out, b"Hello");
        assert!(!cancel.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_write_cancels_the_turn() {
        let cancel = AtomicBool::new(false);
        write_delta(&mut ClosedPipe, "lost", &cancel);
        assert!(cancel.load(Ordering::SeqCst));
    }
}
