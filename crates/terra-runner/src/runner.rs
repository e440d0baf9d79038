use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use terra_context::prompts::ANNOTATOR_SYSTEM_PROMPT;
use terra_context::{
    AnnotationContext, CompactionConfig, CompactionState, Compactor, LlmSummarizer, MessageInputs,
    Summarize, TokenCounter,
};
use terra_core::corpus::Scene;
use terra_core::entry::GlossaryEntry;
use terra_core::messages::{ChatMessage, Role, ToolCall};
use terra_core::snapshot::{SnapshotType, ThreadStatus};
use terra_core::turn::Turn;
use terra_corpus::{CorpusReader, SceneBatcher, SceneEvent};
use terra_llm::{AgentApi, AgentClient, ChatRequest, ClientConfig};
use terra_store::{
    Database, GlossaryRepo, RevisionRepo, RunStateRepo, SearchOptions, SnapshotContext,
    SnapshotInput, SnapshotRepo, StateAdvance, ThreadAdvance, ThreadStateRepo,
};
use terra_tools::ToolDispatcher;

use crate::config::{RunResult, RunnerConfig};
use crate::curator::Curator;
use crate::error::RunnerError;
use crate::updates::{extract_updates, UpdateStatus};

const RELEVANT_ENTRY_LIMIT: usize = 8;
const RELEVANT_TERM_CAP: usize = 24;

/// Runner phases, surfaced through tracing. Stop requests are honored at
/// phase boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Init,
    Idle,
    Compacting,
    Preparing,
    Calling,
    Processing,
    Parsing,
    Recording,
    Curating,
    Checkpoint,
    Halting,
    NoMore,
}

/// Drives the perceive-reason-act loop: one scene at a time, tool rounds
/// in between, curation and a checkpoint at every thread boundary.
pub struct AnnotationRunner {
    config: RunnerConfig,
    corpus: Arc<CorpusReader>,
    agent: Arc<dyn AgentApi>,
    summarizer: Arc<dyn Summarize>,

    glossary: GlossaryRepo,
    snapshots: SnapshotRepo,
    run_state: RunStateRepo,
    thread_state: ThreadStateRepo,
    dispatcher: ToolDispatcher,
    curator: Curator,

    context: AnnotationContext,
    compaction: CompactionState,
    compactor: Compactor,
    counter: Arc<TokenCounter>,

    cancel: CancellationToken,
    phase: Phase,
    /// Threads closed so far, for snapshot metadata.
    thread_position: i64,
    scenes_since_checkpoint: u32,
}

impl AnnotationRunner {
    /// Open stores and connect to the agent server at `config.agent_url`.
    pub fn new(config: RunnerConfig) -> Result<Self, RunnerError> {
        let agent: Arc<dyn AgentApi> = Arc::new(AgentClient::new(ClientConfig {
            base_url: config.agent_url.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs),
            ..Default::default()
        }));
        Self::with_agent(config, agent, None)
    }

    /// Construct with an injected agent (and optionally summarizer), for
    /// tests and embedding.
    pub fn with_agent(
        config: RunnerConfig,
        agent: Arc<dyn AgentApi>,
        summarizer: Option<Arc<dyn Summarize>>,
    ) -> Result<Self, RunnerError> {
        let db = Database::open(&config.annotator_db)?;
        let corpus = Arc::new(CorpusReader::open(&config.corpus_db)?);

        let glossary = GlossaryRepo::new(db.clone());
        let summarizer = summarizer.unwrap_or_else(|| {
            Arc::new(LlmSummarizer::new(agent.clone(), GlossaryRepo::new(db.clone())))
        });
        let counter = Arc::new(TokenCounter::new(agent.clone()));
        let compactor = Compactor::new(
            counter.clone(),
            summarizer.clone(),
            CompactionConfig::with_budget(config.context_budget),
        );
        let dispatcher = ToolDispatcher::new(
            GlossaryRepo::new(db.clone()),
            RevisionRepo::new(db.clone()),
            SnapshotRepo::new(db.clone()),
            corpus.clone(),
            agent.clone(),
        );
        let curator = Curator::new(
            GlossaryRepo::new(db.clone()),
            RevisionRepo::new(db.clone()),
            corpus.clone(),
            agent.clone(),
        );

        Ok(Self {
            config,
            corpus,
            agent,
            summarizer,
            glossary,
            snapshots: SnapshotRepo::new(db.clone()),
            run_state: RunStateRepo::new(db.clone()),
            thread_state: ThreadStateRepo::new(db),
            dispatcher,
            curator,
            context: AnnotationContext::new(ANNOTATOR_SYSTEM_PROMPT),
            compaction: CompactionState::default(),
            compactor,
            counter,
            cancel: CancellationToken::new(),
            phase: Phase::Init,
            thread_position: 0,
            scenes_since_checkpoint: 0,
        })
    }

    /// Token to request a stop; honored at the next phase boundary with a
    /// final checkpoint.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
        debug!(?phase, "runner phase");
    }

    /// Process scenes until the corpus is exhausted, the limit is hit, or
    /// a stop is requested.
    #[instrument(skip(self), fields(limit))]
    pub async fn run(&mut self, limit: Option<u64>) -> Result<RunResult, RunnerError> {
        self.set_phase(Phase::Init);
        if !self.agent.health_check().await {
            warn!(url = %self.config.agent_url, "agent server health check failed; continuing anyway");
        }
        self.run_state.start_run()?;

        let start_after = if self.config.resume {
            let state = self.run_state.get()?;
            if let Some(snapshot_id) = state.current_snapshot_id {
                self.restore_from_snapshot(snapshot_id)?;
            }
            state.last_post_id
        } else {
            None
        };

        let mut batcher = SceneBatcher::with_page_size(self.corpus.clone(), self.config.batch_size);
        if let Some(post_id) = start_after {
            batcher = batcher.start_after(post_id)?;
            info!(post_id, "resuming after checkpointed post");
        }

        let mut result = RunResult::default();
        self.set_phase(Phase::Idle);

        for event in batcher {
            if self.cancel.is_cancelled() {
                info!("stop requested; writing final checkpoint");
                self.force_checkpoint(SnapshotType::Manual).await?;
                result.stopped_early = true;
                break;
            }

            match event? {
                SceneEvent::ThreadBoundary { thread_id } => {
                    // A thread with no story content still closes.
                    debug!(thread_id, "thread yielded no scenes");
                    self.thread_state.update(
                        thread_id,
                        &ThreadAdvance {
                            status: Some(ThreadStatus::Completed),
                            ..Default::default()
                        },
                    )?;
                    self.thread_position += 1;
                }
                SceneEvent::Scene(scene) => {
                    self.process_scene(&scene, &mut result).await?;
                    result.scenes_processed += 1;

                    if limit.is_some_and(|l| result.scenes_processed >= l) {
                        info!(scenes = result.scenes_processed, "scene limit reached");
                        self.force_checkpoint(SnapshotType::Checkpoint).await?;
                        result.stopped_early = true;
                        break;
                    }
                }
            }
        }

        if !result.stopped_early {
            self.set_phase(Phase::NoMore);
        }
        info!(
            phase = ?self.phase,
            scenes = result.scenes_processed,
            posts = result.posts_processed,
            threads = result.threads_completed,
            created = result.entries_created,
            updated = result.entries_updated,
            tool_calls = result.tool_calls_total,
            stats = %self.compactor.stats().summary(),
            "annotation run finished"
        );
        Ok(result)
    }

    #[instrument(
        skip(self, scene, result),
        fields(
            thread_id = scene.thread_id,
            scene_index = scene.scene_index,
            first_post = scene.first_post_id(),
        )
    )]
    async fn process_scene(&mut self, scene: &Scene, result: &mut RunResult) -> Result<(), RunnerError> {
        let thread_id = scene.thread_id;

        if self.compaction.current_thread_id != Some(thread_id) {
            self.compaction.start_new_thread(thread_id);
            self.thread_state.update(
                thread_id,
                &ThreadAdvance {
                    status: Some(ThreadStatus::InProgress),
                    ..Default::default()
                },
            )?;
        }

        self.set_phase(Phase::Compacting);
        let compaction = self.compactor.compact(&mut self.compaction, &mut self.context).await;
        if compaction.could_not_compact {
            warn!(
                tokens = compaction.final_tokens,
                budget = self.config.context_budget,
                "compactor could not reach target; continuing, a coming boundary may free space"
            );
        }

        self.set_phase(Phase::Preparing);
        let relevant = self.find_relevant_entries(scene)?;
        let inputs = MessageInputs {
            cumulative_summary: Some(self.compaction.cumulative_summary.as_str()),
            chunk_summaries: &self.compaction.chunk_summaries,
            thread_summary: self.compaction.thread_summaries.last(),
            current_scene: Some(scene),
            relevant_entries: &relevant,
        };
        let mut messages = self.context.build_messages(&inputs);
        let scene_payload = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        let mut new_turns =
            vec![Turn::new(Role::User, scene_payload).tagged(thread_id, scene.scene_index)];

        self.dispatcher.set_position(scene.last_post_id(), thread_id);

        let mut rounds = 0;
        loop {
            self.set_phase(Phase::Calling);
            let request = ChatRequest::new(messages.clone())
                .with_tools(self.dispatcher.definitions())
                .with_sampling(self.config.temperature, self.config.max_tokens);

            // The client retries transient failures with backoff; an error
            // here is persistent.
            let response = match self.agent.chat(request).await {
                Ok(r) => r,
                Err(e) => {
                    self.set_phase(Phase::Halting);
                    warn!(error = %e, "persistent agent failure; checkpointing before halt");
                    self.force_checkpoint(SnapshotType::Checkpoint).await?;
                    return Err(RunnerError::Halted(e));
                }
            };
            let assistant = response.message;

            self.set_phase(Phase::Processing);
            let calls: Vec<ToolCall> = assistant.tool_calls.clone().unwrap_or_default();
            if !calls.is_empty() && rounds < self.config.max_tool_rounds {
                let mut assistant_msg = ChatMessage::assistant(assistant.content.clone());
                assistant_msg.tool_calls = Some(calls.clone());
                messages.push(assistant_msg);
                new_turns.push(
                    Turn::new(Role::Assistant, assistant.content.clone())
                        .with_tool_calls(calls.clone())
                        .tagged(thread_id, scene.scene_index),
                );

                // Side effects apply in the order the model emitted them.
                for call in &calls {
                    let outcome = self.dispatcher.dispatch(call).await?;
                    result.tool_calls_total += 1;
                    messages.push(ChatMessage::tool_result(outcome.call_id.clone(), outcome.body.clone()));
                    new_turns.push(
                        Turn::new(Role::Tool, outcome.body)
                            .with_tool_call_id(outcome.call_id)
                            .tagged(thread_id, scene.scene_index),
                    );
                }
                rounds += 1;
                continue;
            }
            if !calls.is_empty() {
                warn!(
                    rounds,
                    max = self.config.max_tool_rounds,
                    "tool round limit reached; ignoring further calls"
                );
            }

            self.set_phase(Phase::Parsing);
            self.apply_codex_updates(&assistant.content).await?;
            new_turns.push(Turn::new(Role::Assistant, assistant.content).tagged(thread_id, scene.scene_index));
            break;
        }

        self.set_phase(Phase::Recording);
        for turn in new_turns {
            self.context.record_turn(turn);
        }
        self.compaction.advance_scene();

        let stats = self.dispatcher.take_scene_stats();
        result.posts_processed += scene.post_count() as u64;
        result.entries_created += stats.entries_created as u64;
        result.entries_updated += stats.entries_updated as u64;

        self.thread_state.update(
            thread_id,
            &ThreadAdvance {
                posts_processed_delta: scene.post_count() as i64,
                entries_created_delta: stats.entries_created,
                entries_updated_delta: stats.entries_updated,
                ..Default::default()
            },
        )?;

        let advance = StateAdvance {
            last_post_id: Some(scene.last_post_id()),
            last_thread_id: Some(thread_id),
            posts_processed_delta: scene.post_count() as i64,
            entries_created_delta: stats.entries_created,
            entries_updated_delta: stats.entries_updated,
            ..Default::default()
        };

        if scene.is_thread_end {
            self.set_phase(Phase::Curating);
            let mut fork = self.context.clone();
            let curated = self
                .curator
                .run(&mut fork, thread_id, scene.last_post_id())
                .await?;
            drop(fork); // the curator's dialogue never leaks back
            debug!(
                evaluated = curated.entries_evaluated,
                rejected = curated.rejected,
                "curation finished"
            );

            self.close_thread(thread_id).await?;
            result.threads_completed += 1;

            self.set_phase(Phase::Checkpoint);
            self.commit_checkpoint(SnapshotType::Checkpoint, scene.last_post_id(), thread_id, &advance)
                .await?;
            self.scenes_since_checkpoint = 0;
        } else if self
            .config
            .checkpoint_every_scenes
            .is_some_and(|n| self.scenes_since_checkpoint + 1 >= n)
        {
            self.set_phase(Phase::Checkpoint);
            self.commit_checkpoint(SnapshotType::Checkpoint, scene.last_post_id(), thread_id, &advance)
                .await?;
            self.scenes_since_checkpoint = 0;
        } else {
            self.run_state.update(&advance)?;
            self.scenes_since_checkpoint += 1;
        }

        self.set_phase(Phase::Idle);
        Ok(())
    }

    /// Thread close: summarize the finished thread, eagerly fold the
    /// previous pending summary into the cumulative (so at most one
    /// summary stays pending), and queue the thread for tier-1 turn
    /// removal.
    async fn close_thread(&mut self, thread_id: i64) -> Result<(), RunnerError> {
        let excerpt: Vec<Turn> = self
            .context
            .history()
            .iter()
            .filter(|t| t.thread_id == Some(thread_id))
            .cloned()
            .collect();
        let summary = self.summarizer.summarize_thread(thread_id, &excerpt).await;
        let summary_text = summary.text.clone();

        if !self.compaction.thread_summaries.is_empty() {
            let previous = self.compaction.thread_summaries.remove(0);
            let addition = format!("Thread {}: {}", previous.thread_id, previous.text);
            self.compaction.cumulative_summary = self
                .summarizer
                .merge_cumulative(&self.compaction.cumulative_summary, &addition)
                .await;
            if !self.compaction.merged_thread_ids.contains(&previous.thread_id) {
                self.compaction.merged_thread_ids.push(previous.thread_id);
            }
        }

        self.compaction
            .thread_summaries
            .push(summary.into_thread_summary(self.thread_position));
        self.compaction.complete_thread(thread_id);
        self.thread_position += 1;

        self.thread_state.update(
            thread_id,
            &ThreadAdvance {
                status: Some(ThreadStatus::Completed),
                summary: Some(summary_text),
                ..Default::default()
            },
        )?;
        info!(thread_id, "thread closed");
        Ok(())
    }

    /// Checkpoint snapshot and run-state advance in one transaction.
    async fn commit_checkpoint(
        &mut self,
        snapshot_type: SnapshotType,
        last_post_id: i64,
        last_thread_id: i64,
        advance: &StateAdvance,
    ) -> Result<i64, RunnerError> {
        let entry_states: Vec<(i64, String, String)> = self
            .glossary
            .all_entries()?
            .into_iter()
            .map(|e| (e.id, e.definition, e.status.to_string()))
            .collect();
        // Below the verification threshold the heuristic stands alone;
        // above it the tokenize endpoint cross-checks the count.
        let (messages, _) = self.compactor.measure(&self.compaction, &self.context);
        let tokens = self
            .counter
            .count_messages_verified(&messages, self.compactor.config().soft_threshold())
            .await;

        let input = SnapshotInput {
            snapshot_type,
            last_post_id,
            last_thread_id,
            thread_position: self.thread_position,
            token_count: Some(tokens as i64),
            context: self.snapshot_context(),
            entry_states,
        };
        let snapshot_id = self.run_state.commit_checkpoint(&input, advance)?;
        info!(snapshot_id, last_post_id, "checkpoint committed");
        Ok(snapshot_id)
    }

    /// Checkpoint at the current run-state position without advancing it
    /// (halting and stop paths).
    async fn force_checkpoint(&mut self, snapshot_type: SnapshotType) -> Result<(), RunnerError> {
        let state = self.run_state.get()?;
        self.commit_checkpoint(
            snapshot_type,
            state.last_post_id.unwrap_or(0),
            state.last_thread_id.unwrap_or(0),
            &StateAdvance::default(),
        )
        .await?;
        Ok(())
    }

    fn snapshot_context(&self) -> SnapshotContext {
        SnapshotContext {
            system_prompt: self.context.system_prompt.clone(),
            cumulative_summary: (!self.compaction.cumulative_summary.is_empty())
                .then(|| self.compaction.cumulative_summary.clone()),
            chunk_summaries: self.compaction.chunk_summaries.clone(),
            thread_summaries: self.compaction.thread_summaries.clone(),
            conversation_history: self.context.history().to_vec(),
            current_thread_id: self.compaction.current_thread_id,
            current_scene_index: self.compaction.current_scene_index,
            completed_thread_ids: self.compaction.completed_thread_ids.clone(),
            summarized_chunk_indices: self.compaction.summarized_chunk_indices.clone(),
            merged_thread_ids: self.compaction.merged_thread_ids.clone(),
        }
    }

    fn restore_from_snapshot(&mut self, snapshot_id: i64) -> Result<(), RunnerError> {
        let ctx = match self.snapshots.get_context(snapshot_id)? {
            Some(c) => c,
            None => {
                warn!(snapshot_id, "checkpoint context missing; starting with fresh context");
                return Ok(());
            }
        };

        self.context = AnnotationContext::with_history(ctx.system_prompt.clone(), ctx.conversation_history);
        self.compaction = CompactionState {
            cumulative_summary: ctx.cumulative_summary.unwrap_or_default(),
            chunk_summaries: ctx.chunk_summaries,
            thread_summaries: ctx.thread_summaries,
            completed_thread_ids: ctx.completed_thread_ids,
            current_thread_id: ctx.current_thread_id,
            current_scene_index: ctx.current_scene_index,
            summarized_chunk_indices: ctx.summarized_chunk_indices,
            merged_thread_ids: ctx.merged_thread_ids,
        };
        if let Some(snapshot) = self.snapshots.get(snapshot_id)? {
            self.thread_position = snapshot.thread_position;
        }
        info!(snapshot_id, turns = self.context.history().len(), "context restored from checkpoint");
        Ok(())
    }

    /// Candidate entries for the scene: distinct words from the scene
    /// text, OR-ed into one FTS query.
    fn find_relevant_entries(&self, scene: &Scene) -> Result<Vec<GlossaryEntry>, RunnerError> {
        let text = scene.combined_text();
        let mut seen = HashSet::new();
        let mut terms = Vec::new();
        for word in text.split(|c: char| !c.is_alphanumeric()) {
            if word.chars().count() < 4 || !word.chars().any(|c| c.is_alphabetic()) {
                continue;
            }
            let lower = word.to_lowercase();
            if seen.insert(lower.clone()) {
                terms.push(lower);
                if terms.len() >= RELEVANT_TERM_CAP {
                    break;
                }
            }
        }
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let query = terms.join(" OR ");
        let entries = self.glossary.search(
            &query,
            &SearchOptions {
                limit: RELEVANT_ENTRY_LIMIT,
                ..Default::default()
            },
        )?;
        debug!(candidates = entries.len(), "relevant entries retrieved");
        Ok(entries)
    }

    /// Apply a `<codex_updates>` payload via the dispatcher so counters
    /// and revisions flow through the same path as tool calls. Failures
    /// are warnings; the scene continues.
    async fn apply_codex_updates(&mut self, content: &str) -> Result<(), RunnerError> {
        let updates = extract_updates(content);
        for (index, update) in updates.into_iter().enumerate() {
            if update.status == UpdateStatus::Skip {
                continue;
            }

            let existing = self
                .glossary
                .get_by_normalized_term(&terra_core::entry::normalize_term(&update.term))?;

            let call = match (&update.status, &existing) {
                (UpdateStatus::New, None) | (UpdateStatus::Update, None) => ToolCall::new(
                    format!("codex_{index}"),
                    "glossary_create",
                    serde_json::json!({
                        "term": update.term,
                        "definition": update.definition,
                        "tags": [],
                    }),
                ),
                (_, Some(entry)) => ToolCall::new(
                    format!("codex_{index}"),
                    "glossary_update",
                    serde_json::json!({
                        "entry_id": entry.id,
                        "definition": update.definition,
                    }),
                ),
                (UpdateStatus::Skip, None) => unreachable!("Skip updates are filtered above"),
            };

            let outcome = self.dispatcher.dispatch(&call).await?;
            if !outcome.success {
                warn!(term = %update.term, body = %outcome.body, "codex update not applied");
            }
        }
        Ok(())
    }
}
