//! End-to-end tests of ingestion and answering with deterministic stub
//! embedding and generation services.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use kb_harness::config::Config;
use kb_harness::embedding::Embedder;
use kb_harness::error::KbError;
use kb_harness::extract::{ExtractError, ExtractedUnit, Extractor, ExtractorSet};
use kb_harness::generation::{Generator, TokenStream};
use kb_harness::models::{Message, Role, SourceRef, StreamEvent};
use kb_harness::service::KnowledgeBase;

const DIMS: usize = 64;

/// Bag-of-words embedder: each lowercase word is hashed into one of 64 buckets.
#[derive(Default)]
struct WordEmbedder {
    calls: AtomicUsize,
    texts: AtomicUsize,
}

fn bucket(word: &str) -> usize {
    // FNV-1a
    let mut h: u64 = 0xcbf29ce484222325;
    for b in word.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h % DIMS as u64) as usize
}

#[async_trait]
impl Embedder for WordEmbedder {
    fn model_name(&self) -> &str {
        "bag-of-words"
    }

    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0f32; DIMS];
                for word in t
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    v[bucket(&word.to_lowercase())] += 1.0;
                }
                v
            })
            .collect())
    }
}

#[derive(Clone, Default)]
enum Behavior {
    /// Answer with the retrieved context verbatim.
    #[default]
    EchoContext,
    /// Emit these fragments in order.
    Fragments(Vec<&'static str>),
    /// Emit these fragments, then fail.
    FailAfter(Vec<&'static str>),
    /// Refuse the request outright.
    Unavailable,
    /// Emit fragments slowly, forever.
    Endless,
}

#[derive(Default)]
struct StubGenerator {
    behavior: Behavior,
}

fn context_of(prompt: &str) -> String {
    let start = prompt.find("Context:\n").map(|i| i + "Context:\n".len()).unwrap_or(0);
    let end = prompt.find("\n\nConversation history:").unwrap_or(prompt.len());
    prompt[start..end].to_string()
}

#[async_trait]
impl Generator for StubGenerator {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        match &self.behavior {
            Behavior::EchoContext => Ok(context_of(prompt)),
            Behavior::Fragments(f) => Ok(f.concat()),
            Behavior::FailAfter(_) | Behavior::Unavailable | Behavior::Endless => {
                anyhow::bail!("model unavailable")
            }
        }
    }

    async fn generate_stream(&self, prompt: &str) -> anyhow::Result<TokenStream> {
        match &self.behavior {
            Behavior::EchoContext => Ok(stream::iter(vec![Ok(context_of(prompt))]).boxed()),
            Behavior::Fragments(f) => Ok(stream::iter(
                f.iter().map(|s| Ok(s.to_string())).collect::<Vec<_>>(),
            )
            .boxed()),
            Behavior::FailAfter(f) => {
                let mut items: Vec<anyhow::Result<String>> =
                    f.iter().map(|s| Ok(s.to_string())).collect();
                items.push(Err(anyhow::anyhow!("connection reset")));
                Ok(stream::iter(items).boxed())
            }
            Behavior::Unavailable => anyhow::bail!("model unavailable"),
            Behavior::Endless => Ok(stream::repeat(())
                .then(|_| async {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok("tick ".to_string())
                })
                .boxed()),
        }
    }
}

struct Env {
    _tmp: TempDir,
    docs: PathBuf,
    config: Config,
}

fn env() -> Env {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("knowledge_base");
    fs::create_dir_all(&docs).unwrap();
    let mut config = Config::minimal();
    config.paths.knowledge_dir = docs.clone();
    config.paths.index_dir = tmp.path().join("data").join("index");
    config.paths.manifest_path = tmp.path().join("data").join("file_tracking.json");
    Env {
        _tmp: tmp,
        docs,
        config,
    }
}

fn kb_with(env: &Env, embedder: Arc<WordEmbedder>, behavior: Behavior) -> KnowledgeBase {
    KnowledgeBase::new(
        env.config.clone(),
        embedder,
        Arc::new(StubGenerator { behavior }),
    )
    .unwrap()
}

fn kb(env: &Env, behavior: Behavior) -> KnowledgeBase {
    kb_with(env, Arc::new(WordEmbedder::default()), behavior)
}

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).unwrap();
}

fn assert_paired(history: &[Message]) {
    assert_eq!(history.len() % 2, 0, "odd history: {:?}", history);
    for (i, m) in history.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        assert_eq!(m.role, expected, "role out of order at {}: {:?}", i, history);
    }
}

async fn collect(kb: &KnowledgeBase, q: &str, session: &str) -> Vec<Result<StreamEvent, KbError>> {
    kb.stream_query(q, session).await.unwrap().collect().await
}

#[tokio::test]
async fn test_answers_from_ingested_notes() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = kb(&env, Behavior::EchoContext);

    let report = kb.initialize().await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.ingested, 1);
    assert!(report.chunks >= 1);
    assert!(report.failed.is_empty());

    let answer = kb
        .query("What is the capital of France?", "s1")
        .await
        .unwrap();
    assert!(answer.answer.contains("Paris"));
    assert_eq!(
        serde_json::to_value(&answer.sources).unwrap(),
        serde_json::json!([{ "file": "notes.txt" }])
    );

    let history = kb.history("s1").await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "What is the capital of France?");
    assert_eq!(history[1].sources, answer.sources);
}

#[tokio::test]
async fn test_stream_emits_sources_tokens_end() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = kb(&env, Behavior::Fragments(vec!["Paris", " is", " the capital."]));
    kb.initialize().await.unwrap();

    let events: Vec<StreamEvent> = collect(&kb, "Capital of France?", "s1")
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();

    assert_eq!(
        events,
        vec![
            StreamEvent::Sources {
                sources: vec![SourceRef {
                    file: "notes.txt".to_string(),
                    page: None
                }]
            },
            StreamEvent::Token {
                token: "Paris".to_string()
            },
            StreamEvent::Token {
                token: " is".to_string()
            },
            StreamEvent::Token {
                token: " the capital.".to_string()
            },
            StreamEvent::End,
        ]
    );

    let history = kb.history("s1").await;
    assert_paired(&history);
    assert_eq!(history[1].content, "Paris is the capital.");

    // The buffered variant yields the same text.
    let buffered = kb.query("Capital of France?", "s2").await.unwrap();
    assert_eq!(buffered.answer, "Paris is the capital.");
}

#[tokio::test]
async fn test_mid_stream_failure_rolls_back_question() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let ok = kb(&env, Behavior::Fragments(vec!["Paris."]));
    ok.initialize().await.unwrap();
    ok.query("First question?", "s").await.unwrap();
    let before = ok.history("s").await;
    drop(ok);

    // A failing service over the same index, sharing no session state.
    let failing = kb(&env, Behavior::FailAfter(vec!["Par", "is"]));
    failing.initialize().await.unwrap();
    failing.query("Warm-up?", "s").await.unwrap_err();
    assert!(failing.history("s").await.is_empty());

    let events = collect(&failing, "Capital?", "s").await;
    assert!(matches!(events.first(), Some(Ok(StreamEvent::Sources { .. }))));
    assert!(matches!(events.last(), Some(Err(KbError::Generation(_)))));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Ok(StreamEvent::End))));
    let tokens = events
        .iter()
        .filter(|e| matches!(e, Ok(StreamEvent::Token { .. })))
        .count();
    assert_eq!(tokens, 2);

    assert!(failing.history("s").await.is_empty());
    assert_paired(&before);
}

#[tokio::test]
async fn test_failures_keep_history_paired() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = kb(&env, Behavior::FailAfter(vec!["partial"]));
    kb.initialize().await.unwrap();

    // Seed a completed round directly.
    kb.sessions().append("s", Message::user("earlier")).await;
    kb.sessions()
        .append("s", Message::assistant("reply", Vec::new()))
        .await;

    for _ in 0..3 {
        assert!(matches!(
            kb.query("Capital?", "s").await,
            Err(KbError::Generation(_))
        ));
        let _ = collect(&kb, "Capital?", "s").await;
    }

    let history = kb.history("s").await;
    assert_paired(&history);
    assert_eq!(history.len(), 2);
}

#[tokio::test]
async fn test_unavailable_generator_fails_before_streaming() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = kb(&env, Behavior::Unavailable);
    kb.initialize().await.unwrap();

    let err = kb.stream_query("Capital?", "s").await.err().unwrap();
    assert!(matches!(err, KbError::Generation(_)));
    assert!(kb.history("s").await.is_empty());
}

#[tokio::test]
async fn test_history_capped_at_twenty_messages() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = kb(&env, Behavior::Fragments(vec!["ok"]));
    kb.initialize().await.unwrap();

    for i in 0..12 {
        kb.query(&format!("question {}", i), "s").await.unwrap();
    }

    let history = kb.history("s").await;
    assert_eq!(history.len(), 20);
    assert_paired(&history);
    assert_eq!(history[0].content, "question 2");
    assert_eq!(history[18].content, "question 11");
}

#[tokio::test]
async fn test_query_without_documents_is_empty_index() {
    let env = env();
    let kb = kb(&env, Behavior::EchoContext);
    let report = kb.initialize().await.unwrap();
    assert_eq!(report.changed, 0);

    let err = kb.query("Anything?", "s").await.unwrap_err();
    assert!(matches!(err, KbError::EmptyIndex(_)));
    assert!(kb.history("s").await.is_empty());
}

#[tokio::test]
async fn test_changed_and_deleted_files_are_purged() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    write(&env.docs, "other.txt", "Rome is the capital of Italy.");
    let kb = kb(&env, Behavior::EchoContext);
    kb.initialize().await.unwrap();
    let initial = kb.indexed_chunks().await.unwrap();

    write(&env.docs, "notes.txt", "Berlin is the capital of Germany.");
    let report = kb.sync().await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(kb.indexed_chunks().await.unwrap(), initial);

    let answer = kb.query("capital", "s").await.unwrap();
    assert!(answer.answer.contains("Berlin"));
    assert!(!answer.answer.contains("Paris"));

    fs::remove_file(env.docs.join("notes.txt")).unwrap();
    let report = kb.sync().await.unwrap();
    assert_eq!(report.removed, 1);

    let answer = kb.query("capital", "s").await.unwrap();
    assert_eq!(
        answer.sources,
        vec![SourceRef {
            file: "other.txt".to_string(),
            page: None
        }]
    );
}

#[tokio::test]
async fn test_unchanged_files_are_not_reembedded() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let embedder = Arc::new(WordEmbedder::default());
    let kb = kb_with(&env, Arc::clone(&embedder), Behavior::EchoContext);
    kb.initialize().await.unwrap();
    let embedded = embedder.texts.load(Ordering::SeqCst);

    let report = kb.sync().await.unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(embedder.texts.load(Ordering::SeqCst), embedded);

    // A restart with an intact index does not re-ingest either.
    drop(kb);
    let kb = kb_with(&env, Arc::clone(&embedder), Behavior::EchoContext);
    let report = kb.initialize().await.unwrap();
    assert_eq!(report.ingested, 0);
    assert_eq!(embedder.texts.load(Ordering::SeqCst), embedded);
    assert!(kb.indexed_chunks().await.unwrap() >= 1);
}

#[tokio::test]
async fn test_missing_index_triggers_full_ingest() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = kb(&env, Behavior::EchoContext);
    kb.initialize().await.unwrap();
    drop(kb);

    fs::remove_dir_all(&env.config.paths.index_dir).unwrap();
    let kb2 = self::kb(&env, Behavior::EchoContext);
    let report = kb2.initialize().await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.ingested, 1);
    assert!(kb2.query("capital", "s").await.is_ok());
}

#[tokio::test]
async fn test_retrieval_returns_at_most_k_sources() {
    let env = env();
    for i in 0..6 {
        write(
            &env.docs,
            &format!("city{}.txt", i),
            &format!("City number {} is a capital.", i),
        );
    }
    let kb = kb(&env, Behavior::Fragments(vec!["ok"]));
    kb.initialize().await.unwrap();
    let answer = kb.query("Which city is a capital?", "s").await.unwrap();
    assert_eq!(answer.sources.len(), 4);

    let env2 = self::env();
    write(&env2.docs, "a.txt", "alpha capital");
    write(&env2.docs, "b.txt", "beta capital");
    let kb2 = self::kb(&env2, Behavior::Fragments(vec!["ok"]));
    kb2.initialize().await.unwrap();
    let answer = kb2.query("capital", "s").await.unwrap();
    assert_eq!(answer.sources.len(), 2);
}

#[tokio::test]
async fn test_disconnect_stops_stream_and_rolls_back() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = kb(&env, Behavior::Endless);
    kb.initialize().await.unwrap();

    let mut events = kb.stream_query("Capital?", "s").await.unwrap();
    assert!(matches!(
        events.next().await,
        Some(Ok(StreamEvent::Sources { .. }))
    ));
    assert!(matches!(
        events.next().await,
        Some(Ok(StreamEvent::Token { .. }))
    ));
    drop(events);

    // Waits for the producer to release the session.
    let history = tokio::time::timeout(Duration::from_secs(5), kb.history("s"))
        .await
        .expect("producer did not stop");
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_sessions_do_not_share_history() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = Arc::new(kb(&env, Behavior::Fragments(vec!["ok"])));
    kb.initialize().await.unwrap();

    let mut handles = Vec::new();
    for s in 0..4 {
        let kb = Arc::clone(&kb);
        handles.push(tokio::spawn(async move {
            for i in 0..3 {
                kb.query(&format!("q{}", i), &format!("session-{}", s))
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    for s in 0..4 {
        let history = kb.history(&format!("session-{}", s)).await;
        assert_eq!(history.len(), 6);
        assert_paired(&history);
    }
    kb.clear_history("session-0").await;
    assert!(kb.history("session-0").await.is_empty());
    assert_eq!(kb.history("session-1").await.len(), 6);
}

#[tokio::test]
async fn test_upload_sanitizes_name_and_ingests() {
    let env = env();
    let kb = kb(&env, Behavior::EchoContext);
    kb.initialize().await.unwrap();

    let (name, report) = kb
        .upload_file("../../outside/notes.txt", b"Paris is the capital of France.")
        .await
        .unwrap();
    assert_eq!(name, "notes.txt");
    assert!(env.docs.join("notes.txt").exists());
    assert_eq!(report.ingested, 1);

    let files = kb.list_files().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "notes.txt");
    assert_eq!(files[0].file_type, "TXT");

    let answer = kb.query("capital of France", "s").await.unwrap();
    assert!(answer.answer.contains("Paris"));

    assert!(matches!(
        kb.upload_file("tool.exe", b"MZ").await,
        Err(KbError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_unextractable_file_is_retried_next_sync() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    // Legacy binary spreadsheet: not an OOXML container.
    fs::write(env.docs.join("old.xls"), b"\xD0\xCF\x11\xE0 legacy").unwrap();
    let kb = kb(&env, Behavior::EchoContext);

    let report = kb.initialize().await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed, vec!["old.xls".to_string()]);

    // Still failing, so still reported as changed on the next scan.
    let report = kb.sync().await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.failed, vec!["old.xls".to_string()]);
}

/// PDF extractor that panics on its first call and works afterwards.
#[derive(Default)]
struct FlakyPdf {
    panicked: AtomicBool,
}

impl Extractor for FlakyPdf {
    fn extensions(&self) -> &[&'static str] {
        &["pdf"]
    }

    fn extract(&self, path: &Path) -> Result<Vec<ExtractedUnit>, ExtractError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("malformed cross-reference table");
        }
        Ok(vec![ExtractedUnit {
            text: fs::read_to_string(path)?,
            page: Some(1),
        }])
    }
}

#[tokio::test]
async fn test_extractor_panic_fails_only_that_file() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    write(&env.docs, "report.pdf", "Berlin is the capital of Germany.");
    let mut extractors = ExtractorSet::with_builtins();
    extractors.register(Arc::new(FlakyPdf::default()));
    let kb = kb(&env, Behavior::EchoContext).with_extractors(extractors);

    let report = kb.initialize().await.unwrap();
    assert_eq!(report.ingested, 1);
    assert_eq!(report.failed, vec!["report.pdf".to_string()]);
    assert!(kb.query("capital of France", "s").await.is_ok());

    let report = kb.sync().await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.ingested, 1);
    assert!(report.failed.is_empty());
    let answer = kb.query("capital of Germany", "s").await.unwrap();
    assert!(answer.sources.contains(&SourceRef {
        file: "report.pdf".to_string(),
        page: Some(1)
    }));
}

#[tokio::test]
async fn test_aborted_ingestion_leaves_files_pending() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    // A plain file where the index directory should be.
    let index_dir = env.config.paths.index_dir.clone();
    fs::create_dir_all(index_dir.parent().unwrap()).unwrap();
    fs::write(&index_dir, "not a directory").unwrap();
    let kb = kb(&env, Behavior::EchoContext);

    assert!(matches!(kb.initialize().await, Err(KbError::Io(_))));

    fs::remove_file(&index_dir).unwrap();
    let report = kb.sync().await.unwrap();
    assert_eq!(report.changed, 1);
    assert_eq!(report.ingested, 1);
    assert!(kb.query("capital of France", "s").await.is_ok());
}

#[tokio::test]
async fn test_concurrent_turns_on_one_session_stay_paired() {
    let env = env();
    write(&env.docs, "notes.txt", "Paris is the capital of France.");
    let kb = Arc::new(kb(&env, Behavior::Fragments(vec!["o", "k"])));
    kb.initialize().await.unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let kb = Arc::clone(&kb);
        handles.push(tokio::spawn(async move {
            let question = format!("question {}", i);
            if i % 2 == 0 {
                kb.query(&question, "shared").await.unwrap();
            } else {
                let events: Vec<_> = kb
                    .stream_query(&question, "shared")
                    .await
                    .unwrap()
                    .collect()
                    .await;
                assert!(matches!(events.last(), Some(Ok(StreamEvent::End))));
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let history = kb.history("shared").await;
    assert_eq!(history.len(), 16);
    assert_paired(&history);
    for pair in history.chunks(2) {
        assert!(pair[0].content.starts_with("question "));
        assert_eq!(pair[1].content, "ok");
    }
    let mut asked: Vec<&str> = history
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect();
    asked.sort_unstable();
    asked.dedup();
    assert_eq!(asked.len(), 8);
}

#[tokio::test]
async fn test_concurrent_syncs_ingest_each_change_once() {
    let env = env();
    let embedder = Arc::new(WordEmbedder::default());
    let kb = Arc::new(kb_with(&env, Arc::clone(&embedder), Behavior::EchoContext));
    kb.initialize().await.unwrap();

    write(&env.docs, "paris.txt", "Paris is the capital of France.");
    write(&env.docs, "berlin.txt", "Berlin is the capital of Germany.");

    let a = tokio::spawn({
        let kb = Arc::clone(&kb);
        async move { kb.sync().await.unwrap() }
    });
    let b = tokio::spawn({
        let kb = Arc::clone(&kb);
        async move { kb.sync().await.unwrap() }
    });
    let (a, b) = (a.await.unwrap(), b.await.unwrap());

    assert_eq!(a.changed + b.changed, 2);
    assert_eq!(a.ingested + b.ingested, 2);
    assert_eq!(embedder.texts.load(Ordering::SeqCst), 2);
    assert_eq!(kb.indexed_chunks().await.unwrap(), 2);

    let report = kb.sync().await.unwrap();
    assert_eq!(report.changed, 0);
}
