//! End-to-end request scenarios through the pipeline.

mod common;

use async_trait::async_trait;
use common::{pipeline, pipeline_with, MemorySnippets, NoNative, RecordingAdapter, PACKAGES};
use nixie_core::executor::native::{NativeAdapter, ProfileLibrary};
use nixie_core::executor::process::ProcessAdapter;
use nixie_core::learner::LearnerHandle;
use nixie_core::package_index::StaticIndex;
use nixie_core::{Adapter, NativeProbe, PipelineBuilder};
use nixie_shared::config::{LearnerConfig, NixieConfig, ToolTemplate};
use nixie_shared::intent::{param, IntentAction};
use nixie_shared::plan::{Operation, Safety};
use nixie_shared::request::{Request, ResponseStatus};
use nixie_shared::result::{Backend, ErrorKind};
use std::os::unix::fs::symlink;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

// ============================================================================
// Install
// ============================================================================

#[tokio::test]
async fn test_install_firefox() {
    let adapter = Arc::new(RecordingAdapter::new(Backend::Fallback));
    let mut p = pipeline(adapter.clone(), None);

    let response = p.handle(Request::apply("install firefox")).await.unwrap();

    assert_eq!(response.intent.action, IntentAction::Install);
    assert_eq!(response.intent.param(param::PACKAGE), Some("firefox"));
    assert!(response.intent.confidence >= 0.8);
    assert_eq!(response.plan_summary[0], "install firefox [safe]");
    assert_eq!(
        adapter.calls().first().map(|(op, target, _)| (*op, target.clone())),
        Some((Operation::Install, "firefox".to_string()))
    );

    let result = response.result.unwrap();
    assert!(result.success);
    assert_eq!(result.backend_used, Backend::Fallback);
    assert_eq!(response.status.exit_code(), 0);
}

#[tokio::test]
async fn test_unknown_package_clarifies() {
    let adapter = Arc::new(RecordingAdapter::new(Backend::Fallback));
    let mut p = pipeline(adapter.clone(), None);
    let response = p.handle(Request::apply("install firefoxx")).await.unwrap();
    assert_eq!(response.status, ResponseStatus::ClarificationNeeded);
    assert!(response.message.contains("couldn't find a package called 'firefoxx'"));
    assert!(adapter.calls().is_empty());
}

// ============================================================================
// Destructive without confirmation
// ============================================================================

#[tokio::test]
async fn test_destructive_without_confirmation() {
    let adapter = Arc::new(RecordingAdapter::new(Backend::Fallback));
    let mut p = pipeline(adapter.clone(), None);

    let response = p
        .handle(Request::apply("remove all old generations"))
        .await
        .unwrap();

    assert_eq!(response.exit_code(), 3);
    assert!(response.plan_summary[0].contains(Safety::Destructive.as_str()));
    assert!(adapter.calls().is_empty());
}

// ============================================================================
// Alias learning
// ============================================================================

#[tokio::test]
async fn test_alias_learned_after_three_corrections() {
    let state = tempdir().unwrap();
    let learner = LearnerHandle::spawn(&LearnerConfig::default(), state.path());
    let adapter = Arc::new(RecordingAdapter::new(Backend::Fallback));
    let mut p = pipeline_with(adapter.clone(), None, learner.clone());

    for _ in 0..3 {
        let failed = p.handle(Request::apply("grab firefox")).await.unwrap();
        assert_eq!(failed.status, ResponseStatus::ClarificationNeeded);
        let fixed = p.handle(Request::apply("install firefox")).await.unwrap();
        assert_eq!(fixed.status, ResponseStatus::Completed);
    }
    learner.flush().await.unwrap();
    assert_eq!(
        learner.snapshot().aliases.get("grab").map(String::as_str),
        Some("install")
    );

    let response = p.handle(Request::apply("grab vscode")).await.unwrap();
    assert_eq!(response.intent.action, IntentAction::Install);
    assert_eq!(response.intent.param(param::PACKAGE), Some("vscode"));
    assert_eq!(response.intent.rewritten.as_deref(), Some("install vscode"));
    assert!(response.suggestions.iter().any(|s| s == "Read 'grab' as 'install'"));
    assert_eq!(response.status, ResponseStatus::Completed);
    assert_eq!(
        adapter.calls().last().map(|(op, target, _)| (*op, target.clone())),
        Some((Operation::Install, "vscode".to_string()))
    );

    // learned data survives a restart
    learner.flush().await.unwrap();
    let again = LearnerHandle::spawn(&LearnerConfig::default(), state.path());
    again.flush().await.unwrap();
    assert!(again.snapshot().aliases.contains_key("grab"));
}

#[tokio::test]
async fn test_two_corrections_are_not_enough() {
    let state = tempdir().unwrap();
    let learner = LearnerHandle::spawn(&LearnerConfig::default(), state.path());
    let adapter = Arc::new(RecordingAdapter::new(Backend::Fallback));
    let mut p = pipeline_with(adapter, None, learner.clone());

    for _ in 0..2 {
        p.handle(Request::apply("grab firefox")).await.unwrap();
        p.handle(Request::apply("install firefox")).await.unwrap();
    }
    learner.flush().await.unwrap();

    let response = p.handle(Request::apply("grab vscode")).await.unwrap();
    assert_eq!(response.status, ResponseStatus::ClarificationNeeded);
}

#[tokio::test]
async fn test_recovery_offered_only_for_the_same_failure() {
    let state = tempdir().unwrap();
    let learner = LearnerHandle::spawn(&LearnerConfig::default(), state.path());
    let adapter = Arc::new(RecordingAdapter::failing(
        Backend::Fallback,
        Operation::Search,
        ErrorKind::BackendUnavailable,
    ));
    let mut p = pipeline_with(adapter, None, learner.clone());

    let failed = p.handle(Request::apply("search for editor")).await.unwrap();
    assert_eq!(failed.exit_code(), 4);
    p.handle(Request::apply("install vim")).await.unwrap();
    learner.flush().await.unwrap();

    let again = p.handle(Request::apply("search for editor")).await.unwrap();
    assert!(again
        .suggestions
        .iter()
        .any(|s| s == "This worked before: install vim"));

    let other = p.handle(Request::apply("search for browser")).await.unwrap();
    assert_eq!(other.exit_code(), 4);
    assert!(!other.suggestions.iter().any(|s| s.starts_with("This worked before")));
}

#[tokio::test]
async fn test_clarify_recovery_is_not_reused_for_other_packages() {
    let state = tempdir().unwrap();
    let learner = LearnerHandle::spawn(&LearnerConfig::default(), state.path());
    let adapter = Arc::new(RecordingAdapter::new(Backend::Fallback));
    let mut p = pipeline_with(adapter, None, learner.clone());

    p.handle(Request::apply("grab firefox")).await.unwrap();
    p.handle(Request::apply("install firefox")).await.unwrap();
    learner.flush().await.unwrap();

    let other = p.handle(Request::apply("grab htop")).await.unwrap();
    assert_eq!(other.status, ResponseStatus::ClarificationNeeded);
    assert!(!other.suggestions.iter().any(|s| s.starts_with("This worked before")));

    let same = p.handle(Request::apply("grab firefox")).await.unwrap();
    assert_eq!(same.status, ResponseStatus::ClarificationNeeded);
    assert!(same
        .suggestions
        .iter()
        .any(|s| s == "This worked before: install firefox"));
}

// ============================================================================
// Timeout
// ============================================================================

#[tokio::test]
async fn test_timeout_kills_process() {
    let mut config = NixieConfig::default();
    config.executor.force_fallback = true;
    config.tools.insert(
        "rebuild".to_string(),
        ToolTemplate::new(&["sleep", "30"], Some(&["true"])),
    );
    let snippets = Arc::new(MemorySnippets::default());
    let fallback =
        ProcessAdapter::new(&config, snippets.clone()).with_timeout(Duration::from_millis(300));

    let mut p = PipelineBuilder::new(config)
        .package_index(Arc::new(StaticIndex::from_names(PACKAGES)))
        .snippets(snippets)
        .fallback(Arc::new(fallback))
        .learner(LearnerHandle::disabled())
        .atomic_generations(true)
        .build()
        .unwrap();

    let started = std::time::Instant::now();
    let response = p
        .handle(Request::apply("rebuild").non_interactive(true))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    assert_eq!(response.status, ResponseStatus::TimedOut);
    assert_eq!(response.exit_code(), 5);
    let result = response.result.unwrap();
    assert!(!result.success);
    assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
    assert!(result.incomplete);
    assert!(result.snapshot_available);
    assert!(response.message.contains("was not retried"));

    // "killed process <pid> after <n>s"
    let detail = &result.error.unwrap().detail;
    let pid: u32 = detail.split_whitespace().nth(2).unwrap().parse().unwrap();
    assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
}

// ============================================================================
// Native backend unavailable / available
// ============================================================================

#[tokio::test]
async fn test_native_unavailable_routes_everything_to_fallback() {
    let mut config = NixieConfig::default();
    config.executor.force_fallback = false;
    let adapter = Arc::new(RecordingAdapter::new(Backend::Fallback));
    let mut p = PipelineBuilder::new(config)
        .package_index(Arc::new(StaticIndex::from_names(PACKAGES)))
        .snippets(Arc::new(MemorySnippets::default()))
        .fallback(adapter.clone())
        .native_probe(Box::new(NoNative))
        .learner(LearnerHandle::disabled())
        .atomic_generations(true)
        .build()
        .unwrap();

    assert!(!p.selector().native_available().await);
    for text in ["list generations", "install firefox", "search for vim", "what is installed"] {
        let response = p.handle(Request::apply(text)).await.unwrap();
        let result = response.result.unwrap();
        assert!(result.success, "{}", text);
        assert_eq!(result.backend_used, Backend::Fallback, "{}", text);
    }
    assert_eq!(adapter.calls().len(), 4);
}

struct ProfileProbe(Arc<dyn Adapter>);

#[async_trait]
impl NativeProbe for ProfileProbe {
    async fn probe(&self) -> Option<Arc<dyn Adapter>> {
        Some(Arc::clone(&self.0))
    }
}

#[tokio::test]
async fn test_native_handles_what_it_supports() {
    let tree = tempdir().unwrap();
    for n in [1, 2] {
        symlink(
            format!("/nix/store/h{}-nixos-system", n),
            tree.path().join(format!("system-{}-link", n)),
        )
        .unwrap();
    }
    symlink("system-2-link", tree.path().join("system")).unwrap();
    let native: Arc<dyn Adapter> = Arc::new(NativeAdapter::new(
        Arc::new(ProfileLibrary::new(tree.path())),
        Duration::from_secs(5),
    ));

    let fallback = Arc::new(RecordingAdapter::new(Backend::Fallback));
    let mut config = NixieConfig::default();
    config.executor.force_fallback = false;
    let mut p = PipelineBuilder::new(config)
        .package_index(Arc::new(StaticIndex::from_names(PACKAGES)))
        .snippets(Arc::new(MemorySnippets::default()))
        .fallback(fallback.clone())
        .native_probe(Box::new(ProfileProbe(native)))
        .learner(LearnerHandle::disabled())
        .build()
        .unwrap();

    let listed = p.handle(Request::apply("list generations")).await.unwrap();
    let result = listed.result.unwrap();
    assert_eq!(result.backend_used, Backend::Native);
    assert!(result.output.contains("(current)"));

    let installed = p.handle(Request::apply("install firefox")).await.unwrap();
    assert_eq!(installed.result.unwrap().backend_used, Backend::Fallback);

    let switched = p
        .handle(Request::apply("switch to generation 1").non_interactive(true))
        .await
        .unwrap();
    assert_eq!(switched.status, ResponseStatus::Completed);
    assert_eq!(
        std::fs::read_link(tree.path().join("system")).unwrap(),
        std::path::PathBuf::from("system-1-link")
    );
    assert_eq!(fallback.operations(), vec![Operation::Install]);
}
