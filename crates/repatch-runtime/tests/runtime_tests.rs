use pretty_assertions::assert_eq;
use repatch_bundle::{BundleSource, PatchOptions, PatchSelection};
use repatch_core::{EventSink, ProgressEvent, StepId};
use repatch_runtime::{
    InProcessRuntime, Patcher, ProcessRuntime, RepatchConfig, Runtime, RuntimeError, RuntimeMode, WorkerParameters,
};
use repatch_split::{InProcessMerge, MergeRequest, MergeStrategy, SubprocessMerge};
use repatch_test_utils::{
    abi_module, base_module, entry_set, read_entry, sample_bundle, sample_package, sample_split_archive,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

const WORKER: &str = env!("CARGO_BIN_EXE_repatch-worker");

fn parameters(dir: &Path, input: &Path) -> (WorkerParameters, PathBuf) {
    let bundle = sample_bundle(&dir.join("bundle.rpb"));
    let output = dir.join("out/app-patched.apk");
    let parameters = WorkerParameters::new("com.example.app", input, &output, dir.join("cache"))
        .with_bundle(BundleSource::new("main", bundle))
        .with_selection(
            PatchSelection::new()
                .with("main", "Rename label")
                .with("main", "Remove ads"),
        )
        .with_options(PatchOptions::new().with("main", "Rename label", "label", "Renamed".into()));
    (parameters, output)
}

fn steps(events: &[ProgressEvent]) -> Vec<ProgressEvent> {
    events
        .iter()
        .filter(|event| matches!(event, ProgressEvent::Started { .. } | ProgressEvent::Completed { .. }))
        .cloned()
        .collect()
}

#[tokio::test]
async fn in_process_session_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_package().write_to(&dir.path().join("app.apk"));
    let (parameters, output) = parameters(dir.path(), &input);
    let (sink, log) = EventSink::recorder();

    InProcessRuntime::new().execute(parameters, sink).await.unwrap();

    assert_eq!(
        steps(&log.snapshot()),
        vec![
            ProgressEvent::started(StepId::LoadPatches),
            ProgressEvent::completed(StepId::LoadPatches),
            ProgressEvent::started(StepId::ReadInput),
            ProgressEvent::completed(StepId::ReadInput),
            ProgressEvent::started(StepId::ExecutePatches),
            ProgressEvent::started(StepId::ExecutePatch(0)),
            ProgressEvent::completed(StepId::ExecutePatch(0)),
            ProgressEvent::started(StepId::ExecutePatch(1)),
            ProgressEvent::completed(StepId::ExecutePatch(1)),
            ProgressEvent::completed(StepId::ExecutePatches),
            ProgressEvent::started(StepId::WriteOutput),
            ProgressEvent::completed(StepId::WriteOutput),
        ]
    );
    assert_eq!(read_entry(&output, "res/values/strings.txt"), b"app_name=Renamed");
    assert!(!entry_set(&output).contains("assets/ads/banner.png"));
}

#[tokio::test]
async fn split_input_is_merged_before_patching() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_split_archive(&dir.path().join("app.apks"));
    let (parameters, output) = parameters(dir.path(), &input);
    let parameters = parameters.with_native_libs(true, vec!["arm64-v8a".to_string()]);
    let (sink, log) = EventSink::recorder();

    InProcessRuntime::new().execute(parameters, sink).await.unwrap();

    let markers = steps(&log.snapshot());
    assert!(markers.contains(&ProgressEvent::completed(StepId::PrepareSplitPackage)));
    let entries = entry_set(&output);
    assert!(entries.contains("lib/arm64-v8a/libnative.so"));
    assert!(!entries.contains("lib/x86/libnative.so"));
    assert_eq!(read_entry(&output, "res/values/strings.txt"), b"app_name=Renamed");
    assert!(!dir.path().join("cache").read_dir().unwrap().any(|entry| {
        entry.unwrap().file_name().to_string_lossy().starts_with("split-")
    }));
}

#[tokio::test]
async fn late_cancel_does_not_reach_the_next_session() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_package().write_to(&dir.path().join("app.apk"));
    let (parameters, output) = parameters(dir.path(), &input);
    let runtime = InProcessRuntime::new();

    let canceller = runtime.clone();
    let sink = EventSink::new(move |event| {
        if event == ProgressEvent::completed(StepId::WriteOutput) {
            canceller.cancel();
        }
    });
    runtime.execute(parameters.clone(), sink).await.unwrap();
    assert!(output.exists());

    std::fs::remove_file(&output).unwrap();
    runtime.execute(parameters, EventSink::discard()).await.unwrap();
    assert!(output.exists());
}

#[tokio::test]
async fn cancel_stops_an_in_process_session() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_package().write_to(&dir.path().join("app.apk"));
    let (parameters, output) = parameters(dir.path(), &input);
    let runtime = InProcessRuntime::new();

    let canceller = runtime.clone();
    let sink = EventSink::new(move |event| {
        if event == ProgressEvent::started(StepId::ReadInput) {
            canceller.cancel();
        }
    });
    let err = runtime.execute(parameters, sink).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Cancelled), "{err}");
    assert!(!output.exists());
}

#[tokio::test]
async fn worker_process_session_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_package().write_to(&dir.path().join("app.apk"));
    let (parameters, output) = parameters(dir.path(), &input);
    let (sink, log) = EventSink::recorder();

    ProcessRuntime::new(WORKER, dir.path().join("cache"))
        .execute(parameters, sink)
        .await
        .unwrap();

    let markers = steps(&log.snapshot());
    assert_eq!(markers.first(), Some(&ProgressEvent::started(StepId::LoadPatches)));
    assert_eq!(markers.last(), Some(&ProgressEvent::completed(StepId::WriteOutput)));
    assert_eq!(read_entry(&output, "res/values/strings.txt"), b"app_name=Renamed");
}

#[tokio::test]
async fn worker_failure_carries_the_remote_trace() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_package().write_to(&dir.path().join("app.apk"));
    let output = dir.path().join("app-patched.apk");
    let parameters = WorkerParameters::new("com.example.app", &input, &output, dir.path().join("cache"))
        .with_bundle(BundleSource::new("main", dir.path().join("missing.rpb")));
    let (sink, log) = EventSink::recorder();

    let err = ProcessRuntime::new(WORKER, dir.path().join("cache"))
        .execute(parameters, sink)
        .await
        .unwrap_err();

    assert!(matches!(&err, RuntimeError::RemoteFailure(remote) if remote.error_type == "BundleError"), "{err}");
    assert!(log.snapshot().iter().any(|event| matches!(
        event,
        ProgressEvent::Failed {
            step: Some(StepId::LoadPatches),
            ..
        }
    )));
    assert!(!output.exists());
}

#[tokio::test]
async fn stale_worker_is_never_started() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_package().write_to(&dir.path().join("app.apk"));
    let (parameters, output) = parameters(dir.path(), &input);
    let (sink, log) = EventSink::recorder();

    let err = ProcessRuntime::new(WORKER, dir.path().join("cache"))
        .with_build_id("some-other-build")
        .execute(parameters, sink)
        .await
        .unwrap_err();

    assert!(
        matches!(&err, RuntimeError::StaleWorkerBuild { expected, .. } if expected == "some-other-build"),
        "{err}"
    );
    assert!(log.snapshot().is_empty());
    assert!(!output.exists());
}

#[tokio::test]
async fn worker_exiting_before_connecting_reports_its_code() {
    let dir = tempfile::tempdir().unwrap();
    let (parameters, _) = parameters(dir.path(), &dir.path().join("app.apk"));

    let err = ProcessRuntime::new("/bin/false", dir.path().join("cache"))
        .execute(parameters, EventSink::discard())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), Some(1));
}

#[cfg(unix)]
#[tokio::test]
async fn silent_worker_times_out() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("silent-worker");
    std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let (parameters, _) = parameters(dir.path(), &dir.path().join("app.apk"));

    let runtime = ProcessRuntime::new(&script, dir.path().join("cache")).with_handshake_timeout(Duration::from_millis(300));
    let err = runtime.execute(parameters.clone(), EventSink::discard()).await.unwrap_err();
    assert!(matches!(err, RuntimeError::WorkerHandshakeTimeout(_)), "{err}");

    let leftover: Vec<_> = std::fs::read_dir(dir.path().join("cache"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert!(leftover.is_empty(), "{leftover:?}");
}

#[cfg(unix)]
#[tokio::test]
async fn cancel_during_handshake_kills_the_worker() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("silent-worker");
    std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    let (parameters, output) = parameters(dir.path(), &dir.path().join("app.apk"));

    let runtime = ProcessRuntime::new(&script, dir.path().join("cache"));
    let session = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.execute(parameters, EventSink::discard()).await }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;
    runtime.cancel();

    let err = tokio::time::timeout(Duration::from_secs(5), session)
        .await
        .expect("cancel did not stop the handshake wait")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Cancelled), "{err}");
    assert!(!output.exists());
    assert_eq!(std::fs::read_dir(dir.path().join("cache")).unwrap().count(), 0);
}

#[tokio::test]
async fn merge_worker_lists_and_merges_modules() {
    let dir = tempfile::tempdir().unwrap();
    let modules = dir.path().join("modules");
    base_module().write_to(&modules.join("base.apk"));
    abi_module("arm64-v8a").write_to(&modules.join("split_config.arm64_v8a.apk"));
    abi_module("x86").write_to(&modules.join("split_config.x86.apk"));
    let merge = SubprocessMerge::new(WORKER, dir.path());

    let order = merge.list_order(&modules).await.unwrap();
    assert_eq!(
        order,
        vec![
            "base.apk".to_string(),
            "split_config.arm64_v8a.apk".to_string(),
            "split_config.x86.apk".to_string(),
        ]
    );
    assert_eq!(order, InProcessMerge.list_order(&modules).await.unwrap());

    let request = MergeRequest {
        modules_dir: modules,
        output: dir.path().join("merged.apk"),
        skip: ["split_config.x86.apk".to_string()].into(),
    };
    merge.merge(&request, None).await.unwrap();

    let entries = entry_set(&request.output);
    assert!(entries.contains("classes.dex"));
    assert!(entries.contains("lib/arm64-v8a/libnative.so"));
    assert!(!entries.contains("lib/x86/libnative.so"));
    assert!(!entries.contains("META-INF/BASE.RSA"));
}

#[tokio::test]
async fn merge_worker_failure_keeps_the_output_tail() {
    let dir = tempfile::tempdir().unwrap();
    let modules = dir.path().join("modules");
    std::fs::create_dir_all(&modules).unwrap();
    let merge = SubprocessMerge::new(WORKER, dir.path());

    let request = MergeRequest {
        modules_dir: modules,
        output: dir.path().join("merged.apk"),
        skip: Default::default(),
    };
    let err = merge.merge(&request, None).await.unwrap_err();
    assert!(err.to_string().contains("no modules found"), "{err}");
}

#[tokio::test]
async fn patcher_in_process_mode_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_package().write_to(&dir.path().join("app.apk"));
    let output = dir.path().join("app-patched.apk");
    let bundle = sample_bundle(&dir.path().join("bundle.rpb"));
    let config = RepatchConfig::default()
        .with_mode(RuntimeMode::InProcess)
        .with_cache_dir(dir.path().join("cache"));

    let patcher = Patcher::from_config(config).unwrap();
    let parameters = patcher
        .parameters("com.example.app", &input, &output)
        .with_bundle(BundleSource::new("main", bundle))
        .with_selection(PatchSelection::new().with("main", "Add banner"));

    patcher.patch(parameters, EventSink::discard()).await.unwrap();
    assert_eq!(read_entry(&output, "assets/banner.txt"), b"patched-banner");
}

#[tokio::test]
async fn patcher_reports_the_final_failure() {
    let dir = tempfile::tempdir().unwrap();
    let input = sample_package().write_to(&dir.path().join("app.apk"));
    let bundle = sample_bundle(&dir.path().join("bundle.rpb"));
    let config = RepatchConfig::default()
        .with_mode(RuntimeMode::InProcess)
        .with_cache_dir(dir.path().join("cache"));

    let patcher = Patcher::from_config(config).unwrap();
    let parameters = patcher
        .parameters("com.example.app", &input, &dir.path().join("out.apk"))
        .with_bundle(BundleSource::new("main", bundle))
        .with_selection(PatchSelection::new().with("main", "Broken"));
    let (sink, log) = EventSink::recorder();

    let err = patcher.patch(parameters, sink).await.unwrap_err();
    assert!(matches!(err, RuntimeError::PatchFailed(_)), "{err}");
    assert!(matches!(
        log.snapshot().last(),
        Some(ProgressEvent::Failed { step: None, .. })
    ));
}
