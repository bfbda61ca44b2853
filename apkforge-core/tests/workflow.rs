//! Confirm / download workflow acceptance tests.
//!
//! Runs the coordinator against an in-memory store with fake build and
//! artifact services. The fake build "uploads" a payload to the job's
//! output path when the job succeeds, the same way the real upload step does.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use apkforge_core::artifact::ArtifactStore;
use apkforge_core::build::{BuildConfig, BuildService, BuildSpec, JobHandle};
use apkforge_core::{
    ArtifactError, BuildError, ConfirmOutcome, Coordinator, NewBatch, Progress, Status, Store,
    Template, WorkflowError,
};

#[derive(Default)]
struct FakeArtifacts {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl ArtifactStore for FakeArtifacts {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, ArtifactError> {
        self.objects
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(path.to_string()))
    }
}

#[derive(Default)]
struct FakeBuilds {
    artifacts: Arc<FakeArtifacts>,
    submitted: Mutex<Vec<BuildSpec>>,
    reject_submit: Option<String>,
    fail_job: Option<String>,
    /// Skip the upload step so the final fetch fails.
    skip_upload: bool,
}

impl BuildService for FakeBuilds {
    async fn submit(&self, spec: &BuildSpec) -> Result<JobHandle, BuildError> {
        if let Some(reason) = &self.reject_submit {
            return Err(BuildError::Submit(reason.clone()));
        }
        let mut submitted = self.submitted.lock();
        submitted.push(spec.clone());
        Ok(JobHandle(format!("operations/build/test/{}", submitted.len() - 1)))
    }

    async fn wait(&self, handle: &JobHandle) -> Result<(), BuildError> {
        tokio::task::yield_now().await;
        if let Some(reason) = &self.fail_job {
            return Err(BuildError::Execution(reason.clone()));
        }
        let index: usize = handle.0.rsplit('/').next().unwrap().parse().unwrap();
        let spec = self.submitted.lock()[index].clone();
        if !self.skip_upload {
            self.artifacts
                .objects
                .lock()
                .insert(spec.output_path.clone(), payload_for(&spec));
        }
        Ok(())
    }
}

/// Pretend APK: the injected config script, so tests can tell builds apart.
fn payload_for(spec: &BuildSpec) -> Vec<u8> {
    format!("APK:{}", spec.steps[1].args[1]).into_bytes()
}

struct Harness {
    store: Arc<Store>,
    builds: Arc<FakeBuilds>,
    artifacts: Arc<FakeArtifacts>,
    coordinator: Coordinator<FakeBuilds, FakeArtifacts>,
}

fn harness(builds: FakeBuilds) -> Harness {
    let store = Arc::new(Store::open_memory().unwrap());
    let artifacts = builds.artifacts.clone();
    let builds = Arc::new(builds);
    let config = BuildConfig {
        repo_url: Some("https://github.com/acme/android.git".into()),
        bucket: "acme-builds".into(),
        ..Default::default()
    };
    let coordinator = Coordinator::new(store.clone(), config, builds.clone(), artifacts.clone());
    Harness {
        store,
        builds,
        artifacts,
        coordinator,
    }
}

fn add_batch(store: &Store, id: &str, name: &str, project: Option<&str>) {
    store
        .create_batch(&NewBatch {
            id: id.into(),
            artifact_name: name.into(),
            project: project.map(String::from),
            status: Status::Available,
        })
        .unwrap();
}

fn add_template(store: &Store, project: &str, index: u64, data: &str) {
    store
        .put_template(&Template {
            project: project.into(),
            index,
            data_text: data.into(),
        })
        .unwrap();
}

#[tokio::test]
async fn first_build_uses_sequence_one_and_exact_template() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b1", "demo-app", Some("DEMO"));
    add_template(&h.store, "DEMO", 1, "{\"cfg\":1}");
    add_template(&h.store, "DEMO", 3, "{\"cfg\":3}");

    let outcome = h.coordinator.confirm("b1", None).await.unwrap();
    let ConfirmOutcome::Delivered { report, artifact } = outcome else {
        panic!("expected delivery, got {outcome:?}");
    };
    assert_eq!(report.seq, 1);
    assert_eq!(report.template_index, 1);
    assert_eq!(report.project, "DEMO");
    assert_eq!(report.filename, "demo-app-release.apk");

    let b = h.store.get_batch("b1").unwrap().unwrap();
    assert_eq!(b.status, Status::Built);
    assert_eq!(b.apk_seq, Some(1));
    assert_eq!(b.template_index_used, Some(1));
    assert_eq!(b.artifact_path.as_deref(), Some("builds/b1/app-release.apk"));
    assert!(b.build_start.is_some() && b.built_at.is_some());
    assert!(b.error.is_none());

    let spec = &h.builds.submitted.lock()[0];
    assert_eq!(artifact, payload_for(spec));
}

#[tokio::test]
async fn falls_back_to_highest_template_without_exact_match() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b1", "demo-app", None);
    add_template(&h.store, "DEMO", 4, "{\"cfg\":4}");
    add_template(&h.store, "DEMO", 2, "{\"cfg\":2}");

    let outcome = h.coordinator.confirm("b1", None).await.unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Delivered { ref report, .. } if report.template_index == 4));
    let b = h.store.get_batch("b1").unwrap().unwrap();
    // Project inferred from the artifact name.
    assert_eq!(b.project.as_deref(), Some("DEMO"));
    assert_eq!(b.template_index_used, Some(4));
}

#[tokio::test]
async fn explicit_project_overrides_batch() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b1", "demo-app", Some("DEMO"));
    add_template(&h.store, "SHOP", 1, "shop");

    h.coordinator.confirm("b1", Some("SHOP")).await.unwrap();
    let b = h.store.get_batch("b1").unwrap().unwrap();
    assert_eq!(b.project.as_deref(), Some("SHOP"));
    assert_eq!(h.store.counter("SHOP").unwrap().unwrap().last_seq, 1);
    assert!(h.store.counter("DEMO").unwrap().is_none());
}

#[tokio::test]
async fn sequences_advance_across_batches() {
    let h = harness(FakeBuilds::default());
    add_template(&h.store, "DEMO", 1, "one");
    for id in ["b1", "b2", "b3"] {
        add_batch(&h.store, id, "demo-app", None);
        h.coordinator.confirm(id, None).await.unwrap();
    }
    let seqs: Vec<Option<u64>> = ["b1", "b2", "b3"]
        .iter()
        .map(|id| h.store.get_batch(id).unwrap().unwrap().apk_seq)
        .collect();
    assert_eq!(seqs, vec![Some(1), Some(2), Some(3)]);
    // Only b1 had an exact template; the rest fall back to the highest.
    let b3 = h.store.get_batch("b3").unwrap().unwrap();
    assert_eq!(b3.template_index_used, Some(1));
}

#[tokio::test]
async fn missing_template_marks_error_without_submitting() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b2", "demo-app", Some("DEMO"));

    let err = h.coordinator.confirm("b2", None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::TemplateNotFound(ref p) if p == "DEMO"));

    let b = h.store.get_batch("b2").unwrap().unwrap();
    assert_eq!(b.status, Status::Error);
    assert!(b.error.unwrap().contains("no template"));
    assert!(b.apk_seq.is_none());
    assert!(h.builds.submitted.lock().is_empty());
}

#[tokio::test]
async fn empty_template_marks_error_without_submitting() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b3", "demo-app", Some("DEMO"));
    add_template(&h.store, "DEMO", 1, "   \n");

    let err = h.coordinator.confirm("b3", None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::EmptyTemplate { index: 1, .. }));

    let b = h.store.get_batch("b3").unwrap().unwrap();
    assert_eq!(b.status, Status::Error);
    assert!(b.error.unwrap().contains("empty"));
    assert!(h.builds.submitted.lock().is_empty());
}

#[tokio::test]
async fn submit_failure_keeps_build_start_but_no_artifact() {
    let h = harness(FakeBuilds {
        reject_submit: Some("quota exceeded".into()),
        ..Default::default()
    });
    add_batch(&h.store, "b4", "demo-app", Some("DEMO"));
    add_template(&h.store, "DEMO", 1, "cfg");

    let err = h.coordinator.confirm("b4", None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::BuildSubmit(ref r) if r == "quota exceeded"));

    let b = h.store.get_batch("b4").unwrap().unwrap();
    assert_eq!(b.status, Status::Error);
    assert!(b.error.unwrap().contains("quota exceeded"));
    assert!(b.build_start.is_some());
    assert_eq!(b.apk_seq, Some(1));
    assert!(b.artifact_path.is_none());
}

#[tokio::test]
async fn unconfigured_source_is_a_submit_error() {
    let store = Arc::new(Store::open_memory().unwrap());
    let builds = Arc::new(FakeBuilds::default());
    let coordinator = Coordinator::new(
        store.clone(),
        BuildConfig {
            bucket: "acme-builds".into(),
            ..Default::default()
        },
        builds.clone(),
        builds.artifacts.clone(),
    );
    add_batch(&store, "b1", "demo-app", None);
    add_template(&store, "DEMO", 1, "cfg");

    let err = coordinator.confirm("b1", None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::BuildSubmit(_)));
    assert_eq!(store.get_batch("b1").unwrap().unwrap().status, Status::Error);
    assert!(builds.submitted.lock().is_empty());
}

#[tokio::test]
async fn job_failure_reason_is_recorded() {
    let h = harness(FakeBuilds {
        fail_job: Some("step 2 exited with 1".into()),
        ..Default::default()
    });
    add_batch(&h.store, "b5", "demo-app", None);
    add_template(&h.store, "DEMO", 1, "cfg");

    let err = h.coordinator.confirm("b5", None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::BuildExecution(_)));
    let b = h.store.get_batch("b5").unwrap().unwrap();
    assert_eq!(b.status, Status::Error);
    assert_eq!(b.error.as_deref(), Some("build failed: step 2 exited with 1"));
    assert!(b.artifact_path.is_none());
}

#[tokio::test]
async fn fetch_failure_leaves_batch_built_and_download_recovers() {
    let h = harness(FakeBuilds {
        skip_upload: true,
        ..Default::default()
    });
    add_batch(&h.store, "b6", "demo-app", None);
    add_template(&h.store, "DEMO", 1, "cfg");

    let outcome = h.coordinator.confirm("b6", None).await.unwrap();
    assert!(matches!(outcome, ConfirmOutcome::Undelivered { .. }));
    let b = h.store.get_batch("b6").unwrap().unwrap();
    assert_eq!(b.status, Status::Built);
    assert!(b.error.is_none());

    let err = h.coordinator.download("b6").await.unwrap_err();
    assert!(matches!(err, WorkflowError::ArtifactFetch(_)));

    h.artifacts
        .objects
        .lock()
        .insert("builds/b6/app-release.apk".into(), b"late apk".to_vec());
    let download = h.coordinator.download("b6").await.unwrap();
    assert_eq!(download.artifact, b"late apk");
    assert_eq!(download.batch.id, "b6");
}

#[tokio::test]
async fn download_returns_uploaded_bytes() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b7", "demo-app", None);
    add_template(&h.store, "DEMO", 1, "cfg");
    h.coordinator.confirm("b7", None).await.unwrap();

    let uploaded = payload_for(&h.builds.submitted.lock()[0]);
    let download = h.coordinator.download("b7").await.unwrap();
    assert_eq!(download.artifact, uploaded);
}

#[tokio::test]
async fn download_before_built_is_not_ready() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b8", "demo-app", None);
    h.store
        .transition("b8", &apkforge_core::BatchPatch::confirmed("DEMO"))
        .unwrap();
    let before = h.store.get_batch("b8").unwrap().unwrap();

    let err = h.coordinator.download("b8").await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotReady(Status::Confirmed)));
    assert_eq!(h.store.get_batch("b8").unwrap().unwrap(), before);

    assert!(matches!(
        h.coordinator.download("nope").await.unwrap_err(),
        WorkflowError::NotFound(_)
    ));
}

#[tokio::test]
async fn confirm_on_built_batch_is_a_conflict_without_writes() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b9", "demo-app", None);
    add_template(&h.store, "DEMO", 1, "cfg");
    add_template(&h.store, "DEMO", 2, "cfg2");
    h.coordinator.confirm("b9", None).await.unwrap();
    let before = h.store.get_batch("b9").unwrap().unwrap();

    let err = h.coordinator.confirm("b9", Some("OTHER")).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Conflict(Status::Built)));
    assert_eq!(h.store.get_batch("b9").unwrap().unwrap(), before);
    assert_eq!(h.store.counter("DEMO").unwrap().unwrap().last_seq, 1);
    assert_eq!(h.builds.submitted.lock().len(), 1);
}

#[tokio::test]
async fn confirm_on_errored_batch_is_a_conflict() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b10", "demo-app", None);
    h.coordinator.confirm("b10", None).await.unwrap_err();

    let err = h.coordinator.confirm("b10", None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Conflict(Status::Error)));
}

#[tokio::test]
async fn confirm_unknown_batch_is_not_found() {
    let h = harness(FakeBuilds::default());
    assert!(matches!(
        h.coordinator.confirm("ghost", None).await.unwrap_err(),
        WorkflowError::NotFound(ref id) if id == "ghost"
    ));
}

#[tokio::test]
async fn concurrent_confirms_submit_once() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b11", "demo-app", None);
    add_template(&h.store, "DEMO", 1, "cfg");

    let (a, b) = tokio::join!(
        h.coordinator.confirm("b11", None),
        h.coordinator.confirm("b11", None)
    );
    let results = [a, b];
    let delivered = results
        .iter()
        .filter(|r| matches!(r, Ok(ConfirmOutcome::Delivered { .. })))
        .count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(WorkflowError::Conflict(_))))
        .count();
    assert_eq!((delivered, conflicts), (1, 1));
    assert_eq!(h.builds.submitted.lock().len(), 1);
    assert_eq!(h.store.counter("DEMO").unwrap().unwrap().last_seq, 1);
}

/// Confirms racing on worker threads, so losers get past the status
/// pre-check and are turned away by the claim itself.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn parallel_confirms_claim_once_per_batch() {
    const ROUNDS: usize = 100;
    const CONTENDERS: usize = 4;

    let h = harness(FakeBuilds::default());
    let coordinator = Arc::new(h.coordinator);

    for round in 0..ROUNDS {
        let id = format!("race-{round}");
        add_batch(&h.store, &id, "demo-app", Some(&format!("RACE{round}")));
        add_template(&h.store, &format!("RACE{round}"), 1, "cfg");

        let tasks: Vec<_> = (0..CONTENDERS)
            .map(|_| {
                let coordinator = coordinator.clone();
                let id = id.clone();
                tokio::spawn(async move { coordinator.confirm(&id, None).await })
            })
            .collect();

        let mut delivered = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(ConfirmOutcome::Delivered { .. }) => delivered += 1,
                Err(WorkflowError::Conflict(_)) => conflicts += 1,
                other => panic!("round {round}: unexpected {other:?}"),
            }
        }
        assert_eq!((delivered, conflicts), (1, CONTENDERS - 1), "round {round}");
        assert_eq!(h.builds.submitted.lock().len(), round + 1, "round {round}");
        let counter = h.store.counter(&format!("RACE{round}")).unwrap().unwrap();
        assert_eq!(counter.last_seq, 1, "round {round}");
        assert_eq!(h.store.get_batch(&id).unwrap().unwrap().status, Status::Built);
    }
}

#[tokio::test]
async fn progress_reported_while_building() {
    let h = harness(FakeBuilds::default());
    add_batch(&h.store, "b12", "demo-app", None);
    add_template(&h.store, "DEMO", 1, "cfg");

    let store = h.store.clone();
    let mut seen = Vec::new();
    h.coordinator
        .confirm_with_progress("b12", None, |p| {
            let status = store.get_batch("b12").unwrap().unwrap().status;
            seen.push((p, status));
        })
        .await
        .unwrap();

    assert_eq!(seen.len(), 1);
    let (Progress::Building(report), status) = &seen[0];
    assert_eq!(*status, Status::Building);
    assert_eq!(report.seq, 1);
}
