use async_trait::async_trait;
use instance_reconcile::{
    ExtractConfig, Pipeline, RecordFamily, ReconcileError, Result, SnapshotReader, WorkDir,
    ZdbSnapshotReader,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

/// Writes `<partition>/<generation>` to the family's file, failing on demand.
struct FakeReader {
    fail: Option<(RecordFamily, &'static str)>,
}

impl FakeReader {
    fn healthy() -> Self {
        Self { fail: None }
    }

    fn failing(family: RecordFamily, generation: &'static str) -> Self {
        Self {
            fail: Some((family, generation)),
        }
    }
}

fn snapshot_label(snapshot: &Path) -> String {
    let generation = snapshot.file_name().unwrap().to_string_lossy();
    let partition = snapshot
        .parent()
        .and_then(Path::parent)
        .and_then(Path::file_name)
        .unwrap()
        .to_string_lossy();
    format!("{}/{}", partition, generation)
}

#[async_trait]
impl SnapshotReader for FakeReader {
    async fn dump(&self, snapshot: &Path, family: RecordFamily, out: &Path) -> Result<()> {
        let label = snapshot_label(snapshot);
        if let Some((failing, generation)) = self.fail {
            if failing == family && label.ends_with(generation) {
                return Err(ReconcileError::Command {
                    program: "fake".to_string(),
                    reason: "exit status: 1".to_string(),
                });
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(out).unwrap();
        writeln!(file, "{}", label).unwrap();
        Ok(())
    }
}

fn snapshot_tree(root: &Path) {
    for dir in ["p2/snapshots/g1", "p1/snapshots/g2", "p1/snapshots/g1", "p3/runtime"] {
        fs::create_dir_all(root.join(dir)).unwrap();
    }
    fs::write(root.join("p1/snapshots/not-a-dir"), "").unwrap();
}

fn lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn partitions_and_generations_are_walked_in_name_order() {
    let snapshots = tempdir().unwrap();
    snapshot_tree(snapshots.path());
    let work = tempdir().unwrap();
    let work_dir = WorkDir::new(work.path());

    let report = Pipeline::new(work_dir.clone())
        .extract(&FakeReader::healthy(), snapshots.path(), false)
        .await
        .unwrap();

    assert_eq!(report.partitions, 2);
    assert_eq!(report.skipped_partitions, 1);
    assert_eq!(report.snapshots, 3);
    let expected = vec!["p1/g1", "p1/g2", "p2/g1"];
    assert_eq!(lines(&work_dir.trusted_keys()), expected);
    assert_eq!(lines(&work_dir.raw_variables()), expected);
    assert_eq!(lines(&work_dir.raw_flow_nodes()), expected);
}

#[tokio::test]
async fn rerun_appends_unless_truncated() {
    let snapshots = tempdir().unwrap();
    snapshot_tree(snapshots.path());
    let work = tempdir().unwrap();
    let pipeline = Pipeline::new(WorkDir::new(work.path()));
    let reader = FakeReader::healthy();

    pipeline.extract(&reader, snapshots.path(), false).await.unwrap();
    pipeline.extract(&reader, snapshots.path(), false).await.unwrap();
    assert_eq!(lines(&pipeline.work_dir().trusted_keys()).len(), 6);

    pipeline.extract(&reader, snapshots.path(), true).await.unwrap();
    assert_eq!(lines(&pipeline.work_dir().trusted_keys()).len(), 3);
}

#[tokio::test]
async fn key_and_flow_node_failures_are_skipped() {
    let snapshots = tempdir().unwrap();
    snapshot_tree(snapshots.path());
    let work = tempdir().unwrap();
    let work_dir = WorkDir::new(work.path());

    let report = Pipeline::new(work_dir.clone())
        .extract(
            &FakeReader::failing(RecordFamily::FlowNodes, "p1/g2"),
            snapshots.path(),
            false,
        )
        .await
        .unwrap();

    assert_eq!(report.snapshots, 3);
    assert_eq!(report.flow_node_failures, 1);
    assert_eq!(report.key_failures, 0);
    assert_eq!(lines(&work_dir.raw_flow_nodes()), vec!["p1/g1", "p2/g1"]);
    assert_eq!(lines(&work_dir.raw_variables()).len(), 3);

    let report = Pipeline::new(work_dir.clone())
        .extract(&FakeReader::failing(RecordFamily::Keys, "p2/g1"), snapshots.path(), true)
        .await
        .unwrap();
    assert_eq!(report.key_failures, 1);
    assert_eq!(lines(&work_dir.trusted_keys()), vec!["p1/g1", "p1/g2"]);
}

#[tokio::test]
async fn variable_failure_aborts_the_walk() {
    let snapshots = tempdir().unwrap();
    snapshot_tree(snapshots.path());
    let work = tempdir().unwrap();
    let work_dir = WorkDir::new(work.path());

    let result = Pipeline::new(work_dir.clone())
        .extract(
            &FakeReader::failing(RecordFamily::Variables, "p1/g2"),
            snapshots.path(),
            false,
        )
        .await;

    assert!(matches!(result, Err(ReconcileError::Command { .. })));
    // p1/g2 keys were dumped before its variables failed; p2 was never reached
    assert_eq!(lines(&work_dir.trusted_keys()), vec!["p1/g1", "p1/g2"]);
    assert_eq!(lines(&work_dir.raw_flow_nodes()), vec!["p1/g1"]);
}

#[tokio::test]
async fn missing_root_is_an_io_error() {
    let work = tempdir().unwrap();
    let result = Pipeline::new(WorkDir::new(work.path()))
        .extract(&FakeReader::healthy(), &work.path().join("absent"), false)
        .await;
    assert!(matches!(result, Err(ReconcileError::Io { .. })));
}

/// Reader running `sh`: key dumps execute the "snapshot" path as a script,
/// other families run `script` through `sh -c`.
fn shell_reader(script: &str) -> ZdbSnapshotReader {
    ZdbSnapshotReader::new(ExtractConfig {
        dump_program: "sh".into(),
        dump_prefix_args: vec!["-c".to_string(), script.to_string(), "zdb".to_string()],
        key_dump_program: "sh".into(),
    })
}

#[tokio::test]
async fn process_stdout_is_appended_to_the_output_file() {
    let dir = tempdir().unwrap();
    let snapshot = dir.path().join("generation.sh");
    fs::write(&snapshot, "echo 111\necho 222\n").unwrap();
    let out = dir.path().join("process-instances");
    let reader = shell_reader("exit 0");

    reader.dump(&snapshot, RecordFamily::Keys, &out).await.unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), "111\n222\n");

    reader.dump(&snapshot, RecordFamily::Keys, &out).await.unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), "111\n222\n111\n222\n");
}

#[tokio::test]
async fn state_dump_output_lands_in_the_family_file() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("variables.json");
    let reader = shell_reader(r#"echo '{"key":"1:varName"}'; echo 'state warning' >&2"#);

    reader
        .dump(dir.path(), RecordFamily::Variables, &out)
        .await
        .unwrap();
    assert_eq!(fs::read_to_string(&out).unwrap(), "{\"key\":\"1:varName\"}\n");
}

#[tokio::test]
async fn non_zero_exit_is_a_command_error() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("flow-node-instances.json");
    let reader = shell_reader("echo broken >&2; exit 4");

    let result = reader.dump(dir.path(), RecordFamily::FlowNodes, &out).await;
    assert!(matches!(result, Err(ReconcileError::Command { .. })));
    assert_eq!(fs::read_to_string(&out).unwrap(), "");
}

#[tokio::test]
async fn missing_program_is_a_command_error() {
    let dir = tempdir().unwrap();
    let reader = ZdbSnapshotReader::new(ExtractConfig {
        key_dump_program: dir.path().join("no-such-tool"),
        ..ExtractConfig::default()
    });
    let result = reader
        .dump(dir.path(), RecordFamily::Keys, &dir.path().join("keys"))
        .await;
    assert!(matches!(result, Err(ReconcileError::Command { .. })));
}
