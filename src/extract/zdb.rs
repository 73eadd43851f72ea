use super::{RecordFamily, SnapshotReader};
use crate::config::ExtractConfig;
use crate::core::{ReconcileError, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{Level, event};

/// Dumps snapshot state through the external state-inspection tool.
///
/// Stdout of the tool is redirected into the output file opened for append;
/// stderr is drained from a pipe and logged.
#[derive(Debug, Clone)]
pub struct ZdbSnapshotReader {
    config: ExtractConfig,
}

impl ZdbSnapshotReader {
    pub fn new(config: ExtractConfig) -> Self {
        Self { config }
    }

    /// Program and arguments for one dump call.
    pub fn command_line(&self, snapshot: &Path, family: RecordFamily) -> (String, Vec<String>) {
        let snapshot = snapshot.display().to_string();
        let (column_family, key_format) = match family {
            RecordFamily::Keys => {
                return (
                    self.config.key_dump_program.display().to_string(),
                    vec![snapshot],
                );
            }
            RecordFamily::Variables => ("VARIABLES", "ls"),
            RecordFamily::FlowNodes => ("ELEMENT_INSTANCE_KEY", "l"),
        };

        let mut args = self.config.dump_prefix_args.clone();
        args.extend([
            "state".to_string(),
            "list".to_string(),
            format!("-p={}", snapshot),
            format!("-cf={}", column_family),
            format!("-kf={}", key_format),
        ]);
        (self.config.dump_program.display().to_string(), args)
    }
}

#[async_trait]
impl SnapshotReader for ZdbSnapshotReader {
    async fn dump(&self, snapshot: &Path, family: RecordFamily, out: &Path) -> Result<()> {
        let (program, args) = self.command_line(snapshot, family);
        let sink = OpenOptions::new()
            .create(true)
            .append(true)
            .open(out)
            .map_err(|err| ReconcileError::io(out, err))?;

        let spawn_failed = |err: std::io::Error| ReconcileError::Command {
            program: program.clone(),
            reason: err.to_string(),
        };
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_failed)?;

        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr).await.map_err(spawn_failed)?;
        }
        let status = child.wait().await.map_err(spawn_failed)?;

        for line in stderr.lines() {
            event!(Level::WARN, family = family.name(), "{}", line);
        }
        event!(
            Level::DEBUG,
            family = family.name(),
            status = %status,
            "dump process exited"
        );
        if !status.success() {
            return Err(ReconcileError::Command {
                program,
                reason: format!("{} while dumping {}", status, snapshot.display()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_dump_uses_state_list() {
        let reader = ZdbSnapshotReader::new(ExtractConfig::default());
        let (program, args) = reader.command_line(Path::new("/data/1/snapshots/7"), RecordFamily::Variables);
        assert_eq!(program, "java");
        assert_eq!(
            args,
            vec![
                "-jar",
                "zdb.jar",
                "state",
                "list",
                "-p=/data/1/snapshots/7",
                "-cf=VARIABLES",
                "-kf=ls"
            ]
        );
    }

    #[test]
    fn key_dump_takes_only_the_snapshot() {
        let reader = ZdbSnapshotReader::new(ExtractConfig::default());
        let (program, args) = reader.command_line(Path::new("/s"), RecordFamily::Keys);
        assert_eq!(program, "pr-inst.sh");
        assert_eq!(args, vec!["/s"]);
    }
}
