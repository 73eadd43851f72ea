//! Cancels process instances one at a time through the live service's
//! command-line client.

use crate::config::DispatchConfig;
use crate::core::{EntityKey, ReconcileError, Result};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

/// Issues a single cancel command for one entity.
#[async_trait]
pub trait EntityCommandRunner: Send + Sync {
    async fn cancel(&self, key: EntityKey) -> Result<()>;
}

/// Runs `<program> <args..> <key>`, e.g. `zbctl --insecure cancel instance 42`.
#[derive(Debug, Clone)]
pub struct CliCommandRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl Default for CliCommandRunner {
    fn default() -> Self {
        Self::new(
            "zbctl",
            ["--insecure", "cancel", "instance"].map(String::from).to_vec(),
        )
    }
}

impl CliCommandRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl EntityCommandRunner for CliCommandRunner {
    async fn cancel(&self, key: EntityKey) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(key.to_string())
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| ReconcileError::Command {
                program: self.program.display().to_string(),
                reason: err.to_string(),
            })?;

        for line in String::from_utf8_lossy(&output.stderr).lines() {
            event!(Level::ERROR, key, "{}", line);
        }
        if !output.status.success() {
            return Err(ReconcileError::CancelRejected {
                key,
                exit: output.status.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOutcome {
    pub key: EntityKey,
    pub state: EntityState,
    pub attempts: usize,
}

/// Per-entity outcomes in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub outcomes: Vec<EntityOutcome>,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.count(EntityState::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(EntityState::Failed)
    }

    pub fn failed_keys(&self) -> Vec<EntityKey> {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state == EntityState::Failed)
            .map(|outcome| outcome.key)
            .collect()
    }

    fn count(&self, state: EntityState) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.state == state)
            .count()
    }
}

/// Drives one entity until it succeeds or runs out of attempts.
pub async fn cancel_with_retry(
    runner: &dyn EntityCommandRunner,
    config: &DispatchConfig,
    key: EntityKey,
) -> EntityOutcome {
    let max_attempts = config.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        match runner.cancel(key).await {
            Ok(()) => {
                event!(Level::INFO, key, attempt, "{}: CANCELLED", key);
                return EntityOutcome {
                    key,
                    state: EntityState::Success,
                    attempts: attempt,
                };
            }
            Err(err) => {
                event!(Level::WARN, key, attempt, error = %err, "cancel attempt failed");
            }
        }
        if attempt < max_attempts {
            let delay = config.backoff(attempt);
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
    }

    event!(
        Level::ERROR,
        key,
        "FAILED after {} attempts. Moving on...",
        max_attempts
    );
    EntityOutcome {
        key,
        state: EntityState::Failed,
        attempts: max_attempts,
    }
}

/// Fixed pool of workers draining a shared queue of entities.
pub struct Dispatcher {
    runner: Arc<dyn EntityCommandRunner>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn EntityCommandRunner>, config: DispatchConfig) -> Self {
        Self { runner, config }
    }

    pub async fn cancel_all(&self, keys: &[EntityKey]) -> Result<DispatchReport> {
        let queue: VecDeque<(usize, EntityKey)> = keys.iter().copied().enumerate().collect();
        let queue = Arc::new(Mutex::new(queue));
        let workers = self.config.workers.clamp(1, keys.len().max(1));
        event!(Level::INFO, entities = keys.len(), workers, "dispatching cancellations");

        let handles = (0..workers).map(|worker| {
            let queue = Arc::clone(&queue);
            let runner = Arc::clone(&self.runner);
            let config = self.config.clone();
            tokio::spawn(
                async move {
                    let mut done = Vec::new();
                    loop {
                        let next = queue.lock().await.pop_front();
                        let Some((position, key)) = next else {
                            break;
                        };
                        let outcome = cancel_with_retry(runner.as_ref(), &config, key).await;
                        done.push((position, outcome));
                    }
                    done
                }
                .instrument(info_span!("dispatch.worker", worker)),
            )
        });

        let mut finished = Vec::with_capacity(keys.len());
        for joined in join_all(handles).await {
            finished.extend(joined?);
        }
        finished.sort_by_key(|(position, _)| *position);

        let report = DispatchReport {
            outcomes: finished.into_iter().map(|(_, outcome)| outcome).collect(),
        };
        event!(
            Level::INFO,
            succeeded = report.succeeded(),
            failed = report.failed(),
            "dispatch finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Fails each key a scripted number of times before succeeding.
    struct FlakyRunner {
        failures: Mutex<HashMap<EntityKey, usize>>,
        calls: Mutex<Vec<EntityKey>>,
    }

    impl FlakyRunner {
        fn new(failures: impl IntoIterator<Item = (EntityKey, usize)>) -> Self {
            Self {
                failures: Mutex::new(failures.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EntityCommandRunner for FlakyRunner {
        async fn cancel(&self, key: EntityKey) -> Result<()> {
            self.calls.lock().await.push(key);
            let mut failures = self.failures.lock().await;
            match failures.get_mut(&key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(ReconcileError::CancelRejected {
                        key,
                        exit: "exit status: 1".to_string(),
                    })
                }
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let runner = FlakyRunner::new([(7, 2)]);
        let outcome = cancel_with_retry(&runner, &DispatchConfig::default(), 7).await;
        assert_eq!(outcome.state, EntityState::Success);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let runner = FlakyRunner::new([(7, usize::MAX)]);
        let outcome = cancel_with_retry(&runner, &DispatchConfig::default(), 7).await;
        assert_eq!(outcome.state, EntityState::Failed);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(runner.calls.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn pool_reports_in_input_order() {
        let runner = Arc::new(FlakyRunner::new([(2, usize::MAX)]));
        let config = DispatchConfig {
            workers: 3,
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::new(runner.clone(), config);

        let report = dispatcher.cancel_all(&[1, 2, 3, 4, 5]).await.unwrap();
        let keys: Vec<EntityKey> = report.outcomes.iter().map(|o| o.key).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
        assert_eq!(report.succeeded(), 4);
        assert_eq!(report.failed_keys(), vec![2]);
        assert_eq!(runner.calls.lock().await.len(), 4 + 3);
    }

    fn shell_runner(script: &str) -> CliCommandRunner {
        // the key lands in `$0` of the inline script
        CliCommandRunner::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn cli_runner_maps_exit_status() {
        assert!(shell_runner("exit 0").cancel(42).await.is_ok());

        let rejected = shell_runner("echo x >&2; exit 3").cancel(42).await;
        assert!(matches!(
            rejected,
            Err(ReconcileError::CancelRejected { key: 42, .. })
        ));
    }

    #[tokio::test]
    async fn cli_runner_passes_key_as_last_argument() {
        assert!(shell_runner(r#"test "$0" = 42"#).cancel(42).await.is_ok());
        assert!(shell_runner(r#"test "$0" = 42"#).cancel(43).await.is_err());
    }

    #[tokio::test]
    async fn cli_runner_reports_missing_program() {
        let runner = CliCommandRunner::new("/nonexistent/zbctl", Vec::new());
        assert!(matches!(
            runner.cancel(1).await,
            Err(ReconcileError::Command { .. })
        ));
    }

    #[tokio::test]
    async fn empty_input_dispatches_nothing() {
        let dispatcher = Dispatcher::new(Arc::new(FlakyRunner::new([])), DispatchConfig::default());
        assert!(dispatcher.cancel_all(&[]).await.unwrap().outcomes.is_empty());
    }
}
