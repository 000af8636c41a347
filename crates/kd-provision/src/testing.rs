//! Scripted [`CommandRunner`] for tests.
//!
//! Rules match on the program name and a prefix of its arguments; the most
//! recently added matching rule answers. Unmatched invocations succeed with
//! empty output. A rule can be gated so the invocation blocks until the test
//! releases it.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::runner::{CommandOutput, CommandRunner, RunnerError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    fn matches(&self, program: &str, prefix: &[String]) -> bool {
        self.program == program && self.args.starts_with(prefix)
    }

    /// Value following `flag` in the argument list.
    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Blocks matching invocations until released.
#[derive(Clone)]
pub struct Gate(Arc<Semaphore>);

impl Gate {
    /// Let every current and future matching invocation through.
    pub fn release(&self) {
        self.0.close();
    }
}

enum Outcome {
    Output(CommandOutput),
    SpawnFailure,
}

struct Rule {
    program: String,
    prefix: Vec<String>,
    outcome: Outcome,
    gate: Option<Gate>,
}

#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    invocations: Mutex<Vec<Invocation>>,
}

fn owned(prefix: &[&str]) -> Vec<String> {
    prefix.iter().map(|s| s.to_string()).collect()
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `program <prefix...>` with `output`.
    pub fn respond(&self, program: &str, prefix: &[&str], output: CommandOutput) -> &Self {
        lock(&self.rules).push(Rule {
            program: program.to_string(),
            prefix: owned(prefix),
            outcome: Outcome::Output(output),
            gate: None,
        });
        self
    }

    /// Make `program <prefix...>` fail to start at all.
    pub fn fail_to_start(&self, program: &str, prefix: &[&str]) -> &Self {
        lock(&self.rules).push(Rule {
            program: program.to_string(),
            prefix: owned(prefix),
            outcome: Outcome::SpawnFailure,
            gate: None,
        });
        self
    }

    /// Answer `program <prefix...>` with `output` once the returned gate is released.
    pub fn respond_gated(&self, program: &str, prefix: &[&str], output: CommandOutput) -> Gate {
        let gate = Gate(Arc::new(Semaphore::new(0)));
        lock(&self.rules).push(Rule {
            program: program.to_string(),
            prefix: owned(prefix),
            outcome: Outcome::Output(output),
            gate: Some(gate.clone()),
        });
        gate
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        lock(&self.invocations).clone()
    }

    /// Invocations of `program <prefix...>`.
    pub fn calls(&self, program: &str, prefix: &[&str]) -> Vec<Invocation> {
        let prefix = owned(prefix);
        lock(&self.invocations)
            .iter()
            .filter(|inv| inv.matches(program, &prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, RunnerError> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        };
        lock(&self.invocations).push(invocation.clone());

        let (outcome, gate) = {
            let rules = lock(&self.rules);
            match rules
                .iter()
                .rev()
                .find(|r| invocation.matches(&r.program, &r.prefix))
            {
                Some(rule) => {
                    let outcome = match &rule.outcome {
                        Outcome::Output(out) => Some(out.clone()),
                        Outcome::SpawnFailure => None,
                    };
                    (outcome, rule.gate.clone())
                }
                None => (Some(CommandOutput::ok("")), None),
            }
        };

        if let Some(gate) = gate {
            // Permits are never added; acquire only returns once the gate is closed.
            let _ = gate.0.acquire().await;
        }

        outcome.ok_or_else(|| RunnerError::Spawn {
            program: program.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted spawn failure"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        owned(list)
    }

    #[tokio::test]
    async fn test_unmatched_succeeds() {
        let runner = ScriptedRunner::new();
        let out = runner.run("kind", &args(&["version"])).await.unwrap();
        assert!(out.success());
        assert_eq!(runner.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_latest_rule_wins() {
        let runner = ScriptedRunner::new();
        runner
            .respond("kind", &["create"], CommandOutput::ok(""))
            .respond("kind", &["create"], CommandOutput::failed(1, "boom"));
        let out = runner
            .run("kind", &args(&["create", "cluster"]))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let runner = ScriptedRunner::new();
        runner.fail_to_start("docker", &[]);
        assert!(runner.run("docker", &args(&["ps"])).await.is_err());
    }

    #[tokio::test]
    async fn test_gate_blocks_until_released() {
        let runner = Arc::new(ScriptedRunner::new());
        let gate = runner.respond_gated("kind", &["delete"], CommandOutput::ok(""));

        let task = {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run("kind", &args(&["delete"])).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        gate.release();
        assert!(task.await.unwrap().unwrap().success());
    }

    #[test]
    fn test_arg_after() {
        let inv = Invocation {
            program: "kind".into(),
            args: args(&["create", "cluster", "--name", "kd-1"]),
        };
        assert_eq!(inv.arg_after("--name"), Some("kd-1"));
        assert_eq!(inv.arg_after("--config"), None);
    }
}
