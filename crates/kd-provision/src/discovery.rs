use thiserror::Error;
use tracing::debug;

use crate::runner::{CommandRunner, RunnerError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("container query failed: {0}")]
    QueryFailed(String),
}

/// Ask the container runtime for the id of the container whose name
/// matches `name_pattern`.
///
/// Returns the first non-empty line of `docker ps --filter name=<pattern>
/// --format {{.ID}}`, or `None` when nothing matches.
pub async fn find_container_id(
    runner: &dyn CommandRunner,
    docker: &str,
    name_pattern: &str,
) -> Result<Option<String>, DiscoveryError> {
    let args = vec![
        "ps".to_string(),
        "--filter".to_string(),
        format!("name={name_pattern}"),
        "--format".to_string(),
        "{{.ID}}".to_string(),
    ];
    let output = runner.run(docker, &args).await?;
    if !output.success() {
        return Err(DiscoveryError::QueryFailed(output.describe_failure(docker)));
    }

    let id = output
        .stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string);
    debug!(name_pattern, container_id = ?id, "container discovery finished");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use crate::testing::ScriptedRunner;

    #[tokio::test]
    async fn test_finds_first_id() {
        let runner = ScriptedRunner::new();
        runner.respond("docker", &["ps"], CommandOutput::ok("\nabc123\ndef456\n"));

        let id = find_container_id(&runner, "docker", "kd-x-control-plane")
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("abc123"));

        let calls = runner.calls("docker", &["ps"]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arg_after("--filter"), Some("name=kd-x-control-plane"));
        assert_eq!(calls[0].arg_after("--format"), Some("{{.ID}}"));
    }

    #[tokio::test]
    async fn test_no_match_is_none() {
        let runner = ScriptedRunner::new();
        runner.respond("docker", &["ps"], CommandOutput::ok("  \n"));
        let id = find_container_id(&runner, "docker", "missing").await.unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn test_query_failure() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "docker",
            &["ps"],
            CommandOutput::failed(1, "Cannot connect to the Docker daemon"),
        );
        let err = find_container_id(&runner, "docker", "x").await.unwrap_err();
        assert!(matches!(err, DiscoveryError::QueryFailed(_)));
        assert!(err.to_string().contains("Docker daemon"));
    }
}
