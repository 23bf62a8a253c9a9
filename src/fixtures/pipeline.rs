use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::error::ScriptError;
use crate::fixtures::{FixtureScript, discover, parse_statements};
use crate::query::QueryConnection;

/// What a pipeline run executed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub files: usize,
    pub statements: usize,
}

/// Executes the fixtures under one root against a single connection.
#[derive(Debug, Clone)]
pub struct ScriptPipeline {
    root: PathBuf,
}

impl ScriptPipeline {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Discover, parse and execute every fixture, strictly in order.
    ///
    /// Stops at the first failing statement. Each file is read and parsed
    /// right before it runs; nothing is retained afterwards.
    pub async fn run(
        &self,
        connection: &mut dyn QueryConnection,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, ScriptError> {
        let scripts = discover(&self.root)?;
        tracing::info!(
            root = %self.root.display(),
            files = scripts.len(),
            "Running fixture scripts"
        );

        let mut report = PipelineReport::default();
        for script in &scripts {
            report.statements += run_script(script, connection, cancel).await?;
            report.files += 1;
        }

        tracing::info!(
            files = report.files,
            statements = report.statements,
            "Fixture scripts applied"
        );
        Ok(report)
    }
}

async fn run_script(
    script: &FixtureScript,
    connection: &mut dyn QueryConnection,
    cancel: &CancellationToken,
) -> Result<usize, ScriptError> {
    let text = tokio::fs::read_to_string(&script.path)
        .await
        .map_err(|source| ScriptError::Io {
            path: script.path.clone(),
            source,
        })?;
    let statements = parse_statements(&text);
    tracing::debug!(
        group = %script.group,
        file = %script.path.display(),
        statements = statements.len(),
        "Executing fixture"
    );

    for statement in &statements {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ScriptError::Cancelled),
            result = connection.execute(statement) => result,
        };
        result.map_err(|e| ScriptError::Statement {
            file: script.path.clone(),
            statement: statement.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(statements.len())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::query::QueryConnector;
    use crate::testing::RecordingConnector;

    fn fixture_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("create")).unwrap();
        fs::create_dir_all(dir.path().join("insert")).unwrap();
        fs::write(
            dir.path().join("create/001_schema.sql"),
            "CREATE SCHEMA IF NOT EXISTS iceberg.test;\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("insert/001_rows.sql"),
            "INSERT INTO iceberg.test.t VALUES (1);\nINSERT INTO iceberg.test.t VALUES (2);\n",
        )
        .unwrap();
        dir
    }

    #[tokio::test]
    async fn test_failure_names_file_and_statement() {
        let dir = fixture_tree();
        let connector = RecordingConnector::new();
        connector.fail_on("VALUES (2)", "boom");
        let mut connection = connector
            .connect("http://127.0.0.1:1", "iceberg", None)
            .await
            .unwrap();

        let err = ScriptPipeline::new(dir.path())
            .run(connection.as_mut(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ScriptError::Statement {
                file, statement, ..
            } => {
                assert!(file.ends_with("insert/001_rows.sql"));
                assert_eq!(statement, "INSERT INTO iceberg.test.t VALUES (2)");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Earlier statements ran, nothing after the failure did.
        assert_eq!(connector.statements().len(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_statement() {
        let dir = fixture_tree();
        let connector = RecordingConnector::new();
        let mut connection = connector
            .connect("http://127.0.0.1:1", "iceberg", None)
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ScriptPipeline::new(dir.path())
            .run(connection.as_mut(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ScriptError::Cancelled));
    }
}
