//! Repository provisioning through the external infrastructure tool.
//!
//! Provisioning is a collaborator, not part of ingestion: the server shells
//! out to the infrastructure project's CLI and reports pass, fail, or a
//! partial success where the repository exists but a follow-up step failed.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prequel_core::{
    CorrelationId, Direction, EventType, RecordedEvent, RecordingLogger, Sanitizer,
};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Markers in the tool's error output meaning the repository itself was
/// created and only a later step failed.
const PARTIAL_FAILURE_MARKERS: &[&str] = &["branch protection", "could not resolve to a repository"];

const PARTIAL_FAILURE_WARNING: &str = "Branch protection could not be applied";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRequest {
    pub name: String,
    pub org: String,
    pub description: String,
    pub visibility: Visibility,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedRepository {
    pub name: String,
    pub organization: String,
    pub full_name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningError {
    InvalidRequest(String),
    /// The tool ran and reported failure; carries its error output.
    Failed(String),
    /// The tool could not be started.
    Spawn(String),
    Timeout(Duration),
    DeploymentInProgress,
}

impl fmt::Display for ProvisioningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningError::InvalidRequest(msg) => write!(f, "invalid request: {}", msg),
            ProvisioningError::Failed(detail) => write!(f, "provisioning failed: {}", detail),
            ProvisioningError::Spawn(msg) => write!(f, "could not run provisioning tool: {}", msg),
            ProvisioningError::Timeout(after) => {
                write!(f, "provisioning tool timed out after {:?}", after)
            }
            ProvisioningError::DeploymentInProgress => write!(f, "a deployment is already running"),
        }
    }
}

impl std::error::Error for ProvisioningError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentState {
    Idle,
    Deploying,
    Complete,
    Failed,
}

/// Status of the most recent infrastructure deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentStatus {
    pub status: DeploymentState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for DeploymentStatus {
    fn default() -> Self {
        Self {
            status: DeploymentState::Idle,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn create_repository(
        &self,
        request: RepositoryRequest,
    ) -> Result<ProvisionedRepository, ProvisioningError>;

    /// Start a deployment in the background and return the resulting status.
    async fn start_deployment(&self) -> Result<DeploymentStatus, ProvisioningError>;

    async fn deployment_status(&self) -> DeploymentStatus;
}

#[derive(Debug)]
struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// Runs the infrastructure CLI as a subprocess.
#[derive(Clone)]
pub struct CommandProvisioner {
    infrastructure_dir: PathBuf,
    setup_repo_command: Vec<String>,
    deploy_command: Vec<String>,
    timeout: Duration,
    status: Arc<RwLock<DeploymentStatus>>,
    recording_logger: Option<RecordingLogger>,
}

impl CommandProvisioner {
    pub fn new(infrastructure_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            infrastructure_dir,
            setup_repo_command: ["npx", "ts-node", "src/index.ts", "setup-repo"]
                .map(String::from)
                .to_vec(),
            deploy_command: ["pulumi", "up", "--yes"].map(String::from).to_vec(),
            timeout,
            status: Arc::new(RwLock::new(DeploymentStatus::default())),
            recording_logger: None,
        }
    }

    /// Override the program and leading arguments used for repository setup.
    pub fn with_setup_repo_command(mut self, command: Vec<String>) -> Self {
        self.setup_repo_command = command;
        self
    }

    pub fn with_deploy_command(mut self, command: Vec<String>) -> Self {
        self.deploy_command = command;
        self
    }

    pub fn with_recording(mut self, logger: Option<RecordingLogger>) -> Self {
        self.recording_logger = logger;
        self
    }

    async fn run_command(&self, args: &[String]) -> Result<CommandOutput, ProvisioningError> {
        let Some((program, rest)) = args.split_first() else {
            return Err(ProvisioningError::Spawn("empty command".to_string()));
        };

        let safe_command = Sanitizer::sanitize_args(args).join(" ");
        info!("Executing provisioning command: {}", safe_command);

        let child = Command::new(program)
            .args(rest)
            .current_dir(&self.infrastructure_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProvisioningError::Spawn(format!("{}: {}", program, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ProvisioningError::Spawn(e.to_string()))?,
            Err(_) => {
                error!("Provisioning command timed out: {}", safe_command);
                return Err(ProvisioningError::Timeout(self.timeout));
            }
        };

        let result = CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.success {
            info!("Provisioning command succeeded: {}", safe_command);
        } else {
            error!(
                "Provisioning command failed ({}): {}",
                output.status, safe_command
            );
        }
        self.record(&safe_command, &result);
        Ok(result)
    }

    fn record(&self, command: &str, output: &CommandOutput) {
        let Some(ref logger) = self.recording_logger else {
            return;
        };
        logger.record(RecordedEvent {
            timestamp: Utc::now().to_rfc3339(),
            correlation_id: CorrelationId::generate().0,
            event_type: EventType::ProvisioningCommand,
            direction: Direction::Response,
            operation: command.to_string(),
            data: serde_json::json!({
                "success": output.success,
                "stdout_bytes": output.stdout.len(),
                "stderr": output.stderr,
            }),
            metadata: HashMap::new(),
        });
    }

    async fn run_deployment(&self) {
        let result = self.run_command(&self.deploy_command).await;
        let mut status = self.status.write().await;
        status.completed_at = Some(Utc::now());
        match result {
            Ok(output) if output.success => {
                info!("Infrastructure deployment completed");
                status.status = DeploymentState::Complete;
                status.error = None;
            }
            Ok(output) => {
                error!("Infrastructure deployment failed");
                status.status = DeploymentState::Failed;
                status.error = Some(non_empty_or(
                    output.stderr,
                    "Deployment failed. Check logs for details.",
                ));
            }
            Err(e) => {
                error!("Infrastructure deployment could not run: {}", e);
                status.status = DeploymentState::Failed;
                status.error = Some(e.to_string());
            }
        }
    }
}

#[async_trait]
impl ProvisioningClient for CommandProvisioner {
    async fn create_repository(
        &self,
        request: RepositoryRequest,
    ) -> Result<ProvisionedRepository, ProvisioningError> {
        validate_request(&request)?;

        let mut args = self.setup_repo_command.clone();
        args.extend([
            "--name".to_string(),
            request.name.clone(),
            "--org".to_string(),
            request.org.clone(),
            "--description".to_string(),
            request.description.clone(),
            "--visibility".to_string(),
            request.visibility.as_str().to_string(),
            "--branch".to_string(),
            request.branch.clone(),
        ]);

        let output = self.run_command(&args).await?;
        let mut provisioned = ProvisionedRepository {
            full_name: format!("{}/{}", request.org, request.name),
            url: format!("https://github.com/{}/{}", request.org, request.name),
            name: request.name,
            organization: request.org,
            warning: None,
        };

        if output.success {
            return Ok(provisioned);
        }

        if is_partial_failure(&output.stderr) {
            warn!(
                "Repository {} likely created but a follow-up step failed: {}",
                provisioned.full_name,
                output.stderr.trim()
            );
            provisioned.warning = Some(PARTIAL_FAILURE_WARNING.to_string());
            return Ok(provisioned);
        }

        Err(ProvisioningError::Failed(non_empty_or(
            output.stderr,
            "provisioning tool exited with an error",
        )))
    }

    async fn start_deployment(&self) -> Result<DeploymentStatus, ProvisioningError> {
        let snapshot = {
            let mut status = self.status.write().await;
            if status.status == DeploymentState::Deploying {
                return Err(ProvisioningError::DeploymentInProgress);
            }
            *status = DeploymentStatus {
                status: DeploymentState::Deploying,
                started_at: Some(Utc::now()),
                completed_at: None,
                error: None,
            };
            status.clone()
        };

        let provisioner = self.clone();
        tokio::spawn(async move {
            provisioner.run_deployment().await;
        });

        Ok(snapshot)
    }

    async fn deployment_status(&self) -> DeploymentStatus {
        self.status.read().await.clone()
    }
}

fn validate_request(request: &RepositoryRequest) -> Result<(), ProvisioningError> {
    let valid_name = |s: &str| {
        !s.is_empty()
            && !s.starts_with('-')
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };

    if !valid_name(&request.name) {
        return Err(ProvisioningError::InvalidRequest(format!(
            "invalid repository name '{}'",
            request.name
        )));
    }
    if !valid_name(&request.org) {
        return Err(ProvisioningError::InvalidRequest(format!(
            "invalid organization '{}'",
            request.org
        )));
    }
    if !valid_name(&request.branch) {
        return Err(ProvisioningError::InvalidRequest(format!(
            "invalid branch '{}'",
            request.branch
        )));
    }
    Ok(())
}

fn is_partial_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    PARTIAL_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

fn non_empty_or(s: String, fallback: &str) -> String {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> RepositoryRequest {
        RepositoryRequest {
            name: name.to_string(),
            org: "acme".to_string(),
            description: "Widgets service".to_string(),
            visibility: Visibility::Private,
            branch: "main".to_string(),
        }
    }

    /// A provisioner whose setup command is an inline shell script. The
    /// repository arguments are appended after it and ignored.
    fn scripted(script: &str) -> CommandProvisioner {
        CommandProvisioner::new(std::env::temp_dir(), Duration::from_secs(10))
            .with_setup_repo_command(vec!["sh".into(), "-c".into(), script.into(), "sh".into()])
    }

    #[tokio::test]
    async fn test_successful_creation() {
        let provisioned = scripted("exit 0")
            .create_repository(request("widgets"))
            .await
            .expect("should succeed");
        assert_eq!(provisioned.full_name, "acme/widgets");
        assert_eq!(provisioned.url, "https://github.com/acme/widgets");
        assert_eq!(provisioned.warning, None);
    }

    #[tokio::test]
    async fn test_arguments_are_passed_through() {
        let provisioned = scripted(r#"[ "$2" = widgets ] && [ "$4" = acme ] && [ "$8" = private ]"#)
            .create_repository(request("widgets"))
            .await;
        assert!(provisioned.is_ok(), "{:?}", provisioned);
    }

    #[tokio::test]
    async fn test_branch_protection_failure_is_partial_success() {
        let provisioned = scripted("echo 'Error: Branch Protection rule failed' >&2; exit 1")
            .create_repository(request("widgets"))
            .await
            .expect("should be a partial success");
        assert_eq!(
            provisioned.warning.as_deref(),
            Some("Branch protection could not be applied")
        );
    }

    #[tokio::test]
    async fn test_other_failure_carries_detail() {
        let err = scripted("echo 'Bad credentials' >&2; exit 1")
            .create_repository(request("widgets"))
            .await
            .unwrap_err();
        assert_eq!(err, ProvisioningError::Failed("Bad credentials".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected_without_running() {
        let err = scripted("exit 0")
            .create_repository(request("--rm -rf"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let provisioner = CommandProvisioner::new(std::env::temp_dir(), Duration::from_secs(5))
            .with_setup_repo_command(vec!["prequel-no-such-program".into()]);
        let err = provisioner
            .create_repository(request("widgets"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let provisioner = CommandProvisioner::new(std::env::temp_dir(), Duration::from_millis(100))
            .with_setup_repo_command(vec!["sh".into(), "-c".into(), "sleep 5".into()]);
        let err = provisioner
            .create_repository(request("widgets"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisioningError::Timeout(_)));
    }

    async fn wait_for_deployment(provisioner: &CommandProvisioner) -> DeploymentStatus {
        for _ in 0..100 {
            let status = provisioner.deployment_status().await;
            if status.status != DeploymentState::Deploying {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("deployment did not finish");
    }

    #[tokio::test]
    async fn test_deployment_lifecycle() {
        let provisioner = CommandProvisioner::new(std::env::temp_dir(), Duration::from_secs(10))
            .with_deploy_command(vec!["sh".into(), "-c".into(), "sleep 0.2".into()]);
        assert_eq!(provisioner.deployment_status().await.status, DeploymentState::Idle);

        let started = provisioner.start_deployment().await.unwrap();
        assert_eq!(started.status, DeploymentState::Deploying);
        assert!(started.started_at.is_some());
        assert_eq!(
            provisioner.start_deployment().await.unwrap_err(),
            ProvisioningError::DeploymentInProgress
        );

        let finished = wait_for_deployment(&provisioner).await;
        assert_eq!(finished.status, DeploymentState::Complete);
        assert!(finished.completed_at.is_some());
        assert_eq!(finished.error, None);
    }

    #[tokio::test]
    async fn test_failed_deployment_records_error() {
        let provisioner = CommandProvisioner::new(std::env::temp_dir(), Duration::from_secs(10))
            .with_deploy_command(vec!["sh".into(), "-c".into(), "echo boom >&2; exit 2".into()]);
        provisioner.start_deployment().await.unwrap();

        let finished = wait_for_deployment(&provisioner).await;
        assert_eq!(finished.status, DeploymentState::Failed);
        assert_eq!(finished.error.as_deref(), Some("boom"));
    }
}
