use thiserror::Error;

pub type Result<T> = std::result::Result<T, TsuruError>;

#[derive(Debug, Error)]
pub enum TsuruError {
    // ── Validation ──
    #[error("invalid role name")]
    InvalidRoleName,

    #[error("invalid service instance name")]
    InvalidInstanceName,

    #[error("{0}")]
    InvalidWebhook(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid proxy path")]
    InvalidProxyPath,

    #[error("please specify the team that owns the service instance")]
    TeamMandatory,

    // ── Not found ──
    #[error("role not found")]
    RoleNotFound,

    #[error("service instance not found")]
    ServiceInstanceNotFound,

    #[error("Service not found.")]
    ServiceNotFound,

    #[error("webhook not found")]
    WebhookNotFound,

    #[error("instance does not exist in the service API")]
    InstanceNotFoundInApi,

    #[error("node not found")]
    NodeNotFound,

    #[error("broker not found: {0}")]
    BrokerNotFound(String),

    #[error("event not found")]
    EventNotFound,

    #[error("role event not found")]
    RoleEventNotFound,

    #[error("unregistered permission: {0}")]
    UnregisteredPermission(String),

    // ── Conflict ──
    #[error("role already exists")]
    RoleAlreadyExists,

    #[error("instance name already exists: {0}")]
    InstanceNameAlreadyExists(String),

    #[error("Service already exists.")]
    ServiceAlreadyExists,

    #[error("webhook already exists with the same name")]
    WebhookAlreadyExists,

    #[error("app is already bound to this service instance")]
    AppAlreadyBound,

    #[error("app is not bound to this service instance")]
    AppNotBound,

    #[error("unit is already bound to this service instance")]
    UnitAlreadyBound,

    #[error("unit is not bound to this service instance")]
    UnitNotBound,

    #[error("instance already exists in the service API")]
    InstanceAlreadyExistsInApi,

    #[error("event locked: {0}")]
    EventLocked(String),

    // ── Precondition ──
    #[error("instance is not ready yet")]
    InstanceNotReady,

    #[error("This service instance is bound to at least one app. Unbind them before removing it")]
    ServiceInstanceBound,

    #[error("This service cannot be removed because it has instances")]
    ServiceHasInstances,

    #[error("cannot remove role: {0} user(s) still assigned")]
    RemoveRoleWithUsers(usize),

    #[error("cannot revoke the instance's team owner access")]
    RevokeInstanceTeamOwnerAccess,

    #[error("{0}")]
    RoleEventWrongContext(String),

    // ── Authorization ──
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("permission not allowed")]
    PermissionNotAllowed,

    #[error("permission not found")]
    PermissionNotFound,

    // ── Transient I/O ──
    #[error("Failed to {action} the instance {instance}: {message}")]
    Endpoint {
        action: String,
        instance: String,
        message: String,
    },

    #[error("invalid response from {url} (status {status}): {body}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("invalid status code calling hook: {status}: {body}")]
    HookStatus { status: u16, body: String },

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage: {0}")]
    Storage(String),

    #[error("template: {0}")]
    Template(String),

    // ── Pipeline ──
    #[error("No actions to execute.")]
    PipelineNoActions,

    #[error("Not enough parameters to call Action.Forward.")]
    PipelineFewParameters,

    #[error("[{action}] panic in forward: {message}")]
    PipelinePanic { action: String, message: String },

    // ── Internal ──
    #[error("config: {0}")]
    Config(String),

    #[error("shutdown timed out before draining {0}")]
    ShutdownTimeout(String),

    #[error("cannot register {0}: shutdown in progress")]
    ShutdownInProgress(String),

    #[error("{0}")]
    Multi(MultiError),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl TsuruError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidRoleName
            | Self::InvalidInstanceName
            | Self::InvalidWebhook(_)
            | Self::InvalidInput(_)
            | Self::InvalidProxyPath
            | Self::TeamMandatory => 400,

            Self::RoleNotFound
            | Self::ServiceInstanceNotFound
            | Self::ServiceNotFound
            | Self::WebhookNotFound
            | Self::InstanceNotFoundInApi
            | Self::NodeNotFound
            | Self::BrokerNotFound(_)
            | Self::EventNotFound
            | Self::RoleEventNotFound
            | Self::UnregisteredPermission(_) => 404,

            Self::RoleAlreadyExists
            | Self::InstanceNameAlreadyExists(_)
            | Self::ServiceAlreadyExists
            | Self::WebhookAlreadyExists
            | Self::AppAlreadyBound
            | Self::AppNotBound
            | Self::UnitAlreadyBound
            | Self::UnitNotBound
            | Self::InstanceAlreadyExistsInApi
            | Self::EventLocked(_) => 409,

            Self::InstanceNotReady
            | Self::ServiceInstanceBound
            | Self::ServiceHasInstances
            | Self::RemoveRoleWithUsers(_)
            | Self::RevokeInstanceTeamOwnerAccess
            | Self::RoleEventWrongContext(_) => 412,

            Self::Unauthorized(_) | Self::PermissionNotAllowed | Self::PermissionNotFound => 403,

            Self::Endpoint { .. }
            | Self::UnexpectedStatus { .. }
            | Self::HookStatus { .. }
            | Self::Http(_)
            | Self::Json(_)
            | Self::Storage(_)
            | Self::Template(_)
            | Self::PipelineNoActions
            | Self::PipelineFewParameters
            | Self::PipelinePanic { .. }
            | Self::Config(_)
            | Self::ShutdownTimeout(_)
            | Self::ShutdownInProgress(_)
            | Self::Multi(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Wraps a transport-level failure with the operation and instance name.
    pub fn endpoint(action: &str, instance: &str, err: impl std::fmt::Display) -> Self {
        Self::Endpoint {
            action: action.to_string(),
            instance: instance.to_string(),
            message: err.to_string(),
        }
    }
}

// ============================================================================
// MULTI ERROR
// ============================================================================

/// Independent failures collected from one unit of work.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<TsuruError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: TsuruError) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[TsuruError] {
        &self.errors
    }

    /// `Ok(())` when nothing was collected, the single error when there is one.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(TsuruError::Multi(self)),
        }
    }
}

impl std::fmt::Display for MultiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
