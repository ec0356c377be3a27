use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Viewer => "viewer",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "user" => Ok(Role::User),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role {other}")),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    Postgresql,
    Mysql,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::Postgresql => "postgresql",
            DataSourceKind::Mysql => "mysql",
        }
    }
}

impl FromStr for DataSourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgresql" | "postgres" => Ok(DataSourceKind::Postgresql),
            "mysql" => Ok(DataSourceKind::Mysql),
            other => Err(format!("unknown data source kind {other}")),
        }
    }
}

impl From<DataSourceKind> for String {
    fn from(kind: DataSourceKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Internal datasource record. Deliberately not `Serialize`: the encrypted
/// password must never travel through an API response. External callers see
/// [`DataSourceSummary`].
#[derive(Debug, Clone)]
pub struct DataSource {
    pub id: Uuid,
    pub name: String,
    pub kind: DataSourceKind,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub username: String,
    pub ciphertext_password: Vec<u8>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSource {
    pub fn summary(&self) -> DataSourceSummary {
        DataSourceSummary {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            host: self.host.clone(),
            port: self.port,
            database_name: self.database_name.clone(),
            username: self.username.clone(),
            active: self.active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// API-safe projection of a datasource; carries no credential material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSourceSummary {
    pub id: Uuid,
    pub name: String,
    pub kind: DataSourceKind,
    pub host: String,
    pub port: u16,
    pub database_name: String,
    pub username: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-datasource permission flags. The effective set for a user is the
/// pointwise OR over all of their groups, then capped by role.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionSet {
    pub can_read: bool,
    pub can_write: bool,
    pub can_approve: bool,
}

impl PermissionSet {
    pub fn all() -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_approve: true,
        }
    }

    pub fn union(self, other: PermissionSet) -> PermissionSet {
        PermissionSet {
            can_read: self.can_read || other.can_read,
            can_write: self.can_write || other.can_write,
            can_approve: self.can_approve || other.can_approve,
        }
    }

    /// Viewer role caps the effective set at read-only.
    pub fn capped_by(self, role: Role) -> PermissionSet {
        match role {
            Role::Admin => PermissionSet::all(),
            Role::User => self,
            Role::Viewer => PermissionSet {
                can_read: self.can_read,
                can_write: false,
                can_approve: false,
            },
        }
    }

    pub fn allows(&self, action: PermissionAction) -> bool {
        match action {
            PermissionAction::Read => self.can_read,
            PermissionAction::Write => self.can_write,
            PermissionAction::Approve => self.can_approve,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionAction {
    Read,
    Write,
    Approve,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Select => "select",
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Create => "create",
            OperationKind::Drop => "drop",
            OperationKind::Alter => "alter",
        }
    }

    /// Everything except reads is gated behind the approval workflow.
    pub fn requires_approval(&self) -> bool {
        !matches!(self, OperationKind::Select)
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "select" => Ok(OperationKind::Select),
            "insert" => Ok(OperationKind::Insert),
            "update" => Ok(OperationKind::Update),
            "delete" => Ok(OperationKind::Delete),
            "create" => Ok(OperationKind::Create),
            "drop" => Ok(OperationKind::Drop),
            "alter" => Ok(OperationKind::Alter),
            other => Err(format!("unknown operation {other}")),
        }
    }
}

impl From<OperationKind> for String {
    fn from(operation: OperationKind) -> Self {
        operation.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Running => "running",
            QueryStatus::Completed => "completed",
            QueryStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(QueryStatus::Pending),
            "running" => Ok(QueryStatus::Running),
            "completed" => Ok(QueryStatus::Completed),
            "failed" => Ok(QueryStatus::Failed),
            other => Err(format!("unknown query status {other}")),
        }
    }
}

impl From<QueryStatus> for String {
    fn from(status: QueryStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub user_id: Uuid,
    pub data_source_id: Uuid,
    pub query_text: String,
    pub operation: OperationKind,
    pub status: QueryStatus,
    pub row_count: Option<i64>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
    pub requires_approval: bool,
    pub created_at: DateTime<Utc>,
}

/// Captured SELECT output. `column_names` and `column_types` are ordered
/// sibling arrays of equal length; `data` is an ordered array of objects
/// keyed by column name with SQL NULL preserved as JSON null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResultRecord {
    pub query_id: Uuid,
    pub column_names: Vec<String>,
    pub column_types: Vec<String>,
    pub row_count: i64,
    pub data: Vec<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ApprovalStatus::Pending),
            "approved" => Ok(ApprovalStatus::Approved),
            "rejected" => Ok(ApprovalStatus::Rejected),
            other => Err(format!("unknown approval status {other}")),
        }
    }
}

impl From<ApprovalStatus> for String {
    fn from(status: ApprovalStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub query_id: Uuid,
    pub data_source_id: Uuid,
    pub query_text: String,
    pub operation: OperationKind,
    pub requester_id: Uuid,
    pub status: ApprovalStatus,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewDecision::Approved => "approved",
            ReviewDecision::Rejected => "rejected",
        }
    }
}

impl FromStr for ReviewDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approved" => Ok(ReviewDecision::Approved),
            "rejected" => Ok(ReviewDecision::Rejected),
            other => Err(format!("unknown review decision {other}")),
        }
    }
}

impl From<ReviewDecision> for String {
    fn from(decision: ReviewDecision) -> Self {
        decision.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalReview {
    pub id: Uuid,
    pub approval_id: Uuid,
    pub reviewer_id: Uuid,
    pub decision: ReviewDecision,
    pub comment: Option<String>,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalComment {
    pub id: Uuid,
    pub approval_id: Uuid,
    pub user_id: Uuid,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Active,
    Committed,
    RolledBack,
    Failed,
    TimedOut,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Committed => "committed",
            TransactionStatus::RolledBack => "rolled_back",
            TransactionStatus::Failed => "failed",
            TransactionStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Active)
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(TransactionStatus::Active),
            "committed" => Ok(TransactionStatus::Committed),
            "rolled_back" => Ok(TransactionStatus::RolledBack),
            "failed" => Ok(TransactionStatus::Failed),
            "timed_out" => Ok(TransactionStatus::TimedOut),
            other => Err(format!("unknown transaction status {other}")),
        }
    }
}

impl From<TransactionStatus> for String {
    fn from(status: TransactionStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewTransaction {
    pub id: Uuid,
    pub approval_id: Uuid,
    pub reviewer_id: Uuid,
    pub data_source_id: Uuid,
    pub status: TransactionStatus,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }
}
