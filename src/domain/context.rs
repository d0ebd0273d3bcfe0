use crate::domain::utils::id::{ProjectId, UserId};
use crate::domain::utils::strutils::generate_uid;

/// Authenticated caller identity attached to every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub is_admin: bool,
    pub request_id: String,
}

impl RequestContext {
    pub fn new(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            project_id: ProjectId::new(project_id),
            user_id: UserId::new(user_id),
            is_admin: false,
            request_id: generate_uid("req"),
        }
    }

    pub fn admin(project_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self { is_admin: true, ..Self::new(project_id, user_id) }
    }

    /// Same identity with admin rights, for internal lookups.
    pub fn elevated(&self) -> Self {
        Self { is_admin: true, ..self.clone() }
    }
}
