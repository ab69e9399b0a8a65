use taskflow_proto::model::{Comment, EntityId, Page, SortDir, Task, TaskStatus};
use taskflow_proto::payload::{CommentPayload, TaskPayload};

use super::Api;
use crate::http::{ApiError, ApiRequest};

/// Pagination and sort parameters for listing endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageRequest {
    /// Zero-based page index.
    pub page: u32,
    /// Items per page.
    pub size: u32,
    /// Field to sort by.
    pub sort_by: String,
    /// Sort direction.
    pub sort_dir: SortDir,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 0,
            size: 10,
            sort_by: "createdAt".to_string(),
            sort_dir: SortDir::Desc,
        }
    }
}

impl PageRequest {
    /// Page `page` of `size` items, newest first.
    #[must_use]
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size,
            ..Self::default()
        }
    }
}

impl Api {
    /// Every task visible to the user.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn list_tasks(&self) -> Result<Vec<Task>, ApiError> {
        self.http.send_json(&ApiRequest::get("/tasks")).await
    }

    /// One page of tasks.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn tasks_page(&self, page: &PageRequest) -> Result<Page<Task>, ApiError> {
        let req = ApiRequest::get("/tasks/paginated")
            .query("page", page.page)
            .query("size", page.size)
            .query("sortBy", &page.sort_by)
            .query("sortDir", page.sort_dir.as_str());
        self.http.send_json(&req).await
    }

    /// A single task.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn get_task(&self, id: EntityId) -> Result<Task, ApiError> {
        self.http.send_json(&ApiRequest::get(format!("/tasks/{id}"))).await
    }

    /// Create a task; the server assigns `id` and `createdAt`.
    ///
    /// # Errors
    ///
    /// [`ApiError::Validation`] for a rejected payload.
    pub async fn create_task(&self, payload: &TaskPayload) -> Result<Task, ApiError> {
        let req = ApiRequest::post("/tasks").json(payload)?;
        self.http.send_json(&req).await
    }

    /// Replace a task's fields.
    ///
    /// # Errors
    ///
    /// [`ApiError::Validation`] for a rejected payload.
    pub async fn update_task(&self, id: EntityId, payload: &TaskPayload) -> Result<Task, ApiError> {
        let req = ApiRequest::put(format!("/tasks/{id}")).json(payload)?;
        self.http.send_json(&req).await
    }

    /// Delete a task.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn delete_task(&self, id: EntityId) -> Result<(), ApiError> {
        self.http
            .send_empty(&ApiRequest::delete(format!("/tasks/{id}")))
            .await
    }

    /// Tasks in one column.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, ApiError> {
        self.http
            .send_json(&ApiRequest::get(format!("/tasks/status/{}", status.as_str())))
            .await
    }

    /// Tasks whose title contains `title`.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn search_tasks(&self, title: &str) -> Result<Vec<Task>, ApiError> {
        self.http
            .send_json(&ApiRequest::get("/tasks/search").query("title", title))
            .await
    }

    /// Tasks belonging to a group.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn tasks_by_group(&self, group_id: EntityId) -> Result<Vec<Task>, ApiError> {
        self.http
            .send_json(&ApiRequest::get(format!("/tasks/group/{group_id}")))
            .await
    }

    /// Comments on a task, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn comments(&self, task_id: EntityId) -> Result<Vec<Comment>, ApiError> {
        self.http
            .send_json(&ApiRequest::get(format!("/tasks/{task_id}/comments")))
            .await
    }

    /// Append a comment.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn add_comment(&self, task_id: EntityId, text: &str) -> Result<Comment, ApiError> {
        let req = ApiRequest::post(format!("/tasks/{task_id}/comments")).json(&CommentPayload {
            text: text.to_string(),
        })?;
        self.http.send_json(&req).await
    }
}
