use taskflow_proto::model::{ActivityLog, EntityId, Page};

use super::Api;
use crate::http::{ApiError, ApiRequest};

impl Api {
    /// Most recent activity across everything the user can see.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn recent_activities(&self, page: u32, size: u32) -> Result<Page<ActivityLog>, ApiError> {
        let req = ApiRequest::get("/activities")
            .query("page", page)
            .query("size", size);
        self.http.send_json(&req).await
    }

    /// Activity for one task.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn task_activities(
        &self,
        task_id: EntityId,
        page: u32,
        size: u32,
    ) -> Result<Page<ActivityLog>, ApiError> {
        let req = ApiRequest::get(format!("/activities/task/{task_id}"))
            .query("page", page)
            .query("size", size);
        self.http.send_json(&req).await
    }
}

#[cfg(test)]
mod tests {
    use taskflow_proto::model::ActivityType;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::api::test_support::{api_for, user_json};

    #[tokio::test]
    async fn task_activity_page_decodes_type_field() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/activities/task/7"))
            .and(query_param("size", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "content": [{
                    "id": 1,
                    "type": "COMMENT_ADDED",
                    "description": "bob commented",
                    "timestamp": "2026-03-01T10:00:00",
                    "user": user_json(2, "bob"),
                    "task": { "id": 7, "title": "Ship release" }
                }],
                "totalPages": 1,
                "totalElements": 1,
                "number": 0,
                "size": 10
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (api, _) = api_for(&server);
        let page = api.task_activities(7, 0, 10).await.unwrap();
        assert_eq!(page.content[0].kind, ActivityType::CommentAdded);
        assert!(!page.has_next());
    }
}
