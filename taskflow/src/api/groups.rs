use taskflow_proto::model::{EntityId, Group, Invitation};
use taskflow_proto::payload::InvitePayload;

use super::Api;
use crate::http::{ApiError, ApiRequest};

impl Api {
    /// Groups the user owns or belongs to.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn my_groups(&self) -> Result<Vec<Group>, ApiError> {
        self.http.send_json(&ApiRequest::get("/groups/my-groups")).await
    }

    /// One group.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn get_group(&self, id: EntityId) -> Result<Group, ApiError> {
        self.http.send_json(&ApiRequest::get(format!("/groups/{id}"))).await
    }

    /// Create a group owned by the current user. The server binds the raw
    /// request body as the name.
    ///
    /// # Errors
    ///
    /// [`ApiError::Validation`] for a rejected name.
    pub async fn create_group(&self, name: &str) -> Result<Group, ApiError> {
        self.http
            .send_json(&ApiRequest::post("/groups").text(name))
            .await
    }

    /// Leave a group the user is a member of.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn leave_group(&self, id: EntityId) -> Result<(), ApiError> {
        self.http
            .send_empty(&ApiRequest::post(format!("/groups/{id}/leave")))
            .await
    }

    /// Delete a group; the server cascades to its tasks.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn delete_group(&self, id: EntityId) -> Result<(), ApiError> {
        self.http
            .send_empty(&ApiRequest::delete(format!("/groups/{id}")))
            .await
    }

    /// Invite `email` to a group.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn invite(&self, group_id: EntityId, email: &str) -> Result<(), ApiError> {
        let req = ApiRequest::post("/invitations/invite").json(&InvitePayload {
            group_id: group_id.to_string(),
            email: email.to_string(),
        })?;
        self.http.send_empty(&req).await
    }

    /// Invitations addressed to the user that are still pending.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn pending_invitations(&self) -> Result<Vec<Invitation>, ApiError> {
        self.http
            .send_json(&ApiRequest::get("/invitations/my-pending"))
            .await
    }

    /// Accept an invitation.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn accept_invitation(&self, id: EntityId) -> Result<(), ApiError> {
        self.http
            .send_empty(&ApiRequest::post(format!("/invitations/{id}/accept")))
            .await
    }

    /// Decline an invitation.
    ///
    /// # Errors
    ///
    /// Propagates [`ApiError`] from the request.
    pub async fn decline_invitation(&self, id: EntityId) -> Result<(), ApiError> {
        self.http
            .send_empty(&ApiRequest::post(format!("/invitations/{id}/decline")))
            .await
    }
}
