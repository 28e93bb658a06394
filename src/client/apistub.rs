//! Client API communication stub.

use std::net::SocketAddr;

use crate::server::{ApiReply, ApiRequest};
use crate::utils::{read_frame, tcp_connect_with_retry, write_frame, TripStoreError};

/// Client stub talking to one server node's API listener.
#[derive(Debug, Clone)]
pub struct ClientApiStub {
    /// Acting user's email, sent along with itinerary operations.
    user: String,

    /// API address of the server node.
    server: SocketAddr,

    /// Connection retries per call.
    retries: u8,
}

impl ClientApiStub {
    /// Creates a new API stub acting as `user`.
    pub fn new(user: impl ToString, server: SocketAddr) -> Self {
        ClientApiStub {
            user: user.to_string(),
            server,
            retries: 3,
        }
    }

    /// Sends one request on a fresh connection and waits for its reply.
    pub async fn call(&self, req: &ApiRequest) -> Result<ApiReply, TripStoreError> {
        let mut conn = tcp_connect_with_retry(self.server, self.retries).await?;
        write_frame(&mut conn, req).await?;
        read_frame(&mut conn).await
    }

    async fn call_text(&self, req: ApiRequest) -> Result<String, TripStoreError> {
        match self.call(&req).await? {
            ApiReply::Text(text) => Ok(text),
            reply => Err(TripStoreError(format!(
                "unexpected reply to {:?}: {:?}",
                req, reply
            ))),
        }
    }

    /// Sends an `OP|arg...` itinerary operation message.
    pub async fn execute_operation(
        &self,
        message: &str,
    ) -> Result<String, TripStoreError> {
        self.call_text(ApiRequest::ExecuteOperation {
            message: message.into(),
            actor: self.user.clone(),
        })
        .await
    }

    /// Sends an itinerary JSON payload; returns its id on success.
    pub async fn put_itinerary(
        &self,
        payload: &str,
    ) -> Result<String, TripStoreError> {
        self.call_text(ApiRequest::PutItinerary {
            payload: payload.into(),
            actor: self.user.clone(),
        })
        .await
    }

    /// Signs up with `name|email|password`.
    pub async fn sign_up(&self, info: &str) -> Result<String, TripStoreError> {
        self.call_text(ApiRequest::SignUp { info: info.into() }).await
    }

    /// Logs in with `email|password`.
    pub async fn login(&self, info: &str) -> Result<String, TripStoreError> {
        self.call_text(ApiRequest::Login { info: info.into() }).await
    }

    /// Logs out the acting user.
    pub async fn logout(&self) -> Result<String, TripStoreError> {
        self.call_text(ApiRequest::Logout {
            email: self.user.clone(),
        })
        .await
    }

    /// Asks whether the acting user is logged in at this node.
    pub async fn is_logged_in(&self) -> Result<bool, TripStoreError> {
        let req = ApiRequest::IsLoggedIn {
            email: self.user.clone(),
        };
        match self.call(&req).await? {
            ApiReply::Flag(flag) => Ok(flag),
            reply => Err(TripStoreError(format!(
                "unexpected reply to {:?}: {:?}",
                req, reply
            ))),
        }
    }
}
